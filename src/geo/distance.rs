/// Default precision, in miles, with which distances are reported.
pub(crate) const GCS_DISTANCE_PRECISION: f64 = 50.0;

/// Surface distance in miles between two (latitude, longitude) pairs,
/// by the spherical law of cosines, rounded down to a multiple of
/// `precision`.
///
/// The reduced precision is deliberate: it lets servers at similar
/// distances from the client tie, so that selection can spread load
/// across them.
pub(crate) fn gcs_distance(a: (f64, f64), b: (f64, f64), precision: f64) -> f64 {
    let (lat1, lon1) = a;
    let (lat2, lon2) = b;

    let theta = lon1 - lon2;
    let dist = lat1.to_radians().sin() * lat2.to_radians().sin()
        + lat1.to_radians().cos() * lat2.to_radians().cos() * theta.to_radians().cos();

    // Float rounding can push the cosine sum just past 1.0 for
    // near-identical coordinates, which would make acos return NaN.
    let dist = dist.clamp(-1.0, 1.0).acos().to_degrees();
    let miles = dist * 60.0 * 1.1515;

    (miles / precision).floor() * precision
}
