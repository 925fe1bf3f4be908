use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use chrono::Utc;
use maxminddb::{geoip2::City, Reader};
use parking_lot::Mutex;
use tracing::instrument;

use crate::{
    zone::{GeoParams, ServerEntry},
    Error,
};

mod cache;
mod distance;

pub(crate) use cache::{CacheKey, GeoCache};
pub(crate) use distance::{gcs_distance, GCS_DISTANCE_PRECISION};

/// Geographic lookup over a Maxmind city database.
///
/// The reader is not assumed re-entrant, so every database operation is
/// serialized under a mutex. `reopen` swaps the reader while holding it.
pub(crate) struct Geo {
    geodb_file: PathBuf,
    geodb: Mutex<Reader<Vec<u8>>>,
}

impl Geo {
    pub(crate) fn open(geodb: &Path) -> Result<Self, Error> {
        let reader = Reader::open_readfile(geodb)?;

        Ok(Self {
            geodb_file: geodb.to_owned(),
            geodb: Mutex::new(reader),
        })
    }

    /// Closes and reopens the city database, typically to pick up a
    /// newer version. The old reader keeps serving if reopening fails.
    pub(crate) fn reopen(&self) -> Result<(), Error> {
        let mut geodb = self.geodb.lock();
        *geodb = Reader::open_readfile(&self.geodb_file)?;
        Ok(())
    }

    fn locate(&self, client: IpAddr) -> Option<(f64, f64)> {
        let geodb = self.geodb.lock();

        let city: City<'_> = match geodb.lookup(client) {
            Ok(city) => city,
            Err(e) => {
                tracing::debug!(client = %client, error = %e, "City lookup failed");
                return None;
            }
        };

        let location = city.location?;
        Some((location.latitude?, location.longitude?))
    }

    /// Attempts to find the server(s) closest to the client.
    ///
    /// Returns `Ok(None)` when the client cannot be located or no
    /// candidate survives filtering, leaving the caller to fall back to
    /// any static records the zone carries.
    #[instrument(level = "debug", skip(self, servers, params))]
    pub(crate) fn find_closest_server(
        &self,
        servers: &[ServerEntry],
        client: &str,
        params: &GeoParams,
    ) -> Result<Option<Vec<ServerEntry>>, Error> {
        let Ok(address) = client.parse::<IpAddr>() else {
            tracing::error!(client, "Can't do city lookup on client address");
            return Ok(None);
        };

        let Some(origin) = self.locate(address) else {
            tracing::error!(client, "Can't do city lookup on client address");
            return Ok(None);
        };

        rank_servers(
            origin,
            servers,
            client,
            params,
            Utc::now().timestamp() as f64,
        )
    }
}

/// A hash of the client address, used to pick deterministically among
/// servers tied at the minimum distance: the last group of an
/// IPv6-form address as hex, or the last octet of an IPv4-form address
/// as decimal.
pub(crate) fn client_hash(client: &str) -> Result<u32, Error> {
    let bad = || Error::BadClientAddress {
        address: client.to_string(),
    };

    if client.contains(':') {
        let group = client.rsplit(':').next().unwrap_or_default();
        u32::from_str_radix(group, 16).map_err(|_| bad())
    } else if client.contains('.') {
        let octet = client.rsplit('.').next().unwrap_or_default();
        octet.parse().map_err(|_| bad())
    } else {
        Err(bad())
    }
}

/// Ranks candidate servers by distance from `origin` and selects the
/// reply set. Pure with respect to the GeoIP database, which has
/// already been consulted to produce `origin`.
pub(crate) fn rank_servers(
    origin: (f64, f64),
    servers: &[ServerEntry],
    client: &str,
    params: &GeoParams,
    now: f64,
) -> Result<Option<Vec<ServerEntry>>, Error> {
    let precision = params.precision.unwrap_or(GCS_DISTANCE_PRECISION);

    let mut mindist = f64::MAX;
    let mut ranked: Vec<&ServerEntry> = Vec::new();

    for server in servers {
        if let Some(load) = server.load {
            // A negative reported load marks the server unavailable.
            if load < 0.0 {
                continue;
            }

            if let Some(maxload) = params.maxload {
                if load > maxload {
                    continue;
                }
            }
        }

        // A server that has stopped updating its entry is probably
        // dead; a negative timestamp marks a static entry that does
        // not age out.
        if let (Some(maxage), Some(ts)) = (params.maxage, server.ts) {
            if ts >= 0.0 && now - ts > maxage {
                continue;
            }
        }

        let dist = gcs_distance(origin, (server.lat, server.lon), precision);

        if let Some(maxdist) = params.maxdist {
            if maxdist >= 0.0 && dist > maxdist {
                continue;
            }
        }

        if dist <= mindist {
            if dist < mindist {
                mindist = dist;
                ranked.clear();
            }
            ranked.push(server);
        }
    }

    if ranked.is_empty() {
        return Ok(None);
    }

    if ranked.len() > 1 {
        let idx = (client_hash(client)? as usize) % ranked.len();
        let maxreplies = params.maxreplies.unwrap_or(1);

        // Keep maxreplies entries starting at the hashed index,
        // wrapping past the end of the list. When the whole list fits
        // it is returned as-is.
        if maxreplies < ranked.len() {
            ranked = ranked.iter().cycle().skip(idx).take(maxreplies).copied().collect();
        }
    }

    Ok(Some(ranked.into_iter().cloned().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::server_entry;

    fn candidates() -> Vec<ServerEntry> {
        vec![
            server_entry("s1", 0.0, 0.0, &["1.1.1.1"], &[]),
            server_entry("s2", 0.0, 90.0, &["2.2.2.2"], &[]),
        ]
    }

    #[test]
    fn nearest_wins() {
        let params = GeoParams::default();

        // A client near the prime meridian gets s1, one near 90E gets s2.
        let near_s1 = rank_servers((0.0, 0.0), &candidates(), "10.0.0.1", &params, 0.0)
            .unwrap()
            .unwrap();
        assert_eq!(near_s1.len(), 1);
        assert_eq!(near_s1[0].name, "s1");

        let near_s2 = rank_servers((0.0, 85.0), &candidates(), "10.0.0.1", &params, 0.0)
            .unwrap()
            .unwrap();
        assert_eq!(near_s2.len(), 1);
        assert_eq!(near_s2[0].name, "s2");
    }

    #[test]
    fn idempotent() {
        let params = GeoParams::default();

        let first = rank_servers((12.3, 45.6), &candidates(), "10.0.0.7", &params, 0.0).unwrap();
        for _ in 0..5 {
            let again =
                rank_servers((12.3, 45.6), &candidates(), "10.0.0.7", &params, 0.0).unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn unavailable_and_overloaded_dropped() {
        let mut servers = candidates();
        servers[0].load = Some(-1.0);

        let params = GeoParams::default();
        let picked = rank_servers((0.0, 0.0), &servers, "10.0.0.1", &params, 0.0)
            .unwrap()
            .unwrap();
        assert_eq!(picked[0].name, "s2");

        let mut servers = candidates();
        servers[0].load = Some(8.0);
        servers[1].load = Some(2.0);

        let params = GeoParams {
            maxload: Some(5.0),
            ..Default::default()
        };
        let picked = rank_servers((0.0, 0.0), &servers, "10.0.0.1", &params, 0.0)
            .unwrap()
            .unwrap();
        assert_eq!(picked[0].name, "s2");
    }

    #[test]
    fn stale_entries_dropped() {
        let mut servers = candidates();
        servers[0].ts = Some(100.0);
        servers[1].ts = Some(950.0);

        let params = GeoParams {
            maxage: Some(60.0),
            ..Default::default()
        };
        let picked = rank_servers((0.0, 0.0), &servers, "10.0.0.1", &params, 1000.0)
            .unwrap()
            .unwrap();
        assert_eq!(picked[0].name, "s2");

        // A negative timestamp never ages out.
        servers[0].ts = Some(-1.0);
        let picked = rank_servers((0.0, 0.0), &servers, "10.0.0.1", &params, 1000.0)
            .unwrap()
            .unwrap();
        assert_eq!(picked[0].name, "s1");
    }

    #[test]
    fn maxdist_filter() {
        let params = GeoParams {
            maxdist: Some(1000.0),
            ..Default::default()
        };
        assert_eq!(
            rank_servers((0.0, 45.0), &candidates(), "10.0.0.1", &params, 0.0).unwrap(),
            None
        );

        // Negative means unbounded.
        let params = GeoParams {
            maxdist: Some(-1.0),
            ..Default::default()
        };
        assert!(rank_servers((0.0, 45.0), &candidates(), "10.0.0.1", &params, 0.0)
            .unwrap()
            .is_some());
    }

    #[test]
    fn tie_break_determinism() {
        // Both servers at the same spot tie at every distance; the
        // client hash alone picks the winner.
        let servers = vec![
            server_entry("s1", 10.0, 10.0, &["1.1.1.1"], &[]),
            server_entry("s2", 10.0, 10.0, &["2.2.2.2"], &[]),
        ];
        let params = GeoParams::default();

        let picked = rank_servers((10.0, 10.0), &servers, "192.0.2.4", &params, 0.0)
            .unwrap()
            .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "s1");

        let picked = rank_servers((10.0, 10.0), &servers, "192.0.2.5", &params, 0.0)
            .unwrap()
            .unwrap();
        assert_eq!(picked[0].name, "s2");

        // IPv6 clients hash on the final group, in hex.
        let picked = rank_servers((10.0, 10.0), &servers, "2001:db8::a", &params, 0.0)
            .unwrap()
            .unwrap();
        assert_eq!(picked[0].name, "s1");

        let picked = rank_servers((10.0, 10.0), &servers, "2001:db8::b", &params, 0.0)
            .unwrap()
            .unwrap();
        assert_eq!(picked[0].name, "s2");
    }

    #[test]
    fn maxreplies_slices_with_wraparound() {
        let servers = vec![
            server_entry("s1", 10.0, 10.0, &["1.1.1.1"], &[]),
            server_entry("s2", 10.0, 10.0, &["2.2.2.2"], &[]),
            server_entry("s3", 10.0, 10.0, &["3.3.3.3"], &[]),
        ];
        let params = GeoParams {
            maxreplies: Some(2),
            ..Default::default()
        };

        // Last octet 5 -> idx 2: the slice wraps to the list head.
        let picked = rank_servers((10.0, 10.0), &servers, "192.0.2.5", &params, 0.0)
            .unwrap()
            .unwrap();
        let names: Vec<&str> = picked.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["s3", "s1"]);

        // When maxreplies covers the whole list it is returned as-is.
        let params = GeoParams {
            maxreplies: Some(3),
            ..Default::default()
        };
        let picked = rank_servers((10.0, 10.0), &servers, "192.0.2.5", &params, 0.0)
            .unwrap()
            .unwrap();
        let names: Vec<&str> = picked.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn bad_client_address() {
        let servers = vec![
            server_entry("s1", 10.0, 10.0, &["1.1.1.1"], &[]),
            server_entry("s2", 10.0, 10.0, &["2.2.2.2"], &[]),
        ];
        let params = GeoParams::default();

        let result = rank_servers((10.0, 10.0), &servers, "localhost", &params, 0.0);
        assert!(matches!(result, Err(Error::BadClientAddress { .. })));
    }

    #[test]
    fn client_hashes() {
        assert_eq!(client_hash("192.0.2.45").unwrap(), 45);
        assert_eq!(client_hash("2001:db8::1f").unwrap(), 0x1f);
        assert!(client_hash("2001:db8::").is_err());
        assert!(client_hash("nonsense").is_err());
    }
}
