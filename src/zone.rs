use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr},
    slice,
    sync::Arc,
};

use hickory_server::proto::rr::RecordType;
use serde::{Deserialize, Deserializer};
use tokio::sync::RwLock;

/// A field that may hold either a single value or a list of values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub(crate) fn iter(&self) -> slice::Iter<'_, T> {
        match self {
            OneOrMany::One(value) => slice::from_ref(value).iter(),
            OneOrMany::Many(values) => values.iter(),
        }
    }
}

/// The serial/refresh/retry/expire/minimum tuple of an SOA record.
pub(crate) type SoaTimes = (u32, i32, i32, i32, u32);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum RecordSpec {
    #[serde(rename = "SOA")]
    Soa {
        mname: String,
        rname: String,
        times: SoaTimes,
    },
    #[serde(rename = "A")]
    A { value: Ipv4Addr },
    #[serde(rename = "AAAA")]
    Aaaa { value: Ipv6Addr },
    #[serde(rename = "NS")]
    Ns { value: String },
    #[serde(rename = "CNAME")]
    Cname { value: String },
    #[serde(rename = "TXT")]
    Txt { value: String },
    #[serde(rename = "PTR")]
    Ptr { value: String },
    #[serde(rename = "MX")]
    Mx { value: String, pref: u16 },
}

impl RecordSpec {
    pub(crate) fn record_type(&self) -> RecordType {
        match self {
            RecordSpec::Soa { .. } => RecordType::SOA,
            RecordSpec::A { .. } => RecordType::A,
            RecordSpec::Aaaa { .. } => RecordType::AAAA,
            RecordSpec::Ns { .. } => RecordType::NS,
            RecordSpec::Cname { .. } => RecordType::CNAME,
            RecordSpec::Txt { .. } => RecordType::TXT,
            RecordSpec::Ptr { .. } => RecordType::PTR,
            RecordSpec::Mx { .. } => RecordType::MX,
        }
    }
}

fn deserialize_rr<'de, D>(de: D) -> Result<Vec<RecordSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(de)?;

    Ok(raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(spec) => Some(spec),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unsupported resource record");
                None
            }
        })
        .collect())
}

fn deserialize_rr_opt<'de, D>(de: D) -> Result<Option<Vec<RecordSpec>>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_rr(de).map(Some)
}

/// Parameters influencing geo-dist server selection, set per zone.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub(crate) struct GeoParams {
    #[serde(default)]
    pub(crate) maxload: Option<f64>,

    #[serde(default)]
    pub(crate) maxage: Option<f64>,

    #[serde(default)]
    pub(crate) maxdist: Option<f64>,

    #[serde(default)]
    pub(crate) precision: Option<f64>,

    #[serde(default)]
    pub(crate) maxreplies: Option<usize>,
}

impl GeoParams {
    /// Canonical string form used as part of the geo cache key.
    pub(crate) fn cache_key(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        if let Some(maxload) = self.maxload {
            parts.push(format!("maxload={}", maxload));
        }
        if let Some(maxage) = self.maxage {
            parts.push(format!("maxage={}", maxage));
        }
        if let Some(maxdist) = self.maxdist {
            parts.push(format!("maxdist={}", maxdist));
        }
        if let Some(precision) = self.precision {
            parts.push(format!("precision={}", precision));
        }
        if let Some(maxreplies) = self.maxreplies {
            parts.push(format!("maxreplies={}", maxreplies));
        }

        parts.join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct StaticZone {
    #[serde(deserialize_with = "deserialize_rr")]
    pub(crate) rr: Vec<RecordSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct GeoDistZone {
    #[serde(default)]
    pub(crate) servers: Option<String>,

    #[serde(default)]
    pub(crate) params: GeoParams,

    #[serde(default, deserialize_with = "deserialize_rr_opt")]
    pub(crate) rr: Option<Vec<RecordSpec>>,

    #[serde(default)]
    pub(crate) geo_cache_ttl: Option<u64>,

    #[serde(default)]
    pub(crate) debug: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum ZoneKind {
    #[serde(rename = "static")]
    Static(StaticZone),

    #[serde(rename = "geo-dist")]
    GeoDist(GeoDistZone),
}

/// A configured zone. Keys in the zone table are the fully-qualified
/// name exactly as it appears on the wire, trailing dot included.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct Zone {
    #[serde(default)]
    pub(crate) ttl: Option<u32>,

    #[serde(flatten)]
    pub(crate) kind: ZoneKind,
}

/// One member of a server set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct ServerEntry {
    pub(crate) name: String,

    #[serde(default)]
    pub(crate) city: Option<String>,

    pub(crate) lat: f64,
    pub(crate) lon: f64,

    #[serde(default)]
    pub(crate) ipv4: Option<OneOrMany<Ipv4Addr>>,

    #[serde(default)]
    pub(crate) ipv6: Option<OneOrMany<Ipv6Addr>>,

    /// Reported load; negative means the server is unavailable.
    #[serde(default)]
    pub(crate) load: Option<f64>,

    /// UNIX timestamp of the last update; negative means the entry is
    /// static and never ages out.
    #[serde(default)]
    pub(crate) ts: Option<f64>,
}

/// The in-memory zone and server tables, each guarded by its own lock.
/// Writers (the config feed) replace whole values under the write lock
/// so a reader always sees either the old or the new document for a key.
#[derive(Clone, Default)]
pub(crate) struct ServerState {
    pub(crate) zones: Arc<RwLock<HashMap<String, Zone>>>,
    pub(crate) servers: Arc<RwLock<HashMap<String, Vec<ServerEntry>>>>,
}

impl ServerState {
    pub(crate) async fn zone(&self, name: &str) -> Option<Zone> {
        self.zones.read().await.get(name).cloned()
    }

    pub(crate) async fn server_set(&self, name: &str) -> Option<Vec<ServerEntry>> {
        self.servers.read().await.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_zone() {
        let zone: Zone = serde_json::from_str(
            r#"{
                "type": "static",
                "ttl": 60,
                "rr": [
                    {"type": "A", "value": "10.0.0.1"},
                    {"type": "MX", "value": "mail.example.", "pref": 10},
                    {"type": "SOA", "mname": "ns.example.", "rname": "hostmaster.example.",
                     "times": [2024010101, 7200, 3600, 604800, 300]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(zone.ttl, Some(60));
        let ZoneKind::Static(inner) = zone.kind else {
            panic!("expected a static zone");
        };
        assert_eq!(inner.rr.len(), 3);
        assert_eq!(inner.rr[0].record_type(), RecordType::A);
        assert_eq!(inner.rr[1].record_type(), RecordType::MX);
        assert_eq!(inner.rr[2].record_type(), RecordType::SOA);
    }

    #[test]
    fn geo_dist_zone() {
        let zone: Zone = serde_json::from_str(
            r#"{
                "type": "geo-dist",
                "servers": "www",
                "params": {"maxreplies": 2, "maxload": 5.5},
                "geo_cache_ttl": 10,
                "debug": true,
                "rr": [{"type": "A", "value": "192.0.2.1"}]
            }"#,
        )
        .unwrap();

        assert_eq!(zone.ttl, None);
        let ZoneKind::GeoDist(inner) = zone.kind else {
            panic!("expected a geo-dist zone");
        };
        assert_eq!(inner.servers.as_deref(), Some("www"));
        assert_eq!(inner.params.maxreplies, Some(2));
        assert_eq!(inner.params.maxload, Some(5.5));
        assert_eq!(inner.geo_cache_ttl, Some(10));
        assert!(inner.debug);
        assert_eq!(inner.rr.as_ref().map(|rr| rr.len()), Some(1));
    }

    #[test]
    fn unknown_zone_type_rejected() {
        let result: Result<Zone, _> =
            serde_json::from_str(r#"{"type": "round-robin", "rr": []}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unsupported_record_skipped() {
        let zone: Zone = serde_json::from_str(
            r#"{
                "type": "static",
                "rr": [
                    {"type": "A", "value": "10.0.0.1"},
                    {"type": "NAPTR", "value": "whatever"},
                    {"type": "A", "value": "not-an-address"}
                ]
            }"#,
        )
        .unwrap();

        let ZoneKind::Static(inner) = zone.kind else {
            panic!("expected a static zone");
        };
        assert_eq!(inner.rr.len(), 1);
    }

    #[test]
    fn server_entry_addresses() {
        let entry: ServerEntry = serde_json::from_str(
            r#"{
                "name": "lhr1",
                "city": "London",
                "lat": 51.5,
                "lon": -0.1,
                "ipv4": "192.0.2.10",
                "ipv6": ["2001:db8::1", "2001:db8::2"],
                "load": 0.25,
                "ts": -1
            }"#,
        )
        .unwrap();

        assert_eq!(entry.ipv4.as_ref().unwrap().iter().count(), 1);
        assert_eq!(entry.ipv6.as_ref().unwrap().iter().count(), 2);
        assert_eq!(entry.load, Some(0.25));
        assert_eq!(entry.ts, Some(-1.0));

        let bare: ServerEntry =
            serde_json::from_str(r#"{"name": "sfo1", "lat": 37.77, "lon": -122.4}"#).unwrap();
        assert_eq!(bare.ipv4, None);
        assert_eq!(bare.load, None);
    }

    #[test]
    fn params_cache_key() {
        let params = GeoParams {
            maxreplies: Some(2),
            maxdist: Some(500.0),
            ..Default::default()
        };
        assert_eq!(params.cache_key(), "maxdist=500,maxreplies=2");
        assert_eq!(GeoParams::default().cache_key(), "");
    }
}
