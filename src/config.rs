use std::{
    fmt,
    net::IpAddr,
    path::{Path, PathBuf},
};

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use reqwest::Url;
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer,
};

use crate::Error;

struct UrlVisitor;

impl Visitor<'_> for UrlVisitor {
    type Value = Url;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a string that parses as a URL")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Url::parse(value).map_err(|e| E::custom(format!("{}", e)))
    }
}

pub(crate) fn deserialize_url<'de, D>(de: D) -> Result<Url, D::Error>
where
    D: Deserializer<'de>,
{
    de.deserialize_str(UrlVisitor)
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub address: Option<IpAddr>,

    #[serde(default)]
    pub port: Option<u16>,
}

fn default_zones_table() -> String {
    "zones".to_string()
}

fn default_servers_table() -> String {
    "servers".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(deserialize_with = "deserialize_url")]
    pub url: Url,

    #[serde(default)]
    pub auth_key: Option<String>,

    #[serde(default = "default_zones_table")]
    pub zones_table: String,

    #[serde(default = "default_servers_table")]
    pub servers_table: String,
}

fn default_ttl() -> u32 {
    1800
}

fn default_geo_cache_ttl() -> u64 {
    5
}

fn default_max_inflight() -> usize {
    128
}

fn default_distance_precision() -> f64 {
    crate::geo::GCS_DISTANCE_PRECISION
}

/// Process-wide tunables, collected into one immutable value built at
/// startup and passed to the components that consume them.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Options {
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,

    #[serde(default = "default_geo_cache_ttl")]
    pub geo_cache_ttl: u64,

    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    #[serde(default = "default_distance_precision")]
    pub distance_precision: f64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            default_ttl: default_ttl(),
            geo_cache_ttl: default_geo_cache_ttl(),
            max_inflight: default_max_inflight(),
            distance_precision: default_distance_precision(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub geodb: Option<PathBuf>,

    #[serde(default)]
    pub zones_file: Option<PathBuf>,

    #[serde(default)]
    pub servers_file: Option<PathBuf>,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub options: Options,
}

impl Config {
    pub fn from_file(config_file: &Path) -> Result<Config, Error> {
        let config = Figment::new()
            .join(Env::prefixed("GEODNS_").split("__"))
            .join(Yaml::file_exact(config_file))
            .extract()?;

        Ok(config)
    }
}
