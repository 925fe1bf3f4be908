use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DNS protocol error: {source}")]
    DnsError {
        #[from]
        source: hickory_server::proto::error::ProtoError,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: io::Error,
    },
    #[error("Config file error: {source}")]
    ConfigParseError {
        #[from]
        source: figment::Error,
    },
    #[error("Config feed error: {source}")]
    FeedError {
        #[from]
        source: reqwest::Error,
    },
    #[error("Invalid feed URL '{url}': {message}")]
    FeedUrlError { url: String, message: String },
    #[error("JSON parse error: {source}")]
    JsonParseError {
        #[from]
        source: serde_json::Error,
    },
    #[error("GeoIP database error: {source}")]
    GeoDbError {
        #[from]
        source: maxminddb::MaxMindDBError,
    },
    #[error("Badly formatted IP address: '{address}'")]
    BadClientAddress { address: String },
}
