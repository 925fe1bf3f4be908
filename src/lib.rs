#![deny(unreachable_pub)]
mod config;
mod dns;
mod error;
mod feed;
mod geo;
#[cfg(test)]
mod test;
mod zone;

use std::{collections::HashMap, fs::File, net::SocketAddr, path::Path, sync::Arc, time::Duration};

pub use config::{Config, DatabaseConfig, Options, ServerConfig};
pub use error::Error;
use tokio::{select, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

use crate::{
    dns::{Dispatcher, DnsServer},
    feed::ConfigFeed,
    geo::{Geo, GeoCache},
    zone::{ServerEntry, ServerState, Zone},
};

const IDLE_INTERVAL: Duration = Duration::from_secs(1);

pub struct Server {
    dns_server: DnsServer,
    feed: Option<ConfigFeed>,
    geo: Option<Arc<Geo>>,
    token: CancellationToken,
    idle: Option<JoinHandle<()>>,
}

fn load_seed<T>(path: &Path) -> Result<HashMap<String, T>, Error>
where
    T: serde::de::DeserializeOwned,
{
    let file = File::open(path)?;
    Ok(serde_json::from_reader(file)?)
}

async fn seed_tables(config: &Config, state: &ServerState) -> Result<(), Error> {
    if let Some(zones_file) = &config.zones_file {
        let zones: HashMap<String, Zone> = load_seed(zones_file)?;
        tracing::info!(
            file = %zones_file.display(),
            zones = zones.len(),
            "Seeded zone table"
        );
        *state.zones.write().await = zones;
    }

    if let Some(servers_file) = &config.servers_file {
        let servers: HashMap<String, Vec<ServerEntry>> = load_seed(servers_file)?;
        tracing::info!(
            file = %servers_file.display(),
            sets = servers.len(),
            "Seeded server table"
        );
        *state.servers.write().await = servers;
    }

    Ok(())
}

impl Server {
    pub async fn new(config_path: &Path) -> Result<Self, Error> {
        let config = Config::from_file(config_path)?;
        Server::with_config(config).await
    }

    pub async fn with_config(config: Config) -> Result<Self, Error> {
        let state = ServerState::default();
        seed_tables(&config, &state).await?;

        // Without a city database every geo-dist zone falls back to
        // its static records.
        let geo = match &config.geodb {
            Some(geodb) => match Geo::open(geodb) {
                Ok(geo) => Some(Arc::new(geo)),
                Err(e) => {
                    tracing::error!(
                        geodb = %geodb.display(),
                        error = %e,
                        "Unable to open GeoIP database, geo-dist zones will serve static fallbacks."
                    );
                    None
                }
            },
            None => None,
        };

        let cache = Arc::new(GeoCache::new());

        let dispatcher = Dispatcher::new(
            state.clone(),
            geo.clone(),
            cache.clone(),
            config.options.clone(),
        );

        let dns_server =
            DnsServer::new(&config.server, dispatcher, config.options.max_inflight).await?;

        let feed = match &config.database {
            Some(database) => Some(ConfigFeed::start(database, state.clone()).await?),
            None => None,
        };

        let token = CancellationToken::new();
        let idle = tokio::spawn(idle_loop(cache, token.clone()));

        Ok(Self {
            dns_server,
            feed,
            geo,
            token,
            idle: Some(idle),
        })
    }

    /// Closes and reopens the GeoIP database, typically after a newer
    /// version has been dropped into place.
    pub fn reopen_geodb(&self) -> Result<(), Error> {
        if let Some(geo) = &self.geo {
            tracing::info!("Reopening GeoIP database");
            geo.reopen()?;
        }

        Ok(())
    }

    pub fn udp_local_addr(&self) -> SocketAddr {
        self.dns_server.udp_local_addr()
    }

    pub fn tcp_local_addr(&self) -> SocketAddr {
        self.dns_server.tcp_local_addr()
    }

    pub async fn shutdown(&mut self) {
        tracing::info!("Server shutting down");

        self.token.cancel();
        if let Some(idle) = self.idle.take() {
            if let Err(e) = idle.await {
                tracing::error!(error = %e, "Idle task failed");
            }
        }

        self.dns_server.shutdown().await;

        if let Some(feed) = &mut self.feed {
            feed.shutdown().await;
        }
    }
}

/// Periodic housekeeping: evicts expired geo cache entries.
async fn idle_loop(cache: Arc<GeoCache>, token: CancellationToken) {
    let mut interval = time::interval(IDLE_INTERVAL);

    loop {
        select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => cache.evict_expired().await,
        }
    }
}
