use std::{cmp::min, time::Duration};

use futures::StreamExt;
use reqwest::{Client, Response, Url};
use serde_json::Value;
use tokio::{select, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{config::DatabaseConfig, zone::ServerState, Error};

const RECONNECT_INTERVAL_MS: u64 = 1000;

struct Backoff {
    default: u64,
    scaling: f64,
    max: u64,
    current: u64,
}

impl Backoff {
    fn new(interval: u64) -> Self {
        Backoff {
            default: interval,
            scaling: 1.2,
            max: interval * 30,
            current: interval,
        }
    }

    fn reset(&mut self) {
        self.current = self.default;
    }

    fn backoff(&mut self) {
        self.current = min(
            ((self.current as f64) * self.scaling).round() as u64,
            self.max,
        );
    }

    fn duration(&self) -> Duration {
        Duration::from_millis(self.current)
    }
}

/// The document tables mirrored into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Zones,
    Servers,
}

impl Table {
    /// Parses one changed document and writes it to its table. A
    /// document that fails to parse is skipped, leaving any previous
    /// value for the key in place.
    async fn apply(self, state: &ServerState, key: String, value: Value) {
        match self {
            Table::Zones => match serde_json::from_value(value) {
                Ok(zone) => {
                    state.zones.write().await.insert(key, zone);
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "Skipping invalid zone document");
                }
            },
            Table::Servers => match serde_json::from_value(value) {
                Ok(servers) => {
                    state.servers.write().await.insert(key, servers);
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "Skipping invalid server set document");
                }
            },
        }
    }
}

/// One change event from the feed: a map of key to complete new
/// document value.
#[derive(Debug, serde::Deserialize)]
struct ChangeEvent {
    #[serde(default)]
    new_val: Option<serde_json::Map<String, Value>>,
}

async fn apply_event(state: &ServerState, table: Table, line: &[u8]) {
    let event: ChangeEvent = match serde_json::from_slice(line) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(?table, error = %e, "Ignoring malformed change event");
            return;
        }
    };

    let Some(new_val) = event.new_val else {
        return;
    };

    for (key, value) in new_val {
        table.apply(state, key, value).await;
    }
}

fn changes_url(config: &DatabaseConfig, table: &str) -> Result<Url, Error> {
    config
        .url
        .join(&format!("{}/changes", table))
        .map_err(|e| Error::FeedUrlError {
            url: config.url.to_string(),
            message: e.to_string(),
        })
}

async fn subscribe(client: &Client, url: &Url, auth_key: &Option<String>) -> Result<Response, Error> {
    let mut request = client.get(url.clone()).query(&[("include_initial", "true")]);

    if let Some(auth_key) = auth_key {
        request = request.bearer_auth(auth_key);
    }

    Ok(request.send().await?.error_for_status()?)
}

enum StreamEnd {
    Cancelled,
    Disconnected,
}

/// Consumes one subscription until it is cancelled, ends or errors,
/// applying each newline-delimited change event to the table.
async fn stream_events(
    response: Response,
    state: &ServerState,
    table: Table,
    token: &CancellationToken,
) -> Result<StreamEnd, Error> {
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let chunk = select! {
            _ = token.cancelled() => return Ok(StreamEnd::Cancelled),
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else {
            return Ok(StreamEnd::Disconnected);
        };
        let chunk = chunk?;

        buf.extend_from_slice(&chunk);

        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];

            if line.is_empty() {
                continue;
            }

            apply_event(state, table, line).await;
        }
    }
}

#[instrument(fields(table = ?table, url = %url), skip_all)]
async fn watch_table(
    client: Client,
    url: Url,
    auth_key: Option<String>,
    first: Response,
    state: ServerState,
    table: Table,
    token: CancellationToken,
) {
    let mut backoff = Backoff::new(RECONNECT_INTERVAL_MS);
    let mut response = Some(first);

    loop {
        let subscription = match response.take() {
            Some(subscription) => subscription,
            None => {
                let subscribed = select! {
                    _ = token.cancelled() => return,
                    subscribed = subscribe(&client, &url, &auth_key) => subscribed,
                };

                match subscribed {
                    Ok(subscription) => {
                        tracing::info!("Reconnected to table feed");
                        backoff.reset();
                        subscription
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to reconnect to table feed");
                        backoff.backoff();

                        select! {
                            _ = token.cancelled() => return,
                            _ = sleep(backoff.duration()) => continue,
                        }
                    }
                }
            }
        };

        match stream_events(subscription, &state, table, &token).await {
            Ok(StreamEnd::Cancelled) => return,
            Ok(StreamEnd::Disconnected) => {
                tracing::warn!("Table feed disconnected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error reading table feed");
            }
        }

        // Stale tables keep serving until the feed comes back.
        backoff.backoff();
        select! {
            _ = token.cancelled() => return,
            _ = sleep(backoff.duration()) => {}
        }
    }
}

/// Mirrors the `zones` and `servers` tables of the document store into
/// the in-memory state: one watcher task per table, each holding its
/// own subscription that delivers the initial table contents followed
/// by every subsequent change.
pub(crate) struct ConfigFeed {
    token: CancellationToken,
    watchers: Vec<JoinHandle<()>>,
}

impl ConfigFeed {
    /// Opens the initial subscriptions. Failure to connect at startup
    /// is fatal; later disconnects are retried in the background.
    pub(crate) async fn start(
        config: &DatabaseConfig,
        state: ServerState,
    ) -> Result<Self, Error> {
        let client = Client::new();
        let token = CancellationToken::new();

        let mut watchers = Vec::new();

        for (table_name, table) in [
            (&config.zones_table, Table::Zones),
            (&config.servers_table, Table::Servers),
        ] {
            let url = changes_url(config, table_name)?;
            tracing::info!(table = %table_name, %url, "Subscribing to table feed");

            let first = subscribe(&client, &url, &config.auth_key).await?;

            watchers.push(tokio::spawn(watch_table(
                client.clone(),
                url,
                config.auth_key.clone(),
                first,
                state.clone(),
                table,
                token.clone(),
            )));
        }

        Ok(Self { token, watchers })
    }

    /// Cancels both watchers and waits for them to wind down; dropping
    /// a subscription closes its transport connection.
    pub(crate) async fn shutdown(&mut self) {
        tracing::debug!("Shutting down config feed");

        self.token.cancel();
        for watcher in self.watchers.drain(..) {
            if let Err(e) = watcher.await {
                tracing::error!(error = %e, "Feed watcher task failed");
            }
        }
    }
}
