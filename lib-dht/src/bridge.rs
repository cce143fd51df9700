//! Network bridge connection lifecycle
//!
//! The bridge walks a fixed endpoint preference order (local IPC endpoint,
//! then network endpoint, then bootstrap) and retries the whole list with
//! exponential backoff. State machine:
//! `DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTING -> DISCONNECTED`;
//! `connect` is rejected in any state but `DISCONNECTED`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::DhtError;
use crate::events::{names, EventBus};
use crate::peer::PeerContact;
use crate::transport::Transport;

/// Attempts against the full endpoint list before giving up.
pub const MAX_RETRIES: u32 = 3;

/// Base delay for the exponential backoff between retries.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Bridge connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Endpoint candidates in preference order.
#[derive(Debug, Clone, Default)]
pub struct BridgeEndpoints {
    /// Local IPC endpoint, tried first.
    pub ipc: Option<String>,
    /// Direct network endpoint.
    pub network: Option<String>,
    /// Bootstrap endpoint of last resort.
    pub bootstrap: Option<String>,
}

impl BridgeEndpoints {
    fn ordered(&self) -> Vec<&str> {
        [&self.ipc, &self.network, &self.bootstrap]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

/// Connection manager over a pluggable transport.
pub struct Bridge {
    transport: Arc<dyn Transport>,
    endpoints: BridgeEndpoints,
    state: RwLock<BridgeState>,
    remote: RwLock<Option<PeerContact>>,
    events: EventBus,
}

impl Bridge {
    pub fn new(transport: Arc<dyn Transport>, endpoints: BridgeEndpoints, events: EventBus) -> Self {
        Self {
            transport,
            endpoints,
            state: RwLock::new(BridgeState::Disconnected),
            remote: RwLock::new(None),
            events,
        }
    }

    pub async fn state(&self) -> BridgeState {
        *self.state.read().await
    }

    /// The peer reached by the last successful connect.
    pub async fn remote(&self) -> Option<PeerContact> {
        self.remote.read().await.clone()
    }

    /// Establish a connection through the first reachable endpoint.
    pub async fn connect(&self) -> Result<PeerContact, DhtError> {
        {
            let mut state = self.state.write().await;
            if *state != BridgeState::Disconnected {
                return Err(DhtError::AlreadyConnected);
            }
            *state = BridgeState::Connecting;
        }

        let endpoints = self.endpoints.ordered();
        if endpoints.is_empty() {
            *self.state.write().await = BridgeState::Disconnected;
            return Err(DhtError::Transport("no endpoints configured".to_string()));
        }

        let mut last_error = DhtError::Transport("unreachable".to_string());
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                debug!(attempt, ?backoff, "bridge retrying after backoff");
                tokio::time::sleep(backoff).await;
            }
            for endpoint in &endpoints {
                match self.transport.dial(endpoint).await {
                    Ok(contact) => {
                        *self.remote.write().await = Some(contact.clone());
                        *self.state.write().await = BridgeState::Connected;
                        info!(endpoint, peer = %contact.id, "bridge connected");
                        self.events.emit(
                            names::PEER_CONNECT,
                            json!({ "id": contact.id.to_hex(), "endpoint": endpoint }),
                        );
                        return Ok(contact);
                    }
                    Err(e) => {
                        debug!(endpoint, error = %e, "bridge dial failed");
                        last_error = e;
                    }
                }
            }
        }

        warn!(error = %last_error, "bridge exhausted endpoints");
        *self.state.write().await = BridgeState::Disconnected;
        self.events
            .emit(names::ERROR, json!({ "error": last_error.to_string() }));
        Err(last_error)
    }

    /// Tear the connection down.
    pub async fn disconnect(&self) -> Result<(), DhtError> {
        {
            let mut state = self.state.write().await;
            if *state != BridgeState::Connected {
                return Err(DhtError::NotRunning);
            }
            *state = BridgeState::Disconnecting;
        }
        let remote = self.remote.write().await.take();
        *self.state.write().await = BridgeState::Disconnected;
        if let Some(contact) = remote {
            self.events
                .emit(names::PEER_DISCONNECT, json!({ "id": contact.id.to_hex() }));
        }
        Ok(())
    }
}
