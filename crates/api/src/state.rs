use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use viewer_store::AccountStore;
use viewer_terminal::Supervisor;

/// How many relayed payloads a slow subscriber may fall behind before it
/// starts losing them.
const RELAY_BUFFER: usize = 256;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    /// Account persistence. The mutex keeps each handler's
    /// read-modify-write of the list atomic.
    pub store: Mutex<AccountStore>,
    pub supervisor: Arc<Supervisor>,
    /// Fan-out for telemetry payloads posted by running terminals.
    pub relay_tx: broadcast::Sender<serde_json::Value>,
}

impl AppState {
    pub fn new(store: AccountStore, supervisor: Arc<Supervisor>) -> Self {
        let (relay_tx, _) = broadcast::channel(RELAY_BUFFER);
        Self {
            store: Mutex::new(store),
            supervisor,
            relay_tx,
        }
    }
}
