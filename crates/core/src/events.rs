use crate::models::AccountKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events reported by a terminal's monitor task to the supervisor loop.
///
/// Both variants end in teardown; they are distinguished so logs can tell an
/// unattended death from an operator-requested stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TerminalEvent {
    /// The terminal process exited on its own.
    Exited {
        key: AccountKey,
        launch_id: Uuid,
        exit_code: Option<i32>,
    },
    /// The terminal process was killed in response to a stop request.
    Killed { key: AccountKey, launch_id: Uuid },
}

impl TerminalEvent {
    pub fn key(&self) -> &AccountKey {
        match self {
            TerminalEvent::Exited { key, .. } => key,
            TerminalEvent::Killed { key, .. } => key,
        }
    }
}
