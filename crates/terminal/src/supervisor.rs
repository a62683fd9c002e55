use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use viewer_core::{AccountKey, AccountRecord, Platform, TerminalEvent};

use crate::workspace::{Workspace, WorkspaceBuilder};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a terminal launch was refused or failed.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("terminal already running for {0}")]
    AlreadyRunning(AccountKey),
    #[error("workspace setup failed: {0}")]
    Filesystem(#[source] std::io::Error),
    #[error("failed to launch {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a stop request failed.
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("no running terminal for {0}")]
    NotRunning(AccountKey),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One live terminal: the account snapshot it was launched with, the
/// workspace it owns, and the handle used to ask its monitor task to kill it.
struct RunningInstance {
    account: AccountRecord,
    workspace: Workspace,
    kill_tx: oneshot::Sender<()>,
    launch_id: Uuid,
    started_at: DateTime<Utc>,
}

/// Read-only view of a running instance for the presentation boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunningSummary {
    pub key: AccountKey,
    pub launch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub workspace_root: PathBuf,
    pub server: String,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns the `AccountKey -> RunningInstance` registry and the lifecycle of
/// every spawned terminal.
///
/// Each spawned child is owned by a monitor task that reports its end (exit
/// or kill) as a [`TerminalEvent`] on one mpsc channel; a single event loop
/// consumes those and runs teardown, so registry mutations on the async path
/// have one writer.
pub struct Supervisor {
    registry: Mutex<HashMap<AccountKey, RunningInstance>>,
    events_tx: mpsc::UnboundedSender<TerminalEvent>,
    builder: WorkspaceBuilder,
}

impl Supervisor {
    /// Create a supervisor and spawn its event loop.
    pub fn new(builder: WorkspaceBuilder) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            events_tx,
            builder,
        });
        // The loop holds a weak handle so dropping the last supervisor Arc
        // closes the channel and lets the loop task finish.
        tokio::spawn(Self::run_event_loop(Arc::downgrade(&supervisor), events_rx));
        supervisor
    }

    /// Launch a terminal for `account`.
    ///
    /// Builds the workspace, installs agent artifacts, writes the generated
    /// config, spawns the executable with the workspace as its working
    /// directory, and registers the instance before returning. Every failure
    /// path after workspace creation removes the workspace again, so a failed
    /// start leaks nothing.
    pub async fn start(&self, account: &AccountRecord) -> Result<Uuid, StartError> {
        let key = account.key();
        // Cheap pre-check so the common double-start case never touches disk.
        // The registry lock is not held across the filesystem work below; the
        // insert re-checks the key instead.
        if self.registry.lock().await.contains_key(&key) {
            return Err(StartError::AlreadyRunning(key));
        }

        let workspace = self
            .builder
            .build(account.platform, &account.login)
            .map_err(StartError::Filesystem)?;

        let mut child = match self.launch(account, &workspace) {
            Ok(child) => child,
            Err(err) => {
                workspace.remove();
                return Err(err);
            }
        };

        let mut registry = self.registry.lock().await;
        if registry.contains_key(&key) {
            // Lost a race with a concurrent start for the same account;
            // discard this launch and keep the registered one.
            if let Err(err) = child.start_kill() {
                warn!(%key, %err, "failed to signal duplicate terminal");
            }
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            workspace.remove();
            return Err(StartError::AlreadyRunning(key));
        }

        let launch_id = Uuid::new_v4();
        let (kill_tx, kill_rx) = oneshot::channel();
        info!(%key, %launch_id, workspace = %workspace.root.display(), "terminal started");

        registry.insert(
            key.clone(),
            RunningInstance {
                account: account.clone(),
                workspace,
                kill_tx,
                launch_id,
                started_at: Utc::now(),
            },
        );
        tokio::spawn(monitor(child, key, launch_id, kill_rx, self.events_tx.clone()));

        Ok(launch_id)
    }

    fn launch(&self, account: &AccountRecord, workspace: &Workspace) -> Result<Child, StartError> {
        self.builder
            .install_agent_artifacts(workspace, account.platform)
            .map_err(StartError::Filesystem)?;
        let config_path = self
            .builder
            .write_config(workspace)
            .map_err(StartError::Filesystem)?;

        let mut command = Command::new(&account.terminal_path);
        command
            .arg("--portable")
            .arg(format!("--config={}", config_path.display()))
            .arg(format!("--login={}", account.login))
            .arg(format!("--password={}", account.password))
            .arg(format!("--server={}", account.server))
            .current_dir(&workspace.root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if account.platform == Platform::Mt5 {
            command.arg("--profile=EAProfile");
        }

        command.spawn().map_err(|source| StartError::Spawn {
            path: account.terminal_path.clone(),
            source,
        })
    }

    /// Stop the terminal for `key`: ask its monitor to kill the process, then
    /// tear the instance down. Stopping an account with no running instance
    /// is a [`StopError::NotRunning`] and touches nothing.
    pub async fn stop(&self, key: &AccountKey) -> Result<(), StopError> {
        let instance = self.registry.lock().await.remove(key);
        let Some(instance) = instance else {
            return Err(StopError::NotRunning(key.clone()));
        };

        // The send only fails if the monitor already finished, meaning the
        // process exited on its own and its event is in flight; teardown is
        // idempotent either way.
        if instance.kill_tx.send(()).is_err() {
            debug!(%key, "terminal already exiting during stop");
        }
        instance.workspace.remove();
        info!(%key, launch_id = %instance.launch_id, "terminal stopped");
        Ok(())
    }

    /// Stop and tear down every running instance. One failing instance never
    /// blocks the others; all signalling and deletion here is best-effort.
    pub async fn shutdown(&self) {
        let mut registry = self.registry.lock().await;
        if registry.is_empty() {
            return;
        }
        info!(count = registry.len(), "stopping all running terminals");
        for (key, instance) in registry.drain() {
            if instance.kill_tx.send(()).is_err() {
                debug!(%key, "terminal already exiting during shutdown");
            }
            instance.workspace.remove();
        }
    }

    pub async fn is_running(&self, key: &AccountKey) -> bool {
        self.registry.lock().await.contains_key(key)
    }

    /// Snapshot of all running instances.
    pub async fn running(&self) -> Vec<RunningSummary> {
        self.registry
            .lock()
            .await
            .values()
            .map(|instance| RunningSummary {
                key: instance.account.key(),
                launch_id: instance.launch_id,
                started_at: instance.started_at,
                workspace_root: instance.workspace.root.clone(),
                server: instance.account.server.clone(),
            })
            .collect()
    }

    async fn run_event_loop(
        supervisor: Weak<Self>,
        mut events_rx: mpsc::UnboundedReceiver<TerminalEvent>,
    ) {
        while let Some(event) = events_rx.recv().await {
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };
            match &event {
                TerminalEvent::Exited { key, exit_code, .. } => {
                    info!(%key, ?exit_code, "terminal exited")
                }
                TerminalEvent::Killed { key, .. } => debug!(%key, "terminal kill confirmed"),
            }
            supervisor.teardown(event.key()).await;
        }
    }

    /// Release whatever is still registered for `key`. Safe to call for an
    /// absent key and for an already-deleted workspace.
    async fn teardown(&self, key: &AccountKey) {
        let instance = self.registry.lock().await.remove(key);
        if let Some(instance) = instance {
            instance.workspace.remove();
        }
    }
}

/// Owns one spawned child until it ends. Reports the terminating edge to the
/// supervisor loop; on a kill request the signalling itself is best-effort
/// because the process may already be gone.
async fn monitor(
    mut child: Child,
    key: AccountKey,
    launch_id: Uuid,
    mut kill_rx: oneshot::Receiver<()>,
    events_tx: mpsc::UnboundedSender<TerminalEvent>,
) {
    tokio::select! {
        status = child.wait() => {
            let exit_code = match status {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(%key, %err, "failed to reap terminal process");
                    None
                }
            };
            let _ = events_tx.send(TerminalEvent::Exited { key, launch_id, exit_code });
        }
        _ = &mut kill_rx => {
            if let Err(err) = child.start_kill() {
                warn!(%key, %err, "failed to signal terminal process");
            }
            if let Err(err) = child.wait().await {
                warn!(%key, %err, "failed to reap killed terminal process");
            }
            let _ = events_tx.send(TerminalEvent::Killed { key, launch_id });
        }
    }
}
