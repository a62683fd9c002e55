//! Terminal process supervision for the trading-viewer hub.
//!
//! [`WorkspaceBuilder`] materializes an isolated per-launch directory tree for
//! a MetaTrader terminal (MQL experts dir, profiles dir, generated
//! `common.ini`); [`Supervisor`] spawns the terminal inside it, tracks the
//! running instance, and reclaims the workspace when the process exits or is
//! stopped.

pub mod supervisor;
pub mod workspace;

pub use supervisor::{RunningSummary, StartError, StopError, Supervisor};
pub use workspace::{Workspace, WorkspaceBuilder};
