use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// The MetaTrader platform generation an account trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Mt4,
    Mt5,
}

impl Platform {
    /// Name of the MQL data directory the terminal expects (`MQL4` / `MQL5`).
    pub fn mql_dir(&self) -> &'static str {
        match self {
            Platform::Mt4 => "MQL4",
            Platform::Mt5 => "MQL5",
        }
    }

    /// Compiled expert-advisor extension for this platform.
    pub fn agent_extension(&self) -> &'static str {
        match self {
            Platform::Mt4 => "ex4",
            Platform::Mt5 => "ex5",
        }
    }

    /// Subdirectory of the resources tree holding this platform's artifacts.
    pub fn resource_dir(&self) -> &'static str {
        match self {
            Platform::Mt4 => "MT4",
            Platform::Mt5 => "MT5",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mt4 => "mt4",
            Platform::Mt5 => "mt5",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown platform {0:?} (expected \"mt4\" or \"mt5\")")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mt4" => Ok(Platform::Mt4),
            "mt5" => Ok(Platform::Mt5),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Account identity
// ---------------------------------------------------------------------------

/// Composite key identifying one tradable account configuration.
///
/// Used as the registry key for running terminals, so it must stay a value
/// type rather than a formatted string (logins may contain any character).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub platform: Platform,
    pub login: String,
}

impl AccountKey {
    pub fn new(platform: Platform, login: impl Into<String>) -> Self {
        Self {
            platform,
            login: login.into(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.platform, self.login)
    }
}

// ---------------------------------------------------------------------------
// Account record
// ---------------------------------------------------------------------------

/// Whether a terminal is currently running for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Stopped,
    Running,
}

impl Default for AccountStatus {
    fn default() -> Self {
        AccountStatus::Stopped
    }
}

/// One persisted account: credentials, server, and the terminal executable
/// used to launch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub platform: Platform,
    pub login: String,
    pub password: String,
    pub server: String,
    /// Path to the MetaTrader terminal executable for this account.
    pub terminal_path: PathBuf,
    #[serde(default)]
    pub status: AccountStatus,
}

impl AccountRecord {
    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.platform, self.login.clone())
    }
}
