use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, warn};
use viewer_core::Platform;

/// Filename (minus extension) of the expert advisor pushed into each
/// workspace so the terminal reports telemetry back to the hub.
const AGENT_NAME: &str = "TradingViewer";

/// MT5 chart template that auto-attaches the agent.
const PROFILE_TEMPLATE: &str = "EAProfile.tpl";

/// An isolated directory tree for one terminal launch.
///
/// Owned by exactly one running instance; removed (best-effort) when that
/// instance is torn down.
#[derive(Debug)]
pub struct Workspace {
    pub root: PathBuf,
    pub experts_dir: PathBuf,
    pub profiles_dir: PathBuf,
}

impl Workspace {
    /// Recursively delete the workspace tree. Best-effort: failures are
    /// logged and swallowed so cleanup can never abort a caller, and an
    /// already-removed tree is a no-op.
    pub fn remove(&self) {
        if let Err(err) = fs::remove_dir_all(&self.root) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(root = %self.root.display(), %err, "failed to remove workspace");
            }
        }
    }
}

/// Builds terminal workspaces under a temp root and stamps them with the
/// agent artifacts and generated configuration.
#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    resources_dir: PathBuf,
    relay_port: u16,
    temp_root: PathBuf,
}

impl WorkspaceBuilder {
    pub fn new(resources_dir: impl Into<PathBuf>, relay_port: u16) -> Self {
        Self {
            resources_dir: resources_dir.into(),
            relay_port,
            temp_root: std::env::temp_dir(),
        }
    }

    /// Override the directory workspaces are allocated under.
    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self
    }

    /// Create a fresh uniquely named workspace with the directory layout the
    /// terminal expects. The login only prefixes the directory name for
    /// readability; uniqueness comes from the temp allocation itself.
    pub fn build(&self, platform: Platform, login: &str) -> io::Result<Workspace> {
        fs::create_dir_all(&self.temp_root)?;
        let root = tempfile::Builder::new()
            .prefix(&format!("{platform}_{login}_"))
            .tempdir_in(&self.temp_root)?
            .keep();

        let experts_dir = root.join(platform.mql_dir()).join("Experts");
        let profiles_dir = root.join("Profiles");
        fs::create_dir_all(&experts_dir)?;
        fs::create_dir_all(&profiles_dir)?;

        Ok(Workspace {
            root,
            experts_dir,
            profiles_dir,
        })
    }

    /// Copy the platform's agent binary (and, for MT5, the chart template)
    /// into the workspace. A missing source artifact is skipped: the terminal
    /// still starts, just without the agent pre-installed. Any other copy
    /// failure is fatal to the launch.
    pub fn install_agent_artifacts(&self, workspace: &Workspace, platform: Platform) -> io::Result<()> {
        let platform_dir = self.resources_dir.join(platform.resource_dir());

        let agent_file = format!("{AGENT_NAME}.{}", platform.agent_extension());
        let agent_src = platform_dir.join(&agent_file);
        if agent_src.is_file() {
            fs::copy(&agent_src, workspace.experts_dir.join(&agent_file))?;
        } else {
            debug!(path = %agent_src.display(), "agent artifact missing, skipping install");
        }

        if platform == Platform::Mt5 {
            let template_src = platform_dir.join(PROFILE_TEMPLATE);
            if template_src.is_file() {
                let templates_dir = workspace.profiles_dir.join("Templates");
                fs::create_dir_all(&templates_dir)?;
                fs::copy(&template_src, templates_dir.join(PROFILE_TEMPLATE))?;
            }
        }

        Ok(())
    }

    /// Write the terminal's `common.ini` into the workspace root and return
    /// its path. Credentials are left blank here; they are passed on the
    /// command line. The WebRequest entry whitelists the local relay so the
    /// agent may post telemetry to it.
    pub fn write_config(&self, workspace: &Workspace) -> io::Result<PathBuf> {
        let contents = format!(
            "[Common]\n\
             Login=\n\
             Password=\n\
             Server=\n\
             ProxyEnable=false\n\
             ProxyType=4\n\
             ProxyAddress=\n\
             ProxyPort=8080\n\
             ProxyLogin=\n\
             ProxyPassword=\n\
             CertInstall=true\n\
             NewsEnable=true\n\
             MaxBars=65000\n\
             PrintColorEnable=false\n\
             SaveDeleted=false\n\
             EnableDDE=false\n\
             EnableSound=true\n\
             ExpertsDllImport=true\n\
             ExpertsGlobalVars=true\n\
             ExpertsTrades=true\n\
             ExpertsHTTP=true\n\
             ExpertsModify=true\n\
             ExpertsRemove=true\n\
             Language=English\n\
             TemplatesDirectory=templates\n\
             LogsDirectory=logs\n\
             WebRequest=http://127.0.0.1:{}/*\n",
            self.relay_port
        );

        let config_path = workspace.root.join("common.ini");
        fs::write(&config_path, contents)?;
        Ok(config_path)
    }

    pub fn relay_port(&self) -> u16 {
        self.relay_port
    }
}
