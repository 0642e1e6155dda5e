//! Seams to the programs this runner depends on but does not own: device
//! discovery, affinity file generation, the MPI launcher lookup and the
//! benchmark build.

use crate::command::LaunchCommand;
use crate::config::{HostEnv, LaunchMode, Settings};
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub trait DeviceProbe {
    /// Number of accelerator devices visible on this host.
    fn device_count(&self) -> Result<usize>;
}

pub trait AffinityProvider {
    /// Generates affinity mapping files for `command`. Returns the helper's exit code.
    fn create_affinity_files(&self, mode: LaunchMode, command: &LaunchCommand) -> Result<i32>;
}

pub trait LauncherLocator {
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildAction {
    Release,
    Dev,
    Clean,
}

impl BuildAction {
    fn arg(&self) -> Option<&'static str> {
        match self {
            BuildAction::Release => None,
            BuildAction::Dev => Some("dev"),
            BuildAction::Clean => Some("clean"),
        }
    }
}

pub trait BuildSystem {
    /// Runs the build, optionally through a launcher prefix. Returns the exit code.
    fn build(&self, action: BuildAction, prefix: Option<&LaunchCommand>) -> Result<i32>;

    /// The command line `build` runs, for diagnostics.
    fn command_line(&self, action: BuildAction, prefix: Option<&LaunchCommand>) -> String;
}

/// Counts `lspci` lines that match one of the configured vendor patterns.
#[derive(Debug, Clone)]
pub struct LspciProbe {
    patterns: Vec<String>,
}

impl LspciProbe {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn count_matches(&self, listing: &str) -> usize {
        listing
            .lines()
            .filter(|line| self.patterns.iter().any(|p| line.contains(p.as_str())))
            .count()
    }
}

impl DeviceProbe for LspciProbe {
    fn device_count(&self) -> Result<usize> {
        let output = Command::new("lspci")
            .stderr(Stdio::inherit())
            .output()
            .context("failed to run lspci")?;
        if !output.status.success() {
            return Err(anyhow!("lspci exited with {}", output.status));
        }
        Ok(self.count_matches(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Runs an external affinity helper, or does nothing when none is configured.
#[derive(Debug, Clone, Default)]
pub struct CommandAffinity {
    helper: Option<Vec<String>>,
    working_dir: PathBuf,
}

impl CommandAffinity {
    pub fn new(helper: Option<Vec<String>>, working_dir: PathBuf) -> Self {
        Self {
            helper,
            working_dir,
        }
    }
}

impl AffinityProvider for CommandAffinity {
    fn create_affinity_files(&self, mode: LaunchMode, command: &LaunchCommand) -> Result<i32> {
        let helper = match self.helper.as_deref() {
            Some(h) if !h.is_empty() => h,
            _ => return Ok(0),
        };
        let status = Command::new(&helper[0])
            .args(&helper[1..])
            .current_dir(&self.working_dir)
            .env("HCCL_DEMO_MPI_REQUESTED", if mode.is_mpi() { "1" } else { "0" })
            .env("HCCL_DEMO_COMMAND", command.render())
            .status()
            .with_context(|| format!("failed to run affinity helper {:?}", helper))?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// `which`-style lookup over the `PATH` of a host snapshot.
#[derive(Debug, Clone)]
pub struct PathLocator {
    search_path: Vec<PathBuf>,
}

impl PathLocator {
    pub fn from_host(host: &HostEnv) -> Self {
        let search_path = host
            .get("PATH")
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default();
        Self { search_path }
    }
}

impl LauncherLocator for PathLocator {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        let direct = Path::new(program);
        if direct.components().count() > 1 {
            return is_executable(direct).then(|| direct.to_path_buf());
        }
        self.search_path
            .iter()
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// `bash <script> [dev|clean]` in the working directory.
#[derive(Debug, Clone)]
pub struct ScriptBuild {
    script: String,
    working_dir: PathBuf,
}

impl ScriptBuild {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            script: settings.build_script.clone(),
            working_dir: settings.working_dir.clone(),
        }
    }

    pub fn command_for(&self, action: BuildAction, prefix: Option<&LaunchCommand>) -> LaunchCommand {
        let mut tail = vec![self.script.clone()];
        if let Some(arg) = action.arg() {
            tail.push(arg.to_string());
        }
        match prefix {
            Some(launcher) => {
                let mut cmd = launcher.clone();
                cmd.args.push("bash".to_string());
                cmd.args.extend(tail);
                cmd
            }
            None => LaunchCommand::new("bash").with_args(tail),
        }
    }
}

impl BuildSystem for ScriptBuild {
    fn build(&self, action: BuildAction, prefix: Option<&LaunchCommand>) -> Result<i32> {
        let cmd = self.command_for(action, prefix);
        let status = cmd
            .to_process()
            .current_dir(&self.working_dir)
            .status()
            .with_context(|| format!("failed to run build command: {}", cmd.render()))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn command_line(&self, action: BuildAction, prefix: Option<&LaunchCommand>) -> String {
        self.command_for(action, prefix).render()
    }
}
