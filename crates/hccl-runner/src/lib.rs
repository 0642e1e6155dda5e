pub mod clean;
pub mod collab;
pub mod command;
pub mod config;
pub mod env;
pub mod error;
pub mod launch;
pub mod plan;
pub mod report;
pub mod size;

pub use collab::{
    AffinityProvider, BuildAction, BuildSystem, CommandAffinity, DeviceProbe, LauncherLocator,
    LspciProbe, PathLocator, ScriptBuild,
};
pub use command::{LaunchCommand, MpiCommand};
pub use config::{HostEnv, LaunchMode, RunConfig, Settings, TestKind};
pub use error::{LaunchError, Result};
pub use launch::{LaunchCoordinator, RunResult, RunState, WorkerOutcome, WorkerStatus};
pub use plan::RankPlan;
pub use report::{Reporter, TracingReporter};

use std::path::Path;

/// External programs the orchestrator talks to.
pub struct Collaborators<'a> {
    pub probe: &'a dyn DeviceProbe,
    pub affinity: &'a dyn AffinityProvider,
    pub locator: &'a dyn LauncherLocator,
    pub build: &'a dyn BuildSystem,
}

#[derive(Debug, Clone)]
pub enum PreparedLaunch {
    Local {
        plan: RankPlan,
        jobs: Vec<(u32, LaunchCommand)>,
    },
    Mpi {
        command: MpiCommand,
    },
}

/// Output of the pure stages: everything is decided, nothing has run yet.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub size_bytes: String,
    pub dev_env: bool,
    pub launch: PreparedLaunch,
}

impl PreparedRun {
    pub fn commands(&self) -> Vec<LaunchCommand> {
        match &self.launch {
            PreparedLaunch::Local { jobs, .. } => jobs.iter().map(|(_, c)| c.clone()).collect(),
            PreparedLaunch::Mpi { command } => vec![command.command()],
        }
    }

    fn build_prefix(&self) -> Option<&LaunchCommand> {
        match &self.launch {
            PreparedLaunch::Local { .. } => None,
            PreparedLaunch::Mpi { command } => Some(&command.prefix),
        }
    }
}

pub struct Orchestrator<'a> {
    cfg: &'a RunConfig,
    settings: &'a Settings,
    host: &'a HostEnv,
    collab: Collaborators<'a>,
    reporter: &'a dyn Reporter,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        cfg: &'a RunConfig,
        settings: &'a Settings,
        host: &'a HostEnv,
        collab: Collaborators<'a>,
        reporter: &'a dyn Reporter,
    ) -> Self {
        Self {
            cfg,
            settings,
            host,
            collab,
            reporter,
        }
    }

    /// Validates the configuration and assembles every command.
    pub fn prepare(&self) -> Result<PreparedRun> {
        self.cfg.validate()?;
        let dev_env = self.host.is_dev_env();
        self.reporter.debug(
            "get_env",
            if dev_env {
                "running in development environment"
            } else {
                "running in release environment"
            },
        );
        let size_bytes = size::parse_size(&self.cfg.size, self.reporter)?;

        let launch = match self.cfg.mode {
            LaunchMode::Local => {
                self.reporter.info("prepare_command", "hccl demo runs in local mode");
                let plan = plan::plan_local_ranks(self.cfg, self.collab.probe, self.reporter)?;
                let specs =
                    env::build_worker_specs(self.cfg, &plan, &size_bytes, self.settings, self.host);
                let jobs = command::assemble_direct(specs);
                PreparedLaunch::Local { plan, jobs }
            }
            LaunchMode::Mpi => {
                self.reporter.info("prepare_command", "hccl demo runs in MPI mode");
                let shared = env::build_env(self.cfg, &size_bytes, self.settings, self.host, None);
                let command = command::assemble_mpi(
                    &shared,
                    self.cfg,
                    self.settings,
                    self.host,
                    self.collab.locator,
                    self.reporter,
                )?;
                PreparedLaunch::Mpi { command }
            }
        };
        Ok(PreparedRun {
            size_bytes,
            dev_env,
            launch,
        })
    }

    /// Runs the side-effecting steps: cleaning, affinity, build, launch.
    pub fn execute(&self, prepared: PreparedRun) -> Result<RunResult> {
        let prefix = prepared.build_prefix();
        if self.cfg.clean {
            clean::clean_artifacts(
                &self.settings.working_dir,
                self.host.get("HOME").map(Path::new),
                self.collab.build,
                prefix,
                self.reporter,
            );
        }

        let commands = prepared.commands();
        let first = commands
            .first()
            .ok_or_else(|| LaunchError::config("prepare_command", "no command was assembled"))?;
        self.reporter.debug("handle_affinity", "setting affinity");
        let code = self
            .collab
            .affinity
            .create_affinity_files(self.cfg.mode, first)
            .map_err(|e| {
                LaunchError::dependency(
                    "handle_affinity",
                    format!("setting affinity for {} has failed: {:#}", first.render(), e),
                )
            })?;
        if code != 0 {
            return Err(LaunchError::dependency(
                "handle_affinity",
                format!(
                    "setting affinity has failed with code {} for command: {}",
                    code,
                    first.render()
                ),
            ));
        }

        let mut coordinator = LaunchCoordinator::new(self.reporter).in_dir(&self.settings.working_dir);
        let action = if prepared.dev_env {
            BuildAction::Dev
        } else {
            BuildAction::Release
        };
        coordinator.ensure_executable(
            &self.settings.executable_path(),
            self.collab.build,
            action,
            prefix,
        )?;

        let result = match prepared.launch {
            PreparedLaunch::Local { plan, jobs } => {
                coordinator.run_local(jobs, plan.nranks as usize)?
            }
            PreparedLaunch::Mpi { command } => coordinator.run_mpi(command.command())?,
        };
        result.into_result()
    }

    pub fn run(&self) -> Result<RunResult> {
        let prepared = self.prepare()?;
        self.execute(prepared)
    }
}
