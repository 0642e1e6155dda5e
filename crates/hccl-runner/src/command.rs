use crate::collab::LauncherLocator;
use crate::config::{HostEnv, RunConfig, Settings};
use crate::env::{EnvMap, WorkerSpec};
use crate::error::{LaunchError, Result};
use crate::report::Reporter;
use serde::Serialize;
use std::process::Command;

/// Exports always forwarded to MPI ranks unless the caller already exports them.
pub const DEFAULT_MPI_ENV: [&str; 1] = ["LD_LIBRARY_PATH"];
/// Extra exports for development environments.
pub const DEFAULT_MPI_ENV_DEV: [&str; 4] = [
    "HCL_ROOT",
    "SYNAPSE_ROOT",
    "BUILD_ROOT_LATEST",
    "GC_KERNEL_PATH",
];
pub const IGNORE_ERRORS_ENV: (&str, &str) = ("HWLOC_HIDE_ERRORS", "1");
pub const IGNORE_ERRORS_ARG: [&str; 3] = ["--mca", "btl_openib_warn_no_device_params_found", "0"];

/// A process invocation kept as tokens: `KEY=VALUE` prefix, program, arguments.
/// It only becomes a string for logs and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchCommand {
    pub env: Vec<(String, String)>,
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            env: Vec::new(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: &EnvMap) -> Self {
        self.env = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn tokens(&self) -> Vec<String> {
        let mut out: Vec<String> = self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        out.push(self.program.clone());
        out.extend(self.args.iter().cloned());
        out
    }

    pub fn render(&self) -> String {
        self.tokens().join(" ")
    }

    pub fn to_process(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

/// One direct-exec command per worker, paired with the worker's global rank.
pub fn assemble_direct(specs: Vec<WorkerSpec>) -> Vec<(u32, LaunchCommand)> {
    specs
        .into_iter()
        .map(|spec| {
            let cmd = LaunchCommand::new(spec.executable.to_string_lossy().to_string())
                .with_env(&spec.env);
            (spec.rank, cmd)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultArg {
    pub tokens: Vec<String>,
    pub value: Option<String>,
}

impl DefaultArg {
    fn literal(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            value: None,
        }
    }

    fn with_value(tokens: &[&str], value: &str) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            value: Some(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpiDefaults {
    pub env: Vec<String>,
    pub args: Vec<DefaultArg>,
}

impl MpiDefaults {
    pub fn new(settings: &Settings, dev_env: bool) -> Self {
        let mut env: Vec<String> = DEFAULT_MPI_ENV.iter().map(|s| s.to_string()).collect();
        if dev_env {
            env.extend(DEFAULT_MPI_ENV_DEV.iter().map(|s| s.to_string()));
        }
        Self {
            env,
            args: vec![
                DefaultArg::literal(&["--allow-run-as-root"]),
                DefaultArg::with_value(&["--mca", "btl_tcp_if_include"], &settings.mpi_interface),
            ],
        }
    }
}

fn exports_var(args: &[String], name: &str) -> bool {
    args.windows(2).any(|w| {
        w[0] == "-x" && (w[1] == name || w[1].strip_prefix(name).is_some_and(|rest| rest.starts_with('=')))
    })
}

fn contains_sequence(args: &[String], seq: &[String]) -> bool {
    !seq.is_empty() && args.windows(seq.len()).any(|w| w == seq)
}

/// Adds default exports and arguments the caller has not supplied. Applying it
/// again to its own output changes nothing.
pub fn apply_mpi_defaults(args: &mut Vec<String>, defaults: &MpiDefaults, reporter: &dyn Reporter) {
    for name in &defaults.env {
        if !exports_var(args, name) {
            reporter.debug("apply_mpi_defaults", &format!("-x {}", name));
            args.push("-x".to_string());
            args.push(name.clone());
        }
    }
    for arg in &defaults.args {
        if contains_sequence(args, &arg.tokens) {
            continue;
        }
        args.extend(arg.tokens.iter().cloned());
        if let Some(value) = &arg.value {
            args.push(value.clone());
        }
        reporter.debug("apply_mpi_defaults", &arg.tokens.join(" "));
    }
}

/// The single command handed to the MPI launcher. `prefix` is everything up to
/// the executable so it can be reused to fan out the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpiCommand {
    pub prefix: LaunchCommand,
    pub executable: String,
}

impl MpiCommand {
    pub fn command(&self) -> LaunchCommand {
        let mut cmd = self.prefix.clone();
        cmd.args.push(self.executable.clone());
        cmd
    }
}

pub fn assemble_mpi(
    env: &EnvMap,
    cfg: &RunConfig,
    settings: &Settings,
    host: &HostEnv,
    locator: &dyn LauncherLocator,
    reporter: &dyn Reporter,
) -> Result<MpiCommand> {
    let launcher = locator.locate(&settings.mpi_launcher).ok_or_else(|| {
        LaunchError::dependency(
            "get_mpi_prefix",
            format!("MPI launcher '{}' was not found on PATH", settings.mpi_launcher),
        )
    })?;
    reporter.debug("get_mpi_prefix", &format!("MPI prefix is: {}", launcher.display()));

    let mut args = Vec::with_capacity(env.len() * 2 + cfg.mpi_args.len());
    for (key, value) in env.iter() {
        args.push("-x".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.extend(cfg.mpi_args.iter().cloned());
    apply_mpi_defaults(&mut args, &MpiDefaults::new(settings, host.is_dev_env()), reporter);

    let mut prefix = LaunchCommand::new(launcher.to_string_lossy().to_string());
    if cfg.ignore_mpi_errors {
        prefix
            .env
            .push((IGNORE_ERRORS_ENV.0.to_string(), IGNORE_ERRORS_ENV.1.to_string()));
        let suppress: Vec<String> = IGNORE_ERRORS_ARG.iter().map(|s| s.to_string()).collect();
        if !contains_sequence(&args, &suppress) {
            args.extend(suppress);
        }
    }
    prefix.args = args;

    let mpi = MpiCommand {
        prefix,
        executable: settings.executable.to_string_lossy().to_string(),
    };
    reporter.debug("prepare_command", &format!("mpi command line: {}", mpi.command().render()));
    Ok(mpi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestKind;
    use crate::env::EnvMap;
    use crate::report::MemoryReporter;
    use std::path::PathBuf;

    struct FixedLocator(Option<PathBuf>);

    impl LauncherLocator for FixedLocator {
        fn locate(&self, _program: &str) -> Option<PathBuf> {
            self.0.clone()
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sample_env() -> EnvMap {
        let mut env = EnvMap::new();
        env.insert("HCCL_DEMO_TEST", "broadcast");
        env.insert("HCCL_DEMO_MPI_REQUESTED", "1");
        env
    }

    #[test]
    fn direct_command_renders_env_then_executable() {
        let cmd = LaunchCommand::new("./hccl_demo").with_env(&sample_env());
        assert_eq!(
            cmd.render(),
            "HCCL_DEMO_TEST=broadcast HCCL_DEMO_MPI_REQUESTED=1 ./hccl_demo"
        );
    }

    #[test]
    fn defaults_are_added_once() {
        let r = MemoryReporter::new();
        let defaults = MpiDefaults::new(&Settings::default(), false);
        let mut args = Vec::new();
        apply_mpi_defaults(&mut args, &defaults, &r);
        let once = args.clone();
        apply_mpi_defaults(&mut args, &defaults, &r);
        assert_eq!(args, once);
        assert_eq!(
            once,
            strings(&[
                "-x",
                "LD_LIBRARY_PATH",
                "--allow-run-as-root",
                "--mca",
                "btl_tcp_if_include",
                "eth0"
            ])
        );
    }

    #[test]
    fn user_supplied_defaults_are_respected() {
        let r = MemoryReporter::new();
        let defaults = MpiDefaults::new(&Settings::default(), true);
        let mut args = strings(&[
            "-x",
            "LD_LIBRARY_PATH=/opt/lib",
            "--mca",
            "btl_tcp_if_include",
            "ib0",
        ]);
        apply_mpi_defaults(&mut args, &defaults, &r);
        assert_eq!(args.iter().filter(|a| a.starts_with("LD_LIBRARY_PATH")).count(), 1);
        assert_eq!(args.iter().filter(|a| *a == "btl_tcp_if_include").count(), 1);
        assert!(!args.contains(&"eth0".to_string()));
        for dev in DEFAULT_MPI_ENV_DEV {
            assert!(exports_var(&args, dev), "missing dev export {}", dev);
        }
    }

    #[test]
    fn export_match_is_by_name_not_prefix() {
        let args = strings(&["-x", "LD_LIBRARY_PATH_EXTRA=1"]);
        assert!(!exports_var(&args, "LD_LIBRARY_PATH"));
    }

    #[test]
    fn mpi_command_exports_env_then_user_tokens_then_defaults() {
        let r = MemoryReporter::new();
        let cfg = RunConfig::mpi(TestKind::Broadcast, strings(&["--hostfile", "hosts.txt"]));
        let locator = FixedLocator(Some(PathBuf::from("/usr/bin/mpirun")));
        let mpi = assemble_mpi(
            &sample_env(),
            &cfg,
            &Settings::default(),
            &HostEnv::default(),
            &locator,
            &r,
        )
        .expect("assemble");
        assert_eq!(
            mpi.command().render(),
            "/usr/bin/mpirun -x HCCL_DEMO_TEST=broadcast -x HCCL_DEMO_MPI_REQUESTED=1 \
             --hostfile hosts.txt -x LD_LIBRARY_PATH --allow-run-as-root \
             --mca btl_tcp_if_include eth0 ./hccl_demo"
        );
        assert!(mpi.prefix.env.is_empty());
    }

    #[test]
    fn ignore_errors_sets_launcher_env_and_suppression_arg() {
        let r = MemoryReporter::new();
        let mut cfg = RunConfig::mpi(TestKind::Reduce, vec![]);
        cfg.ignore_mpi_errors = true;
        let locator = FixedLocator(Some(PathBuf::from("/usr/bin/mpirun")));
        let mpi = assemble_mpi(
            &EnvMap::new(),
            &cfg,
            &Settings::default(),
            &HostEnv::default(),
            &locator,
            &r,
        )
        .expect("assemble");
        assert_eq!(
            mpi.prefix.env,
            vec![("HWLOC_HIDE_ERRORS".to_string(), "1".to_string())]
        );
        let suppress = strings(&IGNORE_ERRORS_ARG);
        assert!(contains_sequence(&mpi.prefix.args, &suppress));
        assert!(mpi.command().render().starts_with("HWLOC_HIDE_ERRORS=1 /usr/bin/mpirun"));
    }

    #[test]
    fn missing_launcher_is_dependency_error() {
        let r = MemoryReporter::new();
        let cfg = RunConfig::mpi(TestKind::Broadcast, vec![]);
        let err = assemble_mpi(
            &EnvMap::new(),
            &cfg,
            &Settings::default(),
            &HostEnv::default(),
            &FixedLocator(None),
            &r,
        )
        .expect_err("no launcher");
        assert_eq!(err.exit_code(), 3);
    }
}
