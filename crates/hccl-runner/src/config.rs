use crate::error::{LaunchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Marks a development (non-release) environment when present on the host.
pub const DEV_ENV_MARKER: &str = "SYNAPSE_RELEASE_BUILD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Broadcast,
    AllReduce,
    ReduceScatter,
    AllGather,
    SendRecv,
    Reduce,
    All2all,
}

impl TestKind {
    pub const ALL: [TestKind; 7] = [
        TestKind::Broadcast,
        TestKind::AllReduce,
        TestKind::ReduceScatter,
        TestKind::AllGather,
        TestKind::SendRecv,
        TestKind::Reduce,
        TestKind::All2all,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Broadcast => "broadcast",
            TestKind::AllReduce => "all_reduce",
            TestKind::ReduceScatter => "reduce_scatter",
            TestKind::AllGather => "all_gather",
            TestKind::SendRecv => "send_recv",
            TestKind::Reduce => "reduce",
            TestKind::All2all => "all2all",
        }
    }

    pub fn catalogue() -> Vec<&'static str> {
        Self::ALL.iter().map(|t| t.as_str()).collect()
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestKind {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        TestKind::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                LaunchError::config(
                    "validate_arguments",
                    format!(
                        "chosen test '{}' is not part of the tests list: {}",
                        s,
                        TestKind::catalogue().join(", ")
                    ),
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    Local,
    Mpi,
}

impl LaunchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::Local => "local",
            LaunchMode::Mpi => "mpi",
        }
    }

    pub fn is_mpi(&self) -> bool {
        matches!(self, LaunchMode::Mpi)
    }
}

/// Immutable run parameters. Rank-related fields stay signed and optional so
/// that invalid command-line values survive until validation can name them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub test: TestKind,
    pub nranks: Option<i64>,
    pub ranks_per_node: Option<i64>,
    pub node_id: Option<i64>,
    pub size: String,
    pub loop_count: u32,
    pub test_root: u32,
    pub csv_path: String,
    pub mode: LaunchMode,
    pub mpi_args: Vec<String>,
    pub ignore_mpi_errors: bool,
    pub clean: bool,
}

impl RunConfig {
    pub fn local(test: TestKind, nranks: i64, ranks_per_node: Option<i64>, node_id: i64) -> Self {
        Self {
            test,
            nranks: Some(nranks),
            ranks_per_node,
            node_id: Some(node_id),
            ..Self::defaults(LaunchMode::Local)
        }
    }

    pub fn mpi(test: TestKind, mpi_args: Vec<String>) -> Self {
        Self {
            test,
            mpi_args,
            ..Self::defaults(LaunchMode::Mpi)
        }
    }

    fn defaults(mode: LaunchMode) -> Self {
        Self {
            test: TestKind::Broadcast,
            nranks: None,
            ranks_per_node: None,
            node_id: None,
            size: "33554432".to_string(),
            loop_count: 10,
            test_root: 0,
            csv_path: String::new(),
            mode,
            mpi_args: Vec::new(),
            ignore_mpi_errors: false,
            clean: false,
        }
    }

    /// Checks the mode invariants. Local-mode rank arithmetic is checked again
    /// by the rank planner, which owns it.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            LaunchMode::Local => {
                if let Some(node_id) = self.node_id {
                    if node_id < 0 {
                        return Err(LaunchError::config(
                            "validate_arguments",
                            format!("argument node_id was set to: {}", node_id),
                        ));
                    }
                }
                if !self.mpi_args.is_empty() {
                    return Err(LaunchError::config(
                        "validate_arguments",
                        format!(
                            "running in local mode, the following arguments cannot be used: {:?}",
                            self.mpi_args
                        ),
                    ));
                }
                if self.ignore_mpi_errors {
                    return Err(LaunchError::config(
                        "validate_arguments",
                        "ignore_mpi_errors can only be used in MPI mode",
                    ));
                }
            }
            LaunchMode::Mpi => {
                let mut invalid = Vec::new();
                if self.node_id.is_some() {
                    invalid.push("node_id");
                }
                if self.nranks.is_some() {
                    invalid.push("nranks");
                }
                if self.ranks_per_node.is_some() {
                    invalid.push("ranks_per_node");
                }
                if !invalid.is_empty() {
                    return Err(LaunchError::config(
                        "validate_arguments",
                        format!(
                            "the following arguments cannot be used in MPI mode: {:?}",
                            invalid
                        ),
                    ));
                }
                if let Some(token) = self
                    .mpi_args
                    .iter()
                    .find(|t| exports_rank_identity(t))
                {
                    return Err(LaunchError::config(
                        "validate_arguments",
                        format!(
                            "MPI assigns rank identity itself, per-rank token not allowed: {}",
                            token
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Keys the launcher derives per rank; user tokens must not set them under MPI.
pub const RANK_IDENTITY_KEYS: [&str; 4] = ["ID", "HCCL_RANK", "HCCL_NRANKS", "HCCL_BOX_SIZE"];

fn exports_rank_identity(token: &str) -> bool {
    let name = token.split_once('=').map(|(k, _)| k).unwrap_or(token);
    RANK_IDENTITY_KEYS.contains(&name)
}

/// Snapshot of the host environment, taken once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnv {
    vars: BTreeMap<String, String>,
}

impl HostEnv {
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn is_dev_env(&self) -> bool {
        self.contains(DEV_ENV_MARKER)
    }
}

/// Installation-level knobs. Loaded from YAML when a settings file is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub build_script: String,
    pub mpi_launcher: String,
    pub mpi_interface: String,
    pub affinity_dir: String,
    pub affinity_command: Option<Vec<String>>,
    pub device_patterns: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("./hccl_demo"),
            working_dir: PathBuf::from("."),
            build_script: "build_demo.sh".to_string(),
            mpi_launcher: "mpirun".to_string(),
            mpi_interface: "eth0".to_string(),
            affinity_dir: "/tmp/affinity_topology_output".to_string(),
            affinity_command: None,
            device_patterns: vec!["Habana".to_string(), "1da3".to_string()],
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| LaunchError::io("load_settings", e))?;
        serde_yaml::from_str(&data).map_err(|e| {
            LaunchError::config(
                "load_settings",
                format!("invalid settings file {}: {}", path.display(), e),
            )
        })
    }

    /// Executable path as seen from the working directory.
    pub fn executable_path(&self) -> PathBuf {
        if self.executable.is_absolute() {
            self.executable.clone()
        } else {
            self.working_dir.join(&self.executable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_names_round_trip_through_catalogue() {
        for name in TestKind::catalogue() {
            let kind: TestKind = name.parse().expect("catalogue name parses");
            assert_eq!(kind.as_str(), name);
        }
        let err = "alltoall".parse::<TestKind>().expect_err("unknown test");
        assert!(err.to_string().contains("all2all"), "catalogue missing: {}", err);
    }

    #[test]
    fn local_mode_rejects_negative_node_and_mpi_tokens() {
        let cfg = RunConfig::local(TestKind::Broadcast, 8, Some(8), -1);
        assert!(cfg.validate().is_err());

        let mut cfg = RunConfig::local(TestKind::Broadcast, 8, Some(8), 0);
        cfg.mpi_args = vec!["--hostfile".to_string(), "hosts".to_string()];
        let err = cfg.validate().expect_err("mpi tokens in local mode");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn mpi_mode_rejects_rank_fields() {
        let mut cfg = RunConfig::mpi(TestKind::AllReduce, vec![]);
        cfg.validate().expect("bare mpi config is valid");
        cfg.nranks = Some(16);
        cfg.node_id = Some(0);
        let msg = cfg.validate().expect_err("rank fields").to_string();
        assert!(msg.contains("nranks") && msg.contains("node_id"), "{}", msg);
        assert!(!msg.contains("ranks_per_node"), "{}", msg);
    }

    #[test]
    fn mpi_mode_rejects_rank_identity_exports() {
        let cfg = RunConfig::mpi(
            TestKind::Broadcast,
            vec!["-x".to_string(), "HCCL_RANK=3".to_string()],
        );
        assert!(cfg.validate().is_err());
        let cfg = RunConfig::mpi(
            TestKind::Broadcast,
            vec!["-x".to_string(), "HCCL_COMM_ID".to_string()],
        );
        cfg.validate().expect("non rank export is fine");
    }

    #[test]
    fn settings_load_partial_yaml_keeps_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "hccl_settings_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("settings.yaml");
        fs::write(&path, "mpi_interface: ib0\nexecutable: /opt/hccl/hccl_demo\n").expect("write");
        let settings = Settings::load(&path).expect("load settings");
        assert_eq!(settings.mpi_interface, "ib0");
        assert_eq!(settings.executable_path(), PathBuf::from("/opt/hccl/hccl_demo"));
        assert_eq!(settings.build_script, "build_demo.sh");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn dev_env_detected_from_marker() {
        assert!(HostEnv::from_pairs([(DEV_ENV_MARKER, "1")]).is_dev_env());
        assert!(!HostEnv::default().is_dev_env());
    }
}
