use crate::config::{HostEnv, RunConfig, Settings};
use crate::plan::{RankAssignment, RankPlan};
use serde::Serialize;
use std::path::PathBuf;

/// Host variables forwarded to workers when set. Absence is not an error.
pub const OPTIONAL_ENV: [&str; 11] = [
    "DISABLE_PROC_AFFINITY",
    "ENFORCE_PROC_AFFINITY",
    "BEST_EFFORT_AFFINITY",
    "HCCL_OVER_TCP",
    "HCCL_OVER_OFI",
    "NUM_HT",
    "NUM_SOCKETS",
    "NUM_CORES_PER_SOCKET",
    "NUMA_MAPPING_DIR",
    "NSOCK_PERTHREAD",
    "SOCKET_NTHREADS",
];

/// Insertion-ordered environment with unique keys. Re-inserting a key
/// replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvMap {
    entries: Vec<(String, String)>,
}

impl EnvMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything needed to start one local worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSpec {
    pub rank: u32,
    pub env: EnvMap,
    pub executable: PathBuf,
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Builds the environment for one worker, or the shared map under MPI when
/// `rank` is `None`. `size_bytes` is the already-parsed size.
pub fn build_env(
    cfg: &RunConfig,
    size_bytes: &str,
    settings: &Settings,
    host: &HostEnv,
    rank: Option<&RankAssignment>,
) -> EnvMap {
    let mpi = cfg.mode.is_mpi();
    let mut env = EnvMap::new();
    env.insert("HCCL_DEMO_TEST", cfg.test.as_str());
    env.insert("HCCL_DEMO_TEST_SIZE", size_bytes);
    env.insert("HCCL_DEMO_TEST_LOOP", cfg.loop_count.to_string());
    env.insert("HCCL_DEMO_TEST_ROOT", cfg.test_root.to_string());
    env.insert("HCCL_DEMO_CSV_PATH", cfg.csv_path.as_str());
    env.insert("HCCL_DEMO_MPI_REQUESTED", flag(mpi));
    env.insert("MPI_ENABLED", flag(mpi));
    env.insert(
        "NUMA_MAPPING_DIR",
        host.get("NUMA_MAPPING_DIR").unwrap_or(settings.affinity_dir.as_str()),
    );

    for name in OPTIONAL_ENV {
        if let Some(value) = host.get(name) {
            env.insert(name, value.trim());
        }
    }

    if let Some(rank) = rank {
        env.insert("ID", rank.global_rank.to_string());
        env.insert("HCCL_RANK", rank.global_rank.to_string());
        env.insert("HCCL_NRANKS", rank.nranks.to_string());
        env.insert("HCCL_BOX_SIZE", rank.box_size.to_string());
    }
    env
}

/// One spec per planned local rank, in local index order.
pub fn build_worker_specs(
    cfg: &RunConfig,
    plan: &RankPlan,
    size_bytes: &str,
    settings: &Settings,
    host: &HostEnv,
) -> Vec<WorkerSpec> {
    plan.assignments()
        .iter()
        .map(|assignment| WorkerSpec {
            rank: assignment.global_rank,
            env: build_env(cfg, size_bytes, settings, host, Some(assignment)),
            executable: settings.executable.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestKind;

    fn plan(nranks: u32, rpn: u32, node_id: u32) -> RankPlan {
        RankPlan {
            node_id,
            nranks,
            ranks_per_node: rpn,
            local_processes: rpn.min(nranks),
        }
    }

    #[test]
    fn fixed_keys_come_first_in_stable_order() {
        let cfg = RunConfig::local(TestKind::Broadcast, 2, Some(2), 0);
        let specs = build_worker_specs(&cfg, &plan(2, 2, 0), "1024", &Settings::default(), &HostEnv::default());
        assert_eq!(specs.len(), 2);
        assert_eq!(
            specs[0].env.keys(),
            vec![
                "HCCL_DEMO_TEST",
                "HCCL_DEMO_TEST_SIZE",
                "HCCL_DEMO_TEST_LOOP",
                "HCCL_DEMO_TEST_ROOT",
                "HCCL_DEMO_CSV_PATH",
                "HCCL_DEMO_MPI_REQUESTED",
                "MPI_ENABLED",
                "NUMA_MAPPING_DIR",
                "ID",
                "HCCL_RANK",
                "HCCL_NRANKS",
                "HCCL_BOX_SIZE",
            ]
        );
        assert_eq!(specs[0].env.get("HCCL_RANK"), Some("0"));
        assert_eq!(specs[1].env.get("HCCL_RANK"), Some("1"));
        assert_eq!(specs[1].env.get("HCCL_NRANKS"), Some("2"));
        assert_eq!(specs[1].env.get("NUMA_MAPPING_DIR"), Some("/tmp/affinity_topology_output"));
        assert_eq!(specs[1].executable, PathBuf::from("./hccl_demo"));
    }

    #[test]
    fn allow_listed_host_vars_are_copied_trimmed() {
        let cfg = RunConfig::local(TestKind::AllGather, 4, Some(4), 0);
        let host = HostEnv::from_pairs([
            ("HCCL_OVER_TCP", " 1 "),
            ("NUMA_MAPPING_DIR", "/var/numa"),
            ("HOME", "/root"),
        ]);
        let env = build_env(&cfg, "8", &Settings::default(), &host, None);
        assert_eq!(env.get("HCCL_OVER_TCP"), Some("1"));
        assert_eq!(env.get("NUMA_MAPPING_DIR"), Some("/var/numa"));
        assert_eq!(env.keys().iter().filter(|k| **k == "NUMA_MAPPING_DIR").count(), 1);
        assert_eq!(env.get("HOME"), None);
        assert_eq!(env.get("SOCKET_NTHREADS"), None);
    }

    #[test]
    fn output_is_deterministic_for_same_inputs() {
        let cfg = RunConfig::local(TestKind::SendRecv, 8, Some(4), 1);
        let host = HostEnv::from_pairs([("NUM_SOCKETS", "2"), ("SOCKET_NTHREADS", "4")]);
        let a = build_worker_specs(&cfg, &plan(8, 4, 1), "4096", &Settings::default(), &host);
        let b = build_worker_specs(&cfg, &plan(8, 4, 1), "4096", &Settings::default(), &host);
        assert_eq!(a, b);
        let rendered_a: Vec<String> = a.iter().flat_map(|s| s.env.iter().map(|(k, v)| format!("{}={}", k, v))).collect();
        let rendered_b: Vec<String> = b.iter().flat_map(|s| s.env.iter().map(|(k, v)| format!("{}={}", k, v))).collect();
        assert_eq!(rendered_a, rendered_b);
        assert_eq!(a[0].rank, 4);
    }

    #[test]
    fn mpi_map_has_no_rank_identity() {
        let cfg = RunConfig::mpi(TestKind::Broadcast, vec![]);
        let env = build_env(&cfg, "8", &Settings::default(), &HostEnv::default(), None);
        assert_eq!(env.get("MPI_ENABLED"), Some("1"));
        assert_eq!(env.get("HCCL_DEMO_MPI_REQUESTED"), Some("1"));
        for key in crate::config::RANK_IDENTITY_KEYS {
            assert_eq!(env.get(key), None, "{} leaked into MPI env", key);
        }
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut env = EnvMap::new();
        env.insert("A", "1");
        env.insert("B", "2");
        env.insert("A", "3");
        assert_eq!(env.keys(), vec!["A", "B"]);
        assert_eq!(env.get("A"), Some("3"));
        assert_eq!(env.len(), 2);
    }
}
