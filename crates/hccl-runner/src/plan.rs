use crate::collab::DeviceProbe;
use crate::config::{LaunchMode, RunConfig};
use crate::error::{LaunchError, Result};
use crate::report::Reporter;
use serde::Serialize;

const STAGE: &str = "plan_ranks";

/// Identity handed to one local worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RankAssignment {
    pub local_index: u32,
    pub global_rank: u32,
    pub nranks: u32,
    pub box_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankPlan {
    pub node_id: u32,
    pub nranks: u32,
    pub ranks_per_node: u32,
    pub local_processes: u32,
}

impl RankPlan {
    pub fn assignments(&self) -> Vec<RankAssignment> {
        (0..self.local_processes)
            .map(|i| RankAssignment {
                local_index: i,
                global_rank: i + self.node_id * self.local_processes,
                nranks: self.nranks,
                box_size: self.ranks_per_node,
            })
            .collect()
    }
}

fn to_u32(name: &str, value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| LaunchError::config(STAGE, format!("argument {} is out of range: {}", name, value)))
}

/// Works out how many workers this node runs and their global ranks.
/// Only meaningful in local mode.
pub fn plan_local_ranks(
    cfg: &RunConfig,
    probe: &dyn DeviceProbe,
    reporter: &dyn Reporter,
) -> Result<RankPlan> {
    if cfg.mode != LaunchMode::Local {
        return Err(LaunchError::config(
            STAGE,
            "rank planning only applies to local mode; MPI assigns ranks itself",
        ));
    }
    if !cfg.mpi_args.is_empty() {
        return Err(LaunchError::config(
            STAGE,
            format!("MPI-only arguments supplied in local mode: {:?}", cfg.mpi_args),
        ));
    }

    let node_id = cfg.node_id.unwrap_or(-1);
    if node_id < 0 {
        return Err(LaunchError::config(
            STAGE,
            format!("argument node_id was set to: {}", node_id),
        ));
    }
    let nranks = cfg.nranks.unwrap_or(-1);
    if nranks < 1 {
        return Err(LaunchError::config(
            STAGE,
            format!("argument nranks was set to: {}", nranks),
        ));
    }

    let ranks_per_node = match cfg.ranks_per_node {
        Some(n) => n,
        None => {
            let found = probe.device_count().map_err(|e| {
                LaunchError::dependency("get_ranks_per_node", format!("device discovery failed: {:#}", e))
            })?;
            reporter.debug(
                "get_ranks_per_node",
                &format!("ranks_per_node not set, discovered {} devices", found),
            );
            found as i64
        }
    };
    if ranks_per_node < 1 {
        return Err(LaunchError::config(
            STAGE,
            format!("ranks_per_node must be at least 1, got {}", ranks_per_node),
        ));
    }

    let node_id = to_u32("node_id", node_id)?;
    let nranks = to_u32("nranks", nranks)?;
    let ranks_per_node = to_u32("ranks_per_node", ranks_per_node)?;
    let local_processes = ranks_per_node.min(nranks);
    node_id
        .checked_mul(local_processes)
        .and_then(|base| base.checked_add(local_processes))
        .ok_or_else(|| LaunchError::config(STAGE, "global rank overflows"))?;

    reporter.debug(STAGE, &format!("number of processes to be used is: {}", local_processes));
    Ok(RankPlan {
        node_id,
        nranks,
        ranks_per_node,
        local_processes,
    })
}
