//! Process identity and coordination settings.
//!
//! All ambient configuration is read once into an [`EnvSnapshot`] at startup;
//! no other component touches the environment directly, so tests can inject
//! arbitrary snapshots.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{BenchError, Result};

/// Immutable snapshot of the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Snapshot the OS environment.
    pub fn capture() -> Self {
        EnvSnapshot {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        EnvSnapshot {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn parsed_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<usize>().map(Some).map_err(|_| {
                BenchError::config(format!("{key} must be a non-negative integer, got {raw:?}"))
            }),
        }
    }
}

/// Resolve this process's local rank from the environment.
///
/// Priority: explicit `LOCAL_RANK`, then the scheduler-provided
/// `SLURM_LOCALID`, then `SLURM_PROCID` reduced modulo the number of devices
/// per node (`GPUS_PER_NODE` overrides the runtime-reported count), else 0.
pub fn resolve_local_rank(env: &EnvSnapshot, devices_per_node: usize) -> Result<usize> {
    if let Some(rank) = env.parsed_usize("LOCAL_RANK")? {
        return Ok(rank);
    }
    if let Some(rank) = env.parsed_usize("SLURM_LOCALID")? {
        return Ok(rank);
    }
    if let Some(proc_id) = env.parsed_usize("SLURM_PROCID")? {
        let per_node = match env.parsed_usize("GPUS_PER_NODE")? {
            Some(0) => {
                return Err(BenchError::config("GPUS_PER_NODE must be at least 1"));
            }
            Some(n) => n,
            None => devices_per_node.max(1),
        };
        return Ok(proc_id % per_node);
    }
    debug!("no local-rank signal in environment, defaulting to 0");
    Ok(0)
}

/// Coordination settings for one measurement session, resolved once at
/// startup and passed by reference into every component.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub master_addr: String,
    pub master_port: u16,
    pub world_size: usize,
    pub global_rank: usize,
    pub local_rank: usize,
}

impl SessionConfig {
    /// Validate the environment-based init settings and build the config.
    ///
    /// Collects every missing or invalid field into a single error so a bad
    /// launch script can be fixed in one pass.
    pub fn from_env(env: &EnvSnapshot, local_rank: usize) -> Result<Self> {
        let mut problems: Vec<String> = Vec::new();

        let master_addr = match env.get("MASTER_ADDR") {
            Some(addr) if !addr.trim().is_empty() => Some(addr.trim().to_string()),
            _ => {
                problems.push("MASTER_ADDR is missing or empty".to_string());
                None
            }
        };

        let master_port = match env.get("MASTER_PORT") {
            None => {
                problems.push("MASTER_PORT is missing".to_string());
                None
            }
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(port) if (0..=65535).contains(&port) => Some(port as u16),
                Ok(port) => {
                    problems.push(format!("MASTER_PORT must be in 0..=65535, got {port}"));
                    None
                }
                Err(_) => {
                    problems.push(format!("MASTER_PORT must be an integer, got {raw:?}"));
                    None
                }
            },
        };

        let world_size = match env.parsed_usize("WORLD_SIZE") {
            Ok(Some(0)) => {
                problems.push("WORLD_SIZE must be at least 1".to_string());
                None
            }
            Ok(Some(n)) => Some(n),
            Ok(None) => {
                problems.push("WORLD_SIZE is missing".to_string());
                None
            }
            Err(err) => {
                problems.push(err.to_string());
                None
            }
        };

        let global_rank = match env.parsed_usize("RANK") {
            Ok(Some(rank)) => Some(rank),
            Ok(None) => {
                problems.push("RANK is missing".to_string());
                None
            }
            Err(err) => {
                problems.push(err.to_string());
                None
            }
        };

        if let (Some(rank), Some(world)) = (global_rank, world_size) {
            if rank >= world {
                problems.push(format!("RANK {rank} is out of range for WORLD_SIZE {world}"));
            }
        }

        if env.get("LOCAL_RANK").is_none() {
            warn!("LOCAL_RANK not set");
        }

        if !problems.is_empty() {
            return Err(BenchError::config(format!(
                "coordination settings invalid: {}",
                problems.join("; ")
            )));
        }

        let config = SessionConfig {
            master_addr: master_addr.unwrap_or_default(),
            master_port: master_port.unwrap_or_default(),
            world_size: world_size.unwrap_or(1),
            global_rank: global_rank.unwrap_or(0),
            local_rank,
        };
        debug!(
            master_addr = %config.master_addr,
            master_port = config.master_port,
            world_size = config.world_size,
            rank = config.global_rank,
            local_rank = config.local_rank,
            "session config resolved"
        );
        Ok(config)
    }
}
