//! Process-group coordination.
//!
//! [`Group`] owns the lifecycle `Uninitialized -> Initialized -> Finalized`
//! and delegates the collective primitives to a [`Transport`] backend. The
//! transport is the system under measurement; the harness never verifies the
//! mathematical result of a reduction, it only drives and times it.

pub mod local;
pub mod socket;

use tracing::{info, warn};

use crate::device::Buffer;
use crate::error::{BenchError, Result};
use crate::session::SessionConfig;

/// Reduction applied by `all_reduce`; the harness only measures `Sum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
        }
    }
}

/// Collective-communication backend.
///
/// `barrier` and `all_reduce` block until the group-wide condition holds;
/// the harness configures no timeout of its own.
pub trait Transport: Send {
    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;

    fn barrier(&mut self) -> Result<()>;

    fn all_reduce(&mut self, buffer: &mut Buffer, op: ReduceOp) -> Result<()>;

    fn shutdown(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Socket,
    Local,
}

impl Backend {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "socket" | "tcp" => Ok(Backend::Socket),
            "local" => Ok(Backend::Local),
            _ => Err(BenchError::config(format!(
                "unknown backend {raw:?}, expected socket or local"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMethod {
    Env,
}

impl InitMethod {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "env" | "env://" => Ok(InitMethod::Env),
            _ => Err(BenchError::config(format!(
                "unknown init method {raw:?}, expected env"
            ))),
        }
    }
}

/// Build the transport for the requested backend.
///
/// The env-init precondition checks have already run inside
/// [`SessionConfig::from_env`], so by the time we get here the coordination
/// settings are known-good.
pub fn connect(
    backend: Backend,
    _init_method: InitMethod,
    config: &SessionConfig,
) -> Result<Box<dyn Transport>> {
    match backend {
        Backend::Socket => Ok(Box::new(socket::SocketTransport::establish(config)?)),
        Backend::Local => {
            if config.world_size != 1 {
                return Err(BenchError::config(
                    "local backend supports a single-process group only (WORLD_SIZE=1)",
                ));
            }
            let mut members = local::LocalGroup::spawn(1);
            Ok(Box::new(members.remove(0)))
        }
    }
}

enum GroupState {
    Uninitialized,
    Initialized(Box<dyn Transport>),
    Finalized,
}

/// Group coordinator handle; one per process.
pub struct Group {
    state: GroupState,
}

impl Group {
    pub fn new() -> Self {
        Group {
            state: GroupState::Uninitialized,
        }
    }

    /// Bring the group up. Redundant initialization is tolerated: a second
    /// call on an initialized group warns and leaves the membership as-is.
    pub fn initialize(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        match &self.state {
            GroupState::Uninitialized => {
                info!(
                    world_size = transport.world_size(),
                    rank = transport.rank(),
                    "process group initialized"
                );
                self.state = GroupState::Initialized(transport);
                Ok(())
            }
            GroupState::Initialized(_) => {
                warn!("process group already initialized, skipping");
                Ok(())
            }
            GroupState::Finalized => Err(BenchError::transport(
                "cannot initialize a finalized process group",
            )),
        }
    }

    fn active(&mut self) -> Result<&mut Box<dyn Transport>> {
        match &mut self.state {
            GroupState::Initialized(transport) => Ok(transport),
            GroupState::Uninitialized => {
                Err(BenchError::transport("process group is not initialized"))
            }
            GroupState::Finalized => Err(BenchError::transport("process group is finalized")),
        }
    }

    pub fn world_size(&self) -> Result<usize> {
        match &self.state {
            GroupState::Initialized(transport) => Ok(transport.world_size()),
            _ => Err(BenchError::transport("process group is not initialized")),
        }
    }

    pub fn rank(&self) -> Result<usize> {
        match &self.state {
            GroupState::Initialized(transport) => Ok(transport.rank()),
            _ => Err(BenchError::transport("process group is not initialized")),
        }
    }

    /// Block until every member of the group has reached this barrier.
    pub fn barrier(&mut self) -> Result<()> {
        self.active()?.barrier()
    }

    /// Combine `buffer` element-wise across every member, leaving the result
    /// in every member's copy.
    pub fn all_reduce(&mut self, buffer: &mut Buffer, op: ReduceOp) -> Result<()> {
        self.active()?.all_reduce(buffer, op)
    }

    /// Release group resources. Terminal: no further calls are allowed.
    /// Dropping an initialized group finalizes it too, so teardown runs on
    /// error paths as well.
    pub fn finalize(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, GroupState::Finalized) {
            GroupState::Initialized(mut transport) => transport.shutdown(),
            GroupState::Uninitialized | GroupState::Finalized => Ok(()),
        }
    }
}

impl Default for Group {
    fn default() -> Self {
        Group::new()
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        if let GroupState::Initialized(transport) = &mut self.state {
            if let Err(err) = transport.shutdown() {
                warn!(%err, "group shutdown failed during drop");
            }
        }
    }
}
