//! In-process transport backed by OS threads.
//!
//! Every member holds a handle to shared group state; collective calls meet
//! at a `std::sync::Barrier`. This backend drives single-process sessions
//! from the CLI and lets tests exercise multi-rank code paths without
//! sockets or child processes.

use std::sync::{Arc, Barrier, Mutex};

use crate::device::Buffer;
use crate::error::{BenchError, Result};
use crate::group::{ReduceOp, Transport};

struct Shared {
    world_size: usize,
    rendezvous: Barrier,
    slots: Mutex<Vec<Vec<u8>>>,
}

pub struct LocalGroup;

impl LocalGroup {
    /// Create a connected group of `world_size` members; hand one member to
    /// each participating thread.
    pub fn spawn(world_size: usize) -> Vec<LocalTransport> {
        let shared = Arc::new(Shared {
            world_size,
            rendezvous: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        (0..world_size)
            .map(|rank| LocalTransport {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

pub struct LocalTransport {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalTransport {
    fn lock_slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<Vec<u8>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| BenchError::transport("local group state poisoned by a peer panic"))
    }
}

impl Transport for LocalTransport {
    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn barrier(&mut self) -> Result<()> {
        if self.shared.world_size > 1 {
            self.shared.rendezvous.wait();
        }
        Ok(())
    }

    fn all_reduce(&mut self, buffer: &mut Buffer, op: ReduceOp) -> Result<()> {
        let ReduceOp::Sum = op;
        if self.shared.world_size <= 1 {
            return Ok(());
        }

        // Round 1: everyone deposits its contribution.
        self.lock_slots()?[self.rank] = buffer.bytes().to_vec();
        self.shared.rendezvous.wait();

        // Round 2: everyone folds the peers' contributions into its own
        // buffer; a second meeting keeps the slots stable until all readers
        // are done.
        let result = {
            let slots = self.lock_slots()?;
            let mut outcome = Ok(());
            for (rank, slot) in slots.iter().enumerate() {
                if rank == self.rank {
                    continue;
                }
                if let Err(err) = buffer.sum_bytes(slot) {
                    outcome = Err(err);
                    break;
                }
            }
            outcome
        };
        self.shared.rendezvous.wait();
        result
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
