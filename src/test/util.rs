use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::device::Buffer;
use crate::error::Result;
use crate::group::{ReduceOp, Transport};

/// Single-member transport that counts calls; lets tests observe what the
/// measurement engine drives without any real communication.
pub struct RecordingTransport {
    pub barriers: Arc<AtomicUsize>,
    pub all_reduces: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        RecordingTransport {
            barriers: Arc::new(AtomicUsize::new(0)),
            all_reduces: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Transport for RecordingTransport {
    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn barrier(&mut self) -> Result<()> {
        self.barriers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn all_reduce(&mut self, _buffer: &mut Buffer, _op: ReduceOp) -> Result<()> {
        self.all_reduces.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
