//! Compute devices and data buffers.
//!
//! The harness touches devices through the [`DeviceRuntime`] trait: device
//! selection, synchronization points around timing windows, and the memory
//! budget consulted before allocation. [`CpuRuntime`] is the shipped
//! implementation; accelerator runtimes plug in behind the same trait.

use half::{bf16, f16};
use serde::Serialize;

use crate::error::{BenchError, Result};

/// Element type of a benchmark buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    F32,
    F16,
    Bf16,
}

impl Dtype {
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::F16 | Dtype::Bf16 => 2,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "f32" | "float32" => Ok(Dtype::F32),
            "f16" | "float16" => Ok(Dtype::F16),
            "bf16" | "bfloat16" => Ok(Dtype::Bf16),
            _ => Err(BenchError::config(format!(
                "unknown dtype {raw:?}, expected f32, f16 or bf16"
            ))),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Dtype::F32 => "f32",
            Dtype::F16 => "f16",
            Dtype::Bf16 => "bf16",
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A compute target; exactly one per process for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Accelerator { index: usize },
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator { index } => write!(f, "accelerator:{index}"),
        }
    }
}

/// Device enumeration, selection, synchronization and capacity queries.
pub trait DeviceRuntime {
    fn accelerator_count(&self) -> usize;

    /// Pick the device for a process with the given local rank.
    fn select(&self, local_rank: usize) -> Device;

    /// Total addressable memory of the device, or `None` for host memory
    /// (capacity then goes unchecked).
    fn total_memory(&self, device: Device) -> Option<u64>;

    /// Block until all outstanding device work has completed.
    fn synchronize(&self, device: Device);
}

/// Host-only runtime: no accelerators, synchronization is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuRuntime;

impl DeviceRuntime for CpuRuntime {
    fn accelerator_count(&self) -> usize {
        0
    }

    fn select(&self, _local_rank: usize) -> Device {
        Device::Cpu
    }

    fn total_memory(&self, _device: Device) -> Option<u64> {
        None
    }

    fn synchronize(&self, _device: Device) {}
}

/// A fixed-size, fixed-dtype region of elements on one device.
///
/// Created once before warm-up and mutated in place by every collective call;
/// never resized.
#[derive(Debug, Clone)]
pub struct Buffer {
    device: Device,
    dtype: Dtype,
    len: usize,
    data: Vec<u8>,
}

impl Buffer {
    /// Allocate `element_count` elements of `dtype` on `device`.
    ///
    /// When the runtime reports a finite memory budget for the device, the
    /// requested size is checked against it up front; there is no partial
    /// allocation and no retry.
    pub fn allocate(
        runtime: &dyn DeviceRuntime,
        element_count: usize,
        dtype: Dtype,
        device: Device,
    ) -> Result<Self> {
        let requested = element_count as u64 * dtype.size_in_bytes() as u64;
        if let Some(available) = runtime.total_memory(device) {
            if requested > available {
                return Err(BenchError::Resource {
                    requested_bytes: requested,
                    available_bytes: available,
                });
            }
        }
        Ok(Buffer {
            device,
            dtype,
            len: element_count,
            data: vec![0u8; requested as usize],
        })
    }

    pub fn element_count(&self) -> usize {
        self.len
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Fill every element with `value`.
    pub fn fill(&mut self, value: f32) {
        for i in 0..self.len {
            self.write_scalar(i, value);
        }
    }

    /// Fill with a deterministic per-seed pattern of small values, standing
    /// in for the random payload of a real workload.
    pub fn fill_pattern(&mut self, seed: u64) {
        for i in 0..self.len {
            let v = (((seed.wrapping_add(i as u64)) % 7) + 1) as f32 * 0.125;
            self.write_scalar(i, v);
        }
    }

    pub fn write_scalar(&mut self, index: usize, value: f32) {
        let off = index * self.dtype.size_in_bytes();
        match self.dtype {
            Dtype::F32 => self.data[off..off + 4].copy_from_slice(&value.to_le_bytes()),
            Dtype::F16 => {
                self.data[off..off + 2].copy_from_slice(&f16::from_f32(value).to_le_bytes())
            }
            Dtype::Bf16 => {
                self.data[off..off + 2].copy_from_slice(&bf16::from_f32(value).to_le_bytes())
            }
        }
    }

    pub fn read_scalar(&self, index: usize) -> f32 {
        let off = index * self.dtype.size_in_bytes();
        match self.dtype {
            Dtype::F32 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&self.data[off..off + 4]);
                f32::from_le_bytes(b)
            }
            Dtype::F16 => {
                let mut b = [0u8; 2];
                b.copy_from_slice(&self.data[off..off + 2]);
                f16::from_le_bytes(b).to_f32()
            }
            Dtype::Bf16 => {
                let mut b = [0u8; 2];
                b.copy_from_slice(&self.data[off..off + 2]);
                bf16::from_le_bytes(b).to_f32()
            }
        }
    }

    /// Element-wise add-to-self over the whole buffer, the synthetic local
    /// workload used by the computation baseline.
    pub fn accumulate_in_place(&mut self) {
        match self.dtype {
            Dtype::F32 => add_self_f32(&mut self.data),
            Dtype::F16 => add_self_f16(&mut self.data),
            Dtype::Bf16 => add_self_bf16(&mut self.data),
        }
    }

    /// Element-wise sum of `src` into this buffer starting at `byte_offset`.
    ///
    /// `src` must cover a whole number of elements and fit inside the buffer;
    /// a mismatch means the transport delivered a wrong-sized chunk.
    pub fn sum_bytes_at(&mut self, byte_offset: usize, src: &[u8]) -> Result<()> {
        let elem = self.dtype.size_in_bytes();
        let end = byte_offset.checked_add(src.len()).unwrap_or(usize::MAX);
        if end > self.data.len() || src.len() % elem != 0 || byte_offset % elem != 0 {
            return Err(BenchError::transport(format!(
                "reduce region mismatch: offset {byte_offset} + {} bytes into a {}-byte buffer",
                src.len(),
                self.data.len()
            )));
        }
        let dst = &mut self.data[byte_offset..end];
        match self.dtype {
            Dtype::F32 => sum_f32(dst, src),
            Dtype::F16 => sum_f16(dst, src),
            Dtype::Bf16 => sum_bf16(dst, src),
        }
        Ok(())
    }

    /// Element-wise sum of another rank's full buffer contents.
    pub fn sum_bytes(&mut self, src: &[u8]) -> Result<()> {
        if src.len() != self.data.len() {
            return Err(BenchError::transport(format!(
                "buffer size mismatch across ranks: {} vs {} bytes",
                self.data.len(),
                src.len()
            )));
        }
        self.sum_bytes_at(0, src)
    }
}

fn add_self_f32(data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(4) {
        let mut b = [0u8; 4];
        b.copy_from_slice(chunk);
        let v = f32::from_le_bytes(b);
        chunk.copy_from_slice(&(v + v).to_le_bytes());
    }
}

fn add_self_f16(data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(2) {
        let mut b = [0u8; 2];
        b.copy_from_slice(chunk);
        let v = f16::from_le_bytes(b);
        chunk.copy_from_slice(&(v + v).to_le_bytes());
    }
}

fn add_self_bf16(data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(2) {
        let mut b = [0u8; 2];
        b.copy_from_slice(chunk);
        let v = bf16::from_le_bytes(b);
        chunk.copy_from_slice(&(v + v).to_le_bytes());
    }
}

fn sum_f32(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        a.copy_from_slice(d);
        b.copy_from_slice(s);
        let v = f32::from_le_bytes(a) + f32::from_le_bytes(b);
        d.copy_from_slice(&v.to_le_bytes());
    }
}

fn sum_f16(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        a.copy_from_slice(d);
        b.copy_from_slice(s);
        let v = f16::from_le_bytes(a) + f16::from_le_bytes(b);
        d.copy_from_slice(&v.to_le_bytes());
    }
}

fn sum_bf16(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        a.copy_from_slice(d);
        b.copy_from_slice(s);
        let v = bf16::from_le_bytes(a) + bf16::from_le_bytes(b);
        d.copy_from_slice(&v.to_le_bytes());
    }
}
