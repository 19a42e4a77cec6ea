// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![cfg_attr(not(test), no_std)]

//! Seams between the NPU coordinator and the things it drives: the
//! accelerator runtime, the SoC blocks around it, and the host link.

extern crate alloc;

pub mod proto;

use alloc::vec::Vec;
use core::ops::Range;
use npu_shared::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use static_assertions::const_assert;

pub use proto::HostMessage;
pub use proto::Response;

// Strand counters sit after the clock counter in the same bank.
const_assert!(FIRST_STRAND_COUNTER + STRAND_COUNT <= NUM_COUNTERS);

/// Most instances a build can carry.
pub const MAX_INSTANCES: usize = 1;

/// Vendor words in the extra-configuration array of SysInfo.
pub const EXTRA_CONF_LEN: usize = if cfg!(feature = "extra_conf") { 8 } else { 0 };

/// Return codes from NPU coordinator api's.
#[repr(usize)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum NpuError {
    Success = 0,
    NotFound,
    SizeMismatch,
    ExecutionFailure,
    InvalidState,
    InstallFailed,
    InvalidParam,
    InvalidCommand,
    SerializeFailed,
    DeserializeFailed,
    ChannelClosed,
    MemoryFault,
    #[default]
    UnknownError,
}
impl From<NpuError> for Result<(), NpuError> {
    fn from(err: NpuError) -> Result<(), NpuError> {
        if err == NpuError::Success {
            Ok(())
        } else {
            Err(err)
        }
    }
}
impl From<SizeMismatch> for NpuError {
    fn from(_err: SizeMismatch) -> NpuError { NpuError::SizeMismatch }
}

/// Points in the life of one execution unit at which the runtime calls
/// back. They always arrive in this order, once per unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    PreStart,
    PostStart,
    PreEnd,
    PostEnd,
}

/// Result of advancing the runtime by one step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RtStatus {
    Done,     // All units have completed.
    Busy,     // Accelerator is working; wait for an event and poll again.
    Continue, // A unit completed and more remain.
    Fault,
}

/// Identification of the accelerator runtime library.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RuntimeInfo {
    pub version: [u8; 3],
    pub build: u32,
    pub compiler_id: u8,
    pub compiler_desc: &'static str,
    pub desc: &'static str,
}

/// A compiled network. Buffers and units are static tables produced by the
/// model compiler; the coordinator only iterates them.
pub trait Network {
    fn name(&self) -> &'static str;
    /// Inputs, including parameter buffers flagged |is_param|.
    fn input_buffers(&self) -> &'static [TensorDesc];
    fn output_buffers(&self) -> &'static [TensorDesc];
    fn internal_buffers(&self) -> &'static [TensorDesc];
    /// Execution units, ending with an entry flagged LAST.
    fn epoch_blocks(&self) -> &'static [EpochBlock];
    fn memory_regions(&self) -> &'static [MemRegion] { &[] }

    /// Bytes of activation memory used by the network.
    fn activation_footprint(&self) -> usize {
        activation_footprint(self.memory_regions(), self.internal_buffers())
    }
}

/// The accelerator runtime library.
pub trait NpuRuntime {
    fn runtime_init(&mut self) -> Result<(), NpuError>;
    fn runtime_deinit(&mut self);
    fn init_network(&mut self, net: &dyn Network) -> Result<(), NpuError>;
    fn deinit_network(&mut self, net: &dyn Network);
    /// Rewinds |net| to its first unit.
    fn reset_network(&mut self, net: &dyn Network);
    /// Advances |net|. |hook| is handed each transition together with the
    /// index of the unit in |net.epoch_blocks()|.
    fn run_epoch_block(
        &mut self,
        net: &dyn Network,
        hook: &mut dyn FnMut(Transition, usize),
    ) -> RtStatus;
    /// Low-power wait until the accelerator raises an event.
    fn wait_for_event(&mut self);
    fn info(&self) -> RuntimeInfo;
}

/// Accelerator clock control.
pub trait PipelineControl {
    /// Clears the accelerator pipeline.
    fn soft_reset(&mut self);
}

/// Lane direction for activity counters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    In,
    Out,
}

/// Signal a debug/trace counter is wired to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterEvent {
    NpuClock,
    StrandActive { strand: u8, dir: Direction },
    StrandHoldEnv { strand: u8 },
}

/// The accelerator debug and trace unit.
pub trait TraceUnit {
    fn enable(&mut self);
    fn disable(&mut self);
    fn num_counters(&self) -> usize;
    fn configure(&mut self, counter: usize, event: CounterEvent);
    fn start(&mut self, counter: usize);
    fn stop(&mut self, counter: usize);
    fn read(&self, counter: usize) -> u32;
    fn clear(&mut self, counter: usize);
    /// Arms every counter as a burst-length histogram of the bus ports.
    fn burst_len_start(&mut self);
    fn burst_len_read(&mut self, out: &mut [u32; NUM_COUNTERS]);
    /// Returns (writes, reads) seen by the bus interface.
    fn total_transfers(&self) -> (u32, u32);
}

/// The accelerator cache monitor.
pub trait CacheCounters {
    fn present(&self) -> bool;
    fn enable(&mut self);
    fn disable(&mut self);
    fn read(&self, out: &mut [u32; CACHE_COUNTERS]);
}

/// CPU and accelerator cache maintenance.
pub trait CacheMaintenance {
    fn clean_invalidate_range(&mut self, range: Range<usize>);
    fn invalidate_range(&mut self, range: Range<usize>);
    fn clean_invalidate_all(&mut self);
    fn npu_cache_invalidate(&mut self);
}

/// CPU cycle counter plus a millisecond tick.
pub trait CycleClock {
    fn init(&mut self);
    fn cycles(&self) -> u32;
    fn reset(&mut self);
    fn ticks_ms(&self) -> u32;
    fn cpu_freq_hz(&self) -> u32;
}

/// Access to accelerator-visible memory by address.
pub trait BufferMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), NpuError>;
    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), NpuError>;
}

/// Board description reported to the host.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct McuConf {
    pub devid: u32,
    pub sclk: u32,
    pub hclk: u32,
    pub conf: u32, // Cache configuration bits.
    pub extra: Vec<u32>,
}

pub trait SystemConfig {
    fn mcu_conf(&self) -> McuConf;
}

/// Message-level link to the host.
pub trait HostChannel {
    fn recv(&mut self) -> Result<HostMessage, NpuError>;
    fn send(&mut self, msg: &Response) -> Result<(), NpuError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_roundtrips_usize() {
        let code: usize = NpuError::ExecutionFailure.into();
        assert_eq!(NpuError::from(code), NpuError::ExecutionFailure);
        assert_eq!(NpuError::from(9999usize), NpuError::UnknownError);
    }

    #[test]
    fn error_into_result() {
        let ok: Result<(), NpuError> = NpuError::Success.into();
        assert_eq!(ok, Ok(()));
        let err: Result<(), NpuError> = NpuError::NotFound.into();
        assert_eq!(err, Err(NpuError::NotFound));
    }
}
