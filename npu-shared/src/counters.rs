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

//! Telemetry counter records.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Hardware counter slots in the debug/trace unit. Slot 0 is the free
/// running accelerator clock counter; the rest are lane counters.
pub const NUM_COUNTERS: usize = 16;
pub const CLOCK_COUNTER: usize = 0;
pub const FIRST_STRAND_COUNTER: usize = 1;

/// Registers exposed by the accelerator cache monitor.
pub const CACHE_COUNTERS: usize = 8;

bitflags! {
    /// Telemetry requests, carried in the high byte of the run option word.
    #[derive(Default, Serialize, Deserialize)]
    pub struct TelemetryOpts: u32 {
        const EPOCH_LEN     = 1 << 0;
        const STRG_ACTIVE   = 1 << 1;
        const STRG_I_ACTIVE = 1 << 2;
        const STRG_O_ACTIVE = 1 << 3;
        const STRG_HENV     = 1 << 4;
        const BUSIF_RW_DATA = 1 << 5;
        const NPU_CACHE     = 1 << 6;
    }
}

/// Which counters were armed for a unit and how many samples are valid.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CounterFormat {
    pub opts: TelemetryOpts,
    pub count: u8,
}
impl CounterFormat {
    /// Packed form sent to the host: options in the top half, sample
    /// count in the low byte.
    pub fn word(&self) -> u32 { self.opts.bits() << 16 | self.count as u32 }

    pub fn has(&self, opt: TelemetryOpts) -> bool { self.opts.contains(opt) }
}

/// Counters captured for one execution unit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EpochCounters {
    pub format: CounterFormat,
    pub cpu_start: u32, // CPU cycles PRE_START..POST_START
    pub cpu_core: u32,  // CPU cycles POST_START..PRE_END
    pub cpu_end: u32,   // CPU cycles PRE_END..POST_END
    pub npu_start: u32,
    pub npu_core: u32,
    pub npu_end: u32,
    pub counters: [u32; NUM_COUNTERS],
    pub cache_counters: [u32; CACHE_COUNTERS],
}
impl EpochCounters {
    pub fn cpu_total(&self) -> u64 {
        self.cpu_start as u64 + self.cpu_core as u64 + self.cpu_end as u64
    }

    /// Valid lane/bus samples.
    pub fn samples(&self) -> &[u32] {
        &self.counters[..(self.format.count as usize).min(NUM_COUNTERS)]
    }
}

/// Totals for a whole run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunCounters {
    pub cpu_start: u64,
    pub cpu_core: u64,
    pub cpu_end: u64,
    pub npu_all: u64,
    pub cpu_all: u64,
    pub ticks_ms: u32,
    pub epochs: u16,
}
impl RunCounters {
    /// Order used for the run-level operator report.
    pub fn as_array(&self) -> [u64; 5] {
        [self.cpu_start, self.cpu_core, self.cpu_end, self.npu_all, self.cpu_all]
    }
}
