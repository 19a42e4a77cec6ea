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

//! Trace counter multiplexing.
//!
//! The debug/trace unit has a handful of counters and several mutually
//! exclusive ways of wiring them. One |TelemetryMode| is chosen when a run
//! starts; |CounterMux| then arms and drains the same counter set around
//! every unit of that run.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use log::info;
use npu_interface::*;
use npu_shared::*;

/// Counter wiring families, at most one per run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CounterFamily {
    #[default]
    None,
    EpochLen,   // Accelerator clock only.
    BusBurst,   // All counters histogram bus burst lengths.
    ActiveIn,   // Activity of every input lane.
    ActiveOut,  // Activity of every output lane.
    ActiveBoth, // Activity of the lanes the unit uses.
    HoldEnv,    // Hold-environment cycles of the unit's input lanes.
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TelemetryMode {
    pub family: CounterFamily,
    pub npu_cache: bool,
}
impl TelemetryMode {
    /// Picks the counter family for |opts|. Bus bursts win over lane
    /// counters, which win over a bare epoch length; the cache monitor is
    /// orthogonal but only exists when |cache_present|.
    pub fn select(opts: TelemetryOpts, cache_present: bool) -> Self {
        let family = if opts.contains(TelemetryOpts::BUSIF_RW_DATA) {
            CounterFamily::BusBurst
        } else if opts.contains(TelemetryOpts::STRG_I_ACTIVE) {
            CounterFamily::ActiveIn
        } else if opts.contains(TelemetryOpts::STRG_O_ACTIVE) {
            CounterFamily::ActiveOut
        } else if opts.contains(TelemetryOpts::STRG_ACTIVE) {
            CounterFamily::ActiveBoth
        } else if opts.contains(TelemetryOpts::STRG_HENV) {
            CounterFamily::HoldEnv
        } else if opts.contains(TelemetryOpts::EPOCH_LEN) {
            CounterFamily::EpochLen
        } else {
            CounterFamily::None
        };
        Self {
            family,
            npu_cache: cache_present && opts.contains(TelemetryOpts::NPU_CACHE),
        }
    }

    /// Whether counter 0 times each unit in accelerator clocks.
    pub fn epoch_len(&self) -> bool {
        matches!(
            self.family,
            CounterFamily::EpochLen
                | CounterFamily::ActiveIn
                | CounterFamily::ActiveOut
                | CounterFamily::ActiveBoth
                | CounterFamily::HoldEnv
        )
    }

    /// Options actually in force, as reported to the host.
    pub fn opts(&self) -> TelemetryOpts {
        let mut opts = match self.family {
            CounterFamily::None | CounterFamily::EpochLen => TelemetryOpts::empty(),
            CounterFamily::BusBurst => TelemetryOpts::BUSIF_RW_DATA,
            CounterFamily::ActiveIn => TelemetryOpts::STRG_I_ACTIVE,
            CounterFamily::ActiveOut => TelemetryOpts::STRG_O_ACTIVE,
            CounterFamily::ActiveBoth => TelemetryOpts::STRG_ACTIVE,
            CounterFamily::HoldEnv => TelemetryOpts::STRG_HENV,
        };
        opts.set(TelemetryOpts::EPOCH_LEN, self.epoch_len());
        opts.set(TelemetryOpts::NPU_CACHE, self.npu_cache);
        opts
    }

    /// Lane events for |block|, ascending strand, input before output.
    pub fn lanes(&self, block: &EpochBlock) -> Vec<CounterEvent> {
        let mut lanes = Vec::new();
        for strand in 0..STRAND_COUNT as u8 {
            let bit = 1u32 << strand;
            match self.family {
                CounterFamily::ActiveIn => lanes.push(CounterEvent::StrandActive {
                    strand,
                    dir: Direction::In,
                }),
                CounterFamily::ActiveOut => lanes.push(CounterEvent::StrandActive {
                    strand,
                    dir: Direction::Out,
                }),
                CounterFamily::ActiveBoth => {
                    if block.in_strands & bit != 0 {
                        lanes.push(CounterEvent::StrandActive {
                            strand,
                            dir: Direction::In,
                        });
                    }
                    if block.out_strands & bit != 0 {
                        lanes.push(CounterEvent::StrandActive {
                            strand,
                            dir: Direction::Out,
                        });
                    }
                }
                CounterFamily::HoldEnv => {
                    if block.in_strands & bit != 0 {
                        lanes.push(CounterEvent::StrandHoldEnv { strand });
                    }
                }
                _ => {}
            }
        }
        lanes
    }
}

/// Arms and drains the counters chosen by one |TelemetryMode|.
#[derive(Debug, Default)]
pub struct CounterMux {
    mode: TelemetryMode,
    format: CounterFormat,
    lanes: Vec<CounterEvent>,
}
impl CounterMux {
    pub fn new(mode: TelemetryMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn mode(&self) -> TelemetryMode { self.mode }

    /// Configures and starts the counters for |block|. Returns the format
    /// the samples will be reported in.
    pub fn arm_pre_start(
        &mut self,
        block: &EpochBlock,
        trace: &mut dyn TraceUnit,
        cache: &mut dyn CacheCounters,
    ) -> CounterFormat {
        let mut count = 0;
        self.lanes.clear();
        match self.mode.family {
            CounterFamily::None | CounterFamily::EpochLen => {}
            CounterFamily::BusBurst => {
                trace.burst_len_start();
                count = NUM_COUNTERS;
            }
            _ => {
                let slots = trace.num_counters().saturating_sub(FIRST_STRAND_COUNTER);
                self.lanes = self.mode.lanes(block);
                self.lanes.truncate(slots);
                for (i, event) in self.lanes.iter().enumerate() {
                    trace.configure(FIRST_STRAND_COUNTER + i, *event);
                }
                for i in 0..self.lanes.len() {
                    trace.start(FIRST_STRAND_COUNTER + i);
                }
                count = self.lanes.len();
            }
        }
        if self.mode.epoch_len() {
            trace.configure(CLOCK_COUNTER, CounterEvent::NpuClock);
            trace.start(CLOCK_COUNTER);
            trace.clear(CLOCK_COUNTER);
        }
        if self.mode.npu_cache {
            cache.enable();
        }
        self.format = CounterFormat {
            opts: self.mode.opts(),
            count: count as u8,
        };
        self.format
    }

    /// Restarts the unit clock from zero.
    pub fn reset_clock(&self, trace: &mut dyn TraceUnit) {
        if self.mode.epoch_len() {
            trace.clear(CLOCK_COUNTER);
        }
    }

    /// Accelerator clocks since the unit was armed, or 0 when not counted.
    pub fn npu_clock(&self, trace: &dyn TraceUnit) -> u32 {
        if self.mode.epoch_len() {
            trace.read(CLOCK_COUNTER)
        } else {
            0
        }
    }

    /// Stops the counters armed for the unit and copies them into |out|.
    /// The cache monitor is left disabled.
    pub fn read_post_end(
        &mut self,
        trace: &mut dyn TraceUnit,
        cache: &mut dyn CacheCounters,
        out: &mut EpochCounters,
    ) {
        out.format = self.format;
        match self.mode.family {
            CounterFamily::None | CounterFamily::EpochLen => {}
            CounterFamily::BusBurst => trace.burst_len_read(&mut out.counters),
            _ => {
                for i in 0..self.lanes.len() {
                    trace.stop(FIRST_STRAND_COUNTER + i);
                    out.counters[i] = trace.read(FIRST_STRAND_COUNTER + i);
                }
            }
        }
        if self.mode.epoch_len() {
            trace.stop(CLOCK_COUNTER);
        }
        if self.mode.npu_cache {
            cache.read(&mut out.cache_counters);
            cache.disable();
        }
    }

    /// Emits the stat lines for one finished unit.
    pub fn log_stats(&self, c: &EpochCounters, trace: &dyn TraceUnit) {
        let transfers = if self.mode.family == CounterFamily::BusBurst {
            trace.total_transfers()
        } else {
            (0, 0)
        };
        for line in self.stat_lines(c, transfers) {
            info!("{}", line);
        }
    }

    /// Stat lines for one finished unit. |transfers| are the bus totals as
    /// (writes, reads); only bus-burst runs report them.
    pub fn stat_lines(&self, c: &EpochCounters, transfers: (u32, u32)) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!("s:node:mcu_cycles:{}:{}:{}", c.cpu_start, c.cpu_core, c.cpu_end));
        if self.mode.epoch_len() {
            lines.push(format!("s:node:npu_cycles:{}:{}:{}", c.npu_start, c.npu_core, c.npu_end));
        }
        let samples = c.samples();
        match self.mode.family {
            CounterFamily::None | CounterFamily::EpochLen => {}
            CounterFamily::BusBurst => {
                // Four burst-length bins per port and direction.
                const GROUPS: [&str; 4] = [
                    "port0:burst:w",
                    "port0:burst:r",
                    "port1:burst:w",
                    "port1:burst:r",
                ];
                let groups = ((samples.len() + 3) / 4).max(1);
                for (label, g) in GROUPS.iter().zip(c.counters.chunks(4)).take(groups) {
                    lines.push(format!("s:node:{}:{}:{}:{}:{}", label, g[0], g[1], g[2], g[3]));
                }
                let (writes, reads) = transfers;
                lines.push(format!(
                    "s:node:portx:burst:rw:{}:{}:{}:0",
                    reads,
                    writes,
                    reads.wrapping_add(writes)
                ));
            }
            CounterFamily::HoldEnv => {
                for (event, &v) in self.lanes.iter().zip(samples) {
                    if let CounterEvent::StrandHoldEnv { strand } = event {
                        let diff = c.npu_core.wrapping_sub(v) as i32;
                        lines.push(format!("s:node:streng_henv:i:{}:{}:{}", strand, v, diff));
                    }
                }
            }
            CounterFamily::ActiveIn | CounterFamily::ActiveOut | CounterFamily::ActiveBoth => {
                // NB: the per-port lanes only report once they saw real traffic.
                let sparse = self.mode.family != CounterFamily::ActiveBoth;
                let mut max: Option<(char, u8, u32)> = None;
                for (event, &v) in self.lanes.iter().zip(samples) {
                    let CounterEvent::StrandActive { strand, dir } = event else {
                        continue;
                    };
                    if sparse && v <= 20 {
                        continue;
                    }
                    let d = if *dir == Direction::In { 'i' } else { 'o' };
                    if v > max.map_or(0, |(_, _, m)| m) {
                        max = Some((d, *strand, v));
                    }
                    let diff = (c.npu_core as i32).wrapping_sub(v as i32);
                    lines.push(format!("s:node:streng_active:{}:{}:{}:{}", d, strand, v, diff));
                }
                let line = match max {
                    Some((d, strand, v)) => {
                        format!("s:node:streng_active:max:{}:{}:{}", d, strand, v)
                    }
                    None if self.mode.family == CounterFamily::ActiveOut => {
                        "s:node:streng_active:max:o:-1:0".into()
                    }
                    None => "s:node:streng_active:max:i:-1:0".into(),
                };
                lines.push(line);
            }
        }
        if self.mode.npu_cache {
            // Read hit, miss, alloc miss, evict; then write hit, miss,
            // alloc miss, write-through.
            let cc = &c.cache_counters;
            lines.push(format!("s:node:npu_cache:r:{}:{}:{}:{}", cc[0], cc[1], cc[2], cc[3]));
            lines.push(format!("s:node:npu_cache:w:{}:{}:{}:{}", cc[4], cc[5], cc[6], cc[7]));
        }
        lines
    }
}
