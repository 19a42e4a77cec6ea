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

//! Software stand-in for the NPU SoC. Every handle shares one |SocState| so
//! tests can poke at what the coordinator did to the "hardware".

extern crate alloc;

mod network;
pub use network::*;

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::ops::Range;
use log::trace;
use npu_interface::*;
use npu_shared::*;

// Simulated cycle costs of one unit.
pub const DISPATCH_CYCLES: u32 = 100; // previous POST_END .. PRE_START
pub const START_CYCLES: u32 = 10; //     PRE_START .. POST_START
pub const CORE_CYCLES: u32 = 500; //     POST_START .. PRE_END
pub const END_CYCLES: u32 = 20; //       PRE_END .. POST_END
pub const NPU_CORE_CLOCKS: u32 = 400;

pub const CPU_FREQ_HZ: u32 = 800_000_000;

/// Cache maintenance requests, in the order they were issued.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CacheOp {
    CleanInvalidate(Range<usize>),
    Invalidate(Range<usize>),
    CleanInvalidateAll,
    NpuInvalidate,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FakeCounter {
    pub event: Option<CounterEvent>,
    pub running: bool,
    pub value: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Phase {
    #[default]
    Idle,
    Running,
}

/// Runtime library state.
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub initialized: bool,
    pub network: Option<&'static str>,
    pub cursor: usize,
    phase: Phase,
    pub fault_at: Option<usize>, // Unit index that faults instead of running.
    pub fail_init: bool,
    pub inits: usize,
    pub deinits: usize,
}

/// Everything the fake hardware remembers.
#[derive(Debug)]
pub struct SocState {
    pub memory: Vec<u8>,
    pub cache_ops: Vec<CacheOp>,
    pub trace_enabled: bool,
    pub counters: [FakeCounter; NUM_COUNTERS],
    /// Every (counter, event) configured since the last |take_configured|.
    pub configured: Vec<(usize, CounterEvent)>,
    pub burst_runs: usize,
    pub burst_active: bool,
    pub npu_cache: bool, // Cache monitor present.
    pub cache_counters_enabled: bool,
    pub cache_counter_values: [u32; CACHE_COUNTERS],
    pub cache_enables: usize,
    pub cycles: u32,
    pub ticks_ms: u32,
    pub ms_per_unit: u32,
    pub clock_inits: usize,
    pub soft_resets: usize,
    pub wfe_count: usize,
    pub runtime: RuntimeState,
    pub transfers: (u32, u32),
    pub conf: McuConf,
}
impl SocState {
    fn new() -> Self {
        Self {
            memory: vec![0; MEM_SIZE],
            cache_ops: Vec::new(),
            trace_enabled: false,
            counters: [FakeCounter::default(); NUM_COUNTERS],
            configured: Vec::new(),
            burst_runs: 0,
            burst_active: false,
            npu_cache: false,
            cache_counters_enabled: false,
            cache_counter_values: [0; CACHE_COUNTERS],
            cache_enables: 0,
            cycles: 0,
            ticks_ms: 0,
            ms_per_unit: 1,
            clock_inits: 0,
            soft_resets: 0,
            wfe_count: 0,
            runtime: RuntimeState::default(),
            transfers: (0, 0),
            conf: McuConf {
                devid: 0x486,
                sclk: CPU_FREQ_HZ,
                hclk: 400_000_000,
                conf: 0x3,
                extra: vec![0, 1_000_000_000, 900_000_000, 0, 0, 0, 0, 0],
            },
        }
    }

    pub fn take_configured(&mut self) -> Vec<(usize, CounterEvent)> {
        core::mem::take(&mut self.configured)
    }

    fn offset(&self, addr: usize, len: usize) -> Result<usize, NpuError> {
        let off = addr.checked_sub(MEM_BASE).ok_or(NpuError::MemoryFault)?;
        if off + len > self.memory.len() {
            return Err(NpuError::MemoryFault);
        }
        Ok(off)
    }

    // Running counters tick while the accelerator core is busy.
    fn run_core(&mut self, block: &EpochBlock) {
        self.cycles = self.cycles.wrapping_add(CORE_CYCLES);
        for c in self.counters.iter_mut().filter(|c| c.running) {
            let inc = match c.event {
                Some(CounterEvent::NpuClock) => NPU_CORE_CLOCKS,
                Some(CounterEvent::StrandActive { strand, dir }) => {
                    let mask = match dir {
                        Direction::In => block.in_strands,
                        Direction::Out => block.out_strands,
                    };
                    if mask & (1 << strand) != 0 {
                        100 + strand as u32
                    } else {
                        0
                    }
                }
                Some(CounterEvent::StrandHoldEnv { strand }) => 10 + strand as u32,
                None => 0,
            };
            c.value = c.value.wrapping_add(inc);
        }
        if self.burst_active {
            for (i, c) in self.counters.iter_mut().enumerate() {
                c.value = c.value.wrapping_add(i as u32 + 1);
            }
            self.transfers.0 += 8;
            self.transfers.1 += 16;
        }
        if self.npu_cache && self.cache_counters_enabled {
            for (i, v) in self.cache_counter_values.iter_mut().enumerate() {
                *v = v.wrapping_add(i as u32 + 1);
            }
        }
    }

    // Deterministic stand-in for the network math: every buffer produced by
    // |epoch| is filled from the input bytes.
    fn compute(&mut self, net: &dyn Network, epoch: i16) {
        let Some(input) = net.input_buffers().iter().find(|d| !d.is_param) else {
            return;
        };
        let Ok(in_off) = self.offset(input.addr, input.size) else {
            return;
        };
        let values: Vec<f32> = self.memory[in_off..in_off + input.size]
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let produced = net
            .internal_buffers()
            .iter()
            .chain(net.output_buffers().iter())
            .filter(|d| d.epoch == epoch);
        for desc in produced {
            let Ok(off) = self.offset(desc.addr, desc.size) else {
                continue;
            };
            let n = (desc.size / 4).max(1);
            for i in 0..desc.size / 4 {
                let acc: f32 = values.iter().skip(i).step_by(n).sum();
                let v = acc * epoch as f32;
                self.memory[off + i * 4..off + i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
            }
        }
    }
}

pub type SharedSoc = Rc<RefCell<SocState>>;

/// Owner of the shared state; hands out device handles.
#[derive(Clone)]
pub struct FakeSoc {
    state: SharedSoc,
}
impl Default for FakeSoc {
    fn default() -> Self { Self::new() }
}
impl FakeSoc {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SocState::new())),
        }
    }

    pub fn state(&self) -> SharedSoc { self.state.clone() }

    pub fn runtime(&self) -> FakeRuntime {
        FakeRuntime {
            soc: self.state.clone(),
        }
    }
    pub fn pipeline(&self) -> FakePipeline {
        FakePipeline {
            soc: self.state.clone(),
        }
    }
    pub fn trace(&self) -> FakeTrace {
        FakeTrace {
            soc: self.state.clone(),
        }
    }
    pub fn cache_counters(&self) -> FakeCacheCounters {
        FakeCacheCounters {
            soc: self.state.clone(),
        }
    }
    pub fn cache(&self) -> FakeCache {
        FakeCache {
            soc: self.state.clone(),
        }
    }
    pub fn clock(&self) -> FakeClock {
        FakeClock {
            soc: self.state.clone(),
        }
    }
    pub fn memory(&self) -> FakeMemory {
        FakeMemory {
            soc: self.state.clone(),
        }
    }
    pub fn sysconf(&self) -> FakeSysConf {
        FakeSysConf {
            soc: self.state.clone(),
        }
    }
}

pub struct FakeRuntime {
    soc: SharedSoc,
}
impl NpuRuntime for FakeRuntime {
    fn runtime_init(&mut self) -> Result<(), NpuError> {
        let mut soc = self.soc.borrow_mut();
        if soc.runtime.fail_init {
            return Err(NpuError::InstallFailed);
        }
        soc.runtime.initialized = true;
        soc.runtime.inits += 1;
        Ok(())
    }

    fn runtime_deinit(&mut self) {
        let mut soc = self.soc.borrow_mut();
        soc.runtime.initialized = false;
        soc.runtime.deinits += 1;
    }

    fn init_network(&mut self, net: &dyn Network) -> Result<(), NpuError> {
        let mut soc = self.soc.borrow_mut();
        if !soc.runtime.initialized {
            return Err(NpuError::InstallFailed);
        }
        soc.runtime.network = Some(net.name());
        soc.runtime.cursor = 0;
        soc.runtime.phase = Phase::Idle;
        Ok(())
    }

    fn deinit_network(&mut self, _net: &dyn Network) {
        self.soc.borrow_mut().runtime.network = None;
    }

    fn reset_network(&mut self, _net: &dyn Network) {
        let mut soc = self.soc.borrow_mut();
        soc.runtime.cursor = 0;
        soc.runtime.phase = Phase::Idle;
    }

    // NB: the state borrow is always released before |hook| runs; the hook
    // reaches back into the clock and trace handles.
    fn run_epoch_block(
        &mut self,
        net: &dyn Network,
        hook: &mut dyn FnMut(Transition, usize),
    ) -> RtStatus {
        let blocks = net.epoch_blocks();
        let (cursor, phase) = {
            let soc = self.soc.borrow();
            if soc.runtime.network != Some(net.name()) {
                return RtStatus::Fault;
            }
            if soc.runtime.fault_at == Some(soc.runtime.cursor) {
                return RtStatus::Fault;
            }
            (soc.runtime.cursor, soc.runtime.phase)
        };
        let Some(block) = blocks.get(cursor) else {
            return RtStatus::Fault;
        };
        if block.is_last() {
            return RtStatus::Done;
        }
        match phase {
            Phase::Idle => {
                trace!("fake: dispatch unit {} (epoch {})", cursor, block.epoch_num);
                self.advance(DISPATCH_CYCLES);
                hook(Transition::PreStart, cursor);
                self.advance(START_CYCLES);
                hook(Transition::PostStart, cursor);
                self.soc.borrow_mut().runtime.phase = Phase::Running;
                RtStatus::Busy
            }
            Phase::Running => {
                {
                    let mut soc = self.soc.borrow_mut();
                    soc.run_core(block);
                    soc.ticks_ms = soc.ticks_ms.wrapping_add(soc.ms_per_unit);
                }
                hook(Transition::PreEnd, cursor);
                self.soc.borrow_mut().compute(net, block.epoch_num);
                self.advance(END_CYCLES);
                hook(Transition::PostEnd, cursor);
                let mut soc = self.soc.borrow_mut();
                soc.runtime.cursor = cursor + 1;
                soc.runtime.phase = Phase::Idle;
                match blocks.get(cursor + 1) {
                    Some(next) if !next.is_last() => RtStatus::Continue,
                    _ => RtStatus::Done,
                }
            }
        }
    }

    fn wait_for_event(&mut self) { self.soc.borrow_mut().wfe_count += 1; }

    fn info(&self) -> RuntimeInfo {
        RuntimeInfo {
            version: [1, 1, 0],
            build: 0x5eed,
            compiler_id: 2,
            compiler_desc: "fake-compiler 1.0",
            desc: "fake npu runtime build:",
        }
    }
}
impl FakeRuntime {
    fn advance(&self, cycles: u32) {
        let mut soc = self.soc.borrow_mut();
        soc.cycles = soc.cycles.wrapping_add(cycles);
    }
}

pub struct FakePipeline {
    soc: SharedSoc,
}
impl PipelineControl for FakePipeline {
    fn soft_reset(&mut self) { self.soc.borrow_mut().soft_resets += 1; }
}

pub struct FakeTrace {
    soc: SharedSoc,
}
impl TraceUnit for FakeTrace {
    fn enable(&mut self) { self.soc.borrow_mut().trace_enabled = true; }
    fn disable(&mut self) {
        let mut soc = self.soc.borrow_mut();
        soc.trace_enabled = false;
        soc.counters = [FakeCounter::default(); NUM_COUNTERS];
        soc.burst_active = false;
    }
    fn num_counters(&self) -> usize { NUM_COUNTERS }
    fn configure(&mut self, counter: usize, event: CounterEvent) {
        let mut soc = self.soc.borrow_mut();
        soc.counters[counter] = FakeCounter {
            event: Some(event),
            running: false,
            value: 0,
        };
        soc.configured.push((counter, event));
    }
    fn start(&mut self, counter: usize) { self.soc.borrow_mut().counters[counter].running = true; }
    fn stop(&mut self, counter: usize) { self.soc.borrow_mut().counters[counter].running = false; }
    fn read(&self, counter: usize) -> u32 { self.soc.borrow().counters[counter].value }
    fn clear(&mut self, counter: usize) { self.soc.borrow_mut().counters[counter].value = 0; }
    fn burst_len_start(&mut self) {
        let mut soc = self.soc.borrow_mut();
        for c in soc.counters.iter_mut() {
            *c = FakeCounter::default();
        }
        soc.burst_active = true;
        soc.burst_runs += 1;
    }
    fn burst_len_read(&mut self, out: &mut [u32; NUM_COUNTERS]) {
        let mut soc = self.soc.borrow_mut();
        soc.burst_active = false;
        for (o, c) in out.iter_mut().zip(soc.counters.iter()) {
            *o = c.value;
        }
    }
    fn total_transfers(&self) -> (u32, u32) { self.soc.borrow().transfers }
}

pub struct FakeCacheCounters {
    soc: SharedSoc,
}
impl CacheCounters for FakeCacheCounters {
    fn present(&self) -> bool { self.soc.borrow().npu_cache }
    fn enable(&mut self) {
        let mut soc = self.soc.borrow_mut();
        soc.cache_counters_enabled = true;
        soc.cache_counter_values = [0; CACHE_COUNTERS];
        soc.cache_enables += 1;
    }
    fn disable(&mut self) { self.soc.borrow_mut().cache_counters_enabled = false; }
    fn read(&self, out: &mut [u32; CACHE_COUNTERS]) {
        *out = self.soc.borrow().cache_counter_values;
    }
}

pub struct FakeCache {
    soc: SharedSoc,
}
impl CacheMaintenance for FakeCache {
    fn clean_invalidate_range(&mut self, range: Range<usize>) {
        self.soc.borrow_mut().cache_ops.push(CacheOp::CleanInvalidate(range));
    }
    fn invalidate_range(&mut self, range: Range<usize>) {
        self.soc.borrow_mut().cache_ops.push(CacheOp::Invalidate(range));
    }
    fn clean_invalidate_all(&mut self) {
        self.soc.borrow_mut().cache_ops.push(CacheOp::CleanInvalidateAll);
    }
    fn npu_cache_invalidate(&mut self) {
        self.soc.borrow_mut().cache_ops.push(CacheOp::NpuInvalidate);
    }
}

pub struct FakeClock {
    soc: SharedSoc,
}
impl CycleClock for FakeClock {
    fn init(&mut self) {
        let mut soc = self.soc.borrow_mut();
        soc.clock_inits += 1;
        soc.cycles = 0;
    }
    fn cycles(&self) -> u32 { self.soc.borrow().cycles }
    fn reset(&mut self) { self.soc.borrow_mut().cycles = 0; }
    fn ticks_ms(&self) -> u32 { self.soc.borrow().ticks_ms }
    fn cpu_freq_hz(&self) -> u32 { CPU_FREQ_HZ }
}

pub struct FakeMemory {
    soc: SharedSoc,
}
impl BufferMemory for FakeMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), NpuError> {
        let soc = self.soc.borrow();
        let off = soc.offset(addr, buf.len())?;
        buf.copy_from_slice(&soc.memory[off..off + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), NpuError> {
        let mut soc = self.soc.borrow_mut();
        let off = soc.offset(addr, data.len())?;
        soc.memory[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }
}

pub struct FakeSysConf {
    soc: SharedSoc,
}
impl SystemConfig for FakeSysConf {
    fn mcu_conf(&self) -> McuConf { self.soc.borrow().conf.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(soc: &FakeSoc) -> FakeRuntime {
        let mut rt = soc.runtime();
        rt.runtime_init().unwrap();
        rt.init_network(&SAMPLE_NETWORK).unwrap();
        rt
    }

    /// Each unit takes two steps: dispatch (Busy) and completion.
    #[test]
    fn steps_through_units() {
        let soc = FakeSoc::new();
        let mut rt = installed(&soc);
        let mut seen = Vec::new();
        let mut statuses = Vec::new();
        loop {
            let st = rt.run_epoch_block(&SAMPLE_NETWORK, &mut |t, i| seen.push((t, i)));
            statuses.push(st);
            if st != RtStatus::Busy && st != RtStatus::Continue {
                break;
            }
        }
        assert_eq!(statuses.len(), 12);
        assert_eq!(statuses.last(), Some(&RtStatus::Done));
        assert_eq!(seen.len(), 24);
        assert_eq!(
            &seen[..4],
            &[
                (Transition::PreStart, 0),
                (Transition::PostStart, 0),
                (Transition::PreEnd, 0),
                (Transition::PostEnd, 0)
            ]
        );
        assert_eq!(seen[23], (Transition::PostEnd, 5));
    }

    #[test]
    fn fault_injection() {
        let soc = FakeSoc::new();
        let mut rt = installed(&soc);
        soc.state().borrow_mut().runtime.fault_at = Some(0);
        assert_eq!(rt.run_epoch_block(&SAMPLE_NETWORK, &mut |_, _| {}), RtStatus::Fault);
    }

    /// Running without an installed network faults.
    #[test]
    fn requires_network() {
        let soc = FakeSoc::new();
        let mut rt = soc.runtime();
        assert_eq!(rt.run_epoch_block(&SAMPLE_NETWORK, &mut |_, _| {}), RtStatus::Fault);
    }

    #[test]
    fn memory_bounds() {
        let soc = FakeSoc::new();
        let mut mem = soc.memory();
        assert!(mem.write(INPUT_ADDR, &[1, 2, 3]).is_ok());
        let mut buf = [0u8; 3];
        mem.read(INPUT_ADDR, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(mem.write(MEM_BASE - 1, &[0]), Err(NpuError::MemoryFault));
        assert_eq!(mem.read(MEM_BASE + MEM_SIZE - 1, &mut buf), Err(NpuError::MemoryFault));
    }

    /// The hook may touch other handles while the runtime is stepping.
    #[test]
    fn hook_can_reenter() {
        let soc = FakeSoc::new();
        let mut rt = installed(&soc);
        let mut clock = soc.clock();
        let mut stamps = Vec::new();
        rt.run_epoch_block(&SAMPLE_NETWORK, &mut |_, _| {
            stamps.push(clock.cycles());
            clock.reset();
        });
        assert_eq!(stamps, vec![DISPATCH_CYCLES, START_CYCLES]);
    }

    /// Active counters only count lanes the unit uses.
    #[test]
    fn strand_counters_follow_masks() {
        let soc = FakeSoc::new();
        let mut rt = installed(&soc);
        let mut trace = soc.trace();
        trace.configure(1, CounterEvent::StrandActive { strand: 0, dir: Direction::In });
        trace.configure(2, CounterEvent::StrandActive { strand: 5, dir: Direction::In });
        trace.start(1);
        trace.start(2);
        rt.run_epoch_block(&SAMPLE_NETWORK, &mut |_, _| {});
        rt.run_epoch_block(&SAMPLE_NETWORK, &mut |_, _| {});
        assert_eq!(trace.read(1), 100);
        assert_eq!(trace.read(2), 0);
    }
}
