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

//! Epoch execution driver.
//!
//! Steps the runtime through a network one unit at a time. Each unit
//! reports PRE_START, POST_START, PRE_END and POST_END back through the
//! runtime hook; when a run is observed the hook times the unit on the CPU
//! cycle counter, arms/drains the trace counters and hands the result to
//! the observer.

use crate::*;
use log::{error, info, trace};
use npu_interface::*;
use npu_shared::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriverState {
    Idle,
    Resetting,
    Executing,
    WaitingForEvent,
    Done,
    Failed,
}

/// One transition of one unit, as seen by an |EpochObserver|.
pub struct EpochEvent<'a> {
    pub transition: Transition,
    pub exec_idx: u16, // Ordinal of the unit within the run.
    pub index: usize,  // Position of |block| in the network's unit table.
    pub block: &'a EpochBlock,
    pub next: Option<&'a EpochBlock>,
    pub counters: Option<&'a EpochCounters>, // Only at PostEnd.
    pub network: &'a dyn Network,
}

/// Per-unit callback of an observed run. Runs inside the runtime hook; the
/// time spent here is not charged to the unit.
pub trait EpochObserver {
    fn on_epoch(
        &mut self,
        event: &EpochEvent,
        memory: &mut dyn BufferMemory,
        cache: &mut CacheCoherency,
    );
}

/// Everything scoped to one run. Built by the caller and consumed by
/// |EpochDriver::run|.
#[derive(Default)]
pub struct RunContext<'a> {
    observer: Option<&'a mut dyn EpochObserver>,
    stats: bool,
}
impl<'a> RunContext<'a> {
    pub fn new() -> Self { Self::default() }

    /// Sets or clears the per-unit callback. Telemetry is only armed for
    /// observed runs.
    pub fn register_callback(&mut self, observer: Option<&'a mut dyn EpochObserver>) {
        self.observer = observer;
    }

    /// Logs the per-unit stat lines of an observed run.
    pub fn with_stats(mut self, stats: bool) -> Self {
        self.stats = stats;
        self
    }

    pub fn is_observed(&self) -> bool { self.observer.is_some() }
}

// Hook state for one run; borrows the parts of the hal the hook touches.
struct Session<'r, 'o> {
    net: &'r dyn Network,
    observer: Option<&'r mut (dyn EpochObserver + 'o)>,
    stats: bool,
    mux: CounterMux,
    trace: &'r mut dyn TraceUnit,
    cache_counters: &'r mut dyn CacheCounters,
    clock: &'r mut dyn CycleClock,
    cache: &'r mut CacheCoherency,
    memory: &'r mut dyn BufferMemory,
    totals: RunCounters,
    cur: EpochCounters,
    npu_start: u32,
    npu_end: u32,
    exec_idx: u16,
}
impl Session<'_, '_> {
    fn transition(&mut self, t: Transition, index: usize) {
        if self.observer.is_none() {
            if t == Transition::PreStart {
                self.exec_idx += 1;
            }
            return;
        }
        let blocks = self.net.epoch_blocks();
        let Some(block) = blocks.get(index) else {
            error!("hook for unit {} of {}", index, blocks.len());
            return;
        };
        let ts = self.clock.cycles();
        trace!("unit {} (epoch {}) {:?} +{}", index, block.epoch_num, t, ts);
        match t {
            Transition::PreStart => {
                self.cur = EpochCounters::default();
                self.totals.cpu_all += ts as u64;
                self.notify(t, index, false);
                self.cur.format =
                    self.mux.arm_pre_start(block, &mut *self.trace, &mut *self.cache_counters);
                self.exec_idx += 1;
                self.mux.reset_clock(&mut *self.trace);
            }
            Transition::PostStart => {
                self.npu_start = self.mux.npu_clock(&*self.trace);
                self.cur.npu_start = self.npu_start;
                self.cur.cpu_start = ts;
                self.totals.cpu_start += ts as u64;
                self.notify(t, index, false);
            }
            Transition::PreEnd => {
                let npu = self.mux.npu_clock(&*self.trace);
                self.cur.npu_core = npu.wrapping_sub(self.npu_start);
                self.npu_end = npu;
                self.totals.npu_all += self.cur.npu_core as u64;
                self.cur.cpu_core = ts;
                self.totals.cpu_core += ts as u64;
                self.notify(t, index, false);
            }
            Transition::PostEnd => {
                self.cur.npu_end = self.mux.npu_clock(&*self.trace).wrapping_sub(self.npu_end);
                self.cur.cpu_end = ts;
                self.totals.cpu_end += ts as u64;
                self.mux.read_post_end(&mut *self.trace, &mut *self.cache_counters, &mut self.cur);
                self.notify(t, index, true);
                if self.stats {
                    self.mux.log_stats(&self.cur, &*self.trace);
                }
            }
        }
        self.clock.reset();
    }

    fn notify(&mut self, transition: Transition, index: usize, with_counters: bool) {
        let Some(observer) = self.observer.as_deref_mut() else {
            return;
        };
        let blocks = self.net.epoch_blocks();
        let Some(block) = blocks.get(index) else {
            return;
        };
        // NB: the ordinal is bumped once the unit is armed.
        let exec_idx = if transition == Transition::PreStart {
            self.exec_idx
        } else {
            self.exec_idx.wrapping_sub(1)
        };
        let event = EpochEvent {
            transition,
            exec_idx,
            index,
            block,
            next: blocks.get(index + 1),
            counters: if with_counters { Some(&self.cur) } else { None },
            network: self.net,
        };
        observer.on_epoch(&event, &mut *self.memory, &mut *self.cache);
    }
}

/// Runs installed networks. Holds no state between runs beyond the
/// outcome of the last one.
pub struct EpochDriver {
    state: DriverState,
}
impl Default for EpochDriver {
    fn default() -> Self { Self::new() }
}
impl EpochDriver {
    pub const fn new() -> Self {
        Self {
            state: DriverState::Idle,
        }
    }

    pub fn state(&self) -> DriverState { self.state }

    /// Runs |instance| to completion. An instance that was not installed
    /// is installed for the run and torn down afterwards.
    pub fn run(
        &mut self,
        hal: &mut NpuHal,
        instance: &mut NpuInstance,
        ctx: RunContext,
    ) -> Result<RunCounters, NpuError> {
        self.state = DriverState::Resetting;
        let auto_install = instance.state() != InstanceState::Ready;
        if auto_install {
            if let Err(e) = instance.install(hal) {
                error!("{}: install for run failed: {:?}", instance.name(), e);
                self.state = DriverState::Failed;
                return Err(e);
            }
        }
        let net = instance.network();
        let mode = if ctx.is_observed() {
            TelemetryMode::select(instance.option(), hal.cache_counters.present())
        } else {
            TelemetryMode::default()
        };
        trace!("{}: telemetry {:?}", instance.name(), mode);

        let ticks0 = hal.clock.ticks_ms();
        hal.clock.reset();
        for d in instance.info().inputs.iter() {
            hal.cache.clean_invalidate(d.range());
        }
        for d in instance.info().outputs.iter() {
            hal.cache.invalidate(d.range());
        }
        hal.runtime.reset_network(net);

        let NpuHal {
            runtime,
            trace,
            cache_counters,
            cache,
            clock,
            memory,
            ..
        } = &mut *hal;
        let mut session = Session {
            net,
            observer: ctx.observer,
            stats: ctx.stats,
            mux: CounterMux::new(mode),
            trace: trace.as_mut(),
            cache_counters: cache_counters.as_mut(),
            clock: clock.as_mut(),
            cache,
            memory: memory.as_mut(),
            totals: RunCounters::default(),
            cur: EpochCounters::default(),
            npu_start: 0,
            npu_end: 0,
            exec_idx: 0,
        };
        self.state = DriverState::Executing;
        let status = loop {
            let status = runtime.run_epoch_block(net, &mut |t, i| session.transition(t, i));
            match status {
                RtStatus::Busy => {
                    self.state = DriverState::WaitingForEvent;
                    runtime.wait_for_event();
                    self.state = DriverState::Executing;
                }
                RtStatus::Continue => {}
                RtStatus::Done | RtStatus::Fault => break status,
            }
        };
        let mut totals = session.totals;
        totals.epochs = session.exec_idx;
        totals.cpu_all += session.clock.cycles() as u64;
        totals.cpu_all += totals.cpu_start + totals.cpu_core + totals.cpu_end;
        let observed = session.observer.is_some();
        drop(session);

        totals.ticks_ms = hal.clock.ticks_ms().wrapping_sub(ticks0);
        // NB: the cycle counter wraps within seconds; long unobserved runs
        // fall back to the millisecond tick.
        if !observed && totals.ticks_ms >= TICK_THRESHOLD_MS {
            totals.cpu_all = totals.ticks_ms as u64 * (hal.clock.cpu_freq_hz() / 1000) as u64;
        }

        if auto_install {
            instance.teardown(hal)?;
        }
        if status != RtStatus::Done {
            error!("{}: runtime ended with {:?}", instance.name(), status);
            self.state = DriverState::Failed;
            return Err(NpuError::ExecutionFailure);
        }
        self.state = DriverState::Done;
        info!(
            "{}: {} units, {} cycles, {} ms",
            instance.name(),
            totals.epochs,
            totals.cpu_all,
            totals.ticks_ms
        );
        Ok(totals)
    }
}
