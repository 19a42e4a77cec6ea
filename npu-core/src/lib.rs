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

//! npu-core drives the SoC blocks that surround the neural accelerator:
//! the debug & trace counter unit, the accelerator AXI cache, the clock
//! controller, the MCU caches and cycle counter. The accelerator runtime
//! itself is a vendor library bound in by the firmware.

#[allow(dead_code)]
mod regs;

use core::ops::Range;
use log::{info, trace, warn};
use npu_interface::*;
use npu_shared::*;
use regs::*;
use spin::Mutex;

pub use regs::Mmio;

extern crate alloc;
use alloc::vec::Vec;

cfg_if::cfg_if! {
    if #[cfg(feature = "nonsecure")] {
        const NPU_BASE: usize = 0x480E_0000;
        const CACHEAXI_BASE: usize = 0x480D_FC00;
        const RAM_ALIAS: usize = 0x2400_0000;
    } else {
        const NPU_BASE: usize = 0x580E_0000;
        const CACHEAXI_BASE: usize = 0x580D_FC00;
        const RAM_ALIAS: usize = 0x3400_0000;
    }
}
const CLKCTRL_BASE: usize = NPU_BASE;
const DBGTRC_BASE: usize = NPU_BASE + 0x2_4000;
const SCB_BASE: usize = 0xE000_E000;
const DWT_BASE: usize = 0xE000_1000;
const DBGMCU_BASE: usize = 0xE004_4000;

/// MCU data cache line.
pub const DCACHE_LINE: usize = 32;

const KIB: usize = 1024;

/// Memories the accelerator can see. AXISRAM1..6 and the external window
/// are cacheable by the MCU; the window backing the accelerator cache is
/// not.
pub static REGIONS: [MemRegion; 8] = [
    MemRegion {
        name: "axisram1",
        base: RAM_ALIAS,
        size: 1024 * KIB,
        cacheable: true,
    },
    MemRegion {
        name: "axisram2",
        base: RAM_ALIAS + 0x10_0000,
        size: 1024 * KIB,
        cacheable: true,
    },
    MemRegion {
        name: "axisram3",
        base: RAM_ALIAS + 0x20_0000,
        size: 448 * KIB,
        cacheable: true,
    },
    MemRegion {
        name: "axisram4",
        base: RAM_ALIAS + 0x27_0000,
        size: 448 * KIB,
        cacheable: true,
    },
    MemRegion {
        name: "axisram5",
        base: RAM_ALIAS + 0x2E_0000,
        size: 448 * KIB,
        cacheable: true,
    },
    MemRegion {
        name: "axisram6",
        base: RAM_ALIAS + 0x35_0000,
        size: 448 * KIB,
        cacheable: true,
    },
    MemRegion {
        name: "npu_cache",
        base: RAM_ALIAS + 0x3C_0000,
        size: 256 * KIB,
        cacheable: false,
    },
    MemRegion {
        name: "external",
        base: 0x6000_0000,
        size: 0x4000_0000,
        cacheable: true,
    },
];

#[inline]
fn barrier() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "arm")] {
            unsafe { core::arch::asm!("dsb sy", "isb sy", options(nostack, preserves_flags)) };
        } else {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }
}

/// The accelerator debug & trace unit.
pub struct DebugTrace {
    mmio: Mmio,
}
impl DebugTrace {
    pub fn new(mmio: Mmio) -> Self { Self { mmio } }

    fn count_addr(counter: usize) -> usize { DBGTRC_EVT_CNT + counter * DBGTRC_CNT_STRIDE }

    fn set_enable(&mut self, counter: usize, enable: bool) {
        let cfg = counter_config(&self.mmio, counter).with_enable(enable);
        set_counter_config(&self.mmio, counter, cfg);
    }
}
impl TraceUnit for DebugTrace {
    fn enable(&mut self) {
        trace!("dbgtrc: enable");
        set_trace_ctrl(&self.mmio, TraceCtrl::new().with_clock_en(true).with_enable(true));
    }

    fn disable(&mut self) {
        trace!("dbgtrc: disable");
        for counter in 0..NUM_COUNTERS {
            set_counter_config(&self.mmio, counter, CounterConfig::new());
        }
        set_trace_ctrl(&self.mmio, TraceCtrl::new());
    }

    fn num_counters(&self) -> usize { NUM_COUNTERS }

    fn configure(&mut self, counter: usize, event: CounterEvent) {
        let signal = match event {
            CounterEvent::NpuClock => SIGNAL_VDD,
            CounterEvent::StrandActive {
                strand,
                dir: Direction::In,
            } => SIGNAL_STRENG_IN_ACTIVE + strand,
            CounterEvent::StrandActive {
                strand,
                dir: Direction::Out,
            } => SIGNAL_STRENG_OUT_ACTIVE + strand,
            CounterEvent::StrandHoldEnv { strand } => SIGNAL_STRENG_HENV + strand,
        };
        let cfg = CounterConfig::new()
            .with_signal(signal)
            .with_evt_type(EVT_TYPE_HI)
            .with_int_disable(true);
        set_counter_config(&self.mmio, counter, cfg);
        self.mmio.write(Self::count_addr(counter), 0);
    }

    fn start(&mut self, counter: usize) { self.set_enable(counter, true); }

    fn stop(&mut self, counter: usize) { self.set_enable(counter, false); }

    fn read(&self, counter: usize) -> u32 { self.mmio.read(Self::count_addr(counter)) }

    fn clear(&mut self, counter: usize) { self.mmio.write(Self::count_addr(counter), 0); }

    fn burst_len_start(&mut self) {
        for counter in 0..NUM_COUNTERS {
            self.mmio.write(Self::count_addr(counter), 0);
        }
        let ctrl = get_trace_ctrl(&self.mmio).with_burst_bench(true);
        set_trace_ctrl(&self.mmio, ctrl);
    }

    fn burst_len_read(&mut self, out: &mut [u32; NUM_COUNTERS]) {
        let ctrl = get_trace_ctrl(&self.mmio).with_burst_bench(false);
        set_trace_ctrl(&self.mmio, ctrl);
        for (counter, slot) in out.iter_mut().enumerate() {
            *slot = self.mmio.read(Self::count_addr(counter));
        }
    }

    fn total_transfers(&self) -> (u32, u32) {
        (
            self.mmio.read(DBGTRC_TOTAL_WRITES),
            self.mmio.read(DBGTRC_TOTAL_READS),
        )
    }
}

/// The accelerator AXI cache and its hit/miss monitors.
pub struct AxiCache {
    mmio: Mmio,
}
impl AxiCache {
    pub fn new(mmio: Mmio) -> Self { Self { mmio } }

    fn enabled(&self) -> bool { cfg!(feature = "npu_cache") && get_cache_cr1(&self.mmio).en() }

    /// Invalidates the whole accelerator cache and waits for completion.
    pub fn invalidate(&mut self) {
        if !self.enabled() {
            return;
        }
        let cr1 = get_cache_cr1(&self.mmio).with_cache_inv(true);
        set_cache_cr1(&self.mmio, cr1);
        while get_cache_sr(&self.mmio).busy() {
            core::hint::spin_loop();
        }
    }
}
impl CacheCounters for AxiCache {
    fn present(&self) -> bool { self.enabled() }

    fn enable(&mut self) {
        if self.enabled() {
            let cr1 = get_cache_cr1(&self.mmio).with_monitors(CACHEAXI_MONITORS_ON);
            set_cache_cr1(&self.mmio, cr1);
        }
    }

    fn disable(&mut self) {
        if self.enabled() {
            let cr1 = get_cache_cr1(&self.mmio).with_monitors(0);
            set_cache_cr1(&self.mmio, cr1);
        }
    }

    fn read(&self, out: &mut [u32; CACHE_COUNTERS]) {
        if !self.enabled() {
            return;
        }
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.mmio.read(CACHEAXI_MONR + i * 4);
        }
    }
}

/// Accelerator clock controller.
pub struct ClockControl {
    mmio: Mmio,
}
impl ClockControl {
    pub fn new(mmio: Mmio) -> Self { Self { mmio } }
}
impl PipelineControl for ClockControl {
    fn soft_reset(&mut self) {
        let ctrl = get_clk_ctrl(&self.mmio).with_clr(true);
        set_clk_ctrl(&self.mmio, ctrl);
    }
}

/// MCU L1 data cache maintenance, plus the accelerator cache when fitted.
pub struct McuCache {
    scb: Mmio,
    npu: Option<AxiCache>,
}
impl McuCache {
    pub fn new(scb: Mmio, npu: Option<AxiCache>) -> Self { Self { scb, npu } }

    fn dcache_enabled(&self) -> bool { self.scb.read(SCB_CCR) & CCR_DC != 0 }

    fn by_line(&mut self, reg: usize, range: Range<usize>) {
        if !self.dcache_enabled() || range.is_empty() {
            return;
        }
        barrier();
        let mut addr = range.start & !(DCACHE_LINE - 1);
        while addr < range.end {
            self.scb.write(reg, addr as u32);
            addr += DCACHE_LINE;
        }
        barrier();
    }
}
impl CacheMaintenance for McuCache {
    fn clean_invalidate_range(&mut self, range: Range<usize>) { self.by_line(SCB_DCCIMVAC, range); }

    fn invalidate_range(&mut self, range: Range<usize>) { self.by_line(SCB_DCIMVAC, range); }

    fn clean_invalidate_all(&mut self) {
        if !self.dcache_enabled() {
            return;
        }
        self.scb.write(SCB_CSSELR, 0); // L1 data cache
        barrier();
        let geometry = get_ccsidr(&self.scb);
        let sets = geometry.num_sets() as u32 + 1;
        let ways = geometry.associativity() as u32 + 1;
        let set_shift = geometry.line_size() as u32 + 4;
        let way_shift = if ways > 1 { (ways - 1).leading_zeros() } else { 0 };
        for set in 0..sets {
            for way in 0..ways {
                let way_bits = if ways > 1 { way << way_shift } else { 0 };
                self.scb.write(SCB_DCCISW, way_bits | (set << set_shift));
            }
        }
        barrier();
    }

    fn npu_cache_invalidate(&mut self) {
        if let Some(npu) = self.npu.as_mut() {
            npu.invalidate();
        }
    }
}

/// DWT cycle counter plus the board millisecond tick.
pub struct DwtClock {
    dwt: Mmio,
    scb: Mmio,
    ticks: fn() -> u32,
    cpu_freq_hz: u32,
}
impl DwtClock {
    pub fn new(dwt: Mmio, scb: Mmio, ticks: fn() -> u32, cpu_freq_hz: u32) -> Self {
        Self {
            dwt,
            scb,
            ticks,
            cpu_freq_hz,
        }
    }
}
impl CycleClock for DwtClock {
    fn init(&mut self) {
        self.scb.modify(SCB_DEMCR, |v| v | DEMCR_TRCENA);
        self.dwt.write(DWT_CYCCNT, 0);
        self.dwt.modify(DWT_CTRL, |v| v | DWT_CTRL_CYCCNTENA);
    }
    fn cycles(&self) -> u32 { self.dwt.read(DWT_CYCCNT) }
    fn reset(&mut self) { self.dwt.write(DWT_CYCCNT, 0); }
    fn ticks_ms(&self) -> u32 { (self.ticks)() }
    fn cpu_freq_hz(&self) -> u32 { self.cpu_freq_hz }
}

/// Direct access to accelerator memories by physical address.
pub struct PhysicalMemory {
    regions: &'static [MemRegion],
}
impl PhysicalMemory {
    /// # Safety
    /// Every region in |regions| must be mapped read/write.
    pub unsafe fn new(regions: &'static [MemRegion]) -> Self { Self { regions } }

    fn check(&self, addr: usize, len: usize) -> Result<(), NpuError> {
        let end = addr.checked_add(len).ok_or(NpuError::MemoryFault)?;
        if self.regions.iter().any(|r| r.contains(&(addr..end))) {
            Ok(())
        } else {
            warn!("memory: {:#x}+{} outside known regions", addr, len);
            Err(NpuError::MemoryFault)
        }
    }
}
impl BufferMemory for PhysicalMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), NpuError> {
        self.check(addr, buf.len())?;
        unsafe { core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), NpuError> {
        self.check(addr, data.len())?;
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
        Ok(())
    }
}

/// Clock plan of the board, supplied by bring-up code.
#[derive(Clone, Copy, Debug, Default)]
pub struct Clocks {
    pub sclk: u32,
    pub hclk: u32,
    pub npu: u32,
    pub nic: u32,
}

pub struct BoardConf {
    dbgmcu: Mmio,
    scb: Mmio,
    cache: Option<Mmio>,
    clocks: Clocks,
}
impl BoardConf {
    pub fn new(dbgmcu: Mmio, scb: Mmio, cache: Option<Mmio>, clocks: Clocks) -> Self {
        Self {
            dbgmcu,
            scb,
            cache,
            clocks,
        }
    }
}
impl SystemConfig for BoardConf {
    fn mcu_conf(&self) -> McuConf {
        let idcode = self.dbgmcu.read(DBGMCU_IDCODE);
        let ccr = self.scb.read(SCB_CCR);
        let mut conf = 0;
        if ccr & CCR_IC != 0 {
            conf |= 1 << 0;
        }
        if ccr & CCR_DC != 0 {
            conf |= 1 << 1;
        }
        if self.cache.map_or(false, |m| get_cache_cr1(&m).en()) {
            conf |= 1 << 2;
        }
        let mut extra = Vec::with_capacity(EXTRA_CONF_LEN);
        if EXTRA_CONF_LEN > 0 {
            extra.extend_from_slice(&[idcode, self.clocks.npu, self.clocks.nic]);
            extra.resize(EXTRA_CONF_LEN, 0);
        }
        McuConf {
            devid: idcode & 0xFFF,
            sclk: self.clocks.sclk,
            hclk: self.clocks.hclk,
            conf,
            extra,
        }
    }
}

/// Every SoC block, at its fixed address.
pub struct Soc {
    pub trace: DebugTrace,
    pub cache_counters: AxiCache,
    pub pipeline: ClockControl,
    pub cache: McuCache,
    pub clock: DwtClock,
    pub memory: PhysicalMemory,
    pub sysconf: BoardConf,
}

static TAKEN: Mutex<bool> = Mutex::new(false);

impl Soc {
    /// Claims the SoC blocks. Returns None after the first call.
    pub fn take(ticks: fn() -> u32, clocks: Clocks) -> Option<Soc> {
        let mut taken = TAKEN.lock();
        if *taken {
            return None;
        }
        *taken = true;
        info!(target: "NPU", "dbgtrc @ {:#X} cacheaxi @ {:#X}", DBGTRC_BASE, CACHEAXI_BASE);
        // SAFETY: fixed peripheral addresses of the SoC; claimed once.
        unsafe {
            let npu_cache = || {
                if cfg!(feature = "npu_cache") {
                    Some(AxiCache::new(Mmio::new(CACHEAXI_BASE)))
                } else {
                    None
                }
            };
            Some(Soc {
                trace: DebugTrace::new(Mmio::new(DBGTRC_BASE)),
                cache_counters: AxiCache::new(Mmio::new(CACHEAXI_BASE)),
                pipeline: ClockControl::new(Mmio::new(CLKCTRL_BASE)),
                cache: McuCache::new(Mmio::new(SCB_BASE), npu_cache()),
                clock: DwtClock::new(Mmio::new(DWT_BASE), Mmio::new(SCB_BASE), ticks, clocks.sclk),
                memory: PhysicalMemory::new(&REGIONS),
                sysconf: BoardConf::new(
                    Mmio::new(DBGMCU_BASE),
                    Mmio::new(SCB_BASE),
                    npu_cache().map(|c| c.mmio),
                    clocks,
                ),
            })
        }
    }
}
