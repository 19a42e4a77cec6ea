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

// Register layouts for the blocks around the accelerator.

use modular_bitfield::prelude::*;
use static_assertions::const_assert_eq;

/// A memory-mapped register block.
#[derive(Clone, Copy, Debug)]
pub struct Mmio {
    base: usize,
}
impl Mmio {
    /// # Safety
    /// |base| must address a register block that stays mapped for the life
    /// of the returned value.
    pub const unsafe fn new(base: usize) -> Self { Self { base } }

    pub fn base(&self) -> usize { self.base }

    #[inline]
    pub fn read(&self, offset: usize) -> u32 {
        unsafe { ((self.base + offset) as *const u32).read_volatile() }
    }

    #[inline]
    pub fn write(&self, offset: usize, value: u32) {
        unsafe { ((self.base + offset) as *mut u32).write_volatile(value) }
    }

    #[inline]
    pub fn modify(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        self.write(offset, f(self.read(offset)));
    }
}

// Debug & trace unit.
pub const DBGTRC_CTRL: usize = 0x000;
pub const DBGTRC_TOTAL_WRITES: usize = 0x010;
pub const DBGTRC_TOTAL_READS: usize = 0x014;
pub const DBGTRC_CNT_CFG: usize = 0x100; // + 8 * counter
pub const DBGTRC_EVT_CNT: usize = 0x104; // + 8 * counter
pub const DBGTRC_CNT_STRIDE: usize = 8;
pub const DBGTRC_SIZE: usize = 0x180;

#[bitfield]
pub struct TraceCtrl {
    pub enable: bool,
    pub burst_bench: bool, // All counters histogram bus burst lengths.
    pub clock_en: bool,
    #[skip]
    _unused0: B29,
}

#[bitfield]
pub struct CounterConfig {
    pub enable: bool,
    pub int_disable: bool,
    pub countdown: bool,
    pub wrap: bool,
    pub evt_type: B2,
    #[skip]
    _unused0: B2,
    pub signal: B8,
    #[skip]
    _unused1: B16,
}

pub const EVT_TYPE_HI: u8 = 0;

// Event sources a counter can watch.
pub const SIGNAL_VDD: u8 = 0x00; // Always high: counts accelerator clocks.
pub const SIGNAL_STRENG_IN_ACTIVE: u8 = 0x10; // + strand
pub const SIGNAL_STRENG_OUT_ACTIVE: u8 = 0x20; // + strand
pub const SIGNAL_STRENG_HENV: u8 = 0x30; // + strand

// Accelerator AXI cache.
pub const CACHEAXI_CR1: usize = 0x000;
pub const CACHEAXI_SR: usize = 0x004;
pub const CACHEAXI_MONR: usize = 0x020; // 8 consecutive monitors.
pub const CACHEAXI_SIZE: usize = 0x040;

#[bitfield]
pub struct CacheCr1 {
    pub en: bool,
    pub cache_inv: bool,
    #[skip]
    _unused0: B14,
    pub monitors: B16, // Per-monitor enable/reset pairs.
}
pub const CACHEAXI_MONITORS_ON: u16 = 0xFFFF; // 0x3333 | 0xCCCC

#[bitfield]
pub struct CacheSr {
    pub busy: bool,
    pub bsyend: bool,
    #[skip]
    _unused0: B30,
}

// Accelerator clock control.
pub const CLKCTRL_CTRL: usize = 0x000;
pub const CLKCTRL_SIZE: usize = 0x010;

#[bitfield]
pub struct ClkCtrl {
    pub en: bool,
    pub clr: bool,
    #[skip]
    _unused0: B30,
}

// Cortex-M system control block, offsets from 0xE000_E000.
pub const SCB_CCR: usize = 0xD14;
pub const SCB_CCSIDR: usize = 0xD80;
pub const SCB_CSSELR: usize = 0xD84;
pub const SCB_DCIMVAC: usize = 0xF5C;
pub const SCB_DCCIMVAC: usize = 0xF70;
pub const SCB_DCCISW: usize = 0xF74;
pub const SCB_DEMCR: usize = 0xDFC;
pub const SCB_SIZE: usize = 0xF80;

pub const CCR_DC: u32 = 1 << 16;
pub const CCR_IC: u32 = 1 << 17;
pub const DEMCR_TRCENA: u32 = 1 << 24;

#[bitfield]
pub struct Ccsidr {
    pub line_size: B3, // log2(words per line) - 2
    pub associativity: B10, // ways - 1
    pub num_sets: B15, // sets - 1
    #[skip]
    _unused0: B4,
}

// Data watchpoint & trace.
pub const DWT_CTRL: usize = 0x000;
pub const DWT_CYCCNT: usize = 0x004;
pub const DWT_SIZE: usize = 0x008;
pub const DWT_CTRL_CYCCNTENA: u32 = 1 << 0;

// Debug MCU id.
pub const DBGMCU_IDCODE: usize = 0x000;

const_assert_eq!(core::mem::size_of::<CounterConfig>(), 4);
const_assert_eq!(core::mem::size_of::<Ccsidr>(), 4);
const_assert_eq!(core::mem::size_of::<CacheCr1>(), 4);

pub fn counter_config(mmio: &Mmio, counter: usize) -> CounterConfig {
    CounterConfig::from_bytes(mmio.read(DBGTRC_CNT_CFG + counter * DBGTRC_CNT_STRIDE).to_ne_bytes())
}
pub fn set_counter_config(mmio: &Mmio, counter: usize, cfg: CounterConfig) {
    mmio.write(
        DBGTRC_CNT_CFG + counter * DBGTRC_CNT_STRIDE,
        u32::from_ne_bytes(cfg.into_bytes()),
    );
}
pub fn get_trace_ctrl(mmio: &Mmio) -> TraceCtrl {
    TraceCtrl::from_bytes(mmio.read(DBGTRC_CTRL).to_ne_bytes())
}
pub fn set_trace_ctrl(mmio: &Mmio, ctrl: TraceCtrl) {
    mmio.write(DBGTRC_CTRL, u32::from_ne_bytes(ctrl.into_bytes()));
}
pub fn get_cache_cr1(mmio: &Mmio) -> CacheCr1 {
    CacheCr1::from_bytes(mmio.read(CACHEAXI_CR1).to_ne_bytes())
}
pub fn set_cache_cr1(mmio: &Mmio, cr1: CacheCr1) {
    mmio.write(CACHEAXI_CR1, u32::from_ne_bytes(cr1.into_bytes()));
}
pub fn get_cache_sr(mmio: &Mmio) -> CacheSr {
    CacheSr::from_bytes(mmio.read(CACHEAXI_SR).to_ne_bytes())
}
pub fn get_clk_ctrl(mmio: &Mmio) -> ClkCtrl {
    ClkCtrl::from_bytes(mmio.read(CLKCTRL_CTRL).to_ne_bytes())
}
pub fn set_clk_ctrl(mmio: &Mmio, ctrl: ClkCtrl) {
    mmio.write(CLKCTRL_CTRL, u32::from_ne_bytes(ctrl.into_bytes()));
}
pub fn get_ccsidr(mmio: &Mmio) -> Ccsidr { Ccsidr::from_bytes(mmio.read(SCB_CCSIDR).to_ne_bytes()) }
