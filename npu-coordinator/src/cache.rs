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

//! CPU/accelerator cache coherency.

use alloc::boxed::Box;
use core::ops::Range;
use log::trace;
use npu_interface::CacheMaintenance;
use npu_shared::MemRegion;

pub struct CacheCoherency {
    maint: Box<dyn CacheMaintenance>,
    regions: &'static [MemRegion],
}
impl CacheCoherency {
    /// |regions| are the memories the accelerator shares with the CPU;
    /// maintenance is only issued for ranges touching a cacheable one.
    pub fn new(maint: Box<dyn CacheMaintenance>, regions: &'static [MemRegion]) -> Self {
        Self { maint, regions }
    }

    fn cacheable(&self, range: &Range<usize>) -> bool {
        self.regions.iter().any(|r| r.cacheable && r.overlaps(range))
    }

    /// Writes back CPU data in |range| so the accelerator sees it, and drops
    /// the lines so later CPU reads fetch accelerator results.
    pub fn clean_invalidate(&mut self, range: Range<usize>) {
        if self.cacheable(&range) {
            trace!("clean_invalidate {:#x}..{:#x}", range.start, range.end);
            self.maint.clean_invalidate_range(range);
        }
    }

    /// Drops CPU lines in |range| without writing them back.
    pub fn invalidate(&mut self, range: Range<usize>) {
        if self.cacheable(&range) {
            trace!("invalidate {:#x}..{:#x}", range.start, range.end);
            self.maint.invalidate_range(range);
        }
    }

    /// Flushes every cache between the CPU and the accelerator.
    pub fn force_clean(&mut self, npu_cache: bool) {
        if npu_cache {
            self.maint.npu_cache_invalidate();
        }
        self.maint.clean_invalidate_all();
    }
}
