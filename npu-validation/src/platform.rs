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

//! Assembles the |NpuHal| for the configured platform.

use alloc::boxed::Box;
use fake_npu_core::FakeSoc;
use npu_coordinator::{CacheCoherency, NpuHal};

cfg_if::cfg_if! {
    if #[cfg(feature = "CONFIG_PLAT_N6")] {
        use npu_interface::NpuRuntime;
        pub use npu_core::Clocks;

        /// Claims the SoC blocks and pairs them with the vendor accelerator
        /// |runtime|. Returns None if the SoC was already claimed.
        pub fn soc_hal(
            runtime: Box<dyn NpuRuntime>,
            ticks: fn() -> u32,
            clocks: Clocks,
        ) -> Option<NpuHal> {
            let soc = npu_core::Soc::take(ticks, clocks)?;
            Some(NpuHal {
                runtime,
                pipeline: Box::new(soc.pipeline),
                trace: Box::new(soc.trace),
                cache_counters: Box::new(soc.cache_counters),
                cache: CacheCoherency::new(Box::new(soc.cache), &npu_core::REGIONS),
                clock: Box::new(soc.clock),
                memory: Box::new(soc.memory),
                sysconf: Box::new(soc.sysconf),
            })
        }
    }
}

/// Hosted builds and tests run against the software SoC.
pub fn fake_hal(soc: &FakeSoc) -> NpuHal {
    NpuHal {
        runtime: Box::new(soc.runtime()),
        pipeline: Box::new(soc.pipeline()),
        trace: Box::new(soc.trace()),
        cache_counters: Box::new(soc.cache_counters()),
        cache: CacheCoherency::new(Box::new(soc.cache()), &fake_npu_core::REGIONS),
        clock: Box::new(soc.clock()),
        memory: Box::new(soc.memory()),
        sysconf: Box::new(soc.sysconf()),
    }
}
