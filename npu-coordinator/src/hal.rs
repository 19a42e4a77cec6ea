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

use crate::CacheCoherency;
use alloc::boxed::Box;
use npu_interface::*;

/// The hardware the coordinator drives. A platform crate fills this in with
/// either the register-level backend or the software fake.
pub struct NpuHal {
    pub runtime: Box<dyn NpuRuntime>,
    pub pipeline: Box<dyn PipelineControl>,
    pub trace: Box<dyn TraceUnit>,
    pub cache_counters: Box<dyn CacheCounters>,
    pub cache: CacheCoherency,
    pub clock: Box<dyn CycleClock>,
    pub memory: Box<dyn BufferMemory>,
    pub sysconf: Box<dyn SystemConfig>,
}
