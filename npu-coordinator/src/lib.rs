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

//! NPU Coordinator: owns the accelerator instances and runs them one
//! execution unit at a time, multiplexing the trace counters across units
//! and keeping the CPU caches coherent with accelerator memory.

extern crate alloc;

mod cache;
mod driver;
mod hal;
mod instance;
mod telemetry;

pub use cache::CacheCoherency;
pub use driver::*;
pub use hal::NpuHal;
pub use instance::*;
pub use telemetry::*;

/// Runs longer than this report a tick-derived cycle total.
pub const TICK_THRESHOLD_MS: u32 = 3000;
