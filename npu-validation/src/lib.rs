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

//! Host validation service. A host tool connects over a serial link,
//! uploads input tensors, runs a network and pulls back outputs together
//! with per-unit profiling and intermediate buffers.

extern crate alloc;

mod platform;
mod serial;
mod server;

pub use platform::*;
pub use serial::*;
pub use server::*;
