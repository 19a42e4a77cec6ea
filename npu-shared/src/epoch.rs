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

//! Execution units ("epoch blocks") of a compiled network.

use bitflags::bitflags;

bitflags! {
    #[derive(Default)]
    pub struct EpochFlags: u32 {
        const LAST    = 0b0000_0001; // Terminator entry, never executed.
        const BLOB    = 0b0000_0010; // Epoch controller blob.
        const PURE_SW = 0b0000_0100;
        const HYBRID  = 0b0000_1000;
    }
}

/// What sort of work a unit carries out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnitKind {
    Hardware,
    Extra, // Auxiliary hardware unit with no tensors of its own.
    Software,
    Hybrid,
    Controller,
}

/// One schedulable step of accelerator work. Negative epoch numbers
/// denote extra units.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EpochBlock {
    pub epoch_num: i16,
    pub last_epoch_num: i16,
    pub in_strands: u32,
    pub out_strands: u32,
    pub flags: EpochFlags,
}
impl EpochBlock {
    pub const fn hw(epoch_num: i16, in_strands: u32, out_strands: u32) -> Self {
        Self {
            epoch_num,
            last_epoch_num: epoch_num,
            in_strands,
            out_strands,
            flags: EpochFlags::empty(),
        }
    }

    /// The end-of-list marker.
    pub const fn terminator() -> Self {
        Self {
            epoch_num: 0,
            last_epoch_num: 0,
            in_strands: 0,
            out_strands: 0,
            flags: EpochFlags::LAST,
        }
    }

    pub fn is_last(&self) -> bool { self.flags.contains(EpochFlags::LAST) }

    pub fn is_extra(&self) -> bool { self.epoch_num < 0 }

    // NB: the order of the checks matters; a blob may also be tagged
    // software by the compiler.
    pub fn kind(&self) -> UnitKind {
        if self.flags.contains(EpochFlags::BLOB) {
            UnitKind::Controller
        } else if self.flags.contains(EpochFlags::PURE_SW) {
            UnitKind::Software
        } else if self.flags.contains(EpochFlags::HYBRID) {
            UnitKind::Hybrid
        } else if self.is_extra() {
            UnitKind::Extra
        } else {
            UnitKind::Hardware
        }
    }
}

/// Number of executable units, i.e. entries before the terminator.
pub fn epoch_count(blocks: &[EpochBlock]) -> usize {
    blocks.iter().take_while(|b| !b.is_last()).count()
}
