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

//! A small actor network laid out the way the model compiler emits it:
//! 146 floats in, four dense/tanh stages, 4 floats out.

use npu_interface::Network;
use npu_shared::*;

pub const MEM_BASE: usize = 0x3400_0000;
pub const MEM_SIZE: usize = 0x1_0000;

pub const INPUT_ADDR: usize = MEM_BASE;
pub const INPUT_SIZE: usize = 584;
pub const OUTPUT_ADDR: usize = MEM_BASE + 0x0800;
pub const OUTPUT_SIZE: usize = 16;
pub const PARAMS_ADDR: usize = MEM_BASE + 0x8000;
pub const PARAMS_SIZE: usize = 0x0400;

static IN_SHAPE: [u32; 2] = [1, 146];
static HIDDEN_SHAPE: [u32; 2] = [1, 64];
static OUT_SHAPE: [u32; 2] = [1, 4];
static PARAMS_SHAPE: [u32; 1] = [256];

pub static REGIONS: [MemRegion; 2] = [
    MemRegion {
        name: "axisram1",
        base: MEM_BASE,
        size: 0x8000,
        cacheable: true,
    },
    MemRegion {
        name: "npuram",
        base: MEM_BASE + 0x8000,
        size: 0x8000,
        cacheable: false,
    },
];

const fn f32_buf(
    name: &'static str,
    shape: &'static [u32],
    addr: usize,
    size: usize,
    epoch: i16,
) -> TensorDesc {
    TensorDesc {
        name,
        shape,
        format: ElementFormat::F32,
        quant: None,
        addr,
        size,
        is_param: false,
        epoch,
    }
}

static INPUTS: [TensorDesc; 2] = [
    f32_buf("obs_output", &IN_SHAPE, INPUT_ADDR, INPUT_SIZE, 1),
    TensorDesc {
        is_param: true,
        ..f32_buf("actor_weights", &PARAMS_SHAPE, PARAMS_ADDR, PARAMS_SIZE, 0)
    },
];

static INTERNALS: [TensorDesc; 5] = [
    f32_buf("_actor_Gemm_output_0", &HIDDEN_SHAPE, MEM_BASE + 0x0300, 256, 1),
    f32_buf("_actor_Tanh_output_0", &HIDDEN_SHAPE, MEM_BASE + 0x0400, 256, 2),
    f32_buf("_actor_Gemm_1_output_0", &HIDDEN_SHAPE, MEM_BASE + 0x0500, 256, 3),
    f32_buf("_actor_Tanh_1_output_0", &HIDDEN_SHAPE, MEM_BASE + 0x0600, 256, 4),
    f32_buf("_actor_mu_Gemm_output_0_output", &OUT_SHAPE, MEM_BASE + 0x0700, 16, 5),
];

static OUTPUTS: [TensorDesc; 1] =
    [f32_buf("actions_output", &OUT_SHAPE, OUTPUT_ADDR, OUTPUT_SIZE, 6)];

/// One hardware unit per stage.
pub static SAMPLE_BLOCKS: [EpochBlock; 7] = [
    EpochBlock::hw(1, 0b0000_0011, 0b0000_0100),
    EpochBlock::hw(2, 0b0000_0100, 0b0000_1000),
    EpochBlock::hw(3, 0b0000_1000, 0b0001_0000),
    EpochBlock::hw(4, 0b0001_0000, 0b0010_0000),
    EpochBlock::hw(5, 0b0010_0000, 0b0100_0000),
    EpochBlock::hw(6, 0b0100_0000, 0b1000_0000),
    EpochBlock::terminator(),
];

/// Stage 3 runs on an extra unit and stage 4 is split over two units.
pub static GAP_BLOCKS: [EpochBlock; 8] = [
    EpochBlock::hw(1, 0b0000_0011, 0b0000_0100),
    EpochBlock::hw(2, 0b0000_0100, 0b0000_1000),
    EpochBlock {
        last_epoch_num: 3,
        ..EpochBlock::hw(-1, 0b0000_1000, 0b0001_0000)
    },
    EpochBlock::hw(4, 0b0001_0000, 0),
    EpochBlock::hw(4, 0, 0b0010_0000),
    EpochBlock::hw(5, 0b0010_0000, 0b0100_0000),
    EpochBlock::hw(6, 0b0100_0000, 0b1000_0000),
    EpochBlock::terminator(),
];

/// Compiled network description backed by static tables.
pub struct FakeNetwork {
    pub name: &'static str,
    pub blocks: &'static [EpochBlock],
}
impl Network for FakeNetwork {
    fn name(&self) -> &'static str { self.name }
    fn input_buffers(&self) -> &'static [TensorDesc] { &INPUTS }
    fn output_buffers(&self) -> &'static [TensorDesc] { &OUTPUTS }
    fn internal_buffers(&self) -> &'static [TensorDesc] { &INTERNALS }
    fn epoch_blocks(&self) -> &'static [EpochBlock] { self.blocks }
    fn memory_regions(&self) -> &'static [MemRegion] { &REGIONS }
}

pub static SAMPLE_NETWORK: FakeNetwork = FakeNetwork {
    name: "network",
    blocks: &SAMPLE_BLOCKS,
};

pub static GAP_NETWORK: FakeNetwork = FakeNetwork {
    name: "network_gap",
    blocks: &GAP_BLOCKS,
};
