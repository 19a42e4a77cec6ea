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

//! Host validation protocol messages.
//!
//! Every message is a serde type; on a byte link each one travels as a
//! COBS-framed postcard blob (see |encode_frame| / |decode_frame|).

use crate::NpuError;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use npu_shared::{ElementFormat, Quant, TensorDesc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const PROTO_VERSION: (u8, u8) = (0, 4);

/// Identifier of this runtime family, low 16 bits of the model rtid.
pub const RUNTIME_ID: u32 = 0x0041;
pub const RUNTIME_TOOLS_POS: u32 = 16;

/// Operator type flags live in the top byte of the type word.
pub const OPERATOR_FLAG_POS: u32 = 24;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum Command {
    Sync = 0,
    SysInfo = 1,
    ModelInfo = 2,
    Run = 3,
}

bitflags! {
    /// Command capabilities advertised by Sync.
    #[derive(Serialize, Deserialize)]
    pub struct Capabilities: u32 {
        const SYS_INFO   = 1 << 0;
        const MODEL_INFO = 1 << 1;
        const RUN        = 1 << 2;
        const OBSERVER   = 1 << 3;
    }
}

bitflags! {
    /// The |param| word of a Run request.
    pub struct RunParam: u32 {
        const PER_LAYER           = 1 << 1;
        const PER_LAYER_WITH_DATA = 1 << 2 | Self::PER_LAYER.bits;
        const PERF_ONLY           = 1 << 3;
        const CONST_VALUE         = 1 << 8;
        const DEBUG               = 1 << 9;
    }
}

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct TensorFlags: u32 {
        const INPUT      = 1 << 0;
        const OUTPUT     = 1 << 1;
        const INTERNAL   = 1 << 2;
        const IN_MEMPOOL = 1 << 3;
        const MEMPOOL    = 1 << 4;
        const NO_DATA    = 1 << 5;
        const LAST       = 1 << 6;
    }
}

bitflags! {
    pub struct OperatorFlags: u32 {
        const INTERNAL       = 1 << 0;
        const WITHOUT_TENSOR = 1 << 1;
    }
}

/// A host request. |opcode| is kept raw so unknown commands can be
/// answered rather than dropped.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub opcode: u8,
    pub name: String,
    pub param: u32,
    pub opt: u32,
}
impl Request {
    pub fn new(cmd: Command, name: &str, param: u32, opt: u32) -> Self {
        Self {
            opcode: cmd.into(),
            name: name.into(),
            param,
            opt,
        }
    }

    pub fn command(&self) -> Option<Command> { Command::try_from(self.opcode).ok() }
}

/// Everything the host may send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HostMessage {
    Command(Request),
    Data { chunk: Vec<u8>, last: bool },
    Ack,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum State {
    Idle,
    Waiting,
    Processing,
    Done,
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ErrorCode {
    None,
    InvalidParam,
    InvalidSize,
    Generic,
    InvalidCommand,
}
impl From<NpuError> for ErrorCode {
    fn from(err: NpuError) -> ErrorCode {
        match err {
            NpuError::Success => ErrorCode::None,
            NpuError::NotFound | NpuError::InvalidParam => ErrorCode::InvalidParam,
            NpuError::SizeMismatch => ErrorCode::InvalidSize,
            NpuError::InvalidCommand => ErrorCode::InvalidCommand,
            _ => ErrorCode::Generic,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorDescMsg {
    pub name: String,
    pub format: Option<ElementFormat>, // None for memory pools.
    pub dims: Vec<u32>,
    pub size: u32, // Bytes.
    pub addr: u32, // Informational only.
    pub quant: Option<Quant>,
    pub flags: TensorFlags,
}
impl TensorDescMsg {
    pub fn from_desc(desc: &TensorDesc, flags: TensorFlags) -> Self {
        Self {
            name: desc.name.into(),
            format: Some(desc.format),
            dims: desc.shape.to_vec(),
            size: desc.size as u32,
            addr: desc.addr as u32,
            quant: desc.quant,
            flags,
        }
    }

    /// A synthetic descriptor that only carries a byte count.
    pub fn pool(name: &str, size: usize) -> Self {
        Self {
            name: name.into(),
            format: None,
            dims: Vec::new(),
            size: size as u32,
            addr: 0,
            quant: None,
            flags: TensorFlags::MEMPOOL,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorMsg {
    pub desc: TensorDescMsg,
    pub data: Vec<u8>, // Empty when NO_DATA is set.
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfMsg {
    pub duration_ms: f32,
    pub counter_fmt: u32,
    pub cpu: Vec<u64>,
    pub npu: Vec<u32>,
    pub samples: Vec<u32>,
    pub cache: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorMsg {
    pub name: String,
    pub kind: u32,
    pub id: u32,
    pub perf: PerfMsg,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncMsg {
    pub version: (u8, u8),
    pub capabilities: Capabilities,
    pub rtid: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SysInfoMsg {
    pub devid: u32,
    pub sclk: u32,
    pub hclk: u32,
    pub cache: u32,
    pub extra: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfoMsg {
    pub name: String,
    pub rtid: u32,
    pub runtime_version: [u8; 3],
    pub runtime_build: u32,
    pub runtime_desc: String,
    pub compiler_desc: String,
    pub n_nodes: u32,
    pub inputs: Vec<TensorDescMsg>,
    pub outputs: Vec<TensorDescMsg>,
    pub activations: Vec<TensorDescMsg>,
    pub params: Vec<TensorDescMsg>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AckMsg {
    pub param: u32,
    pub error: ErrorCode,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogMsg {
    pub level: u8,
    pub msg: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Sync(SyncMsg),
    SysInfo(SysInfoMsg),
    ModelInfo(ModelInfoMsg),
    Tensor(TensorMsg),
    Operator(OperatorMsg),
    Ack(AckMsg),
    Log(LogMsg),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub state: State,
    pub payload: Payload,
}
impl Response {
    pub fn ack(state: State, param: u32, error: ErrorCode) -> Self {
        Self {
            state,
            payload: Payload::Ack(AckMsg { param, error }),
        }
    }
}

/// Serializes |msg| into a zero-terminated COBS frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, NpuError> {
    postcard::to_allocvec_cobs(msg).or(Err(NpuError::SerializeFailed))
}

/// Decodes one COBS frame in place. |frame| may include the terminator.
pub fn decode_frame<T: DeserializeOwned>(frame: &mut [u8]) -> Result<T, NpuError> {
    postcard::from_bytes_cobs(frame).or(Err(NpuError::DeserializeFailed))
}
