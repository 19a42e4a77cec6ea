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

//! Message framing over a byte link.

use alloc::vec::Vec;
use log::warn;
use npu_interface::proto::{decode_frame, encode_frame};
use npu_interface::*;

/// Longest frame accepted from the host, terminator included.
pub const MAX_FRAME_LEN: usize = 8 * 1024;

/// A raw byte link, e.g. a UART.
pub trait Transport {
    /// Blocks for the next byte; ChannelClosed when the link is gone.
    fn read_byte(&mut self) -> Result<u8, NpuError>;
    fn write_all(&mut self, data: &[u8]) -> Result<(), NpuError>;
}

/// Carries COBS-framed postcard messages over a |Transport|.
pub struct SerialLink<T: Transport> {
    transport: T,
    frame: Vec<u8>,
}
impl<T: Transport> SerialLink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            frame: Vec::new(),
        }
    }

    pub fn transport(&mut self) -> &mut T { &mut self.transport }

    // Collects bytes up to and including the next zero. Empty frames are
    // skipped; an oversized frame is dropped up to its terminator.
    fn read_frame(&mut self) -> Result<(), NpuError> {
        self.frame.clear();
        let mut overrun = false;
        loop {
            let b = self.transport.read_byte()?;
            if b == 0 {
                if overrun {
                    warn!("dropped frame over {} bytes", MAX_FRAME_LEN);
                    return Err(NpuError::DeserializeFailed);
                }
                if self.frame.is_empty() {
                    continue;
                }
                self.frame.push(b);
                return Ok(());
            }
            if self.frame.len() + 1 >= MAX_FRAME_LEN {
                overrun = true;
                self.frame.clear();
            }
            if !overrun {
                self.frame.push(b);
            }
        }
    }
}
impl<T: Transport> HostChannel for SerialLink<T> {
    fn recv(&mut self) -> Result<HostMessage, NpuError> {
        self.read_frame()?;
        decode_frame(&mut self.frame)
    }

    fn send(&mut self, msg: &Response) -> Result<(), NpuError> {
        let frame = encode_frame(msg)?;
        self.transport.write_all(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npu_interface::proto::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct Wire {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
    }
    impl Transport for Wire {
        fn read_byte(&mut self) -> Result<u8, NpuError> {
            self.rx.pop_front().ok_or(NpuError::ChannelClosed)
        }
        fn write_all(&mut self, data: &[u8]) -> Result<(), NpuError> {
            self.tx.extend_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn recv_skips_empty_frames() {
        let mut wire = Wire::default();
        let msg = HostMessage::Command(Request::new(Command::SysInfo, "", 0, 0));
        wire.rx.extend([0, 0]);
        wire.rx.extend(encode_frame(&msg).unwrap());
        wire.rx.extend(encode_frame(&HostMessage::Ack).unwrap());
        let mut link = SerialLink::new(wire);
        assert_eq!(link.recv(), Ok(msg));
        assert_eq!(link.recv(), Ok(HostMessage::Ack));
        assert_eq!(link.recv(), Err(NpuError::ChannelClosed));
    }

    #[test]
    fn send_frames_response() {
        let mut link = SerialLink::new(Wire::default());
        let resp = Response::ack(State::Waiting, 584, ErrorCode::None);
        link.send(&resp).unwrap();
        let tx = &mut link.transport().tx;
        assert_eq!(tx.last(), Some(&0));
        assert_eq!(decode_frame::<Response>(tx), Ok(resp));
    }

    #[test]
    fn garbage_and_oversized_frames() {
        let mut wire = Wire::default();
        wire.rx.extend([0x05, 0xff, 0x00]);
        wire.rx.extend(std::iter::repeat(1).take(MAX_FRAME_LEN + 10));
        wire.rx.push_back(0);
        wire.rx.extend(encode_frame(&HostMessage::Ack).unwrap());
        let mut link = SerialLink::new(wire);
        assert_eq!(link.recv(), Err(NpuError::DeserializeFailed));
        assert_eq!(link.recv(), Err(NpuError::DeserializeFailed));
        assert_eq!(link.recv(), Ok(HostMessage::Ack));
    }

    /// A framed request answered through the full server.
    #[test]
    fn serve_over_link() {
        let soc = fake_npu_core::FakeSoc::new();
        let mut wire = Wire::default();
        let req = HostMessage::Command(Request::new(Command::SysInfo, "", 0, 0));
        wire.rx.extend(encode_frame(&req).unwrap());
        let mut server = crate::ValidationServer::new(
            SerialLink::new(wire),
            crate::fake_hal(&soc),
            &[&fake_npu_core::SAMPLE_NETWORK],
            Default::default(),
        );
        server.serve().unwrap();
        let tx = &mut server.channel().transport().tx;
        let resp: Response = decode_frame(tx).unwrap();
        assert_eq!(resp.state, State::Idle);
        let Payload::SysInfo(info) = &resp.payload else {
            panic!("{:?}", resp);
        };
        assert_eq!(info.devid, 0x486);
    }

    fn responses(tx: &mut [u8]) -> Vec<Response> {
        tx.split_mut(|&b| b == 0)
            .filter(|f| !f.is_empty())
            .map(|f| decode_frame(f).unwrap())
            .collect()
    }

    /// A corrupt frame inside an upload still ends the Run with an ack.
    #[test]
    fn garbage_during_upload() {
        let soc = fake_npu_core::FakeSoc::new();
        let mut wire = Wire::default();
        let run = HostMessage::Command(Request::new(Command::Run, "network", 0, 0));
        let chunk = HostMessage::Data {
            chunk: vec![0; 64],
            last: false,
        };
        let sys_info = HostMessage::Command(Request::new(Command::SysInfo, "", 0, 0));
        wire.rx.extend(encode_frame(&run).unwrap());
        wire.rx.extend(encode_frame(&chunk).unwrap());
        wire.rx.extend([0x05, 0xff, 0x00]);
        wire.rx.extend(encode_frame(&sys_info).unwrap());
        let mut server = crate::ValidationServer::new(
            SerialLink::new(wire),
            crate::fake_hal(&soc),
            &[&fake_npu_core::SAMPLE_NETWORK],
            Default::default(),
        );
        server.serve().unwrap();
        let resp = responses(&mut server.channel().transport().tx);
        assert_eq!(resp.len(), 3, "{:?}", resp);
        assert_eq!(resp[0], Response::ack(State::Waiting, 584, ErrorCode::None));
        assert_eq!(resp[1], Response::ack(State::Error, 64, ErrorCode::InvalidSize));
        assert!(matches!(resp[2].payload, Payload::SysInfo(_)));
        assert_eq!(soc.state().borrow().runtime.inits, 0);
    }
}
