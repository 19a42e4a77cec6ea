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

//! Validation request server.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use log::{error, info, trace, warn};
use npu_coordinator::*;
use npu_interface::proto::*;
use npu_interface::*;
use npu_shared::*;
use serde::{Deserialize, Serialize};

/// Most buffers reported for one unit.
pub const MAX_DUMP_BUFFERS: usize = 16;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Internal buffers whose contents may be dumped. Empty allows all.
    pub dumpable: Vec<String>,
}
impl ValidationConfig {
    /// Loads a config blob written by the host tools.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NpuError> {
        postcard::from_bytes(bytes).or(Err(NpuError::DeserializeFailed))
    }

    pub fn is_dumpable(&self, name: &str) -> bool {
        self.dumpable.is_empty() || self.dumpable.iter().any(|n| n == name)
    }
}

fn cycles_to_ms(cycles: u64, cpu_freq_hz: u32) -> f32 {
    if cpu_freq_hz == 0 {
        return 0.0;
    }
    (cycles as f64 * 1000.0 / cpu_freq_hz as f64) as f32
}

fn rtid(info: &RuntimeInfo) -> u32 { RUNTIME_ID | (info.compiler_id as u32) << RUNTIME_TOOLS_POS }

/// Operator type word of a unit, and a short tag for logs.
///   b31..b24 OperatorFlags, b15..b4 sub-type, b3..b0 unit kind.
pub fn node_type(block: &EpochBlock, n_buffers: usize) -> (u32, &'static str) {
    let mut flags = OperatorFlags::INTERNAL;
    if n_buffers == 0 {
        flags |= OperatorFlags::WITHOUT_TENSOR;
    }
    let (kind, tag) = match block.kind() {
        UnitKind::Controller => (4, "EC"),
        UnitKind::Software => (2, "SW"),
        UnitKind::Hybrid => (3, "HYBRID"),
        UnitKind::Extra => ((((-(block.epoch_num as i32)) as u32) & 0x3F) << 4 | 1, "EXTRA"),
        UnitKind::Hardware => (0, "HW"),
    };
    (flags.bits() << OPERATOR_FLAG_POS | kind, tag)
}

// Per-unit callback of an observed run: reports each finished unit as an
// operator followed by the buffers it produced.
struct DumpObserver<'a, C: HostChannel> {
    channel: &'a mut C,
    config: &'a ValidationConfig,
    emit: bool,
    debug: bool,
    cpu_freq_hz: u32,
    cur_epoch: i16,
    error: Option<NpuError>,
}
impl<C: HostChannel> DumpObserver<'_, C> {
    fn send(&mut self, msg: Response) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.channel.send(&msg) {
            error!("dump: send failed: {:?}", e);
            self.error = Some(e);
        }
    }

    fn log(&mut self, msg: String) {
        if self.debug {
            self.send(Response {
                state: State::Processing,
                payload: Payload::Log(LogMsg {
                    level: log::Level::Info as u8,
                    msg,
                }),
            });
        }
    }

    fn filtered(&self, desc: &TensorDesc) -> bool {
        !self.emit || !self.config.is_dumpable(desc.name)
    }

    // Buffers to report for |block|. A unit followed by a second unit of
    // the same epoch leaves them to that unit; a unit followed by a gap
    // also reports the next epoch's internals.
    fn buffers(&self, ev: &EpochEvent) -> Vec<&'static TensorDesc> {
        let block = ev.block;
        let epoch = self.cur_epoch;
        let next = ev.next.filter(|n| !n.is_last()).map(|n| n.epoch_num);
        let mut extra = None;
        if block.epoch_num > 0 && epoch > 0 && next != Some(epoch + 1) {
            extra = Some(epoch + 1);
        }
        if block.epoch_num > 0 && next == Some(block.epoch_num) {
            return Vec::new();
        }
        let internals = ev
            .network
            .internal_buffers()
            .iter()
            .filter(|d| d.epoch == epoch || Some(d.epoch) == extra);
        let outputs = ev.network.output_buffers().iter().filter(|d| d.epoch == epoch);
        internals
            .chain(outputs)
            .filter(|d| d.validate().is_ok())
            .take(MAX_DUMP_BUFFERS)
            .collect()
    }

    fn perf(&self, c: &EpochCounters) -> PerfMsg {
        PerfMsg {
            duration_ms: cycles_to_ms(c.cpu_total(), self.cpu_freq_hz),
            counter_fmt: c.format.word(),
            cpu: vec![c.cpu_start as u64, c.cpu_core as u64, c.cpu_end as u64],
            npu: if c.format.has(TelemetryOpts::EPOCH_LEN) {
                vec![c.npu_start, c.npu_core, c.npu_end]
            } else {
                Vec::new()
            },
            samples: c.samples().to_vec(),
            cache: if c.format.has(TelemetryOpts::NPU_CACHE) {
                c.cache_counters.to_vec()
            } else {
                Vec::new()
            },
        }
    }

    fn post_end(
        &mut self,
        ev: &EpochEvent,
        memory: &mut dyn BufferMemory,
        cache: &mut CacheCoherency,
    ) {
        let block = ev.block;
        let buffers = self.buffers(ev);
        let (kind, tag) = node_type(block, buffers.len());
        let id = (block.last_epoch_num as u16 as u32) << 16 | self.cur_epoch as u16 as u32;
        self.log(format!(
            "cidx={}: EpochBlock_{} ({}), (cur={}, nb_buffer={}), type={:08X} {}",
            ev.exec_idx,
            block.epoch_num,
            block.last_epoch_num,
            self.cur_epoch,
            buffers.len(),
            kind,
            tag
        ));
        if self.debug {
            info!(
                "s:node:evt_post_end:{}:{}:{}:{}:{}",
                ev.exec_idx,
                self.cur_epoch,
                block.epoch_num,
                block.last_epoch_num,
                buffers.len()
            );
        }
        let perf = ev.counters.map(|c| self.perf(c)).unwrap_or_default();
        self.send(Response {
            state: State::Processing,
            payload: Payload::Operator(OperatorMsg {
                name: String::new(),
                kind,
                id,
                perf,
            }),
        });

        let n = buffers.len();
        for (pos, desc) in buffers.into_iter().enumerate() {
            let mut flags = TensorFlags::INTERNAL;
            let mut data = Vec::new();
            if self.filtered(desc) {
                flags |= TensorFlags::NO_DATA;
            } else {
                cache.clean_invalidate(desc.range());
                data.resize(desc.size, 0);
                if let Err(e) = memory.read(desc.addr, &mut data) {
                    warn!("dump: {} unreadable: {:?}", desc.name, e);
                    data.clear();
                    flags |= TensorFlags::NO_DATA;
                }
            }
            if pos + 1 == n {
                flags |= TensorFlags::LAST;
            }
            trace!("dump: {} epoch {} flags {:?}", desc.name, desc.epoch, flags);
            self.send(Response {
                state: State::Processing,
                payload: Payload::Tensor(TensorMsg {
                    desc: TensorDescMsg::from_desc(desc, flags),
                    data,
                }),
            });
        }
    }
}
impl<C: HostChannel> EpochObserver for DumpObserver<'_, C> {
    fn on_epoch(
        &mut self,
        ev: &EpochEvent,
        memory: &mut dyn BufferMemory,
        cache: &mut CacheCoherency,
    ) {
        if ev.block.epoch_num >= 0 {
            self.cur_epoch = ev.block.epoch_num;
        }
        match ev.transition {
            Transition::PreStart => {
                let (kind, tag) = node_type(ev.block, 0);
                self.log(format!(
                    "cidx={}: EpochBlock_{} ({}), type={:08X} {}..",
                    ev.exec_idx, ev.block.epoch_num, ev.block.last_epoch_num, kind, tag
                ));
                if self.debug {
                    info!(
                        "s:node:evt_pre_start:{}:{}:{}:{}:{:08X}:{:08X}:{}",
                        ev.exec_idx,
                        self.cur_epoch,
                        ev.block.epoch_num,
                        ev.block.last_epoch_num,
                        ev.block.flags.bits(),
                        kind,
                        tag
                    );
                }
            }
            Transition::PostEnd => self.post_end(ev, memory, cache),
            _ => {}
        }
    }
}

/// Options carried in a Run request.
#[derive(Clone, Copy, Debug, Default)]
struct RunOpts {
    observer: bool,
    emit: bool,
    const_value: bool,
    perf_only: bool,
    debug: bool,
}
impl RunOpts {
    fn new(param: u32) -> Self {
        let p = RunParam::from_bits_truncate(param);
        Self {
            observer: p.contains(RunParam::PER_LAYER),
            emit: p.contains(RunParam::PER_LAYER_WITH_DATA),
            const_value: p.contains(RunParam::CONST_VALUE),
            perf_only: p.contains(RunParam::PERF_ONLY),
            debug: p.contains(RunParam::DEBUG),
        }
    }
}

/// Answers host requests on |channel| until it closes.
pub struct ValidationServer<C: HostChannel> {
    channel: C,
    hal: NpuHal,
    instances: InstanceTable,
    driver: EpochDriver,
    config: ValidationConfig,
}
impl<C: HostChannel> ValidationServer<C> {
    pub fn new(
        channel: C,
        hal: NpuHal,
        networks: &[&'static dyn Network],
        config: ValidationConfig,
    ) -> Self {
        Self {
            channel,
            hal,
            instances: InstanceTable::new(networks),
            driver: EpochDriver::new(),
            config,
        }
    }

    pub fn channel(&mut self) -> &mut C { &mut self.channel }
    pub fn hal(&mut self) -> &mut NpuHal { &mut self.hal }
    pub fn instances(&mut self) -> &mut InstanceTable { &mut self.instances }

    /// Logs what every instance looks like and installs it.
    pub fn bootstrap(&mut self) {
        let rt = self.hal.runtime.info();
        info!(
            "runtime v{}.{}.{}-{:x} ({})",
            rt.version[0], rt.version[1], rt.version[2], rt.build, rt.compiler_desc
        );
        for idx in 0..self.instances.len() {
            let Some(inst) = self.instances.get_mut(idx) else {
                continue;
            };
            let info = inst.info();
            info!("model {}: {} epochs", info.name, info.n_epochs);
            info!(
                "  params {} KiB, activations {} KiB",
                info.params_size / 1024,
                info.activations_size / 1024
            );
            for d in info.inputs.iter() {
                info!("  in  {}", d);
            }
            for d in info.outputs.iter() {
                info!("  out {}", d);
            }
            if let Err(e) = inst.install(&mut self.hal) {
                error!("model {}: install failed: {:?}", inst.name(), e);
            }
        }
    }

    /// Serves until the host goes away.
    pub fn serve(&mut self) -> Result<(), NpuError> {
        loop {
            match self.serve_one() {
                Ok(()) => {}
                Err(NpuError::ChannelClosed) => return Ok(()),
                Err(NpuError::DeserializeFailed) => warn!("dropped undecodable message"),
                Err(e) => return Err(e),
            }
        }
    }

    /// Handles one host message.
    pub fn serve_one(&mut self) -> Result<(), NpuError> {
        match self.channel.recv()? {
            HostMessage::Command(req) => self.dispatch(&req),
            other => {
                warn!("unexpected {:?} outside a command", other);
                Ok(())
            }
        }
    }

    fn dispatch(&mut self, req: &Request) -> Result<(), NpuError> {
        trace!("request {:?}", req);
        match req.command() {
            Some(Command::Sync) => self.sync_request(),
            Some(Command::SysInfo) => self.sys_info_request(),
            Some(Command::ModelInfo) => self.model_info_request(req),
            Some(Command::Run) => self.run_request(req),
            None => {
                warn!("unknown opcode {}", req.opcode);
                self.ack(State::Error, 0, ErrorCode::InvalidCommand)
            }
        }
    }

    fn ack(&mut self, state: State, param: u32, error: ErrorCode) -> Result<(), NpuError> {
        self.channel.send(&Response::ack(state, param, error))
    }

    fn sync_request(&mut self) -> Result<(), NpuError> {
        let msg = SyncMsg {
            version: PROTO_VERSION,
            capabilities: Capabilities::SYS_INFO
                | Capabilities::MODEL_INFO
                | Capabilities::RUN
                | Capabilities::OBSERVER,
            rtid: rtid(&self.hal.runtime.info()),
        };
        self.channel.send(&Response {
            state: State::Idle,
            payload: Payload::Sync(msg),
        })
    }

    fn sys_info_request(&mut self) -> Result<(), NpuError> {
        let conf = self.hal.sysconf.mcu_conf();
        let mut extra = conf.extra;
        extra.resize(EXTRA_CONF_LEN, 0);
        self.channel.send(&Response {
            state: State::Idle,
            payload: Payload::SysInfo(SysInfoMsg {
                devid: conf.devid,
                sclk: conf.sclk,
                hclk: conf.hclk,
                cache: conf.conf,
                extra,
            }),
        })
    }

    fn model_info_request(&mut self, req: &Request) -> Result<(), NpuError> {
        let Some(inst) = self
            .instances
            .resolve(&req.name, Some(req.param as usize))
            .ok()
            .and_then(|idx| self.instances.get(idx))
        else {
            warn!("model info: no instance {:?}/{}", req.name, req.param);
            return self.ack(State::Error, 0, ErrorCode::InvalidParam);
        };
        let rt = self.hal.runtime.info();
        let info = inst.info();
        let msg = ModelInfoMsg {
            name: info.name.to_string(),
            rtid: rtid(&rt),
            runtime_version: rt.version,
            runtime_build: rt.build,
            runtime_desc: format!("{}{}", rt.desc, rt.build),
            compiler_desc: rt.compiler_desc.to_string(),
            n_nodes: info.n_epochs as u32,
            inputs: info
                .inputs
                .iter()
                .map(|d| TensorDescMsg::from_desc(d, TensorFlags::INPUT | TensorFlags::IN_MEMPOOL))
                .collect(),
            outputs: info
                .outputs
                .iter()
                .map(|d| TensorDescMsg::from_desc(d, TensorFlags::OUTPUT | TensorFlags::IN_MEMPOOL))
                .collect(),
            activations: vec![TensorDescMsg::pool("activations", info.activations_size)],
            params: vec![TensorDescMsg::pool("params", info.params_size)],
        };
        self.channel.send(&Response {
            state: State::Idle,
            payload: Payload::ModelInfo(msg),
        })
    }

    // Collects one uploaded tensor. Returns the bytes kept (at most
    // |expected|), the number received, and whether the upload ended
    // with a last chunk. Only a closed channel is an error; anything
    // else cuts the upload short so the command still gets its ack.
    fn receive_tensor(&mut self, expected: usize) -> Result<(Vec<u8>, usize, bool), NpuError> {
        let mut data = Vec::with_capacity(expected);
        let mut received = 0;
        loop {
            let msg = match self.channel.recv() {
                Ok(msg) => msg,
                Err(NpuError::ChannelClosed) => return Err(NpuError::ChannelClosed),
                Err(e) => {
                    warn!("upload broken by {:?}", e);
                    return Ok((data, received, false));
                }
            };
            match msg {
                HostMessage::Data { chunk, last } => {
                    received += chunk.len();
                    let room = expected.saturating_sub(data.len());
                    data.extend_from_slice(&chunk[..chunk.len().min(room)]);
                    if last {
                        return Ok((data, received, true));
                    }
                }
                other => {
                    warn!("upload interrupted by {:?}", other);
                    return Ok((data, received, false));
                }
            }
        }
    }

    fn wait_for_ack(&mut self) -> Result<bool, NpuError> {
        match self.channel.recv() {
            Ok(HostMessage::Ack) => Ok(true),
            Ok(other) => {
                warn!("expected ack, got {:?}", other);
                Ok(false)
            }
            Err(NpuError::ChannelClosed) => Err(NpuError::ChannelClosed),
            Err(e) => {
                warn!("expected ack, got {:?}", e);
                Ok(false)
            }
        }
    }

    fn run_request(&mut self, req: &Request) -> Result<(), NpuError> {
        let Ok(idx) = self.instances.resolve(&req.name, Some(0)) else {
            warn!("run: no instance {:?}", req.name);
            return self.ack(State::Error, 0, ErrorCode::InvalidParam);
        };
        let opts = RunOpts::new(req.param);
        let (inputs, outputs) = match self.instances.get_mut(idx) {
            Some(inst) => {
                inst.set_option(TelemetryOpts::from_bits_truncate(req.opt >> 8));
                (inst.info().inputs.clone(), inst.info().outputs)
            }
            None => return self.ack(State::Error, 0, ErrorCode::InvalidParam),
        };
        trace!("run {:?} {:?}", req.name, opts);
        if let Some(bad) = inputs.iter().find(|d| d.validate().is_err()) {
            error!("run: {} size does not match its shape", bad.name);
            return self.ack(State::Error, 0, ErrorCode::InvalidSize);
        }

        // Upload.
        self.ack(State::Waiting, inputs.first().map_or(0, |d| d.size as u32), ErrorCode::None)?;
        for (i, desc) in inputs.iter().enumerate() {
            let expected = if opts.const_value {
                desc.element_byte_width()
            } else {
                desc.size
            };
            let (data, received, complete) = self.receive_tensor(expected)?;
            if !complete || received != expected {
                warn!("run: {} got {} of {} bytes", desc.name, received, expected);
                return self.ack(State::Error, received as u32, ErrorCode::InvalidSize);
            }
            let written = if opts.const_value {
                let fill: Vec<u8> = data.iter().copied().cycle().take(desc.size).collect();
                self.hal.memory.write(desc.addr, &fill)
            } else {
                self.hal.memory.write(desc.addr, &data)
            };
            if let Err(e) = written {
                error!("run: {} not written: {:?}", desc.name, e);
                return self.ack(State::Error, 0, ErrorCode::Generic);
            }
            if i + 1 < inputs.len() {
                self.ack(State::Waiting, desc.size as u32, ErrorCode::None)?;
                if !self.wait_for_ack()? {
                    return self.ack(State::Error, 0, ErrorCode::InvalidCommand);
                }
            } else {
                self.ack(State::Processing, desc.size as u32, ErrorCode::None)?;
            }
        }

        // Execute.
        let cpu_freq_hz = self.hal.clock.cpu_freq_hz();
        let Some(inst) = self.instances.get_mut(idx) else {
            return self.ack(State::Error, 0, ErrorCode::InvalidParam);
        };
        let name = inst.name();
        let mut observer = DumpObserver {
            channel: &mut self.channel,
            config: &self.config,
            emit: opts.emit,
            debug: opts.debug,
            cpu_freq_hz,
            cur_epoch: -1,
            error: None,
        };
        let mut ctx = RunContext::new().with_stats(opts.debug);
        if opts.observer {
            ctx.register_callback(Some(&mut observer));
        }
        let result = self.driver.run(&mut self.hal, inst, ctx);
        if let Some(e) = observer.error {
            return Err(e);
        }
        let totals = match result {
            Ok(totals) => totals,
            Err(e) => {
                error!("run {}: {:?}", name, e);
                return self.ack(State::Error, 0, ErrorCode::Generic);
            }
        };

        // Report.
        self.channel.send(&Response {
            state: State::Processing,
            payload: Payload::Operator(OperatorMsg {
                name: name.to_string(),
                kind: 0,
                id: 0,
                perf: PerfMsg {
                    duration_ms: cycles_to_ms(totals.cpu_all, cpu_freq_hz),
                    cpu: totals.as_array().to_vec(),
                    ..Default::default()
                },
            }),
        })?;
        if outputs.is_empty() {
            return self.ack(State::Done, 0, ErrorCode::None);
        }
        for (i, desc) in outputs.iter().enumerate() {
            let last = i + 1 == outputs.len();
            let mut flags = TensorFlags::OUTPUT;
            let mut data = Vec::new();
            if opts.perf_only {
                flags |= TensorFlags::NO_DATA;
            } else {
                data.resize(desc.size, 0);
                if let Err(e) = self.hal.memory.read(desc.addr, &mut data) {
                    error!("run: {} unreadable: {:?}", desc.name, e);
                    return self.ack(State::Error, 0, ErrorCode::Generic);
                }
            }
            if last {
                flags |= TensorFlags::LAST;
            }
            self.channel.send(&Response {
                state: if last { State::Done } else { State::Processing },
                payload: Payload::Tensor(TensorMsg {
                    desc: TensorDescMsg::from_desc(desc, flags),
                    data,
                }),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_hal;
    use fake_npu_core::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Loopback {
        rx: VecDeque<HostMessage>,
        tx: Vec<Response>,
    }
    impl HostChannel for Loopback {
        fn recv(&mut self) -> Result<HostMessage, NpuError> {
            self.rx.pop_front().ok_or(NpuError::ChannelClosed)
        }
        fn send(&mut self, msg: &Response) -> Result<(), NpuError> {
            self.tx.push(msg.clone());
            Ok(())
        }
    }

    fn server(soc: &FakeSoc, net: &'static dyn Network) -> ValidationServer<Loopback> {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = ValidationConfig::default();
        ValidationServer::new(Loopback::default(), fake_hal(soc), &[net], config)
    }

    fn command(s: &mut ValidationServer<Loopback>, cmd: Command, name: &str, param: u32, opt: u32) {
        s.channel().rx.push_back(HostMessage::Command(Request::new(cmd, name, param, opt)));
    }

    fn upload(s: &mut ValidationServer<Loopback>, data: &[u8]) {
        let chunks: Vec<&[u8]> = data.chunks(64).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            s.channel().rx.push_back(HostMessage::Data {
                chunk: chunk.to_vec(),
                last: i + 1 == chunks.len(),
            });
        }
    }

    fn input() -> Vec<u8> {
        (0..INPUT_SIZE / 4).flat_map(|i| (i as f32 * 0.5).to_ne_bytes()).collect()
    }

    fn serve(s: &mut ValidationServer<Loopback>) -> Vec<Response> {
        s.serve().unwrap();
        core::mem::take(&mut s.channel().tx)
    }

    fn ack(state: State, param: u32, error: ErrorCode) -> Response {
        Response::ack(state, param, error)
    }

    fn operators(resp: &[Response]) -> Vec<&OperatorMsg> {
        resp.iter()
            .filter_map(|r| match &r.payload {
                Payload::Operator(op) => Some(op),
                _ => None,
            })
            .collect()
    }

    fn tensors(resp: &[Response]) -> Vec<&TensorMsg> {
        resp.iter()
            .filter_map(|r| match &r.payload {
                Payload::Tensor(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    // Buffers reported after each unit operator.
    fn buffers_per_unit(resp: &[Response]) -> Vec<usize> {
        let mut counts = Vec::new();
        for r in resp {
            match &r.payload {
                Payload::Operator(op) if op.name.is_empty() => counts.push(0),
                Payload::Operator(_) => break,
                Payload::Tensor(_) => {
                    if let Some(n) = counts.last_mut() {
                        *n += 1;
                    }
                }
                _ => {}
            }
        }
        counts
    }

    #[test]
    fn sync() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::Sync, "", 0, 0);
        let resp = serve(&mut s);
        let Payload::Sync(msg) = &resp[0].payload else {
            panic!("{:?}", resp);
        };
        assert_eq!(msg.version, PROTO_VERSION);
        assert_eq!(msg.rtid, RUNTIME_ID | 2 << RUNTIME_TOOLS_POS);
        assert!(msg.capabilities.contains(Capabilities::RUN | Capabilities::OBSERVER));
    }

    #[test]
    fn sys_info() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::SysInfo, "", 0, 0);
        let resp = serve(&mut s);
        assert_eq!(resp[0].state, State::Idle);
        let Payload::SysInfo(msg) = &resp[0].payload else {
            panic!("{:?}", resp);
        };
        assert_eq!(msg.devid, 0x486);
        assert_eq!(msg.sclk, CPU_FREQ_HZ);
        assert_eq!(msg.extra.len(), EXTRA_CONF_LEN);
    }

    #[test]
    fn model_info() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::ModelInfo, "network", 0, 0);
        command(&mut s, Command::ModelInfo, "", 0, 0);
        command(&mut s, Command::ModelInfo, "nope", 0, 0);
        let resp = serve(&mut s);
        assert_eq!(resp.len(), 3);
        let Payload::ModelInfo(msg) = &resp[0].payload else {
            panic!("{:?}", resp);
        };
        assert_eq!(resp[1], resp[0]);
        assert_eq!(msg.name, "network");
        assert_eq!(msg.rtid, RUNTIME_ID | 2 << RUNTIME_TOOLS_POS);
        assert_eq!(msg.runtime_version, [1, 1, 0]);
        assert_eq!(msg.runtime_desc, "fake npu runtime build:24301");
        assert_eq!(msg.n_nodes, 6);
        assert_eq!(msg.inputs.len(), 1);
        assert_eq!(msg.inputs[0].size as usize, INPUT_SIZE);
        assert_eq!(msg.inputs[0].dims, vec![1, 146]);
        assert_eq!(msg.inputs[0].flags, TensorFlags::INPUT | TensorFlags::IN_MEMPOOL);
        assert_eq!(msg.outputs[0].flags, TensorFlags::OUTPUT | TensorFlags::IN_MEMPOOL);
        assert_eq!(msg.activations, vec![TensorDescMsg::pool("activations", 0x410)]);
        assert_eq!(msg.params, vec![TensorDescMsg::pool("params", PARAMS_SIZE)]);
        assert_eq!(resp[2], ack(State::Error, 0, ErrorCode::InvalidParam));
    }

    #[test]
    fn unknown_command() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        s.channel().rx.push_back(HostMessage::Command(Request {
            opcode: 0x7f,
            ..Default::default()
        }));
        assert_eq!(serve(&mut s), vec![ack(State::Error, 0, ErrorCode::InvalidCommand)]);
    }

    #[test]
    fn run_unknown_model() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::Run, "other", 0, 0);
        assert_eq!(serve(&mut s), vec![ack(State::Error, 0, ErrorCode::InvalidParam)]);
    }

    /// Full upload, run and one 16-byte output flagged last.
    #[test]
    fn run_complete_input() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::Run, "network", 0, 0);
        upload(&mut s, &input());
        let resp = serve(&mut s);
        assert_eq!(resp.len(), 4);
        assert_eq!(resp[0], ack(State::Waiting, INPUT_SIZE as u32, ErrorCode::None));
        assert_eq!(resp[1], ack(State::Processing, INPUT_SIZE as u32, ErrorCode::None));
        let ops = operators(&resp);
        assert_eq!(ops[0].name, "network");
        assert_eq!(ops[0].perf.cpu.len(), 5);
        assert_eq!(resp[3].state, State::Done);
        let out = tensors(&resp)[0];
        assert_eq!(out.desc.flags, TensorFlags::OUTPUT | TensorFlags::LAST);
        assert_eq!(out.data.len(), OUTPUT_SIZE);
        let st = soc.state();
        let st = st.borrow();
        let mem = &st.memory;
        assert_eq!(out.data[..], mem[OUTPUT_ADDR - MEM_BASE..][..OUTPUT_SIZE]);
        assert_eq!(mem[..INPUT_SIZE], input()[..]);
    }

    #[test]
    fn run_short_input() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::Run, "network", 0, 0);
        upload(&mut s, &input()[..500]);
        let resp = serve(&mut s);
        assert_eq!(
            resp,
            vec![
                ack(State::Waiting, INPUT_SIZE as u32, ErrorCode::None),
                ack(State::Error, 500, ErrorCode::InvalidSize)
            ]
        );
        let st = soc.state();
        let st = st.borrow();
        assert_eq!(st.runtime.inits, 0);
        assert_eq!(st.wfe_count, 0);
    }

    #[test]
    fn run_interrupted_upload() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::Run, "network", 0, 0);
        s.channel().rx.push_back(HostMessage::Data {
            chunk: vec![0; 64],
            last: false,
        });
        s.channel().rx.push_back(HostMessage::Ack);
        let resp = serve(&mut s);
        assert_eq!(resp[1], ack(State::Error, 64, ErrorCode::InvalidSize));
    }

    /// One element fills the whole tensor.
    #[test]
    fn run_const_value() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::Run, "network", RunParam::CONST_VALUE.bits(), 0);
        upload(&mut s, &1.5f32.to_ne_bytes());
        let resp = serve(&mut s);
        assert_eq!(resp[1], ack(State::Processing, INPUT_SIZE as u32, ErrorCode::None));
        let st = soc.state();
        let st = st.borrow();
        let mem = &st.memory;
        let values: Vec<f32> = mem[..INPUT_SIZE]
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(values.len(), 146);
        assert!(values.iter().all(|&v| v == 1.5));
    }

    /// Bus bursts are counted and the lane counters stay unarmed.
    #[test]
    fn run_burst_over_active_in() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        let opt = (TelemetryOpts::STRG_I_ACTIVE | TelemetryOpts::BUSIF_RW_DATA).bits() << 8;
        command(&mut s, Command::Run, "network", RunParam::PER_LAYER.bits(), opt);
        upload(&mut s, &input());
        let resp = serve(&mut s);
        {
            let st = soc.state();
            let st = st.borrow();
            assert_eq!(st.burst_runs, 6);
            assert!(st.configured.is_empty());
        }
        let ops = operators(&resp);
        assert_eq!(ops.len(), 7);
        for op in &ops[..6] {
            assert_eq!(op.perf.counter_fmt, TelemetryOpts::BUSIF_RW_DATA.bits() << 16 | 16);
            assert_eq!(op.perf.samples.len(), NUM_COUNTERS);
            assert!(op.perf.npu.is_empty());
        }
    }

    /// Each unit reports its operator then its buffers, in unit order.
    #[test]
    fn run_observed_order() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::Run, "network", RunParam::PER_LAYER.bits(), 0);
        upload(&mut s, &input());
        let resp = serve(&mut s);
        assert_eq!(resp.len(), 2 + 6 * 2 + 2);
        for unit in 0..6u32 {
            let Payload::Operator(op) = &resp[2 + 2 * unit as usize].payload else {
                panic!("{:?}", resp);
            };
            let epoch = unit + 1;
            assert_eq!(op.id, epoch << 16 | epoch);
            assert_eq!(op.kind, OperatorFlags::INTERNAL.bits() << OPERATOR_FLAG_POS);
            let cpu = [START_CYCLES, CORE_CYCLES, END_CYCLES].map(u64::from);
            assert_eq!(op.perf.cpu, cpu);
            let Payload::Tensor(t) = &resp[3 + 2 * unit as usize].payload else {
                panic!("{:?}", resp);
            };
            let dumped = TensorFlags::INTERNAL | TensorFlags::NO_DATA | TensorFlags::LAST;
            assert_eq!(t.desc.flags, dumped);
            assert!(t.data.is_empty());
        }
        let t = tensors(&resp);
        assert_eq!(t[4].desc.name, "_actor_mu_Gemm_output_0_output");
        assert_eq!(t[5].desc.name, "actions_output");
        let run_op = operators(&resp)[6];
        assert_eq!(run_op.name, "network");
        assert_eq!(run_op.perf.cpu[4], 6 * 630);
        assert_eq!(resp.last().map(|r| r.state), Some(State::Done));
    }

    #[test]
    fn run_observed_with_data() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::Run, "network", RunParam::PER_LAYER_WITH_DATA.bits(), 0);
        upload(&mut s, &input());
        let resp = serve(&mut s);
        let t = tensors(&resp);
        assert_eq!(t[0].desc.flags, TensorFlags::INTERNAL | TensorFlags::LAST);
        assert_eq!(t[0].data.len(), 256);
        let addr = t[0].desc.addr as usize;
        assert!(soc
            .state()
            .borrow()
            .cache_ops
            .contains(&CacheOp::CleanInvalidate(addr..addr + 256)));
    }

    #[test]
    fn dumpable_allow_list() {
        let soc = FakeSoc::new();
        let config = ValidationConfig {
            dumpable: vec!["_actor_Tanh_output_0".into()],
        };
        let hal = fake_hal(&soc);
        let mut s = ValidationServer::new(Loopback::default(), hal, &[&SAMPLE_NETWORK], config);
        command(&mut s, Command::Run, "network", RunParam::PER_LAYER_WITH_DATA.bits(), 0);
        upload(&mut s, &input());
        let resp = serve(&mut s);
        let with_data: Vec<&str> = tensors(&resp)
            .iter()
            .filter(|t| t.desc.flags.contains(TensorFlags::INTERNAL) && !t.data.is_empty())
            .map(|t| t.desc.name.as_str())
            .collect();
        assert_eq!(with_data, vec!["_actor_Tanh_output_0"]);
    }

    /// Extra units and split epochs associate buffers by adjacency.
    #[test]
    fn run_gap_network() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &GAP_NETWORK);
        command(&mut s, Command::Run, "network_gap", RunParam::PER_LAYER.bits(), 0);
        upload(&mut s, &input());
        let resp = serve(&mut s);
        assert_eq!(buffers_per_unit(&resp), vec![1, 2, 1, 0, 1, 1, 1]);
        let ops = operators(&resp);
        let internal = OperatorFlags::INTERNAL.bits() << OPERATOR_FLAG_POS;
        let without = OperatorFlags::WITHOUT_TENSOR.bits() << OPERATOR_FLAG_POS;
        assert_eq!(ops[2].kind, internal | 0x11);
        assert_eq!(ops[2].id, 3 << 16 | 2);
        assert_eq!(ops[3].kind, internal | without);
        // Unit 2 also reports the internals of epoch 3.
        let t = tensors(&resp);
        assert_eq!(t[1].desc.name, "_actor_Tanh_output_0");
        assert_eq!(t[2].desc.name, "_actor_Gemm_1_output_0");
        let dumped = TensorFlags::INTERNAL | TensorFlags::NO_DATA | TensorFlags::LAST;
        assert_eq!(t[2].desc.flags, dumped);
    }

    #[test]
    fn run_perf_only() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::Run, "network", RunParam::PERF_ONLY.bits(), 0);
        upload(&mut s, &input());
        let resp = serve(&mut s);
        let out = tensors(&resp)[0];
        assert_eq!(out.desc.flags, TensorFlags::OUTPUT | TensorFlags::NO_DATA | TensorFlags::LAST);
        assert!(out.data.is_empty());
    }

    #[test]
    fn run_debug_logs() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        let param = (RunParam::PER_LAYER | RunParam::DEBUG).bits();
        command(&mut s, Command::Run, "network", param, 0);
        upload(&mut s, &input());
        let resp = serve(&mut s);
        let logs = resp.iter().filter(|r| matches!(r.payload, Payload::Log(_))).count();
        assert_eq!(logs, 12);
    }

    #[test]
    fn run_failure() {
        let soc = FakeSoc::new();
        soc.state().borrow_mut().runtime.fault_at = Some(1);
        let mut s = server(&soc, &SAMPLE_NETWORK);
        command(&mut s, Command::Run, "network", 0, 0);
        upload(&mut s, &input());
        let resp = serve(&mut s);
        assert_eq!(resp.len(), 3);
        assert_eq!(resp[2], ack(State::Error, 0, ErrorCode::Generic));
    }

    /// Back-to-back runs on a bootstrapped instance give the same outputs.
    #[test]
    fn run_twice() {
        let soc = FakeSoc::new();
        let mut s = server(&soc, &SAMPLE_NETWORK);
        s.bootstrap();
        assert_eq!(s.instances().get(0).map(|i| i.state()), Some(InstanceState::Ready));
        let mut outputs = Vec::new();
        for _ in 0..2 {
            command(&mut s, Command::Run, "network", 0, 0);
            upload(&mut s, &input());
            let resp = serve(&mut s);
            outputs.push(tensors(&resp)[0].data.clone());
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0].len(), OUTPUT_SIZE);
        assert_eq!(soc.state().borrow().runtime.inits, 1);
    }

    #[test]
    fn config_blob() {
        let config = ValidationConfig {
            dumpable: vec!["a".into(), "b".into()],
        };
        let blob = postcard::to_allocvec(&config).unwrap();
        assert_eq!(ValidationConfig::from_bytes(&blob), Ok(config.clone()));
        assert!(config.is_dumpable("b"));
        assert!(!config.is_dumpable("c"));
        assert!(ValidationConfig::default().is_dumpable("c"));
        assert_eq!(ValidationConfig::from_bytes(&[0xff]), Err(NpuError::DeserializeFailed));
    }

    #[test]
    fn node_types() {
        let mut b = EpochBlock::hw(-5, 0, 0);
        assert_eq!(node_type(&b, 1), (0x0100_0051, "EXTRA"));
        b.flags = EpochFlags::HYBRID;
        assert_eq!(node_type(&b, 0), (0x0300_0003, "HYBRID"));
        b.flags = EpochFlags::BLOB;
        assert_eq!(node_type(&b, 2).0, 0x0100_0004);
    }
}
