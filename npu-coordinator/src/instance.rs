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

//! Accelerator instance lifecycle.

use crate::NpuHal;
use alloc::vec::Vec;
use log::{debug, error, info, warn};
use npu_interface::*;
use npu_shared::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceState {
    Uninitialized,
    Ready,
}

/// Init request modes, numbered as the host tools number them.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitMode {
    Install = 0,
    Teardown = 1,
    SoftReset = 2,
}

/// What the host is told about a network.
#[derive(Debug)]
pub struct ModelInfo {
    pub name: &'static str,
    pub inputs: Vec<&'static TensorDesc>, // Parameters excluded.
    pub outputs: &'static [TensorDesc],
    pub params_size: usize,
    pub activations_size: usize,
    pub n_epochs: usize,
}
impl ModelInfo {
    pub fn new(net: &dyn Network) -> Self {
        let (params, inputs): (Vec<&'static TensorDesc>, Vec<&'static TensorDesc>) =
            net.input_buffers().iter().partition(|d| d.is_param);
        Self {
            name: net.name(),
            inputs,
            outputs: net.output_buffers(),
            params_size: params.iter().map(|d| d.size).sum(),
            activations_size: net.activation_footprint(),
            n_epochs: epoch_count(net.epoch_blocks()),
        }
    }
}

/// One accelerator-bound network.
pub struct NpuInstance {
    network: &'static dyn Network,
    state: InstanceState,
    option: TelemetryOpts,
    info: ModelInfo,
}
impl NpuInstance {
    pub fn new(network: &'static dyn Network) -> Self {
        Self {
            network,
            state: InstanceState::Uninitialized,
            option: TelemetryOpts::empty(),
            info: ModelInfo::new(network),
        }
    }

    pub fn network(&self) -> &'static dyn Network { self.network }
    pub fn name(&self) -> &'static str { self.network.name() }
    pub fn state(&self) -> InstanceState { self.state }
    pub fn info(&self) -> &ModelInfo { &self.info }

    /// Telemetry requested for the next observed run.
    pub fn option(&self) -> TelemetryOpts { self.option }
    pub fn set_option(&mut self, option: TelemetryOpts) { self.option = option; }

    pub fn init(&mut self, hal: &mut NpuHal, mode: InitMode) -> Result<(), NpuError> {
        match mode {
            InitMode::Install => self.install(hal),
            InitMode::Teardown => self.teardown(hal),
            InitMode::SoftReset => self.soft_reset(hal),
        }
    }

    /// Brings the accelerator up and loads the network. A Ready instance
    /// is torn down first.
    pub fn install(&mut self, hal: &mut NpuHal) -> Result<(), NpuError> {
        if self.state == InstanceState::Ready {
            debug!("{}: re-install", self.name());
            self.teardown(hal)?;
        }
        hal.cache.force_clean(hal.cache_counters.present());
        hal.clock.init();
        hal.pipeline.soft_reset();
        hal.trace.enable();
        if let Err(e) = hal.runtime.runtime_init() {
            error!("{}: runtime init failed: {:?}", self.name(), e);
            hal.trace.disable();
            return Err(NpuError::InstallFailed);
        }
        if let Err(e) = hal.runtime.init_network(self.network) {
            error!("{}: network init failed: {:?}", self.name(), e);
            hal.runtime.runtime_deinit();
            hal.trace.disable();
            return Err(NpuError::InstallFailed);
        }
        self.state = InstanceState::Ready;
        info!("{}: installed ({} epochs)", self.name(), self.info.n_epochs);
        Ok(())
    }

    /// Unloads the network and shuts the runtime down. Tearing down an
    /// instance that is not installed does nothing.
    pub fn teardown(&mut self, hal: &mut NpuHal) -> Result<(), NpuError> {
        if self.state == InstanceState::Uninitialized {
            return Ok(());
        }
        hal.runtime.deinit_network(self.network);
        hal.runtime.runtime_deinit();
        hal.trace.disable();
        self.state = InstanceState::Uninitialized;
        info!("{}: torn down", self.name());
        Ok(())
    }

    /// Clears the accelerator pipeline and caches, staying Ready.
    pub fn soft_reset(&mut self, hal: &mut NpuHal) -> Result<(), NpuError> {
        if self.state != InstanceState::Ready {
            warn!("{}: soft reset while {:?}", self.name(), self.state);
            return Err(NpuError::InvalidState);
        }
        hal.pipeline.soft_reset();
        hal.cache.force_clean(hal.cache_counters.present());
        debug!("{}: soft reset", self.name());
        Ok(())
    }
}

/// The fixed set of instances built into the image.
pub struct InstanceTable {
    instances: Vec<NpuInstance>,
}
impl InstanceTable {
    pub fn new(networks: &[&'static dyn Network]) -> Self {
        if networks.len() > MAX_INSTANCES {
            warn!("{} networks, only {} supported", networks.len(), MAX_INSTANCES);
        }
        Self {
            instances: networks
                .iter()
                .take(MAX_INSTANCES)
                .map(|&n| NpuInstance::new(n))
                .collect(),
        }
    }

    pub fn len(&self) -> usize { self.instances.len() }
    pub fn is_empty(&self) -> bool { self.instances.is_empty() }

    /// Finds an instance by |name|, or by |index| when |name| is empty.
    pub fn resolve(&self, name: &str, index: Option<usize>) -> Result<usize, NpuError> {
        if name.is_empty() {
            return index.filter(|&i| i < self.instances.len()).ok_or(NpuError::NotFound);
        }
        self.instances
            .iter()
            .position(|inst| inst.name() == name)
            .ok_or(NpuError::NotFound)
    }

    pub fn get(&self, idx: usize) -> Option<&NpuInstance> { self.instances.get(idx) }
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut NpuInstance> {
        self.instances.get_mut(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use fake_npu_core::*;

    #[test]
    fn model_info() {
        let info = ModelInfo::new(&SAMPLE_NETWORK);
        assert_eq!(info.name, "network");
        assert_eq!(info.inputs.len(), 1);
        assert_eq!(info.inputs[0].size, INPUT_SIZE);
        assert_eq!(info.outputs[0].size, OUTPUT_SIZE);
        assert_eq!(info.params_size, PARAMS_SIZE);
        assert_eq!(info.activations_size, 0x410);
        assert_eq!(info.n_epochs, 6);
    }

    #[test]
    fn resolve() {
        let table = InstanceTable::new(&[&SAMPLE_NETWORK, &GAP_NETWORK]);
        assert_eq!(table.len(), MAX_INSTANCES);
        assert_eq!(table.resolve("network", None), Ok(0));
        assert_eq!(table.resolve("", Some(0)), Ok(0));
        assert_eq!(table.resolve("", Some(MAX_INSTANCES)), Err(NpuError::NotFound));
        assert_eq!(table.resolve("", None), Err(NpuError::NotFound));
        assert_eq!(table.resolve("netw", None), Err(NpuError::NotFound));
        assert_eq!(table.resolve("network_gap", Some(0)), Err(NpuError::NotFound));
    }

    /// Install brings up the whole stack in order; teardown undoes it.
    #[test]
    fn install_teardown() {
        init_logger();
        let soc = FakeSoc::new();
        let mut hal = fake_hal(&soc);
        let mut inst = NpuInstance::new(&SAMPLE_NETWORK);
        inst.install(&mut hal).unwrap();
        assert_eq!(inst.state(), InstanceState::Ready);
        {
            let s = soc.state();
            let s = s.borrow();
            assert_eq!(s.cache_ops, vec![CacheOp::CleanInvalidateAll]);
            assert_eq!(s.clock_inits, 1);
            assert_eq!(s.soft_resets, 1);
            assert!(s.trace_enabled);
            assert_eq!(s.runtime.network, Some("network"));
        }
        inst.teardown(&mut hal).unwrap();
        assert_eq!(inst.state(), InstanceState::Uninitialized);
        let s = soc.state();
        let s = s.borrow();
        assert!(!s.trace_enabled);
        assert!(!s.runtime.initialized);
        assert_eq!(s.runtime.network, None);
    }

    #[test]
    fn teardown_is_idempotent() {
        let soc = FakeSoc::new();
        let mut hal = fake_hal(&soc);
        let mut inst = NpuInstance::new(&SAMPLE_NETWORK);
        assert_eq!(inst.init(&mut hal, InitMode::Teardown), Ok(()));
        assert_eq!(soc.state().borrow().runtime.deinits, 0);
    }

    #[test]
    fn reinstall_tears_down_first() {
        let soc = FakeSoc::new();
        let mut hal = fake_hal(&soc);
        let mut inst = NpuInstance::new(&SAMPLE_NETWORK);
        inst.install(&mut hal).unwrap();
        inst.install(&mut hal).unwrap();
        let s = soc.state();
        let s = s.borrow();
        assert_eq!(s.runtime.inits, 2);
        assert_eq!(s.runtime.deinits, 1);
        assert!(s.runtime.initialized);
        assert_eq!(inst.state(), InstanceState::Ready);
    }

    #[test]
    fn install_failure() {
        let soc = FakeSoc::new();
        soc.state().borrow_mut().runtime.fail_init = true;
        let mut hal = fake_hal(&soc);
        let mut inst = NpuInstance::new(&SAMPLE_NETWORK);
        assert_eq!(inst.install(&mut hal), Err(NpuError::InstallFailed));
        assert_eq!(inst.state(), InstanceState::Uninitialized);
        assert!(!soc.state().borrow().trace_enabled);
    }

    #[test]
    fn soft_reset_requires_ready() {
        let soc = FakeSoc::new();
        soc.state().borrow_mut().npu_cache = true;
        let mut hal = fake_hal(&soc);
        let mut inst = NpuInstance::new(&SAMPLE_NETWORK);
        assert_eq!(inst.init(&mut hal, InitMode::SoftReset), Err(NpuError::InvalidState));
        inst.install(&mut hal).unwrap();
        soc.state().borrow_mut().cache_ops.clear();
        assert_eq!(inst.init(&mut hal, InitMode::SoftReset), Ok(()));
        assert_eq!(inst.state(), InstanceState::Ready);
        let s = soc.state();
        let s = s.borrow();
        assert_eq!(s.soft_resets, 2);
        assert_eq!(s.cache_ops, vec![CacheOp::NpuInvalidate, CacheOp::CleanInvalidateAll]);
    }
}
