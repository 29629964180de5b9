// Copyright (c) Facebook, Inc. and its affiliates.
use log::{error, info, warn};

use super::affinity::{GuestAffinityResolver, Pinner};
use super::qemu::{WorkloadProcess, WorkloadState};
use super::Error;
use rmd_tester_intf::Settings;
use rmd_util::*;

/// The VM workloads of a scenario, addressed by index.
pub struct WorkloadFleet {
    vms: Vec<WorkloadProcess>,
}

impl WorkloadFleet {
    /// Configures all VMs. If any of them fails, the shared dirs of the
    /// ones already configured are removed and no fleet is returned.
    pub fn new(settings: &Settings) -> Result<Self, Error> {
        let mut fleet = Self { vms: vec![] };
        for index in 0..settings.vm_count {
            match WorkloadProcess::new(index, settings) {
                Ok(vm) => fleet.vms.push(vm),
                Err(e) => {
                    if let Err(e2) = fleet.stop_all() {
                        warn!("fleet: Failed to clean up after {} ({})", &e, &e2);
                    }
                    return Err(e);
                }
            }
        }
        info!("fleet: Configured {} VMs", fleet.len());
        Ok(fleet)
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    fn vm(&self, index: usize) -> Result<&WorkloadProcess, Error> {
        let count = self.vms.len();
        self.vms.get(index).ok_or(Error::Index { index, count })
    }

    fn vm_mut(&mut self, index: usize) -> Result<&mut WorkloadProcess, Error> {
        let count = self.vms.len();
        self.vms.get_mut(index).ok_or(Error::Index { index, count })
    }

    pub fn start(&mut self, index: usize) -> Result<(), Error> {
        self.vm_mut(index)?.start()
    }

    pub fn stop(&mut self, index: usize) -> Result<(), Error> {
        self.vm_mut(index)?.stop()
    }

    /// Pins the guest vCPU threads of VM `index` through its monitor.
    pub fn affinitize<P: Pinner>(
        &self,
        index: usize,
        resolver: &GuestAffinityResolver<P>,
    ) -> Result<usize, Error> {
        self.vm(index)?.affinitize_guest_threads(resolver)
    }

    /// Spreads host workload processes over the cpu map of VM `index`.
    pub fn affinitize_workload<P: Pinner>(
        &self,
        index: usize,
        resolver: &GuestAffinityResolver<P>,
    ) -> Result<usize, Error> {
        self.vm(index)?.affinitize_workload(resolver)
    }

    pub fn command(&self, index: usize) -> Result<&[String], Error> {
        Ok(self.vm(index)?.command())
    }

    pub fn state(&self, index: usize) -> Result<WorkloadState, Error> {
        Ok(self.vm(index)?.state())
    }

    /// Stops every VM, last started first. All VMs are stopped even if some
    /// fail and the first failure is returned.
    pub fn stop_all(&mut self) -> Result<(), Error> {
        let mut first_err = None;
        for vm in self.vms.iter_mut().rev() {
            if let Err(e) = vm.stop() {
                error!("fleet: Failed to stop {} ({})", vm.name(), &e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
