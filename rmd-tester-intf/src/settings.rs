// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::workload_name;
use rmd_util::*;

const SETTINGS_DOC: &str = "\
//
// rmd-tester settings
//
// rmd-tester launches vm_count QEMU workloads, pins their vCPU threads and
// asks the RMD server to partition the last-level cache between them. Each
// workload WL<N> uses core_binding[N] both for its vCPU pinning and as the
// core list of its cache allocation. Process workloads (process_count) only
// get cache allocations; their core lists follow the VM ones in core_binding.
//
// policy_type selects how allocations are requested for all workloads:
//   COS:    cos_policies[\"WL<N>\"] names an RMD policy (e.g. \"gold\")
//   MinMax: cache_amounts[\"WL<N>\"] is [min_cache, max_cache] in ways.
//           Setup stops at the first workload with fewer than two values.
//
//  rmd.scheme/server/port/api_version: RMD REST endpoint
//  rmd.timeout: RMD request timeout in seconds
//  policy_type: \"COS\" or \"MinMax\"
//  cos_policies: Per-workload policy names for COS mode
//  cache_amounts: Per-workload [min, max] cache amounts for MinMax mode
//  vm_count: Number of QEMU workloads
//  process_count: Number of non-VM workloads which only get allocations
//  core_binding: Per-workload host core lists
//  cpu_maps: Per-workload host core lists for process round-robin affinity
//  images: Per-VM boot images
//  qemu_cmd: QEMU binary
//  memory: Guest memory in megabytes
//  smp: Guest SMP topology, e.g. \"4\" or \"sockets=2,cores=2\"
//  boot_drive_type: Interface of the boot drive
//  shared_drive_type: Interface of the FAT shared drive
//  nics_nr: Number of virtio NICs attached to each VM
//  base_vnc_port: VNC display of WL0, WL<N> uses base_vnc_port + N
//  monitor_dir: Directory for the monitor sockets
//  shared_dir_base: Directory under which the per-VM shared dirs are created
//  log_dir: Directory for QEMU output, null to discard
//  qemu_log_file: QEMU output file name, suffixed with the workload index
//  use_sudo: Run QEMU and pinning under sudo
//  stop_grace: Seconds to wait for a killed VM to exit
//  monitor_timeout: Seconds to wait for monitor responses
//  workload_process_pattern: Process name regex for process affinity
//  allocations_report: Json file to record allocation snapshots, null to skip
//
";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
    #[serde(rename = "COS")]
    Cos,
    MinMax,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmdSettings {
    pub scheme: String,
    pub server: String,
    pub port: u16,
    pub api_version: String,
    pub timeout: u64,
}

impl Default for RmdSettings {
    fn default() -> Self {
        Self {
            scheme: "http".into(),
            server: "127.0.0.1".into(),
            port: 8888,
            api_version: "v1".into(),
            timeout: 10,
        }
    }
}

impl RmdSettings {
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}:{}/{}/",
            &self.scheme, &self.server, self.port, &self.api_version
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rmd: RmdSettings,
    pub policy_type: PolicyType,
    pub cos_policies: BTreeMap<String, String>,
    pub cache_amounts: BTreeMap<String, Vec<u32>>,
    pub vm_count: usize,
    pub process_count: usize,
    pub core_binding: Vec<Vec<String>>,
    pub cpu_maps: Vec<Vec<String>>,
    pub images: Vec<String>,
    pub qemu_cmd: String,
    pub memory: String,
    pub smp: String,
    pub boot_drive_type: String,
    pub shared_drive_type: String,
    pub nics_nr: usize,
    pub base_vnc_port: usize,
    pub monitor_dir: String,
    pub shared_dir_base: String,
    pub log_dir: Option<String>,
    pub qemu_log_file: String,
    pub use_sudo: bool,
    pub stop_grace: f64,
    pub monitor_timeout: f64,
    pub workload_process_pattern: String,
    pub allocations_report: Option<String>,
}

fn cores(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rmd: Default::default(),
            policy_type: PolicyType::Cos,
            cos_policies: [(workload_name(0), "gold"), (workload_name(1), "silver")]
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
            cache_amounts: [(workload_name(0), vec![2, 4]), (workload_name(1), vec![1, 2])]
                .iter()
                .cloned()
                .collect(),
            vm_count: 2,
            process_count: 0,
            core_binding: vec![cores(&["2", "3", "4", "5"]), cores(&["6", "7", "8", "9"])],
            cpu_maps: vec![cores(&["2", "3", "4", "5"]), cores(&["6", "7", "8", "9"])],
            images: vec![
                "/var/lib/rmd-tester/wl0.qcow2".into(),
                "/var/lib/rmd-tester/wl1.qcow2".into(),
            ],
            qemu_cmd: "qemu-system-x86_64".into(),
            memory: "4096".into(),
            smp: "4".into(),
            boot_drive_type: "scsi".into(),
            shared_drive_type: "scsi".into(),
            nics_nr: 0,
            base_vnc_port: 4,
            monitor_dir: "/tmp".into(),
            shared_dir_base: "/tmp".into(),
            log_dir: Some("/tmp".into()),
            qemu_log_file: "qemu.log".into(),
            use_sudo: true,
            stop_grace: 10.0,
            monitor_timeout: 2.0,
            workload_process_pattern: "qemu-".into(),
            allocations_report: None,
        }
    }
}

impl Settings {
    pub fn nr_workloads(&self) -> usize {
        self.vm_count + self.process_count
    }

    /// Class-of-service name and core list for every VM and process
    /// workload, in workload index order.
    pub fn cos_affinity_map(&self) -> Vec<(String, Vec<String>)> {
        self.core_binding
            .iter()
            .take(self.nr_workloads())
            .enumerate()
            .map(|(i, cores)| (workload_name(i), cores.clone()))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.core_binding.len() < self.nr_workloads() {
            bail!(
                "core_binding has {} entries but {} workloads are configured",
                self.core_binding.len(),
                self.nr_workloads()
            );
        }
        if let Some(i) = self.core_binding[..self.nr_workloads()]
            .iter()
            .position(|cores| cores.is_empty())
        {
            bail!("core_binding for {} is empty", workload_name(i));
        }
        if self.images.len() < self.vm_count {
            bail!(
                "images has {} entries but vm_count is {}",
                self.images.len(),
                self.vm_count
            );
        }
        if self.rmd.port == 0 {
            bail!("rmd.port must be specified");
        }
        if self.stop_grace < 0.0 || self.monitor_timeout <= 0.0 {
            bail!("stop_grace must be >= 0 and monitor_timeout > 0");
        }
        Ok(())
    }
}

impl JsonLoad for Settings {
    fn loaded(&mut self) -> Result<()> {
        self.validate()
    }
}

impl JsonSave for Settings {
    fn preamble() -> Option<String> {
        Some(SETTINGS_DOC.to_string())
    }
}
