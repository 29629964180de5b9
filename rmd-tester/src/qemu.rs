// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::affinity::{parse_smp_cpus, GuestAffinityResolver, Pinner};
use super::Error;
use rmd_tester_intf::{workload_name, Settings};
use rmd_util::*;

/// Locally administered MAC address derived from the md5 of `seed`.
pub fn derive_mac(seed: &str) -> String {
    let hex = format!("{:x}", md5::compute(seed.as_bytes()));
    format!(
        "52:54:{}:{}:{}:{}",
        &hex[0..2],
        &hex[2..4],
        &hex[4..6],
        &hex[6..8]
    )
}

fn nic_args(image: &str, nics_nr: usize) -> Vec<String> {
    let mut args = vec![];
    for i in 0..nics_nr {
        let mac = derive_mac(&format!("{}{}", image, i));
        args.push("-netdev".into());
        args.push(format!(
            "type=tap,id=hostnet{},script=no,downscript=no,vhost=on",
            i
        ));
        args.push("-device".into());
        args.push(format!(
            "virtio-net-pci,netdev=hostnet{},mac={},csum=off,gso=off,\
             guest_tso4=off,guest_tso6=off,guest_ecn=off",
            i, mac
        ));
    }
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    Configured,
    Running,
    Stopped,
}

/// One QEMU guest. The launch command is fixed on construction and the VM
/// can be started and stopped repeatedly.
#[derive(Debug)]
pub struct WorkloadProcess {
    name: String,
    core_binding: Vec<String>,
    cpu_map: Vec<String>,
    nr_guest_cpus: usize,
    monitor: PathBuf,
    shared_dir: PathBuf,
    stop_grace: Duration,
    use_sudo: bool,
    task: TaskProcess,
    state: WorkloadState,
}

impl WorkloadProcess {
    pub fn new(index: usize, settings: &Settings) -> Result<Self, Error> {
        let count = settings.vm_count;
        if index >= count {
            return Err(Error::Index { index, count });
        }
        if index >= settings.images.len() || index >= settings.core_binding.len() {
            return Err(Error::Config(format!(
                "no image or core binding for {}",
                workload_name(index)
            )));
        }

        let name = workload_name(index);
        let image = &settings.images[index];
        let core_binding = settings.core_binding[index].clone();
        let cpu_map = match settings.cpu_maps.get(index) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => core_binding.clone(),
        };
        let nr_guest_cpus = match parse_smp_cpus(&settings.smp) {
            Some(v) => v,
            None => {
                warn!(
                    "qemu: Can't determine guest CPUs from smp {:?}, using {}",
                    &settings.smp,
                    core_binding.len()
                );
                core_binding.len()
            }
        };

        let display = settings.base_vnc_port + index;
        let monitor = Path::new(&settings.monitor_dir).join(format!("vm{}monitor", display));
        let shared_dir =
            Path::new(&settings.shared_dir_base).join(format!("qemu{}_share", display));
        fs::create_dir_all(&shared_dir).map_err(|e| Error::io("create", &shared_dir, e))?;

        let mut args: Vec<String> = vec![];
        if settings.use_sudo {
            args.push("sudo".into());
            args.push("-E".into());
        }
        args.push("taskset".into());
        args.push("-c".into());
        args.push(core_binding.join(","));
        args.push(settings.qemu_cmd.clone());

        let qemu_args: Vec<String> = vec![
            "-m".into(),
            settings.memory.clone(),
            "-smp".into(),
            settings.smp.clone(),
            "-cpu".into(),
            "host,migratable=off".into(),
            "-drive".into(),
            format!("if={},file={}", &settings.boot_drive_type, image),
            "-boot".into(),
            "c".into(),
            "--enable-kvm".into(),
            "-monitor".into(),
            format!("unix:{},server,nowait", monitor.display()),
            "-numa".into(),
            "node".into(),
            "-mem-prealloc".into(),
            "-nographic".into(),
            "-vnc".into(),
            format!(":{}", display),
            "-name".into(),
            name.clone(),
            "-snapshot".into(),
            "-net".into(),
            "none".into(),
            "-no-reboot".into(),
            "-drive".into(),
            format!(
                "if={},format=raw,file=fat:rw:{},snapshot=off",
                &settings.shared_drive_type,
                shared_dir.display()
            ),
        ];
        args.extend(qemu_args);
        args.extend(nic_args(image, settings.nics_nr));

        let mut task = TaskProcess::new(name.clone(), args);
        task.set_sudo(settings.use_sudo);
        if let Some(log_dir) = settings.log_dir.as_ref() {
            task.set_log_path(
                Path::new(log_dir).join(format!("{}{}", &settings.qemu_log_file, index)),
            );
        }

        debug!("qemu: Configured {} display=:{}", &name, display);
        Ok(Self {
            name,
            core_binding,
            cpu_map,
            nr_guest_cpus,
            monitor,
            shared_dir,
            stop_grace: Duration::from_secs_f64(settings.stop_grace),
            use_sudo: settings.use_sudo,
            task,
            state: WorkloadState::Configured,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkloadState {
        self.state
    }

    pub fn monitor(&self) -> &Path {
        &self.monitor
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    pub fn command(&self) -> &[String] {
        self.task.args()
    }

    pub fn print_cmd(&self) -> String {
        self.command().join(" ")
    }

    /// Pins each guest vCPU thread to its core in `core_binding`.
    pub fn affinitize_guest_threads<P: Pinner>(
        &self,
        resolver: &GuestAffinityResolver<P>,
    ) -> Result<usize, Error> {
        resolver.affinitize_guest(
            &self.name,
            &self.monitor,
            self.nr_guest_cpus,
            &self.core_binding,
        )
    }

    /// Spreads the host workload processes over this workload's cpu map.
    pub fn affinitize_workload<P: Pinner>(
        &self,
        resolver: &GuestAffinityResolver<P>,
    ) -> Result<usize, Error> {
        resolver.affinitize_processes(&self.cpu_map)
    }

    fn remove_shared_dir(&self) -> Result<(), Error> {
        match fs::remove_dir_all(&self.shared_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && self.use_sudo => {
                debug!("qemu: Removing {:?} with sudo", &self.shared_dir);
                run_command(
                    Command::new("sudo").arg("rm").arg("-rf").arg(&self.shared_dir),
                    "failed to remove shared dir",
                )
                .map_err(|e2| {
                    Error::io(
                        "remove",
                        &self.shared_dir,
                        io::Error::new(io::ErrorKind::PermissionDenied, format!("{:#}", &e2)),
                    )
                })
            }
            Err(e) => Err(Error::io("remove", &self.shared_dir, e)),
        }
    }
}

impl ControllableProcess for WorkloadProcess {
    type Error = Error;

    fn start(&mut self) -> Result<(), Error> {
        fs::create_dir_all(&self.shared_dir)
            .map_err(|e| Error::io("create", &self.shared_dir, e))?;
        self.task.start().map_err(|cause| Error::Spawn {
            name: self.name.clone(),
            cause,
        })?;
        self.state = WorkloadState::Running;
        info!("qemu: Started {} ({})", &self.name, self.monitor.display());
        Ok(())
    }

    /// Kills the VM and removes its shared directory. The workload is
    /// considered stopped even if either step fails.
    fn stop(&mut self) -> Result<(), Error> {
        let killed = self.kill(Signal::SIGKILL, self.stop_grace);
        let removed = self.remove_shared_dir();
        if self.state == WorkloadState::Running {
            info!("qemu: Stopped {}", &self.name);
        }
        self.state = WorkloadState::Stopped;
        killed.and(removed)
    }

    fn kill(&mut self, signal: Signal, grace: Duration) -> Result<(), Error> {
        self.task.kill(signal, grace).map_err(|cause| Error::Kill {
            name: self.name.clone(),
            cause,
        })
    }

    fn is_running(&mut self) -> bool {
        self.task.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::{derive_mac, WorkloadProcess, WorkloadState};
    use crate::Error;
    use nix::sys::signal::Signal;
    use rmd_tester_intf::Settings;
    use rmd_util::*;
    use std::time::Duration;

    fn scratch_settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        let dir = dir.to_str().unwrap().to_string();
        settings.monitor_dir = dir.clone();
        settings.shared_dir_base = dir.clone();
        settings.log_dir = Some(dir);
        settings.use_sudo = false;
        settings.stop_grace = 2.0;
        settings
    }

    #[test]
    fn test_derive_mac() {
        let mac = derive_mac("/var/lib/rmd-tester/wl0.qcow20");
        assert_eq!(mac, derive_mac("/var/lib/rmd-tester/wl0.qcow20"));
        assert_ne!(mac, derive_mac("/var/lib/rmd-tester/wl0.qcow21"));
        assert!(mac.starts_with("52:54:"));
        assert_eq!(mac.len(), 17);
        // md5("") = d41d8cd9...
        assert_eq!(derive_mac(""), "52:54:d4:1d:8c:d9");
    }

    #[test]
    fn test_launch_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = scratch_settings(dir.path());
        settings.nics_nr = 2;
        let vm = WorkloadProcess::new(1, &settings).unwrap();
        let args = vm.command();
        let shared = dir.path().join("qemu5_share");
        let monitor = dir.path().join("vm5monitor");

        assert_eq!(&args[..4], &["taskset", "-c", "6,7,8,9", "qemu-system-x86_64"]);
        assert!(shared.is_dir());
        assert_eq!(vm.shared_dir(), shared.as_path());
        assert_eq!(vm.monitor(), monitor.as_path());
        assert_eq!(vm.state(), WorkloadState::Configured);

        let cmd = vm.print_cmd();
        for frag in &[
            "-m 4096 -smp 4 -cpu host,migratable=off",
            "-drive if=scsi,file=/var/lib/rmd-tester/wl1.qcow2 -boot c --enable-kvm",
            "-numa node -mem-prealloc -nographic -vnc :5 -name WL1 -snapshot -net none -no-reboot",
        ] {
            assert!(cmd.contains(frag), "{:?} not in {:?}", frag, &cmd);
        }
        assert!(cmd.contains(&format!("-monitor unix:{},server,nowait", monitor.display())));
        assert!(cmd.contains(&format!(
            "-drive if=scsi,format=raw,file=fat:rw:{},snapshot=off",
            shared.display()
        )));
        assert!(args.iter().any(|a| a == "none"));

        let mac = derive_mac("/var/lib/rmd-tester/wl1.qcow21");
        assert_eq!(args.iter().filter(|a| *a == "-netdev").count(), 2);
        assert!(args.iter().any(|a| a
            == "type=tap,id=hostnet1,script=no,downscript=no,vhost=on"));
        assert!(args
            .iter()
            .any(|a| a.starts_with(&format!("virtio-net-pci,netdev=hostnet1,mac={},", mac))));
    }

    #[test]
    fn test_sudo_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = scratch_settings(dir.path());
        settings.use_sudo = true;
        let vm = WorkloadProcess::new(0, &settings).unwrap();
        assert_eq!(&vm.command()[..3], &["sudo", "-E", "taskset"]);
    }

    #[test]
    fn test_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        match WorkloadProcess::new(2, &scratch_settings(dir.path())) {
            Err(Error::Index { index: 2, count: 2 }) => {}
            v => panic!("unexpected {:?}", v),
        }
    }

    #[test]
    fn test_stop_never_started() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = WorkloadProcess::new(0, &scratch_settings(dir.path())).unwrap();
        std::fs::write(vm.shared_dir().join("result.txt"), "42\n").unwrap();

        vm.stop().unwrap();
        assert!(!vm.shared_dir().exists());
        assert_eq!(vm.state(), WorkloadState::Stopped);
        assert!(!vm.is_running());

        // stopping again is a no-op
        vm.stop().unwrap();
    }

    #[test]
    fn test_start_recreates_shared_dir() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut settings = scratch_settings(dir.path());
        settings.qemu_cmd = "/nonexistent/qemu-system-x86_64".into();
        let mut vm = WorkloadProcess::new(0, &settings).unwrap();
        vm.stop().unwrap();
        assert!(!vm.shared_dir().exists());

        // taskset may or may not be installed, the shared dir comes back first
        let _ = vm.start();
        assert!(vm.shared_dir().is_dir());

        vm.stop().unwrap();
        assert!(!vm.shared_dir().exists());
        assert!(!vm.is_running());
    }

    #[test]
    fn test_kill_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = WorkloadProcess::new(0, &scratch_settings(dir.path())).unwrap();
        vm.task = TaskProcess::new("WL0".into(), vec!["sleep".into(), "30".into()]);
        vm.start().unwrap();
        assert_eq!(vm.state(), WorkloadState::Running);

        // SIGCONT leaves the process running past the grace period
        match vm.kill(Signal::SIGCONT, Duration::from_millis(200)) {
            Err(Error::Kill { name, .. }) => assert_eq!(name, "WL0"),
            v => panic!("unexpected {:?}", v),
        }
        assert!(vm.is_running());

        vm.stop().unwrap();
        assert!(!vm.is_running());
        assert!(!vm.shared_dir().exists());
        assert_eq!(vm.state(), WorkloadState::Stopped);
    }
}
