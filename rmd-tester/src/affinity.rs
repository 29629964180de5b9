// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use log::{debug, info, trace, warn};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::{self, prelude::*};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use super::Error;
use rmd_tester_intf::Settings;
use rmd_util::*;

lazy_static! {
    static ref CPU_THREAD_RE: Regex = Regex::new(r"CPU #(\d+):.*thread_id=(\d+)").unwrap();
}

const MONITOR_CMD: &[u8] = b"info cpus\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestThreadBinding {
    pub guest_cpu: usize,
    pub host_tid: u32,
    pub host_core: String,
}

/// Guest CPU index to host thread id from `info cpus` output.
pub fn parse_thread_ids(output: &str) -> BTreeMap<usize, u32> {
    let mut tids = BTreeMap::new();
    for line in output.lines() {
        if let Some(caps) = CPU_THREAD_RE.captures(line) {
            match (caps[1].parse::<usize>(), caps[2].parse::<u32>()) {
                (Ok(cpu), Ok(tid)) => {
                    tids.insert(cpu, tid);
                }
                _ => warn!("affinity: Failed to parse {:?}", line.trim()),
            }
        }
    }
    tids
}

/// Binds guest CPU `N` to `cores[N]` for `N` in `0..nr_cpus`. Guest CPUs
/// missing from the output or without a core are skipped.
pub fn resolve_bindings(output: &str, nr_cpus: usize, cores: &[String]) -> Vec<GuestThreadBinding> {
    let tids = parse_thread_ids(output);
    let mut bindings = vec![];
    for guest_cpu in 0..nr_cpus {
        let host_tid = match tids.get(&guest_cpu) {
            Some(v) => *v,
            None => {
                warn!("affinity: No thread id for guest CPU #{}", guest_cpu);
                continue;
            }
        };
        let host_core = match cores.get(guest_cpu) {
            Some(v) => v.clone(),
            None => {
                warn!("affinity: No host core for guest CPU #{}", guest_cpu);
                continue;
            }
        };
        bindings.push(GuestThreadBinding {
            guest_cpu,
            host_tid,
            host_core,
        });
    }
    bindings
}

/// Number of guest CPUs from a `-smp` string, e.g. "4", "cpus=8,sockets=2"
/// or "sockets=2,cores=2,threads=2". An explicit count takes precedence
/// over the topology.
pub fn parse_smp_cpus(smp: &str) -> Option<usize> {
    let mut cpus = None;
    let mut topology: Option<usize> = None;

    for (idx, tok) in smp.split(',').map(|t| t.trim()).enumerate() {
        if tok.is_empty() {
            continue;
        }
        let (key, val) = match tok.find('=') {
            Some(pos) => (&tok[..pos], &tok[pos + 1..]),
            None if idx == 0 => ("cpus", tok),
            None => return None,
        };
        let val = val.parse::<usize>().ok()?;
        match key {
            "cpus" => cpus = Some(val),
            "sockets" | "dies" | "clusters" | "cores" | "threads" => {
                topology = Some(topology.unwrap_or(1) * val)
            }
            _ => {}
        }
    }

    match cpus.or(topology) {
        Some(0) | None => None,
        v => v,
    }
}

/// Assigns `cores` to `pids` in order, wrapping around the core list.
pub fn round_robin(pids: &[u32], cores: &[String]) -> Vec<(u32, String)> {
    if cores.is_empty() {
        return vec![];
    }
    pids.iter()
        .zip(cores.iter().cycle())
        .map(|(pid, core)| (*pid, core.clone()))
        .collect()
}

fn query_monitor_sudo(path: &Path, timeout: Duration) -> Result<String> {
    let mut child = Command::new("sudo")
        .arg("socat")
        .arg("-t")
        .arg(format!("{:.1}", timeout.as_secs_f64()))
        .arg("-")
        .arg(format!("UNIX-CONNECT:{}", path.display()))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("spawning sudo socat")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(MONITOR_CMD)?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        bail!("socat failed ({})", &output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Sends `info cpus` to the monitor socket at `path` and collects the
/// response until the monitor closes the connection or `timeout` passes
/// without output. Falls back to `sudo socat` if the socket isn't accessible.
pub fn query_monitor(path: &Path, timeout: Duration, sudo: bool) -> Result<String> {
    let mut stream = match UnixStream::connect(path) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied && sudo => {
            debug!("affinity: {:?} not accessible, retrying with sudo", path);
            return query_monitor_sudo(path, timeout);
        }
        Err(e) => return Err(e).with_context(|| format!("connecting to {:?}", path)),
    };
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(MONITOR_CMD)?;

    let mut resp = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => resp.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                break
            }
            Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
        }
    }

    let resp = String::from_utf8_lossy(&resp).into_owned();
    trace!("affinity: monitor {:?} responded {:?}", path, &resp);
    Ok(resp)
}

/// Host processes whose name matches `re`, sorted by pid.
pub fn find_processes(re: &Regex) -> Vec<u32> {
    let mut sys = sysinfo::System::new();
    sys.refresh_processes();
    let mut pids: Vec<u32> = sys
        .processes()
        .iter()
        .filter(|(_, proc)| re.is_match(proc.name()))
        .map(|(pid, _)| pid.as_u32())
        .collect();
    pids.sort();
    pids
}

/// Pins a host thread or process to a core.
pub trait Pinner {
    fn pin(&self, id: u32, core: &str) -> Result<()>;
}

pub struct HostPinner {
    pub sudo: bool,
}

impl Pinner for HostPinner {
    fn pin(&self, id: u32, core: &str) -> Result<()> {
        if self.sudo {
            return run_command(
                Command::new("sudo")
                    .args(&["taskset", "-c", "-p", core, id.to_string().as_str()])
                    .stdout(Stdio::null()),
                "failed to set affinity",
            );
        }

        let cpu = core
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid core {:?}", core))?;
        if cpu >= *NR_SYSTEM_CPUS {
            bail!("core {} out of range, {} cpus", cpu, *NR_SYSTEM_CPUS);
        }
        let mut cpuset = CpuSet::new();
        cpuset.set(cpu)?;
        sched_setaffinity(Pid::from_raw(id as i32), &cpuset)
            .with_context(|| format!("sched_setaffinity({}, {})", id, cpu))?;
        Ok(())
    }
}

/// Applies the two pinning strategies. Individual pin failures are logged
/// and skipped.
pub struct GuestAffinityResolver<P: Pinner = HostPinner> {
    pinner: P,
    monitor_timeout: Duration,
    sudo: bool,
    process_re: Regex,
}

impl GuestAffinityResolver<HostPinner> {
    pub fn new(settings: &Settings) -> Result<Self, Error> {
        Self::with_pinner(
            HostPinner {
                sudo: settings.use_sudo,
            },
            settings,
        )
    }
}

impl<P: Pinner> GuestAffinityResolver<P> {
    pub fn with_pinner(pinner: P, settings: &Settings) -> Result<Self, Error> {
        let process_re = Regex::new(&settings.workload_process_pattern).map_err(|e| {
            Error::Config(format!(
                "workload_process_pattern {:?} ({})",
                &settings.workload_process_pattern, &e
            ))
        })?;
        Ok(Self {
            pinner,
            monitor_timeout: Duration::from_secs_f64(settings.monitor_timeout),
            sudo: settings.use_sudo,
            process_re,
        })
    }

    fn pin_all<'a, I>(&self, what: &str, pairs: I) -> usize
    where
        I: Iterator<Item = (u32, &'a str)>,
    {
        let mut nr_pinned = 0;
        for (id, core) in pairs {
            match self.pinner.pin(id, core) {
                Ok(()) => {
                    debug!("affinity: Pinned {} {} to core {}", what, id, core);
                    nr_pinned += 1;
                }
                Err(e) => warn!(
                    "affinity: Failed to pin {} {} to core {} ({:#})",
                    what, id, core, &e
                ),
            }
        }
        nr_pinned
    }

    /// Pins the vCPU threads of the guest behind `monitor` to `cores`.
    /// Returns the number of threads pinned.
    pub fn affinitize_guest(
        &self,
        name: &str,
        monitor: &Path,
        nr_cpus: usize,
        cores: &[String],
    ) -> Result<usize, Error> {
        let output = query_monitor(monitor, self.monitor_timeout, self.sudo)
            .map_err(|e| Error::Affinity(format!("{}: querying monitor ({:#})", name, &e)))?;

        let bindings = resolve_bindings(&output, nr_cpus, cores);
        if bindings.is_empty() {
            return Err(Error::Affinity(format!(
                "{}: no guest CPU threads found in {:?}",
                name, monitor
            )));
        }

        let nr_pinned = self.pin_all(
            "thread",
            bindings
                .iter()
                .map(|b| (b.host_tid, b.host_core.as_str())),
        );
        info!(
            "affinity: {} pinned {}/{} guest CPU threads",
            name,
            nr_pinned,
            bindings.len()
        );
        Ok(nr_pinned)
    }

    /// Pins every matching workload process on the host round-robin over
    /// `cores`. Returns the number of processes pinned.
    pub fn affinitize_processes(&self, cores: &[String]) -> Result<usize, Error> {
        self.affinitize_pids(&find_processes(&self.process_re), cores)
    }

    fn affinitize_pids(&self, pids: &[u32], cores: &[String]) -> Result<usize, Error> {
        if pids.is_empty() {
            return Err(Error::Affinity(format!(
                "no processes matching {:?}",
                self.process_re.as_str()
            )));
        }
        let pairs = round_robin(pids, cores);
        let nr_pinned = self.pin_all("process", pairs.iter().map(|(p, c)| (*p, c.as_str())));
        info!(
            "affinity: Pinned {}/{} processes over {:?}",
            nr_pinned,
            pids.len(),
            cores
        );
        Ok(nr_pinned)
    }
}
