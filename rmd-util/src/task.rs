// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use super::run_command;

pub const DFL_STOP_GRACE: Duration = Duration::from_secs(10);
const EXIT_POLL_INTV: Duration = Duration::from_millis(100);

/// Something which can be started, signalled and stopped as a unit.
pub trait ControllableProcess {
    type Error;

    fn start(&mut self) -> std::result::Result<(), Self::Error>;
    fn stop(&mut self) -> std::result::Result<(), Self::Error>;
    fn kill(&mut self, signal: Signal, grace: Duration) -> std::result::Result<(), Self::Error>;
    fn is_running(&mut self) -> bool;
}

/// A child process spawned in its own process group so that signals reach
/// everything it forks, e.g. the actual workload under `sudo` and `taskset`.
#[derive(Debug)]
pub struct TaskProcess {
    name: String,
    args: Vec<String>,
    log_path: Option<PathBuf>,
    sudo: bool,
    child: Option<Child>,
}

impl TaskProcess {
    pub fn new(name: String, args: Vec<String>) -> Self {
        Self {
            name,
            args,
            log_path: None,
            sudo: false,
            child: None,
        }
    }

    pub fn set_log_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.log_path = Some(PathBuf::from(path.as_ref()));
        self
    }

    /// The process runs as root. Signals which can't be delivered directly
    /// are sent through `sudo kill`.
    pub fn set_sudo(&mut self, sudo: bool) -> &mut Self {
        self.sudo = sudo;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    fn output(&self) -> Result<(Stdio, Stdio)> {
        match self.log_path.as_ref() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let f = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening log file {:?}", path))?;
                let f2 = f.try_clone()?;
                Ok((Stdio::from(f), Stdio::from(f2)))
            }
            None => Ok((Stdio::null(), Stdio::null())),
        }
    }

    fn signal(&self, pgid: Pid, signal: Signal) -> Result<()> {
        match killpg(pgid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) if self.sudo => run_command(
                Command::new("sudo").args(&[
                    "kill".to_string(),
                    format!("-{}", signal as i32),
                    "--".to_string(),
                    format!("-{}", pgid),
                ]),
                "failed to signal process group",
            ),
            Err(e) => bail!("failed to send {} to {:?} ({})", signal, &self.name, &e),
        }
    }

    fn wait_exit(child: &mut Child, grace: Duration) -> Result<bool> {
        let started_at = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                debug!("task: exited with {}", &status);
                return Ok(true);
            }
            if Instant::now().duration_since(started_at) >= grace {
                return Ok(false);
            }
            sleep(EXIT_POLL_INTV);
        }
    }
}

impl ControllableProcess for TaskProcess {
    type Error = anyhow::Error;

    fn start(&mut self) -> Result<()> {
        if self.args.is_empty() {
            bail!("{:?} has no command", &self.name);
        }
        let (stdout, stderr) = self.output()?;

        debug!("task: {:?} args={:?}", &self.name, &self.args);
        let child = Command::new(&self.args[0])
            .args(&self.args[1..])
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .with_context(|| format!("spawning {:?} ({:?})", &self.name, &self.args[0]))?;

        info!("task: Started {:?} (pid {})", &self.name, child.id());
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            self.child = None;
            return Ok(());
        }
        if let Err(e) = self.kill(Signal::SIGTERM, DFL_STOP_GRACE) {
            warn!("task: {:?} didn't terminate ({:#}), killing", &self.name, &e);
            self.kill(Signal::SIGKILL, DFL_STOP_GRACE)?;
        }
        Ok(())
    }

    fn kill(&mut self, signal: Signal, grace: Duration) -> Result<()> {
        if !self.is_running() {
            self.child = None;
            return Ok(());
        }
        let pgid = Pid::from_raw(self.pid().unwrap() as i32);
        self.signal(pgid, signal)?;

        let child = self.child.as_mut().unwrap();
        if Self::wait_exit(child, grace)? {
            self.child = None;
            Ok(())
        } else {
            bail!(
                "{:?} still running {:.1}s after {}",
                &self.name,
                grace.as_secs_f64(),
                signal
            )
        }
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_))) | Some(Err(_)) | None => false,
        }
    }
}

impl Drop for TaskProcess {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("task: {:?} still running on drop, killing", &self.name);
            if let Err(e) = self.kill(Signal::SIGKILL, DFL_STOP_GRACE) {
                error!("task: Failed to kill {:?} ({:#})", &self.name, &e);
            }
        }
    }
}
