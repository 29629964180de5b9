// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use clap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use rmd_util::*;

const HELP_BODY: &str = "\
LLC allocation contention tester.

rmd-tester reproduces noisy-neighbor scenarios. It launches QEMU workloads
with their vCPU threads pinned to host cores, partitions the last-level cache
between the workloads through an RMD server and tears everything down at the
end, releasing all cache allocations it created.

The scenario runs as follows. Each VM is started, given --boot-wait to come
up and then its guest threads are pinned according to --affinity. Once all
VMs run, the cache allocations are set up and logged. After --hold, the VMs
are stopped in reverse order and the allocations are reset. Teardown also
runs if any step fails or SIGINT/TERM is received.

The workloads, core bindings and RMD endpoint are configured in the settings
file which is created with defaults if it doesn't exist.
";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityMode {
    /// Pin each guest vCPU thread found through the QEMU monitor.
    Monitor,
    /// Round-robin all QEMU processes on the host over the workload cpu map.
    Process,
    None,
}

impl FromStr for AffinityMode {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "monitor" => Ok(Self::Monitor),
            "process" => Ok(Self::Process),
            "none" => Ok(Self::None),
            v => bail!("invalid affinity mode {:?}, should be monitor, process or none", v),
        }
    }
}

lazy_static! {
    static ref ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "-s, --settings=[FILE]      'Test settings file (default: {dfl_settings})'
             -a, --args=[FILE]          'Load base command line arguments from FILE'
             -w, --boot-wait=[DUR]      'Wait for VMs to boot before pinning (default: {dfl_boot_wait})'
             -H, --hold=[DUR]           'Run the scenario for DUR before teardown (default: {dfl_hold})'
             -A, --affinity=[MODE]      'Guest pinning, monitor|process|none (default: monitor)'
                 --skip-llc             'Run the workloads without cache allocations'
                 --print-cmd            'Print the workload command lines and exit'
             -v...                      'Sets the level of verbosity'",
            dfl_settings = dfl.settings.as_ref().unwrap(),
            dfl_boot_wait = format_duration(dfl.boot_wait),
            dfl_hold = format_duration(dfl.hold),
        )
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub settings: Option<String>,
    pub boot_wait: f64,
    pub hold: f64,
    pub affinity: AffinityMode,

    #[serde(skip)]
    pub skip_llc: bool,
    #[serde(skip)]
    pub print_cmd: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            settings: Some("/etc/rmd-tester/settings.json".into()),
            boot_wait: 30.0,
            hold: 60.0,
            affinity: AffinityMode::Monitor,
            skip_llc: false,
            print_cmd: false,
        }
    }
}

impl JsonLoad for Args {}
impl JsonSave for Args {}

impl Args {
    fn parse_dur(name: &str, v: &str) -> Result<f64> {
        parse_duration(v).with_context(|| format!("invalid --{} {:?}", name, v))
    }
}

impl JsonArgs for Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        clap::App::new("rmd-tester")
            .version(env!("CARGO_PKG_VERSION"))
            .about(HELP_BODY)
            .args_from_usage(&ARGS_STR)
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool> {
        let dfl = Args::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("settings") {
            self.settings = if v.len() > 0 {
                Some(v.to_string())
            } else {
                dfl.settings.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("boot-wait") {
            self.boot_wait = if v.len() > 0 {
                Self::parse_dur("boot-wait", v)?
            } else {
                dfl.boot_wait
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("hold") {
            self.hold = if v.len() > 0 {
                Self::parse_dur("hold", v)?
            } else {
                dfl.hold
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("affinity") {
            self.affinity = if v.len() > 0 {
                v.parse::<AffinityMode>()?
            } else {
                dfl.affinity
            };
            updated_base = true;
        }

        self.skip_llc = matches.is_present("skip-llc");
        self.print_cmd = matches.is_present("print-cmd");

        Ok(updated_base)
    }
}

#[cfg(test)]
mod tests {
    use super::{AffinityMode, Args};
    use rmd_util::*;

    fn matches(argv: &[&str]) -> clap::ArgMatches<'static> {
        clap::App::new("rmd-tester")
            .args_from_usage(&super::ARGS_STR)
            .get_matches_from(argv.iter().map(|s| s.to_string()).collect::<Vec<String>>())
    }

    #[test]
    fn test_process_cmdline() {
        let mut args = Args::default();
        let updated = args
            .process_cmdline(&matches(&[
                "rmd-tester",
                "--boot-wait",
                "1M30s",
                "--affinity",
                "process",
                "--print-cmd",
            ]))
            .unwrap();
        assert!(updated);
        assert_eq!(args.boot_wait, 90.0);
        assert_eq!(args.hold, Args::default().hold);
        assert_eq!(args.affinity, AffinityMode::Process);
        assert!(args.print_cmd);
        assert!(!args.skip_llc);
    }

    #[test]
    fn test_no_base_update() {
        let mut args = Args::default();
        let updated = args
            .process_cmdline(&matches(&["rmd-tester", "--skip-llc"]))
            .unwrap();
        assert!(!updated);
        assert!(args.skip_llc);
    }

    #[test]
    fn test_bad_affinity() {
        let mut args = Args::default();
        assert!(args
            .process_cmdline(&matches(&["rmd-tester", "--affinity", "sideways"]))
            .is_err());
        assert_eq!("none".parse::<AffinityMode>().unwrap(), AffinityMode::None);
    }
}
