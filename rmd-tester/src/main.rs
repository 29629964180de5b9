// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{error, info, warn};
use std::process::exit;
use std::time::Duration;

use rmd_tester_intf::{AffinityMode, Args, Settings};
use rmd_util::*;

mod affinity;
mod error;
mod fleet;
mod qemu;
mod rmd;

pub use error::Error;

use affinity::GuestAffinityResolver;
use fleet::WorkloadFleet;
use rmd::{CacheAllocationController, HttpRestClient};

type LlcController = CacheAllocationController<HttpRestClient>;

fn startup_checks(settings: &Settings) {
    let mut bins = vec![settings.qemu_cmd.as_str(), "taskset"];
    if settings.use_sudo {
        bins.push("sudo");
    }
    for bin in bins {
        if find_bin(bin, Option::<&str>::None).is_none() {
            warn!("cfg: {:?} not found in PATH", bin);
        }
    }
}

fn affinitize(
    fleet: &WorkloadFleet,
    index: usize,
    mode: AffinityMode,
    resolver: &GuestAffinityResolver,
) {
    let res = match mode {
        AffinityMode::Monitor => fleet.affinitize(index, resolver),
        AffinityMode::Process => fleet.affinitize_workload(index, resolver),
        AffinityMode::None => return,
    };
    if let Err(e) = res {
        warn!("affinity: WL{} left unpinned ({})", index, &e);
    }
}

fn run_scenario(
    args: &Args,
    settings: &Settings,
    fleet: &mut WorkloadFleet,
    llc: Option<&mut LlcController>,
) -> Result<()> {
    let resolver = GuestAffinityResolver::new(settings)?;

    for index in 0..fleet.len() {
        if prog_exiting() {
            bail!("interrupted before WL{} was started", index);
        }
        fleet.start(index)?;
        info!(
            "Waiting {} for WL{} to boot",
            format_duration(args.boot_wait),
            index
        );
        if !sleep_unless_exiting(Duration::from_secs_f64(args.boot_wait)) {
            bail!("interrupted while WL{} was booting", index);
        }
        affinitize(fleet, index, args.affinity, &resolver);
    }

    if let Some(llc) = llc {
        llc.setup_llc_allocation(settings)?;
        llc.log_allocations()?;
    }

    info!("Holding the scenario for {}", format_duration(args.hold));
    if !sleep_unless_exiting(Duration::from_secs_f64(args.hold)) {
        info!("Interrupted, tearing down");
    }
    Ok(())
}

/// VMs are stopped before their cache allocations are released. Both steps
/// always run.
fn teardown(fleet: &mut WorkloadFleet, llc: Option<&mut LlcController>) -> Result<()> {
    let stopped = fleet.stop_all();

    let reset = match llc {
        Some(llc) => {
            let res = llc.reset_all_allocations();
            if let Err(e) = &res {
                error!(
                    "rmd: Failed to release {:?} ({})",
                    llc.allocations(),
                    e
                );
            }
            res
        }
        None => Ok(()),
    };

    stopped?;
    reset?;
    Ok(())
}

fn run(args: &Args, settings: &Settings) -> Result<()> {
    let mut fleet = WorkloadFleet::new(settings)?;

    let mut llc = if args.skip_llc {
        info!("rmd: Skipping LLC allocations as per --skip-llc");
        None
    } else {
        match CacheAllocationController::connect(settings) {
            Ok(v) => Some(v),
            Err(e) => {
                fleet.stop_all()?;
                return Err(e.into());
            }
        }
    };

    let result = run_scenario(args, settings, &mut fleet, llc.as_mut());
    if let Err(e) = &result {
        error!("Scenario failed ({:#})", e);
    }
    let torn_down = teardown(&mut fleet, llc.as_mut());

    result.and(torn_down)
}

fn print_cmds(settings: &Settings) -> Result<()> {
    let mut fleet = WorkloadFleet::new(settings)?;
    for index in 0..fleet.len() {
        println!("{}", fleet.command(index)?.join(" "));
    }
    fleet.stop_all()?;
    Ok(())
}

fn main() {
    let args_file = Args::init_args_and_logging().unwrap_or_else(|e| {
        error!("cfg: Failed to process args file ({:#})", &e);
        exit(1);
    });
    let args = &args_file.data;

    let settings_file = JsonConfigFile::<Settings>::load_or_create(args.settings.as_ref())
        .unwrap_or_else(|e| {
            error!("cfg: Failed to load settings ({:#})", &e);
            exit(1);
        });
    let settings = &settings_file.data;

    if args.print_cmd {
        if let Err(e) = print_cmds(settings) {
            error!("qemu: {:#}", &e);
            exit(1);
        }
        return;
    }

    startup_checks(settings);
    setup_prog_state();

    if let Err(e) = run(args, settings) {
        error!("{:#}", &e);
        exit(1);
    }
    info!("Done");
}
