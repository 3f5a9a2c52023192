//! Code for the monitor binary.

pub mod cgroups;
pub mod config;
pub mod cpu;
mod fifo;
mod master;
pub mod subids;
pub mod supervisor;

use anyhow::{bail, Context as _, Result};
use cgroups::{CgroupBackend as _, SysFsCgroups};
use config::Config;
use nix::unistd::{getgid, getuid};
use slog::{error, info, Logger};
use squall_base::{proto::ExecResult, User};
use squall_util::signal::ShutdownSignals;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::{fs, process};
use supervisor::{Monitor, MonitorConf};
use tokio::task::{self, JoinHandle};

/// Basename of the wrapper binary, looked up in the configured binary
/// directories.
pub const WRAPPER_BIN: &str = "squall-wrapper";

fn resolve_binary(dirs: &[PathBuf], name: &str) -> Result<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!(
        "binary {name} not found in {}",
        dirs.iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// The main function for the monitor. Returns when a shutdown signal has been
/// fully handled (exit 0 at the call site), or with an error on configuration
/// problems and master death (exit 1).
pub async fn main(config: Config, log: Logger) -> Result<()> {
    let current_user = User {
        uid: getuid().as_raw(),
        gid: getgid().as_raw(),
    };
    let first_user_mapped = subids::discover(current_user)?;

    let cpuinfo = if config.cpuinfo {
        Some(cpu::CpuInfo::read()?)
    } else {
        None
    };
    let cpuset_available = cpuinfo.is_some();
    let cpu_groups = cpu::cpu_groups(cpuinfo.as_ref(), config.cpus.as_ref(), config.proc);
    if cpu_groups.len() < 2 {
        bail!(
            "need at least 2 cpu groups (one for the master, the rest for runners), got {}",
            cpu_groups.len()
        );
    }

    // The wrappers directory only ever holds rendezvous fifos; wipe it.
    let wrappers_dir = config.data_dir.join("wrappers");
    match fs::remove_dir_all(&wrappers_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("wiping wrappers dir {}", wrappers_dir.display()))
        }
    }
    fs::create_dir_all(&wrappers_dir)
        .with_context(|| format!("creating wrappers dir {}", wrappers_dir.display()))?;

    let wrapper_bin = resolve_binary(&config.binaries, WRAPPER_BIN)?;
    let master_bin = resolve_binary(&config.binaries, &config.master)?;

    let sysfs = SysFsCgroups::new();
    if let Some(root) = &config.cgroup {
        sysfs.create(root)?;
    }

    let conf = MonitorConf {
        current_user,
        first_user_mapped,
        wrappers_dir,
        cgroup: config.cgroup,
        cpuset_available,
        wrapper_bin,
        keep_runner_rootfs: config.keep_runner_rootfs,
        identity_file: config.identity_file,
        cpu_groups,
    };
    info!(log, "started";
          "pid" => process::id(),
          "master" => %master_bin.display(),
          "first_user_mapped" => ?conf.first_user_mapped,
          "cpu_groups" => ?conf.cpu_groups);
    let monitor = Monitor::new(conf, Box::new(sysfs), log.clone());

    let handle = master::start(monitor.clone(), master_bin, &config.data_dir, log.clone()).await?;
    let mut master_done = Some(handle.done);
    let mut shutdown_task: Option<JoinHandle<()>> = None;
    let mut signals = ShutdownSignals::new();
    loop {
        tokio::select! {
            signal = signals.recv() => {
                error!(log, "received {signal}");
                if monitor.begin_shutdown() {
                    let monitor = monitor.clone();
                    shutdown_task = Some(task::spawn(async move { monitor.shutdown().await }));
                } else {
                    info!(log, "shutdown already in progress");
                }
            }
            joined = async { shutdown_task.as_mut().unwrap().await }, if shutdown_task.is_some() => {
                joined.context("shutdown task")?;
                info!(log, "exiting");
                return Ok(());
            }
            exec_result = async { master_done.as_mut().unwrap().await }, if master_done.is_some() => {
                let outcome = exec_result.context("master supervision task")?;
                master_done = None;
                if !monitor.is_shutting_down() {
                    bail!("master terminated: {outcome}");
                }
                match outcome {
                    ExecResult::Ok | ExecResult::Shutdown => {
                        info!(log, "master stopped"; "outcome" => %outcome)
                    }
                    other => error!(log, "master stopped"; "outcome" => %other),
                }
            }
        }
    }
}
