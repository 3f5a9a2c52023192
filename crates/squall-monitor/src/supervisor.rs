//! Supervision of wrapper/runner pairs: launch, observe, kill, sweep.
//!
//! All state lives in one [`Monitor`] value shared by the master-request
//! handlers and the shutdown path. The running-process table is only touched
//! at well-defined points (insert before spawn, pid fill-in after the
//! handshake, remove after the wrapper is reaped, iterate during shutdown),
//! and each OS child is waited exactly once, with the result published
//! through a [`StatusCell`] every interested party can await.

use crate::{cgroups::CgroupBackend, fifo::FifoPair};
use anyhow::{Context as _, Result};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use slog::{debug, error, info, Logger};
use squall_base::{
    proto::{Configuration, ExecResult, MonitorToMaster},
    RunnerId, User, WrapperParameters,
};
use squall_util::{
    ext::OptionExt as _,
    net,
    sync::StatusCell,
};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::process::ExitStatusExt as _;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, BufReader},
    process::Command,
    sync::mpsc::UnboundedSender,
    task,
    time::timeout,
};

/// How long `kill_runner` waits for a cooperative exit before SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// How long shutdown waits for the master to quiesce before the kill sweep.
pub const MASTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable monitor-wide configuration, resolved at startup.
pub struct MonitorConf {
    pub current_user: User,
    pub first_user_mapped: User,
    /// Scratch directory holding the per-launch fifos.
    pub wrappers_dir: PathBuf,
    /// Root cgroup under which per-runner cgroups are created.
    pub cgroup: Option<String>,
    pub cpuset_available: bool,
    pub wrapper_bin: PathBuf,
    pub keep_runner_rootfs: bool,
    pub identity_file: Option<PathBuf>,
    /// Group 0 belongs to the master; the rest are the runner pool.
    pub cpu_groups: Vec<Vec<u32>>,
}

struct ProcessRecord {
    wrapper_pid: Pid,
    wrapped_pid: Option<Pid>,
    status: Arc<StatusCell<ExitStatus>>,
}

impl ProcessRecord {
    /// The pid a kill should target: the wrapped process once known, the
    /// wrapper itself while the handshake is still in flight.
    fn kill_target(&self) -> Pid {
        self.wrapped_pid.unwrap_or(self.wrapper_pid)
    }
}

pub struct Monitor {
    pub conf: MonitorConf,
    cgroups: Box<dyn CgroupBackend>,
    running: Mutex<HashMap<RunnerId, ProcessRecord>>,
    shutting_down: AtomicBool,
    next_wrapper_id: AtomicU64,
    master: Mutex<Option<UnboundedSender<MonitorToMaster>>>,
    log: Logger,
}

impl Monitor {
    pub fn new(conf: MonitorConf, cgroups: Box<dyn CgroupBackend>, log: Logger) -> Arc<Self> {
        Arc::new(Monitor {
            conf,
            cgroups,
            running: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            next_wrapper_id: AtomicU64::new(0),
            master: Mutex::new(None),
            log,
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn set_master_sender(&self, sender: UnboundedSender<MonitorToMaster>) {
        self.master.lock().unwrap().replace(sender).assert_is_none();
    }

    /// The data reported to the master by `get_configuration`. The identity
    /// file is re-read on every call.
    pub fn configuration(&self) -> Configuration {
        let identity = self.conf.identity_file.as_ref().and_then(|path| {
            match std::fs::read(path) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    error!(self.log, "cannot read identity file";
                           "path" => %path.display(), "error" => %err);
                    None
                }
            }
        });
        Configuration {
            current_user: self.conf.current_user,
            first_user_mapped: self.conf.first_user_mapped,
            keep_runner_rootfs: self.conf.keep_runner_rootfs,
            identity,
            cpu_pool: self.conf.cpu_groups[1..].to_vec(),
        }
    }

    /// Launch one sandboxed runner and wait for it to finish.
    ///
    /// Returns once the wrapper has been reaped (or failed to produce a
    /// child). Never fails the monitor itself; every problem is folded into
    /// the [`ExecResult`] reported to the master.
    pub async fn exec_in_namespace(self: &Arc<Self>, params: WrapperParameters) -> ExecResult {
        match self.exec_inner(params).await {
            Ok(result) => result,
            Err(err) => ExecResult::Setup(format!("{err:#}")),
        }
    }

    async fn exec_inner(self: &Arc<Self>, mut params: WrapperParameters) -> Result<ExecResult> {
        let runner_id = params.runner_id;

        // Resolve the per-runner cgroup; without one there is nothing to pin,
        // so the initial cpuset is suppressed as well.
        params.cgroup = match (params.cgroup.take(), &self.conf.cgroup) {
            (Some(name), Some(root)) => {
                let full = format!("{root}/{name}");
                self.cgroups
                    .create(&full)
                    .with_context(|| format!("creating cgroup for runner {runner_id}"))?;
                Some(full)
            }
            _ => None,
        };
        if !self.conf.cpuset_available || params.cgroup.is_none() {
            params.initial_cpuset = None;
        }

        let wrapper_id = self.next_wrapper_id.fetch_add(1, Ordering::SeqCst);
        let base = self.conf.wrappers_dir.join(format!("wrapper{wrapper_id}"));
        let fifos = FifoPair::create(&base)?;

        let mut child = match Command::new(&self.conf.wrapper_bin)
            .arg(&base)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                fifos.unlink();
                return Err(err).context("spawning wrapper");
            }
        };
        let wrapper_pid = Pid::from_raw(
            child.id().expect("pid of a wrapper that has not been waited") as i32,
        );
        debug!(self.log, "wrapper spawned";
               "runner_id" => %runner_id, "wrapper_pid" => wrapper_pid.as_raw());
        tee_output(runner_id, child.stdout.take().unwrap());
        tee_output(runner_id, child.stderr.take().unwrap());

        let status = Arc::new(StatusCell::new());
        // The record must be visible to the shutdown sweep before the wrapper
        // has reported the wrapped pid.
        self.running
            .lock()
            .unwrap()
            .insert(
                runner_id,
                ProcessRecord {
                    wrapper_pid,
                    wrapped_pid: None,
                    status: status.clone(),
                },
            )
            .assert_is_none();

        // Wait the OS child exactly once; the result is memoized in the cell.
        {
            let status = status.clone();
            let log = self.log.clone();
            task::spawn(async move {
                let wrapper_status = match child.wait().await {
                    Ok(wrapper_status) => wrapper_status,
                    Err(err) => {
                        error!(log, "waiting for wrapper failed"; "error" => %err);
                        ExitStatus::from_raw(0xff00)
                    }
                };
                status.set(wrapper_status);
            });
        }

        // The handshake blocks on fifo opens, so it runs on a blocking
        // thread. A pid of None means the wrapper closed `.out` without
        // writing.
        let mut handshake = {
            let params = params.clone();
            let fifo_in = fifos.fifo_in.clone();
            let fifo_out = fifos.fifo_out.clone();
            task::spawn_blocking(move || -> Result<Option<Pid>> {
                let mut pipe = OpenOptions::new()
                    .write(true)
                    .open(&fifo_in)
                    .context("opening parameter fifo")?;
                net::write_message_to_pipe(&mut pipe, &params)
                    .context("writing wrapper parameters")?;
                drop(pipe);
                let _ = std::fs::remove_file(&fifo_in);
                let mut pipe = File::open(&fifo_out).context("opening pid fifo")?;
                let pid = net::read_message_from_pipe::<i32>(&mut pipe)
                    .ok()
                    .map(Pid::from_raw);
                let _ = std::fs::remove_file(&fifo_out);
                Ok(pid)
            })
        };

        let mut waiter = status.waiter();
        let handshake_result = tokio::select! {
            // A wrapper can deliver the pid and exit before we get to look;
            // prefer the completed handshake so a delivered pid is never
            // misreported as a startup failure.
            biased;
            handshake_result = &mut handshake => handshake_result,
            wrapper_status = waiter.wait() => {
                // The wrapper died before completing the handshake. Nudge
                // the handshake thread out of whichever fifo it is stuck in,
                // then report with the parameter dump.
                let _ = fifos.release_until_done(&mut handshake).await;
                fifos.unlink();
                self.remove_record(runner_id);
                error!(self.log, "wrapper stopped before sending wrapped pid";
                       "runner_id" => %runner_id,
                       "status" => %wrapper_status,
                       "params" => ?params);
                return Ok(ExecResult::WrapperStartup(format!(
                    "wrapper stopped before sending wrapped pid: {wrapper_status}"
                )));
            }
        };

        let wrapped_pid = match handshake_result.context("wrapper handshake task")? {
            Ok(Some(pid)) => pid,
            Ok(None) => {
                fifos.unlink();
                self.remove_record(runner_id);
                error!(self.log, "cannot read wrapped pid";
                       "runner_id" => %runner_id, "params" => ?params);
                return Ok(ExecResult::WrapperStartup("cannot read wrapped pid".into()));
            }
            Err(err) => {
                fifos.unlink();
                self.remove_record(runner_id);
                error!(self.log, "wrapper handshake failed";
                       "runner_id" => %runner_id, "error" => format!("{err:#}"),
                       "params" => ?params);
                return Ok(ExecResult::WrapperStartup(format!(
                    "wrapper handshake failed: {err:#}"
                )));
            }
        };
        debug!(self.log, "runner started";
               "runner_id" => %runner_id, "wrapped_pid" => wrapped_pid.as_raw());
        if let Some(record) = self.running.lock().unwrap().get_mut(&runner_id) {
            record.wrapped_pid = Some(wrapped_pid);
        }

        let wrapper_status = waiter.wait().await;
        self.remove_record(runner_id);
        Ok(self.classify(wrapper_status, &params))
    }

    fn classify(&self, status: ExitStatus, params: &WrapperParameters) -> ExecResult {
        if status.success() {
            return ExecResult::Ok;
        }
        // A SIGKILL death during shutdown is the monitor's own doing. The
        // wrapper forwards a signal death of its child as 128+signo.
        let sigkilled = status.signal() == Some(Signal::SIGKILL as i32)
            || status.code() == Some(128 + Signal::SIGKILL as i32);
        if sigkilled && self.is_shutting_down() {
            return ExecResult::Shutdown;
        }
        error!(self.log, "runner failed";
               "runner_id" => %params.runner_id, "status" => %status, "params" => ?params);
        ExecResult::RunnerFailed(status.to_string())
    }

    fn remove_record(&self, runner_id: RunnerId) {
        self.running.lock().unwrap().remove(&runner_id);
    }

    /// Kill a runner: wait up to [`KILL_GRACE`] for it to exit on its own
    /// (the master usually asks it to stop first), then SIGKILL. Unknown and
    /// already-reaped ids are a silent success.
    pub async fn kill_runner(&self, runner_id: RunnerId) {
        let Some((mut waiter, target)) = ({
            let table = self.running.lock().unwrap();
            table
                .get(&runner_id)
                .map(|record| (record.status.waiter(), record.kill_target()))
        }) else {
            return;
        };
        if timeout(KILL_GRACE, waiter.wait()).await.is_ok() {
            return;
        }
        debug!(self.log, "kill grace expired, sending SIGKILL";
               "runner_id" => %runner_id, "pid" => target.as_raw());
        match kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => error!(self.log, "cannot SIGKILL runner";
                               "runner_id" => %runner_id, "error" => %err),
        }
        waiter.wait().await;
    }

    /// Repoint a runner cgroup's cpuset. A no-op unless the monitor has both
    /// topology information and a root cgroup.
    pub fn set_cpuset(&self, cgroup: &str, cpus: &[u32]) -> Result<()> {
        if !self.conf.cpuset_available {
            return Ok(());
        }
        let Some(root) = &self.conf.cgroup else {
            return Ok(());
        };
        self.cgroups.set_cpuset(&format!("{root}/{cgroup}"), cpus)
    }

    /// Flip the shutdown flag. Returns true for the caller that gets to run
    /// [`shutdown`](Self::shutdown); later callers just log.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Drain the master, then SIGKILL everything still alive and wait for all
    /// of it. Must only be called after [`begin_shutdown`](Self::begin_shutdown)
    /// returned true.
    pub async fn shutdown(&self) {
        info!(self.log, "shutting down");

        let sender = self.master.lock().unwrap().take();
        let master_waiter = {
            let table = self.running.lock().unwrap();
            table
                .get(&RunnerId::MASTER)
                .map(|record| record.status.waiter())
        };
        if let (Some(sender), Some(mut waiter)) = (sender, master_waiter) {
            if sender.send(MonitorToMaster::StopRunner).is_ok() {
                info!(self.log, "asked master to stop its runners");
                if timeout(MASTER_DRAIN_TIMEOUT, waiter.wait()).await.is_err() {
                    error!(self.log, "master did not quiesce in time");
                }
            }
        }

        let mut waiters = Vec::new();
        {
            let table = self.running.lock().unwrap();
            for (runner_id, record) in table.iter() {
                waiters.push(record.status.waiter());
                if record.status.get().is_some() {
                    continue;
                }
                let target = record.kill_target();
                debug!(self.log, "killing runner";
                       "runner_id" => %runner_id, "pid" => target.as_raw());
                match kill(target, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => error!(self.log, "cannot SIGKILL runner";
                                       "runner_id" => %runner_id, "error" => %err),
                }
            }
        }
        for mut waiter in waiters {
            waiter.wait().await;
        }
        info!(self.log, "all runners reaped");
    }
}

/// Forward a wrapper's output to the monitor's stderr, one line at a time,
/// tagged with the runner it belongs to.
fn tee_output(runner_id: RunnerId, stream: impl AsyncRead + Unpin + Send + 'static) {
    task::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            eprintln!("[R{runner_id}] {line}");
        }
    });
}
