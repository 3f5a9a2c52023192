//! Messages sent between the monitor, the master, and runners, and the
//! structures they carry. All of these cross a named pipe with the
//! length-prefixed framing from `squall-util`.

use crate::{RunnerId, User, WrapperParameters};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Message sent from the master to the monitor over the master pipe. Requests
/// carry a sequence number that the monitor echoes in its response; requests
/// may complete out of order (an exec runs for the runner's whole lifetime).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum MasterToMonitor {
    Request(u64, MonitorRequest),
}

/// The operations the monitor exposes to the master.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum MonitorRequest {
    GetConfiguration,
    ExecInNamespace(WrapperParameters),
    KillRunner(RunnerId),
    SetCpuset { cgroup: String, cpus: Vec<u32> },
}

/// Message sent from the monitor to the master: either the response to an
/// earlier [`MonitorRequest`], or a [`MonitorToMaster::StopRunner`] asking the
/// master to quiesce because the monitor is shutting down.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum MonitorToMaster {
    Response(u64, MonitorResponse),
    StopRunner,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum MonitorResponse {
    Configuration(Configuration),
    ExecFinished(ExecResult),
    RunnerKilled,
    CpusetSet(Result<(), String>),
}

/// How a sandbox launch ended, as reported to the master.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum ExecResult {
    /// The wrapped process ran and exited cleanly.
    Ok,
    /// The wrapped process died in the monitor's shutdown kill sweep; not a
    /// failure for accounting purposes.
    Shutdown,
    /// The launch failed before the wrapper was even running (cgroup
    /// creation, fifo creation, or spawn).
    Setup(String),
    /// The wrapper exited before sending the wrapped pid.
    WrapperStartup(String),
    /// The wrapped process exited non-zero or on a signal.
    RunnerFailed(String),
}

impl ExecResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecResult::Ok)
    }
}

impl Display for ExecResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ExecResult::Ok => write!(f, "exited cleanly"),
            ExecResult::Shutdown => write!(f, "killed by monitor shutdown"),
            ExecResult::Setup(err) => write!(f, "launch setup failed: {err}"),
            ExecResult::WrapperStartup(err) => write!(f, "{err}"),
            ExecResult::RunnerFailed(status) => write!(f, "runner failed: {status}"),
        }
    }
}

/// The monitor's configuration as reported to the master. `identity` is
/// re-read from the identity file on every request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Configuration {
    pub current_user: User,
    pub first_user_mapped: User,
    pub keep_runner_rootfs: bool,
    pub identity: Option<Vec<u8>>,
    /// CPU groups available for runners: each inner list is a set of
    /// hyperthread siblings. The master's own group is not included.
    pub cpu_pool: Vec<Vec<u32>>,
}

/// Message sent from the master to a runner over the runner's control pipe.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum RunnerRequest {
    /// Ask the runner to shut down cleanly. Acknowledged with
    /// [`RunnerResponse::Stopping`] before the runner exits.
    StopRunner,
    /// Liveness probe.
    Ping,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum RunnerResponse {
    Stopping,
    Pong,
}
