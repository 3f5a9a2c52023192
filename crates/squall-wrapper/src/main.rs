//! The privileged per-runner helper.
//!
//! Invoked as `squall-wrapper <pipe-base>`. Reads one parameter block from
//! `<pipe-base>.in`, builds the sandbox (namespaces, id maps, rootfs, cgroup,
//! network), forks the wrapped process, writes its pid to `<pipe-base>.out`,
//! and finally exits with the wrapped process's status. Any setup failure
//! exits non-zero without touching `.out`; the monitor detects that by
//! observing wrapper death before the pid arrives.

mod sandbox;

use anyhow::{Context as _, Result};
use nix::{
    sys::wait::{waitpid, WaitStatus},
    unistd::{self, ForkResult, Gid, Pid, Uid},
};
use squall_base::WrapperParameters;
use squall_util::net;
use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::process;

/// Exit code of the wrapped child when its exec fails, distinguishing an
/// unrunnable command from a command that ran and failed.
const EXEC_FAILED: i32 = 127;

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("squall-wrapper: {err:#}");
            process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let base = PathBuf::from(
        std::env::args_os()
            .nth(1)
            .context("usage: squall-wrapper <pipe-base>")?,
    );
    let params = read_parameters(&base)?;
    sandbox::enter(&params)?;
    let child = spawn_wrapped(&params)?;
    reply_pid(&base, child)?;
    let status = waitpid(child, None).context("waiting for wrapped process")?;
    Ok(exit_code(status))
}

fn read_parameters(base: &Path) -> Result<WrapperParameters> {
    let mut pipe = File::open(base.with_extension("in")).context("opening parameter pipe")?;
    net::read_message_from_pipe(&mut pipe).context("reading wrapper parameters")
}

fn reply_pid(base: &Path, pid: Pid) -> Result<()> {
    let mut pipe = OpenOptions::new()
        .write(true)
        .open(base.with_extension("out"))
        .context("opening pid pipe")?;
    net::write_message_to_pipe(&mut pipe, pid.as_raw()).context("writing wrapped pid")
}

fn spawn_wrapped(params: &WrapperParameters) -> Result<Pid> {
    // Everything the child needs is built before the fork; afterwards it only
    // drops privileges, changes directory, and execs.
    let command = CString::new(params.command.as_os_str().as_bytes())?;
    let argv = params
        .argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let env = params
        .env
        .iter()
        .map(|(key, value)| CString::new(format!("{key}={value}")))
        .collect::<Result<Vec<_>, _>>()?;
    let workdir = CString::new(
        params
            .workdir
            .as_deref()
            .unwrap_or(Path::new("/"))
            .as_os_str()
            .as_bytes(),
    )?;

    match unsafe { unistd::fork() }.context("forking wrapped process")? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            if let Err(err) =
                exec_wrapped(params.rungid, params.runuid, &workdir, &command, &argv, &env)
            {
                eprintln!("squall-wrapper: exec {:?} failed: {err:#}", params.command);
            }
            unsafe { libc::_exit(EXEC_FAILED) }
        }
    }
}

fn exec_wrapped(
    rungid: u32,
    runuid: u32,
    workdir: &CStr,
    command: &CStr,
    argv: &[CString],
    env: &[CString],
) -> Result<Infallible> {
    let gid = Gid::from_raw(rungid);
    unistd::setresgid(gid, gid, gid).context("setresgid")?;
    let uid = Uid::from_raw(runuid);
    unistd::setresuid(uid, uid, uid).context("setresuid")?;
    unistd::chdir(workdir).context("chdir to workdir")?;
    Ok(unistd::execve(command, argv, env).context("execve")?)
}

/// Map the wrapped process's wait status to our own exit code: the exit code
/// itself, or 128+signo for signal deaths.
fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        other => {
            eprintln!("squall-wrapper: unexpected wait status {other:?}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn exit_code_forwards_exit_statuses() {
        assert_eq!(exit_code(WaitStatus::Exited(Pid::from_raw(10), 0)), 0);
        assert_eq!(exit_code(WaitStatus::Exited(Pid::from_raw(10), 3)), 3);
    }

    #[test]
    fn exit_code_maps_signal_deaths_past_128() {
        assert_eq!(
            exit_code(WaitStatus::Signaled(Pid::from_raw(10), Signal::SIGKILL, false)),
            137
        );
        assert_eq!(
            exit_code(WaitStatus::Signaled(Pid::from_raw(10), Signal::SIGTERM, false)),
            143
        );
    }
}
