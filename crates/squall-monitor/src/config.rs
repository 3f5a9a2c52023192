use crate::cpu::CpuList;
use squall_util::config::LogLevel;
use std::path::PathBuf;

/// The monitor's resolved configuration. Built from the command line in
/// `main`; immutable afterwards.
#[derive(Debug)]
pub struct Config {
    /// Basename of the master binary, looked up in `binaries`.
    pub master: String,

    /// Directories searched for the master and wrapper binaries.
    pub binaries: Vec<PathBuf>,

    /// The monitor's working directory. `<data_dir>/wrappers` is wiped and
    /// recreated on every startup; the master control pipe also lives here.
    pub data_dir: PathBuf,

    /// File whose contents are forwarded to the master via
    /// `get_configuration`, re-read on every request.
    pub identity_file: Option<PathBuf>,

    /// Minimum log level to output, from the `--verbose` flag.
    pub log_level: LogLevel,

    /// Whether the master should keep runner root filesystems around.
    pub keep_runner_rootfs: bool,

    /// Root cgroup under which per-runner cgroups are created.
    pub cgroup: Option<String>,

    /// Maximum number of simultaneous workers.
    pub proc: usize,

    /// CPUs the monitor may hand out.
    pub cpus: Option<CpuList>,

    /// Whether to parse /proc/cpuinfo for hyperthread topology.
    pub cpuinfo: bool,
}
