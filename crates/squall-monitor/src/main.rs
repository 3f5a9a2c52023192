use anyhow::{Context as _, Result};
use clap::Parser;
use squall_monitor::{config::Config, cpu::CpuList};
use squall_util::{config::LogLevel, log};
use std::path::PathBuf;

/// The squall monitor. Long-lived supervisor that validates the host,
/// launches the master in a sandbox, and serves its requests to start, kill,
/// and pin further sandboxed runners.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Basename of the master binary to look up in the --binaries
    /// directories.
    #[arg(long, default_value = "squall-default-master")]
    master: String,

    /// Directory searched for the master and wrapper binaries. May be given
    /// multiple times; earlier directories win.
    #[arg(long, required = true)]
    binaries: Vec<PathBuf>,

    /// The monitor's working directory; must be writable.
    #[arg(long, default_value = "/var/lib/squall")]
    data_dir: PathBuf,

    /// File whose contents are forwarded to the master via
    /// get_configuration.
    #[arg(long)]
    identity_file: Option<PathBuf>,

    /// Verbosity: one of Debug, Info, Error.
    #[arg(long, default_value = "Info")]
    verbose: LogLevel,

    /// Runner root filesystems are kept by default; passing this flag asks
    /// the master to discard them instead.
    #[arg(long, action = clap::ArgAction::SetFalse)]
    keep_runner_rootfs: bool,

    /// Root cgroup under which per-runner cgroups are created.
    #[arg(long)]
    cgroup: Option<String>,

    /// Maximum number of simultaneous workers. Defaults to 4, or to the
    /// number of cpus when --cpuinfo is given.
    #[arg(long)]
    proc: Option<usize>,

    /// Comma-separated list of cpu indices or a-b intervals, e.g.
    /// "1,3,2,7,8-12,15".
    #[arg(long)]
    cpus: Option<CpuList>,

    /// Parse /proc/cpuinfo for hyperthread topology and enable cpuset
    /// pinning.
    #[arg(long)]
    cpuinfo: bool,

    /// Print the resolved configuration and exit.
    #[arg(short = 'P', long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let proc = cli
        .proc
        .unwrap_or(if cli.cpuinfo { num_cpus::get() } else { 4 });
    let config = Config {
        master: cli.master,
        binaries: cli.binaries,
        data_dir: cli.data_dir,
        identity_file: cli.identity_file,
        log_level: cli.verbose,
        keep_runner_rootfs: cli.keep_runner_rootfs,
        cgroup: cli.cgroup,
        proc,
        cpus: cli.cpus,
        cpuinfo: cli.cpuinfo,
    };
    if cli.print_config {
        println!("{config:#?}");
        return Ok(());
    }
    log::run_with_logger(config.log_level, |log| {
        tokio::runtime::Runtime::new()
            .context("starting tokio runtime")?
            .block_on(async move { squall_monitor::main(config, log).await })
    })
}

#[test]
fn test_cli() {
    use clap::CommandFactory;
    Cli::command().debug_assert()
}
