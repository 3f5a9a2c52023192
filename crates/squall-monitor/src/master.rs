//! The master side-channel: spawn the master as the distinguished first
//! runner and serve its requests over a named-pipe pair.

use crate::{fifo::FifoPair, supervisor::Monitor};
use anyhow::{bail, Context as _, Result};
use slog::{debug, Logger};
use squall_base::{
    idmaps_for,
    proto::{ExecResult, MasterToMonitor, MonitorRequest, MonitorResponse, MonitorToMaster},
    RunnerId, UserKind, WrapperParameters,
};
use squall_util::{net, sync};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::{self, JoinHandle},
};

/// The minimal PATH handed to the master child.
const MASTER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub struct MasterHandle {
    /// Resolves when the master's wrapper has been reaped.
    pub done: JoinHandle<ExecResult>,
}

fn master_parameters(monitor: &Monitor, master_bin: &Path, pipe_base: &Path) -> WrapperParameters {
    WrapperParameters {
        rootfs: "/".into(),
        idmaps: idmaps_for(
            &[(UserKind::Superroot, 1), (UserKind::User, 1), (UserKind::Root, 1)],
            monitor.conf.first_user_mapped,
        ),
        command: master_bin.to_owned(),
        argv: vec![
            master_bin.display().to_string(),
            pipe_base.display().to_string(),
        ],
        env: vec![("PATH".into(), MASTER_PATH.into())],
        runuid: 0,
        rungid: 0,
        bind_system_mount: false,
        prepare_network: false,
        workdir: None,
        cgroup: Some("master".into()),
        initial_cpuset: Some(monitor.conf.cpu_groups[0].clone()),
        runner_id: RunnerId::MASTER,
    }
}

/// Spawn the master and wire up its control pipes. Returns once both pipe
/// ends are attached and the serve loop is running.
pub async fn start(
    monitor: Arc<Monitor>,
    master_bin: PathBuf,
    data_dir: &Path,
    log: Logger,
) -> Result<MasterHandle> {
    let base = data_dir.join("master");
    let fifos = FifoPair::create(&base).context("creating master control pipes")?;

    let params = master_parameters(&monitor, &master_bin, &base);
    let mut done = {
        let monitor = monitor.clone();
        task::spawn(async move { monitor.exec_in_namespace(params).await })
    };

    // The master opens `.in` for reading first, then `.out` for writing; we
    // open in the same order from the other side so neither end deadlocks.
    // If the master dies before attaching, release the blocked opens and
    // fail startup.
    let mut opens = {
        let fifo_in = fifos.fifo_in.clone();
        let fifo_out = fifos.fifo_out.clone();
        task::spawn_blocking(move || -> Result<(File, File)> {
            let to_master = OpenOptions::new()
                .write(true)
                .open(&fifo_in)
                .context("opening master pipe for writing")?;
            let from_master =
                File::open(&fifo_out).context("opening master pipe for reading")?;
            Ok((to_master, from_master))
        })
    };
    let (to_master, from_master) = tokio::select! {
        exec_result = &mut done => {
            let _ = fifos.release_until_done(&mut opens).await;
            bail!(
                "master terminated before attaching its control pipes: {}",
                exec_result.context("master supervision task")?
            );
        }
        opens_result = &mut opens => opens_result.context("master pipe attach task")??,
    };

    let (response_sender, response_receiver) = mpsc::unbounded_channel();
    thread::spawn(move || net::pipe_writer(response_receiver, to_master));
    let (request_sender, request_receiver) = mpsc::unbounded_channel();
    thread::spawn(move || net::pipe_reader(from_master, request_sender, |msg| msg));

    monitor.set_master_sender(response_sender.clone());
    task::spawn(serve(monitor, request_receiver, response_sender, log));
    Ok(MasterHandle { done })
}

/// Dispatch requests from the master. Each request runs on its own task:
/// an exec request stays open for the runner's whole lifetime and must not
/// block the loop.
async fn serve(
    monitor: Arc<Monitor>,
    requests: UnboundedReceiver<MasterToMonitor>,
    responses: UnboundedSender<MonitorToMaster>,
    log: Logger,
) {
    sync::channel_reader(requests, |MasterToMonitor::Request(seq, request)| {
        debug!(log, "request from master"; "seq" => seq, "request" => ?request);
        let monitor = monitor.clone();
        let responses = responses.clone();
        let log = log.clone();
        task::spawn(async move {
            let response = match request {
                MonitorRequest::GetConfiguration => {
                    MonitorResponse::Configuration(monitor.configuration())
                }
                MonitorRequest::ExecInNamespace(params) => {
                    MonitorResponse::ExecFinished(monitor.exec_in_namespace(params).await)
                }
                MonitorRequest::KillRunner(runner_id) => {
                    monitor.kill_runner(runner_id).await;
                    MonitorResponse::RunnerKilled
                }
                MonitorRequest::SetCpuset { cgroup, cpus } => MonitorResponse::CpusetSet(
                    monitor
                        .set_cpuset(&cgroup, &cpus)
                        .map_err(|err| format!("{err:#}")),
                ),
            };
            if responses
                .send(MonitorToMaster::Response(seq, response))
                .is_err()
            {
                debug!(log, "master connection closed before response"; "seq" => seq);
            }
        });
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cgroups::FakeCgroups, supervisor::MonitorConf};
    use squall_base::{IdKind, User};
    use squall_util::log::test_logger;

    fn test_monitor() -> Arc<Monitor> {
        Monitor::new(
            MonitorConf {
                current_user: User { uid: 1000, gid: 1000 },
                first_user_mapped: User {
                    uid: 100000,
                    gid: 200000,
                },
                wrappers_dir: std::env::temp_dir(),
                cgroup: Some("squall".into()),
                cpuset_available: true,
                wrapper_bin: "/nonexistent".into(),
                keep_runner_rootfs: true,
                identity_file: None,
                cpu_groups: vec![vec![0, 4], vec![1, 5]],
            },
            Box::new(FakeCgroups::new()),
            test_logger(),
        )
    }

    #[test]
    fn master_parameters_follow_the_startup_contract() {
        let monitor = test_monitor();
        let params = master_parameters(
            &monitor,
            Path::new("/opt/squall/bin/squall-default-master"),
            Path::new("/var/lib/squall/master"),
        );
        assert_eq!(params.runner_id, RunnerId::MASTER);
        assert_eq!(params.rootfs, Path::new("/"));
        assert_eq!(params.runuid, 0);
        assert_eq!(params.rungid, 0);
        assert!(!params.bind_system_mount);
        assert!(!params.prepare_network);
        assert_eq!(params.cgroup.as_deref(), Some("master"));
        assert_eq!(params.initial_cpuset, Some(vec![0, 4]));
        assert_eq!(params.argv[1], "/var/lib/squall/master");
        assert_eq!(params.env, vec![("PATH".into(), MASTER_PATH.to_string())]);

        // Superroot at container id 0, one user id, and the designated root
        // id, for uids and gids both.
        let uids: Vec<_> = params
            .idmaps
            .iter()
            .filter(|map| map.kind == IdKind::Uid)
            .collect();
        assert_eq!(
            uids.iter().map(|map| map.container_id).collect::<Vec<_>>(),
            vec![0, 1, 1000]
        );
        assert_eq!(
            uids.iter().map(|map| map.host_id).collect::<Vec<_>>(),
            vec![100000, 100001, 101000]
        );
        let gids: Vec<_> = params
            .idmaps
            .iter()
            .filter(|map| map.kind == IdKind::Gid)
            .collect();
        assert_eq!(
            gids.iter().map(|map| map.host_id).collect::<Vec<_>>(),
            vec![200000, 200001, 201000]
        );
    }
}
