//! Sandbox construction: cgroup membership, namespaces, id maps, rootfs,
//! loopback.

use anyhow::{bail, Context as _, Result};
use netlink_packet_core::{NetlinkMessage, NLM_F_ACK, NLM_F_REQUEST};
use netlink_packet_route::{rtnl::constants::RTM_SETLINK, LinkMessage, RtnlMessage, IFF_UP};
use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{unshare, CloneFlags},
    unistd,
};
use squall_base::{IdKind, IdMap, WrapperParameters};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Build the sandbox around the current process. On return the process is in
/// fresh user/pid/mount/ipc/uts/net namespaces with id maps written, the
/// rootfs pivoted, cgroup membership established, and (optionally) loopback
/// up. The next fork lands the child in the new pid namespace.
pub fn enter(params: &WrapperParameters) -> Result<()> {
    // Cgroup membership is inherited across fork, and the host cgroup
    // filesystem is unreachable once we pivot, so join first.
    if let Some(cgroup) = &params.cgroup {
        join_cgroup(cgroup, params.initial_cpuset.as_deref())
            .with_context(|| format!("joining cgroup {cgroup}"))?;
    }
    // The user namespace must come first so the other namespaces are created
    // under it; one unshare does all of them in the right order.
    unshare(
        CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWNET,
    )
    .context("unsharing namespaces")?;
    write_idmaps(&params.idmaps).context("writing id maps")?;
    setup_rootfs(&params.rootfs, params.bind_system_mount)
        .with_context(|| format!("setting up rootfs {}", params.rootfs.display()))?;
    if params.prepare_network {
        bring_loopback_up().context("bringing loopback up")?;
    }
    Ok(())
}

fn join_cgroup(cgroup: &str, cpuset: Option<&[u32]>) -> Result<()> {
    let dir = Path::new(CGROUP_ROOT).join(cgroup);
    fs::write(dir.join("cgroup.procs"), format!("{}\n", unistd::getpid()))
        .context("adding self to cgroup.procs")?;
    if let Some(cpus) = cpuset {
        fs::write(dir.join("cpuset.cpus"), format!("{}\n", cpuset_line(cpus)))
            .context("writing cpuset.cpus")?;
    }
    Ok(())
}

fn cpuset_line(cpus: &[u32]) -> String {
    cpus.iter()
        .map(|cpu| cpu.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// The `uid_map` and `gid_map` file contents for a set of map entries.
fn render_idmaps(idmaps: &[IdMap]) -> (String, String) {
    let mut uid_map = String::new();
    let mut gid_map = String::new();
    for map in idmaps {
        let target = match map.kind {
            IdKind::Uid => &mut uid_map,
            IdKind::Gid => &mut gid_map,
        };
        let _ = writeln!(target, "{} {} {}", map.container_id, map.host_id, map.length);
    }
    (uid_map, gid_map)
}

fn write_idmaps(idmaps: &[IdMap]) -> Result<()> {
    let (uid_map, gid_map) = render_idmaps(idmaps);
    fs::write("/proc/self/uid_map", uid_map).context("writing /proc/self/uid_map")?;
    // The kernel rejects gid maps while setgroups is still allowed.
    fs::write("/proc/self/setgroups", "deny\n").context("writing /proc/self/setgroups")?;
    fs::write("/proc/self/gid_map", gid_map).context("writing /proc/self/gid_map")?;
    Ok(())
}

fn setup_rootfs(rootfs: &Path, bind_system_mount: bool) -> Result<()> {
    // Stop our mount activity from propagating back out.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("making / private")?;
    // pivot_root needs the new root to be a mount point.
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| format!("bind-mounting {}", rootfs.display()))?;
    if bind_system_mount {
        for name in ["proc", "sys", "dev"] {
            let source = PathBuf::from("/").join(name);
            let target = rootfs.join(name);
            fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
            mount(
                Some(&source),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .with_context(|| format!("bind-mounting {} into the rootfs", source.display()))?;
        }
    }
    unistd::chdir(rootfs).context("entering rootfs")?;
    // pivot_root with new_root == put_old stacks the old root under the new
    // one; detaching "." then drops it. Some setups (rootfs directly on the
    // initial root mount) refuse pivot_root, where chroot still works.
    match unistd::pivot_root(".", ".") {
        Ok(()) => {
            umount2(".", MntFlags::MNT_DETACH).context("detaching old root")?;
        }
        Err(_) => {
            unistd::chroot(".").context("chrooting into rootfs")?;
        }
    }
    unistd::chdir("/").context("entering new root")?;
    Ok(())
}

/// Set IFF_UP on the loopback interface via rtnetlink inside the new network
/// namespace.
fn bring_loopback_up() -> Result<()> {
    let mut link = LinkMessage::default();
    link.header.index = 1; // loopback
    link.header.flags |= IFF_UP;
    link.header.change_mask |= IFF_UP;
    let mut message = NetlinkMessage::from(RtnlMessage::SetLink(link));
    message.header.flags = NLM_F_REQUEST | NLM_F_ACK;
    message.header.message_type = RTM_SETLINK;
    message.header.length = message.buffer_len() as u32;
    let mut buffer = vec![0; message.buffer_len()];
    message.serialize(&mut buffer[..]);

    struct Fd(libc::c_int);
    impl Drop for Fd {
        fn drop(&mut self) {
            unsafe { libc::close(self.0) };
        }
    }

    let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE) };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("opening rtnetlink socket");
    }
    let fd = Fd(fd);

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    let rc = unsafe {
        libc::bind(
            fd.0,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("binding rtnetlink socket");
    }

    let rc = unsafe { libc::send(fd.0, buffer.as_ptr().cast(), buffer.len(), 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("sending rtnetlink message");
    }

    let mut reply = [0u8; 1024];
    let received = unsafe { libc::recv(fd.0, reply.as_mut_ptr().cast(), reply.len(), 0) };
    if received < 0 {
        return Err(io::Error::last_os_error()).context("receiving rtnetlink ack");
    }
    // The ack is an NLMSG_ERROR whose payload starts with the error code; 0
    // means success.
    if received as usize >= 20 {
        let errno = i32::from_ne_bytes(reply[16..20].try_into().unwrap());
        if errno != 0 {
            bail!("rtnetlink refused to bring lo up: errno {}", -errno);
        }
    }
    Ok(())
}
