//! Core types shared by the monitor, wrapper, and runner binaries.

pub mod proto;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};
use std::path::PathBuf;

/// Identifier for a runner instance. Chosen by the monitor's client; unique
/// across the monitor's lifetime. `-1` is reserved for the master.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct RunnerId(pub i32);

impl RunnerId {
    pub const MASTER: Self = RunnerId(-1);
}

impl Display for RunnerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<i32> for RunnerId {
    fn from(id: i32) -> Self {
        RunnerId(id)
    }
}

/// A uid/gid pair describing one identity on the host or in a container.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

/// Semantic roles for id-map allocation inside a container.
///
/// Each role has a fixed container id base: `Superroot` is container id 0,
/// `User` ids start at 1, and `Root` is the designated non-zero id 1000 used
/// by the master for job files. Host ids are offset identically into the
/// subuid/subgid block, so a mapping covering all three roles spans container
/// ids 0..=1000 and needs 1001 consecutive host ids.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum UserKind {
    Superroot,
    Root,
    User,
}

impl UserKind {
    pub fn container_base(&self) -> u32 {
        match self {
            UserKind::Superroot => 0,
            UserKind::User => 1,
            UserKind::Root => ROOT_ID,
        }
    }
}

/// The container id of the [`UserKind::Root`] role.
pub const ROOT_ID: u32 = 1000;

/// The number of consecutive subuid/subgid ids a monitor host must provide:
/// enough to map container ids 0 through [`ROOT_ID`].
pub const MIN_SUBIDS: u32 = ROOT_ID + 1;

/// Whether an id-map entry applies to `uid_map` or `gid_map`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum IdKind {
    Uid,
    Gid,
}

/// One line of a `/proc/<pid>/uid_map` or `gid_map` file.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IdMap {
    pub kind: IdKind,
    pub container_id: u32,
    pub host_id: u32,
    pub length: u32,
}

/// Expand a high-level `[(UserKind, count)]` description into uid and gid map
/// entries, drawing host ids identity-offset from `first_user_mapped`.
pub fn idmaps_for(kinds: &[(UserKind, u32)], first_user_mapped: User) -> Vec<IdMap> {
    let mut maps = Vec::with_capacity(kinds.len() * 2);
    for &(kind, count) in kinds {
        let base = kind.container_base();
        maps.push(IdMap {
            kind: IdKind::Uid,
            container_id: base,
            host_id: first_user_mapped.uid + base,
            length: count,
        });
        maps.push(IdMap {
            kind: IdKind::Gid,
            container_id: base,
            host_id: first_user_mapped.gid + base,
            length: count,
        });
    }
    maps
}

/// Everything the wrapper needs to construct one sandbox and exec the target.
/// Sent as the single message over the monitor→wrapper fifo.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WrapperParameters {
    /// Absolute host path to use as the new root.
    pub rootfs: PathBuf,
    /// Lines to write to the new user namespace's uid and gid maps.
    pub idmaps: Vec<IdMap>,
    /// Program to exec and its full argv (`argv[0]` included).
    pub command: PathBuf,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Final identity assumed just before exec.
    pub runuid: u32,
    pub rungid: u32,
    /// Bind-mount host `/proc`, `/sys`, and `/dev` into the rootfs.
    pub bind_system_mount: bool,
    /// Bring up a loopback interface in the new network namespace. The
    /// namespace is created either way; without this it is left unconfigured.
    pub prepare_network: bool,
    /// Directory to chdir to after the pivot; defaults to `/`.
    pub workdir: Option<PathBuf>,
    /// Cgroup (relative to the cgroup fs root) the child must be placed in
    /// before exec.
    pub cgroup: Option<String>,
    /// CPU indices to write to the cgroup's `cpuset.cpus`.
    pub initial_cpuset: Option<Vec<u32>>,
    pub runner_id: RunnerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_idmaps_cover_the_three_roles() {
        let first = User {
            uid: 100000,
            gid: 200000,
        };
        let maps = idmaps_for(
            &[(UserKind::Superroot, 1), (UserKind::User, 1), (UserKind::Root, 1)],
            first,
        );
        assert_eq!(
            maps,
            vec![
                IdMap {
                    kind: IdKind::Uid,
                    container_id: 0,
                    host_id: 100000,
                    length: 1
                },
                IdMap {
                    kind: IdKind::Gid,
                    container_id: 0,
                    host_id: 200000,
                    length: 1
                },
                IdMap {
                    kind: IdKind::Uid,
                    container_id: 1,
                    host_id: 100001,
                    length: 1
                },
                IdMap {
                    kind: IdKind::Gid,
                    container_id: 1,
                    host_id: 200001,
                    length: 1
                },
                IdMap {
                    kind: IdKind::Uid,
                    container_id: 1000,
                    host_id: 101000,
                    length: 1
                },
                IdMap {
                    kind: IdKind::Gid,
                    container_id: 1000,
                    host_id: 201000,
                    length: 1
                },
            ]
        );
    }

    #[test]
    fn min_subids_covers_the_highest_container_id() {
        let maps = idmaps_for(
            &[(UserKind::Superroot, 1), (UserKind::User, 1), (UserKind::Root, 1)],
            User { uid: 0, gid: 0 },
        );
        let highest = maps
            .iter()
            .map(|m| m.host_id + m.length)
            .max()
            .unwrap();
        assert_eq!(highest, MIN_SUBIDS);
    }
}
