//! Cgroup manipulation behind a backend trait so the supervision logic can be
//! tested without a writable cgroup hierarchy.

use anyhow::{Context as _, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Where per-runner cgroups live and how cpusets are written to them. Cgroup
/// names are paths relative to the cgroup filesystem root, e.g. `squall/r7`.
pub trait CgroupBackend: Send + Sync {
    fn create(&self, cgroup: &str) -> Result<()>;
    fn set_cpuset(&self, cgroup: &str, cpus: &[u32]) -> Result<()>;
}

/// The comma-separated list format `cpuset.cpus` accepts.
pub fn format_cpuset(cpus: &[u32]) -> String {
    cpus.iter()
        .map(|cpu| cpu.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Production backend: direct writes under the cgroup2 filesystem.
pub struct SysFsCgroups {
    root: PathBuf,
}

impl SysFsCgroups {
    pub fn new() -> Self {
        Self::with_root("/sys/fs/cgroup".into())
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Default for SysFsCgroups {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupBackend for SysFsCgroups {
    fn create(&self, cgroup: &str) -> Result<()> {
        let dir = self.root.join(cgroup);
        fs::create_dir_all(&dir).with_context(|| {
            format!(
                "failed to create cgroup {}; create it and delegate it to this user with: \
                 `sudo mkdir -p {}` then `sudo chown -R $(id -un):$(id -gn) {}`",
                cgroup,
                dir.display(),
                dir.display()
            )
        })
    }

    fn set_cpuset(&self, cgroup: &str, cpus: &[u32]) -> Result<()> {
        let path = self.root.join(cgroup).join("cpuset.cpus");
        fs::write(&path, format!("{}\n", format_cpuset(cpus)))
            .with_context(|| format!("writing {}", path.display()))
    }
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct FakeCgroups {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    created: HashSet<String>,
    cpusets: HashMap<String, Vec<u32>>,
}

impl FakeCgroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Vec<String> {
        let mut created: Vec<_> = self.state.lock().unwrap().created.iter().cloned().collect();
        created.sort();
        created
    }

    pub fn cpuset(&self, cgroup: &str) -> Option<Vec<u32>> {
        self.state.lock().unwrap().cpusets.get(cgroup).cloned()
    }
}

impl CgroupBackend for FakeCgroups {
    fn create(&self, cgroup: &str) -> Result<()> {
        self.state.lock().unwrap().created.insert(cgroup.into());
        Ok(())
    }

    fn set_cpuset(&self, cgroup: &str, cpus: &[u32]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .cpusets
            .insert(cgroup.into(), cpus.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpuset_format_is_a_comma_list() {
        assert_eq!(format_cpuset(&[2, 3]), "2,3");
        assert_eq!(format_cpuset(&[7]), "7");
        assert_eq!(format_cpuset(&[]), "");
    }

    #[test]
    fn sysfs_backend_creates_and_writes_under_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SysFsCgroups::with_root(dir.path().into());
        backend.create("squall/r7").unwrap();
        assert!(dir.path().join("squall/r7").is_dir());

        backend.set_cpuset("squall/r7", &[2, 3]).unwrap();
        let written = fs::read_to_string(dir.path().join("squall/r7/cpuset.cpus")).unwrap();
        assert_eq!(written, "2,3\n");
    }

    #[test]
    fn sysfs_backend_reports_a_remediation_hint() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the cgroup directory should go makes create fail.
        fs::write(dir.path().join("squall"), "").unwrap();
        let backend = SysFsCgroups::with_root(dir.path().into());
        let err = backend.create("squall/r7").unwrap_err();
        assert!(format!("{err:#}").contains("sudo mkdir -p"));
    }

    #[test]
    fn fake_backend_records_operations() {
        let fake = FakeCgroups::new();
        fake.create("squall/master").unwrap();
        fake.set_cpuset("squall/master", &[0, 4]).unwrap();
        assert_eq!(fake.created(), vec!["squall/master".to_string()]);
        assert_eq!(fake.cpuset("squall/master"), Some(vec![0, 4]));
        assert_eq!(fake.cpuset("squall/other"), None);
    }
}
