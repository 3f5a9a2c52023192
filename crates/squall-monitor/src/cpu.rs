//! CPU topology discovery and partitioning.
//!
//! `/proc/cpuinfo` tells us which logical processors are hyperthread siblings
//! (same physical package and core). The monitor hands the first sibling
//! group to the master and the rest out as per-runner cpusets, so two runners
//! never share a core unless the master decides they should.

use anyhow::{bail, Context as _, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CpuData {
    pub processor: u32,
    pub physical_id: u32,
    pub core_id: u32,
}

#[derive(Clone, Debug)]
pub struct CpuInfo {
    pub nb_cpus: usize,
    pub cpu_datas: HashMap<u32, CpuData>,
    /// Processors grouped by `(physical_id, core_id)`: each inner list is a
    /// set of hyperthread siblings.
    pub layout: Vec<Vec<CpuData>>,
}

impl CpuInfo {
    /// Parse the standard Linux `/proc/cpuinfo` format: records separated by
    /// blank lines, `key : value` fields. Records without a `processor` field
    /// are ignored; duplicate processor numbers are fatal.
    pub fn parse(text: &str) -> Result<Self> {
        let mut cpu_datas = HashMap::new();
        for record in text.split("\n\n") {
            let mut processor = None;
            let mut physical_id = None;
            let mut core_id = None;
            for line in record.lines() {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                let (key, value) = (key.trim(), value.trim());
                match key {
                    "processor" => {
                        processor =
                            Some(value.parse().context("invalid processor field in cpuinfo")?)
                    }
                    "physical id" => {
                        physical_id =
                            Some(value.parse().context("invalid physical id field in cpuinfo")?)
                    }
                    "core id" => {
                        core_id = Some(value.parse().context("invalid core id field in cpuinfo")?)
                    }
                    _ => {}
                }
            }
            let Some(processor) = processor else {
                continue;
            };
            let data = CpuData {
                processor,
                // Some virtualized kernels omit the topology fields; treat
                // each such processor as its own core.
                physical_id: physical_id.unwrap_or(0),
                core_id: core_id.unwrap_or(processor),
            };
            if cpu_datas.insert(processor, data).is_some() {
                bail!("duplicate processor {processor} in cpuinfo");
            }
        }
        if cpu_datas.is_empty() {
            bail!("no processors found in cpuinfo");
        }

        let mut processors: Vec<CpuData> = cpu_datas.values().copied().collect();
        processors.sort_by_key(|data| data.processor);
        let mut groups: BTreeMap<(u32, u32), Vec<CpuData>> = BTreeMap::new();
        for data in processors {
            groups
                .entry((data.physical_id, data.core_id))
                .or_default()
                .push(data);
        }
        Ok(CpuInfo {
            nb_cpus: cpu_datas.len(),
            cpu_datas,
            layout: groups.into_values().collect(),
        })
    }

    pub fn read() -> Result<Self> {
        Self::parse(&std::fs::read_to_string("/proc/cpuinfo").context("reading /proc/cpuinfo")?)
    }
}

/// Restrict each sibling group to the processors in `cpus`, dropping groups
/// that end up empty.
pub fn partition_cpus(info: &CpuInfo, cpus: &[u32]) -> Vec<Vec<u32>> {
    let wanted: HashSet<u32> = cpus.iter().copied().collect();
    info.layout
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|data| data.processor)
                .filter(|processor| wanted.contains(processor))
                .collect::<Vec<_>>()
        })
        .filter(|group| !group.is_empty())
        .collect()
}

/// The CPU groups the monitor will use: group 0 for the master, the rest as
/// the runner pool. Without topology information every cpu is its own
/// singleton group and cpuset pinning is unavailable. At most `proc + 1`
/// groups are returned (the master's plus `proc` worker groups).
pub fn cpu_groups(info: Option<&CpuInfo>, cpus: Option<&CpuList>, proc: usize) -> Vec<Vec<u32>> {
    let mut groups = match info {
        Some(info) => {
            let all: Vec<u32> = match cpus {
                Some(list) => list.0.clone(),
                None => {
                    let mut all: Vec<u32> = info.cpu_datas.keys().copied().collect();
                    all.sort_unstable();
                    all
                }
            };
            partition_cpus(info, &all)
        }
        None => {
            let singletons: Vec<u32> = match cpus {
                Some(list) => list.0.clone(),
                None => (0..proc as u32).collect(),
            };
            singletons.into_iter().map(|processor| vec![processor]).collect()
        }
    };
    groups.truncate(proc + 1);
    groups
}

/// A user-supplied cpu list: comma-separated indices or `a-b` intervals,
/// e.g. `1,3,2,7,8-12,15`. Formatting preserves the set of processors, not
/// the original order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CpuList(pub Vec<u32>);

impl FromStr for CpuList {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let mut cpus = Vec::new();
        for part in value.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((low, high)) => {
                    let low: u32 = low.trim().parse().context("invalid cpu interval")?;
                    let high: u32 = high.trim().parse().context("invalid cpu interval")?;
                    if low > high {
                        bail!("invalid cpu interval {part}");
                    }
                    cpus.extend(low..=high);
                }
                None => cpus.push(part.parse().with_context(|| format!("invalid cpu {part:?}"))?),
            }
        }
        if cpus.is_empty() {
            bail!("empty cpu list");
        }
        Ok(CpuList(cpus))
    }
}

impl Display for CpuList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut cpus = self.0.clone();
        cpus.sort_unstable();
        cpus.dedup();
        let mut first = true;
        let mut i = 0;
        while i < cpus.len() {
            let mut j = i;
            while j + 1 < cpus.len() && cpus[j + 1] == cpus[j] + 1 {
                j += 1;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if j > i {
                write!(f, "{}-{}", cpus[i], cpus[j])?;
            } else {
                write!(f, "{}", cpus[i])?;
            }
            i = j + 1;
        }
        Ok(())
    }
}
