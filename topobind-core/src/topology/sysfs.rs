//! Topology discovery from Linux sysfs
//!
//! Reads cores, hardware threads and caches from `/sys/devices/system/cpu`
//! and binds threads through `core_affinity`. Hosts without sysfs fall back
//! to the CPU counts `num_cpus` reports.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use core_affinity::CoreId;

use crate::error::{ObjectKind, TopologyError};
use crate::topology::{
    BindMode, BindingSupport, CacheAttributes, CacheKind, TopologyObject, TopologyService,
};

/// Default sysfs directory describing CPUs
pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Topology of the local host
#[derive(Clone)]
pub struct SysfsTopology {
    /// Cores in logical order
    cores: Vec<TopologyObject>,
    /// PUs in logical order, grouped by core
    pus: Vec<TopologyObject>,
    /// First data or unified cache of each level, ordered by level
    caches: Vec<CacheAttributes>,
    /// Were the objects read from sysfs?
    discovered: bool,
}

impl fmt::Debug for SysfsTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysfsTopology")
            .field("cores", &self.cores.len())
            .field("pus", &self.pus.len())
            .field("cache_levels", &self.caches.len())
            .field("discovered", &self.discovered)
            .finish()
    }
}

impl SysfsTopology {
    /// Detect the topology of the current host
    ///
    /// Only CPUs the calling thread may run on are kept, so a process
    /// confined to a cpuset sees just its share of the host.
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            let allowed = allowed_cpus();
            match Self::from_root_with_allowed(Path::new(SYSFS_CPU_ROOT), allowed.as_deref()) {
                Ok(topo) => return topo,
                Err(err) => {
                    tracing::debug!("sysfs topology discovery failed: {}", err);
                }
            }
        }

        Self::fallback()
    }

    /// Read the topology below a sysfs CPU directory
    pub fn from_root(root: &Path) -> Result<Self, TopologyError> {
        Self::from_root_with_allowed(root, None)
    }

    /// Read the topology below a sysfs CPU directory, keeping only the CPUs
    /// in `allowed`
    ///
    /// Cores left without any allowed CPU are dropped. `None` keeps every
    /// online CPU.
    pub fn from_root_with_allowed(
        root: &Path,
        allowed: Option<&[usize]>,
    ) -> Result<Self, TopologyError> {
        let online = fs::read_to_string(root.join("online"))?;
        let mut cpus = Self::parse_cpu_list(&online);
        if let Some(allowed) = allowed {
            let online_count = cpus.len();
            cpus.retain(|cpu| allowed.contains(cpu));
            if cpus.len() < online_count {
                tracing::debug!(
                    "Process may run on {} of {} online CPUs",
                    cpus.len(),
                    online_count
                );
            }
        }
        if cpus.is_empty() {
            return Err(TopologyError::MissingObjects(ObjectKind::Pu));
        }

        // (package, core id) -> OS CPU numbers; BTreeMap keeps packages and cores in order
        let mut core_map: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
        for &cpu in &cpus {
            let topo_dir = root.join(format!("cpu{cpu}")).join("topology");
            let package = read_usize(&topo_dir.join("physical_package_id")).unwrap_or(0);
            let core_id = read_usize(&topo_dir.join("core_id")).unwrap_or(cpu);
            core_map.entry((package, core_id)).or_default().push(cpu);
        }

        let mut cores = Vec::with_capacity(core_map.len());
        let mut pus = Vec::with_capacity(cpus.len());
        for (core_idx, mut siblings) in core_map.into_values().enumerate() {
            siblings.sort_unstable();
            // core_id repeats across packages; the first sibling's CPU number does not
            cores.push(TopologyObject::new(core_idx, siblings[0]));
            for cpu in siblings {
                pus.push(TopologyObject::new(pus.len(), cpu));
            }
        }

        let caches = Self::read_caches(&root.join(format!("cpu{}", pus[0].os_index)).join("cache"));

        Ok(Self {
            cores,
            pus,
            caches,
            discovered: true,
        })
    }

    /// Counts from `num_cpus`, with PUs assumed to be numbered core by core
    fn fallback() -> Self {
        let logical = num_cpus::get().max(1);
        let physical = match num_cpus::get_physical() {
            count if count > 0 && logical % count == 0 => count,
            _ => logical,
        };

        Self {
            cores: (0..physical).map(|i| TopologyObject::new(i, i)).collect(),
            pus: (0..logical).map(|i| TopologyObject::new(i, i)).collect(),
            caches: Vec::new(),
            discovered: false,
        }
    }

    /// Were the objects read from sysfs rather than assumed?
    pub fn is_discovered(&self) -> bool {
        self.discovered
    }

    /// Read the data and unified caches of one CPU
    fn read_caches(cache_dir: &Path) -> Vec<CacheAttributes> {
        let mut index_dirs: Vec<(usize, PathBuf)> = match fs::read_dir(cache_dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter_map(|entry| {
                    let name = entry.file_name();
                    let index = name.to_str()?.strip_prefix("index")?.parse::<usize>().ok()?;
                    Some((index, entry.path()))
                })
                .collect(),
            Err(_) => return Vec::new(),
        };
        index_dirs.sort_unstable_by_key(|(index, _)| *index);

        let mut by_level: BTreeMap<usize, CacheAttributes> = BTreeMap::new();
        for (_, dir) in index_dirs {
            let Some(level) = read_usize(&dir.join("level")) else {
                continue;
            };
            let kind = match read_trimmed(&dir.join("type")).as_deref() {
                Some("Data") => CacheKind::Data,
                Some("Unified") => CacheKind::Unified,
                Some("Instruction") => CacheKind::Instruction,
                _ => continue,
            };
            if !kind.holds_data() {
                continue;
            }

            let attrs = CacheAttributes {
                level,
                kind,
                size: read_trimmed(&dir.join("size"))
                    .and_then(|s| Self::parse_cache_size(&s))
                    .unwrap_or(0),
                line_size: read_usize(&dir.join("coherency_line_size")).unwrap_or(0) as u32,
                associativity: read_usize(&dir.join("ways_of_associativity")).unwrap_or(0) as u32,
            };
            by_level.entry(level).or_insert(attrs);
        }

        by_level.into_values().collect()
    }

    /// Parse a CPU list string like "0-2,4,6-8" into a vector of CPU IDs
    fn parse_cpu_list(cpulist: &str) -> Vec<usize> {
        let mut cpus = Vec::new();

        for part in cpulist.trim().split(',') {
            if let Some((start, end)) = part.split_once('-') {
                // Range like "0-3"
                if let (Ok(start), Ok(end)) = (start.trim().parse::<usize>(), end.trim().parse::<usize>()) {
                    cpus.extend(start..=end);
                }
            } else if let Ok(cpu) = part.trim().parse::<usize>() {
                cpus.push(cpu);
            }
        }

        cpus
    }

    /// Parse a sysfs cache size like "32K", "1024K" or "8M" into bytes
    fn parse_cache_size(size: &str) -> Option<u64> {
        let size = size.trim();
        let (digits, multiplier) = match size.chars().last()? {
            'K' | 'k' => (&size[..size.len() - 1], 1024),
            'M' | 'm' => (&size[..size.len() - 1], 1024 * 1024),
            'G' | 'g' => (&size[..size.len() - 1], 1024 * 1024 * 1024),
            _ => (size, 1),
        };
        digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
    }
}

impl TopologyService for SysfsTopology {
    fn support(&self) -> BindingSupport {
        BindingSupport {
            discovery_pu: self.discovered,
            set_thread_binding: cfg!(any(
                target_os = "linux",
                target_os = "android",
                target_os = "windows",
                target_os = "freebsd"
            )),
            get_thread_binding: cfg!(any(target_os = "linux", target_os = "android")),
            strict_binding: cfg!(any(target_os = "linux", target_os = "android")),
        }
    }

    fn core_count(&self) -> Option<usize> {
        (!self.cores.is_empty()).then_some(self.cores.len())
    }

    fn pu_count(&self) -> Option<usize> {
        (!self.pus.is_empty()).then_some(self.pus.len())
    }

    fn core(&self, index: usize) -> Option<TopologyObject> {
        self.cores.get(index).copied()
    }

    fn pu(&self, index: usize) -> Option<TopologyObject> {
        self.pus.get(index).copied()
    }

    fn data_cache(&self, level: usize) -> Option<CacheAttributes> {
        self.caches.iter().find(|cache| cache.level == level).copied()
    }

    fn bind_current_thread(&self, pu: &TopologyObject, mode: BindMode) -> Result<(), TopologyError> {
        let support = self.support();
        if !support.set_thread_binding {
            return Err(TopologyError::BindingUnsupported);
        }
        if mode == BindMode::Strict && !support.strict_binding {
            return Err(TopologyError::BindRejected {
                pu: pu.os_index,
                reason: "strict binding not available".into(),
            });
        }

        if !core_affinity::set_for_current(CoreId { id: pu.os_index }) {
            return Err(TopologyError::BindRejected {
                pu: pu.os_index,
                reason: "operating system refused the affinity mask".into(),
            });
        }

        if mode == BindMode::Strict {
            // Strict means the mask now holds exactly the requested PU
            let current = self.current_thread_binding()?;
            if current != [pu.os_index] {
                return Err(TopologyError::BindRejected {
                    pu: pu.os_index,
                    reason: format!("thread may still run on {current:?}"),
                });
            }
        }

        Ok(())
    }

    fn current_thread_binding(&self) -> Result<Vec<usize>, TopologyError> {
        if !self.support().get_thread_binding {
            return Err(TopologyError::BindingUnsupported);
        }
        let mut ids: Vec<usize> = core_affinity::get_core_ids()
            .ok_or(TopologyError::BindingUnsupported)?
            .into_iter()
            .map(|core| core.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

/// CPUs in the calling thread's affinity mask, if it can be read
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn allowed_cpus() -> Option<Vec<usize>> {
    let ids: Vec<usize> = core_affinity::get_core_ids()?
        .into_iter()
        .map(|core| core.id)
        .collect();
    (!ids.is_empty()).then_some(ids)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_usize(path: &Path) -> Option<usize> {
    read_trimmed(path)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes a fake sysfs CPU tree and removes it on drop
    struct FakeSysfs {
        root: PathBuf,
    }

    impl FakeSysfs {
        fn new() -> Self {
            let root = std::env::temp_dir().join(format!("topobind_sysfs_{}", uuid::Uuid::new_v4()));
            fs::create_dir_all(&root).unwrap();
            Self { root }
        }

        fn write(&self, rel: &str, contents: &str) {
            let path = self.root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }

        fn cpu(&self, cpu: usize, package: usize, core_id: usize) {
            self.write(&format!("cpu{cpu}/topology/physical_package_id"), &format!("{package}\n"));
            self.write(&format!("cpu{cpu}/topology/core_id"), &format!("{core_id}\n"));
        }

        fn cache(&self, cpu: usize, index: usize, level: usize, kind: &str, size: &str, line: u32, ways: u32) {
            let dir = format!("cpu{cpu}/cache/index{index}");
            self.write(&format!("{dir}/level"), &format!("{level}\n"));
            self.write(&format!("{dir}/type"), &format!("{kind}\n"));
            self.write(&format!("{dir}/size"), &format!("{size}\n"));
            self.write(&format!("{dir}/coherency_line_size"), &format!("{line}\n"));
            self.write(&format!("{dir}/ways_of_associativity"), &format!("{ways}\n"));
        }
    }

    impl Drop for FakeSysfs {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn test_sysfs_detect() {
        let topo = SysfsTopology::detect();
        println!("Detected topology: {:?}", topo);

        assert!(topo.core_count().unwrap() > 0);
        assert!(topo.pu_count().unwrap() >= topo.core_count().unwrap());
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(SysfsTopology::parse_cpu_list("0-2,4,6-8"), vec![0, 1, 2, 4, 6, 7, 8]);
        assert_eq!(SysfsTopology::parse_cpu_list("0\n"), vec![0]);
        assert_eq!(SysfsTopology::parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(SysfsTopology::parse_cpu_list(""), Vec::<usize>::new());
    }

    #[test]
    fn test_parse_cache_size() {
        assert_eq!(SysfsTopology::parse_cache_size("32K"), Some(32 * 1024));
        assert_eq!(SysfsTopology::parse_cache_size("8M"), Some(8 * 1024 * 1024));
        assert_eq!(SysfsTopology::parse_cache_size("512"), Some(512));
        assert_eq!(SysfsTopology::parse_cache_size("K"), None);
        assert_eq!(SysfsTopology::parse_cache_size(""), None);
    }

    #[test]
    fn test_from_root_groups_smt_siblings() {
        // 2 cores x 2 threads, Linux-style numbering: cpu0/cpu2 and cpu1/cpu3 are siblings
        let sysfs = FakeSysfs::new();
        sysfs.write("online", "0-3\n");
        sysfs.cpu(0, 0, 0);
        sysfs.cpu(1, 0, 1);
        sysfs.cpu(2, 0, 0);
        sysfs.cpu(3, 0, 1);

        let topo = SysfsTopology::from_root(&sysfs.root).unwrap();
        assert!(topo.is_discovered());
        assert_eq!(topo.core_count(), Some(2));
        assert_eq!(topo.pu_count(), Some(4));
        assert_eq!(topo.core(0), Some(TopologyObject::new(0, 0)));
        assert_eq!(topo.core(1), Some(TopologyObject::new(1, 1)));

        let os_order: Vec<usize> = (0..4).map(|i| topo.pu(i).unwrap().os_index).collect();
        assert_eq!(os_order, vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_from_root_orders_packages() {
        let sysfs = FakeSysfs::new();
        sysfs.write("online", "0-1\n");
        sysfs.cpu(0, 1, 0);
        sysfs.cpu(1, 0, 0);

        let topo = SysfsTopology::from_root(&sysfs.root).unwrap();
        assert_eq!(topo.core_count(), Some(2));
        assert_eq!(topo.pu(0).unwrap().os_index, 1);
        assert_eq!(topo.pu(1).unwrap().os_index, 0);
    }

    #[test]
    fn test_cores_of_two_packages_have_distinct_os_indices() {
        // Both packages number their cores from 0
        let sysfs = FakeSysfs::new();
        sysfs.write("online", "0-3\n");
        sysfs.cpu(0, 0, 0);
        sysfs.cpu(1, 0, 1);
        sysfs.cpu(2, 1, 0);
        sysfs.cpu(3, 1, 1);

        let topo = SysfsTopology::from_root(&sysfs.root).unwrap();
        let os_indices: Vec<usize> = (0..4).map(|i| topo.core(i).unwrap().os_index).collect();
        assert_eq!(os_indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_from_root_keeps_only_allowed_cpus() {
        // 2 cores x 2 threads: cpu0/cpu2 on core 0, cpu1/cpu3 on core 1
        let sysfs = FakeSysfs::new();
        sysfs.write("online", "0-3\n");
        sysfs.cpu(0, 0, 0);
        sysfs.cpu(1, 0, 1);
        sysfs.cpu(2, 0, 0);
        sysfs.cpu(3, 0, 1);

        let topo = SysfsTopology::from_root_with_allowed(&sysfs.root, Some(&[0, 1])).unwrap();
        assert_eq!(topo.core_count(), Some(2));
        assert_eq!(topo.pu_count(), Some(2));
        assert_eq!(topo.pu(0), Some(TopologyObject::new(0, 0)));
        assert_eq!(topo.pu(1), Some(TopologyObject::new(1, 1)));
        assert_eq!(topo.pu(2), None);

        // Cores without an allowed CPU disappear
        let topo = SysfsTopology::from_root_with_allowed(&sysfs.root, Some(&[0, 2])).unwrap();
        assert_eq!(topo.core_count(), Some(1));
        assert_eq!(topo.pu_count(), Some(2));
        let inventory = crate::topology::HardwareInventory::require(&topo).unwrap();
        assert_eq!(inventory.pus_per_core(), 2);

        assert!(matches!(
            SysfsTopology::from_root_with_allowed(&sysfs.root, Some(&[7])),
            Err(TopologyError::MissingObjects(ObjectKind::Pu))
        ));
    }

    #[test]
    fn test_detect_stays_within_affinity_mask() {
        let topo = SysfsTopology::detect();
        if !topo.is_discovered() {
            return;
        }
        if let Some(allowed) = allowed_cpus() {
            for i in 0..topo.pu_count().unwrap() {
                assert!(allowed.contains(&topo.pu(i).unwrap().os_index));
            }
        }
    }

    #[test]
    fn test_from_root_reads_caches() {
        let sysfs = FakeSysfs::new();
        sysfs.write("online", "0\n");
        sysfs.cpu(0, 0, 0);
        sysfs.cache(0, 0, 1, "Data", "48K", 64, 12);
        sysfs.cache(0, 1, 1, "Instruction", "32K", 64, 8);
        sysfs.cache(0, 2, 2, "Unified", "1280K", 64, 10);
        sysfs.cache(0, 3, 3, "Unified", "12M", 64, 0);

        let topo = SysfsTopology::from_root(&sysfs.root).unwrap();

        let l1 = topo.data_cache(1).unwrap();
        assert_eq!(l1.kind, CacheKind::Data);
        assert_eq!(l1.size, 48 * 1024);
        assert_eq!(l1.associativity, 12);

        let l2 = topo.data_cache(2).unwrap();
        assert_eq!(l2.kind, CacheKind::Unified);
        assert_eq!(l2.size, 1280 * 1024);

        let l3 = topo.data_cache(3).unwrap();
        assert_eq!(l3.associativity, 0);
        assert_eq!(topo.data_cache(4), None);
    }

    #[test]
    fn test_from_root_without_online_fails() {
        let sysfs = FakeSysfs::new();
        assert!(matches!(
            SysfsTopology::from_root(&sysfs.root),
            Err(TopologyError::Io(_))
        ));

        sysfs.write("online", "\n");
        assert!(matches!(
            SysfsTopology::from_root(&sysfs.root),
            Err(TopologyError::MissingObjects(ObjectKind::Pu))
        ));
    }

    #[test]
    fn test_fallback_counts() {
        let topo = SysfsTopology::fallback();
        assert!(!topo.is_discovered());
        assert!(!topo.support().discovery_pu);
        assert_eq!(topo.pu_count(), Some(num_cpus::get().max(1)));
        assert_eq!(topo.pu_count().unwrap() % topo.core_count().unwrap(), 0);
    }
}
