//! Hardware topology queries
//!
//! This module is responsible for:
//! - Describing the hardware objects binding works with (cores, PUs, caches)
//! - Abstracting the service that discovers them and binds threads
//! - Deriving the per-host hardware inventory

mod synthetic;
mod sysfs;

pub use synthetic::SyntheticTopology;
pub use sysfs::SysfsTopology;

use std::fmt;

use crate::error::{ObjectKind, TopologyError};

/// A core or PU, in logical (`L#`) and operating-system (`P#`) numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopologyObject {
    /// Index in topology order, dense from 0
    pub logical_index: usize,
    /// Index the operating system uses for this object
    pub os_index: usize,
}

impl TopologyObject {
    /// Create a new object
    pub fn new(logical_index: usize, os_index: usize) -> Self {
        Self {
            logical_index,
            os_index,
        }
    }
}

impl fmt::Display for TopologyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L#{} (P#{})", self.logical_index, self.os_index)
    }
}

/// What a cache holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Data only
    Data,
    /// Instructions only
    Instruction,
    /// Data and instructions
    Unified,
}

impl CacheKind {
    /// True if data accesses go through this cache
    pub fn holds_data(&self) -> bool {
        matches!(self, Self::Data | Self::Unified)
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Instruction => write!(f, "instruction"),
            Self::Unified => write!(f, "unified"),
        }
    }
}

/// Attributes of one cache instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheAttributes {
    /// Cache level, 1 is closest to the core
    pub level: usize,
    /// Cache kind
    pub kind: CacheKind,
    /// Total size in bytes (0 if unknown)
    pub size: u64,
    /// Line size in bytes (0 if unknown)
    pub line_size: u32,
    /// Number of ways (0 if unknown or fully associative)
    pub associativity: u32,
}

impl CacheAttributes {
    /// Distance in bytes between addresses mapping to the same set
    ///
    /// 0 when the associativity is unknown or the cache is fully associative.
    pub fn stride(&self) -> u64 {
        if self.associativity == 0 {
            0
        } else {
            self.size / u64::from(self.associativity)
        }
    }
}

/// Which binding operations a topology service can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindingSupport {
    /// PUs were discovered from the hardware rather than assumed
    pub discovery_pu: bool,
    /// The calling thread can be bound
    pub set_thread_binding: bool,
    /// The calling thread's binding can be read back
    pub get_thread_binding: bool,
    /// Binding can be requested strictly
    pub strict_binding: bool,
}

/// How hard a bind request insists on the exact PU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// The thread must run on exactly the requested PU
    Strict,
    /// The operating system may treat the request as a hint
    Loose,
}

/// Source of hardware topology for one host
///
/// Implementations are process-local; objects at one level are numbered
/// densely in logical order and PUs are grouped by core.
pub trait TopologyService: Send + Sync {
    /// Which binding operations are available
    fn support(&self) -> BindingSupport;

    /// Number of cores, or `None` if cores cannot be reported
    fn core_count(&self) -> Option<usize>;

    /// Number of PUs, or `None` if PUs cannot be reported
    fn pu_count(&self) -> Option<usize>;

    /// Core by logical index
    fn core(&self, index: usize) -> Option<TopologyObject>;

    /// PU by logical index
    fn pu(&self, index: usize) -> Option<TopologyObject>;

    /// First data or unified cache at `level`, if the host has one
    fn data_cache(&self, level: usize) -> Option<CacheAttributes>;

    /// Bind the calling thread to exactly one PU
    fn bind_current_thread(&self, pu: &TopologyObject, mode: BindMode) -> Result<(), TopologyError>;

    /// OS indices of the PUs the calling thread may run on
    fn current_thread_binding(&self) -> Result<Vec<usize>, TopologyError>;
}

/// Core and hardware-thread counts of one host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInventory {
    core_count: usize,
    pus_per_core: usize,
}

impl HardwareInventory {
    /// Build an inventory from core and PU counts
    pub fn new(core_count: usize, pu_count: usize) -> Result<Self, TopologyError> {
        if core_count == 0 {
            return Err(TopologyError::InconsistentTopology("host reports 0 cores".into()));
        }
        if pu_count == 0 {
            return Err(TopologyError::InconsistentTopology("host reports 0 PUs".into()));
        }
        if pu_count % core_count != 0 {
            return Err(TopologyError::InconsistentTopology(format!(
                "{pu_count} PUs do not divide evenly over {core_count} cores"
            )));
        }

        Ok(Self {
            core_count,
            pus_per_core: pu_count / core_count,
        })
    }

    /// Query the inventory, or `None` if the service cannot report cores or PUs
    pub fn query(service: &dyn TopologyService) -> Result<Option<Self>, TopologyError> {
        match (service.core_count(), service.pu_count()) {
            (Some(cores), Some(pus)) => Self::new(cores, pus).map(Some),
            _ => Ok(None),
        }
    }

    /// Query the inventory, failing if cores or PUs cannot be reported
    pub fn require(service: &dyn TopologyService) -> Result<Self, TopologyError> {
        let cores = service
            .core_count()
            .ok_or(TopologyError::MissingObjects(ObjectKind::Core))?;
        let pus = service
            .pu_count()
            .ok_or(TopologyError::MissingObjects(ObjectKind::Pu))?;
        Self::new(cores, pus)
    }

    /// Number of cores
    pub fn core_count(&self) -> usize {
        self.core_count
    }

    /// Hardware threads per core (SMT multiplier)
    pub fn pus_per_core(&self) -> usize {
        self.pus_per_core
    }

    /// Total number of PUs
    pub fn pu_count(&self) -> usize {
        self.core_count * self.pus_per_core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_invariants() {
        let inventory = HardwareInventory::new(4, 8).unwrap();
        assert_eq!(inventory.core_count(), 4);
        assert_eq!(inventory.pus_per_core(), 2);
        assert_eq!(inventory.pu_count(), 8);

        assert!(HardwareInventory::new(0, 8).is_err());
        assert!(HardwareInventory::new(4, 0).is_err());
        assert!(HardwareInventory::new(4, 6).is_err());
    }

    #[test]
    fn test_inventory_query() {
        let topo = SyntheticTopology::new(4, 2);
        assert_eq!(
            HardwareInventory::query(&topo).unwrap(),
            Some(HardwareInventory::new(4, 8).unwrap())
        );

        let no_cores = SyntheticTopology::new(4, 2).without_core_objects();
        assert_eq!(HardwareInventory::query(&no_cores).unwrap(), None);
        assert!(matches!(
            HardwareInventory::require(&no_cores),
            Err(TopologyError::MissingObjects(ObjectKind::Core))
        ));
    }

    #[test]
    fn test_cache_stride() {
        let l1 = CacheAttributes {
            level: 1,
            kind: CacheKind::Data,
            size: 32 * 1024,
            line_size: 64,
            associativity: 8,
        };
        assert_eq!(l1.stride(), 4096);

        let fully_associative = CacheAttributes {
            associativity: 0,
            ..l1
        };
        assert_eq!(fully_associative.stride(), 0);
    }

    #[test]
    fn test_object_display() {
        assert_eq!(TopologyObject::new(2, 5).to_string(), "L#2 (P#5)");
        assert_eq!(CacheKind::Unified.to_string(), "unified");
        assert!(CacheKind::Unified.holds_data());
        assert!(!CacheKind::Instruction.holds_data());
    }
}
