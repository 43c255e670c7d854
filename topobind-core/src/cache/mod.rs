//! Cache geometry for numerics code
//!
//! Walks the data caches level by level once during setup and keeps the line
//! size and stride of each level, together with the number of SMT threads
//! used per core, in a read-only handle.

use crate::binding::BindingPlan;
use crate::error::TopologyError;
use crate::topology::TopologyService;

/// Line size and stride of one data cache level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheLevelInfo {
    /// Cache line size in bytes (0 if unknown)
    pub line_size: usize,
    /// Distance in bytes between addresses that map to the same set (0 if unknown)
    pub stride: usize,
}

/// Read the data cache levels of a host, innermost first
///
/// Stops at the first level without a data or unified cache. Only the first
/// cache instance of each level is looked at.
pub fn extract_cache_levels(
    service: &dyn TopologyService,
) -> Result<Vec<CacheLevelInfo>, TopologyError> {
    let mut levels = Vec::new();

    for level in 1.. {
        let Some(cache) = service.data_cache(level) else {
            break;
        };

        let stride = cache.stride();

        tracing::debug!(
            cache_level = level,
            "Cache L{} has type \"{}\": size {} linesize {} associativity {} stride {}",
            level,
            cache.kind,
            cache.size,
            cache.line_size,
            cache.associativity,
            stride
        );

        if cache.line_size != 0 && !cache.line_size.is_power_of_two() {
            return Err(TopologyError::InvalidCache {
                level,
                reason: format!("line size {} is not a power of two", cache.line_size),
            });
        }

        // Strides need not be powers of two
        let stride = usize::try_from(stride).map_err(|_| TopologyError::InvalidCache {
            level,
            reason: format!("stride {stride} does not fit in memory"),
        })?;

        levels.push(CacheLevelInfo {
            line_size: cache.line_size as usize,
            stride,
        });
    }

    Ok(levels)
}

/// Node topology figures published to numerics code
///
/// Built once during setup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopologyInfo {
    smt_threads_used: usize,
    cache_levels: Vec<CacheLevelInfo>,
}

impl NodeTopologyInfo {
    /// Create from already computed figures
    pub fn new(smt_threads_used: usize, cache_levels: Vec<CacheLevelInfo>) -> Self {
        Self {
            smt_threads_used,
            cache_levels,
        }
    }

    /// Compute from a binding plan and the host's caches
    pub fn load(service: &dyn TopologyService, plan: &BindingPlan) -> Result<Self, TopologyError> {
        let cache_levels = extract_cache_levels(service)?;
        Ok(Self::new(plan.smt_threads_used(), cache_levels))
    }

    /// Hardware threads used per core
    pub fn num_smt_threads(&self) -> usize {
        self.smt_threads_used
    }

    /// All cache levels, innermost first
    pub fn cache_levels(&self) -> &[CacheLevelInfo] {
        &self.cache_levels
    }

    /// Copy up to as many levels as both buffers hold and return the number
    /// of levels the host has
    ///
    /// A return value larger than the buffers means the list was truncated.
    pub fn cache_info(&self, line_sizes: &mut [usize], strides: &mut [usize]) -> usize {
        let copied = line_sizes.len().min(strides.len()).min(self.cache_levels.len());
        for (level, info) in self.cache_levels[..copied].iter().enumerate() {
            line_sizes[level] = info.line_size;
            strides[level] = info.stride;
        }
        self.cache_levels.len()
    }
}
