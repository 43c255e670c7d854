//! Synthetic topologies
//!
//! A described machine that answers topology queries and records bind
//! requests per thread instead of touching the operating system.

use std::collections::HashSet;
use std::thread::{self, ThreadId};

use dashmap::DashMap;

use crate::error::TopologyError;
use crate::topology::{
    BindMode, BindingSupport, CacheAttributes, CacheKind, TopologyObject, TopologyService,
};

/// A machine of `cores` cores with `pus_per_core` hardware threads each
pub struct SyntheticTopology {
    core_count: usize,
    pus_per_core: usize,
    report_cores: bool,
    report_pus: bool,
    caches: Vec<CacheAttributes>,
    support: BindingSupport,
    reject_strict: bool,
    failing_pus: HashSet<usize>,
    bindings: DashMap<ThreadId, usize>,
}

impl SyntheticTopology {
    /// Create a machine with full binding support and no caches
    pub fn new(core_count: usize, pus_per_core: usize) -> Self {
        Self {
            core_count,
            pus_per_core,
            report_cores: true,
            report_pus: true,
            caches: Vec::new(),
            support: BindingSupport {
                discovery_pu: true,
                set_thread_binding: true,
                get_thread_binding: true,
                strict_binding: true,
            },
            reject_strict: false,
            failing_pus: HashSet::new(),
            bindings: DashMap::new(),
        }
    }

    /// Add a cache level; levels are looked up by `level`
    pub fn with_cache(
        mut self,
        level: usize,
        kind: CacheKind,
        size: u64,
        line_size: u32,
        associativity: u32,
    ) -> Self {
        self.caches.push(CacheAttributes {
            level,
            kind,
            size,
            line_size,
            associativity,
        });
        self
    }

    /// Report no core objects
    pub fn without_core_objects(mut self) -> Self {
        self.report_cores = false;
        self
    }

    /// Report no PU objects
    pub fn without_pu_objects(mut self) -> Self {
        self.report_pus = false;
        self
    }

    /// Report that threads can neither be bound nor queried
    pub fn without_binding(mut self) -> Self {
        self.support.set_thread_binding = false;
        self.support.get_thread_binding = false;
        self.support.strict_binding = false;
        self
    }

    /// Refuse strict bind requests, accept loose ones
    pub fn rejecting_strict(mut self) -> Self {
        self.reject_strict = true;
        self
    }

    /// Refuse every bind request for the PU with this OS index
    pub fn failing_pu(mut self, os_index: usize) -> Self {
        self.failing_pus.insert(os_index);
        self
    }

    /// PU the given thread was bound to
    pub fn bound_pu(&self, thread: ThreadId) -> Option<usize> {
        self.bindings.get(&thread).map(|entry| *entry.value())
    }

    /// Number of threads bound so far
    pub fn bound_thread_count(&self) -> usize {
        self.bindings.len()
    }
}

impl TopologyService for SyntheticTopology {
    fn support(&self) -> BindingSupport {
        self.support
    }

    fn core_count(&self) -> Option<usize> {
        self.report_cores.then_some(self.core_count)
    }

    fn pu_count(&self) -> Option<usize> {
        self.report_pus.then_some(self.core_count * self.pus_per_core)
    }

    fn core(&self, index: usize) -> Option<TopologyObject> {
        (self.report_cores && index < self.core_count).then(|| TopologyObject::new(index, index))
    }

    fn pu(&self, index: usize) -> Option<TopologyObject> {
        let pu_count = self.core_count * self.pus_per_core;
        (self.report_pus && index < pu_count).then(|| TopologyObject::new(index, index))
    }

    fn data_cache(&self, level: usize) -> Option<CacheAttributes> {
        self.caches
            .iter()
            .find(|cache| cache.level == level && cache.kind.holds_data())
            .copied()
    }

    fn bind_current_thread(&self, pu: &TopologyObject, mode: BindMode) -> Result<(), TopologyError> {
        if !self.support.set_thread_binding {
            return Err(TopologyError::BindingUnsupported);
        }
        if mode == BindMode::Strict && self.reject_strict {
            return Err(TopologyError::BindRejected {
                pu: pu.os_index,
                reason: "strict binding refused".into(),
            });
        }
        if self.failing_pus.contains(&pu.os_index) {
            return Err(TopologyError::BindRejected {
                pu: pu.os_index,
                reason: "PU refused the thread".into(),
            });
        }

        self.bindings.insert(thread::current().id(), pu.os_index);
        Ok(())
    }

    fn current_thread_binding(&self) -> Result<Vec<usize>, TopologyError> {
        if !self.support.get_thread_binding {
            return Err(TopologyError::BindingUnsupported);
        }
        match self.bound_pu(thread::current().id()) {
            Some(pu) => Ok(vec![pu]),
            None => Ok((0..self.core_count * self.pus_per_core).collect()),
        }
    }
}
