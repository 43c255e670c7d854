//! Process-to-host mapping
//!
//! This module is responsible for:
//! - Identifying the host each worker process runs on
//! - Numbering hosts in order of first appearance across ranks
//! - Numbering the processes within each host densely by global rank

mod identity;

pub use identity::{CoordinateIdentity, HostIdentity, Hostname, StaticIdentity};

use indexmap::IndexMap;

use crate::comm::{Communicator, ROOT};
use crate::error::TopologyError;

/// Where a process sits among hosts and among the processes of its host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostAssignment {
    /// Global rank of this process
    pub proc_num: usize,
    /// Number of processes in the job
    pub num_procs: usize,
    /// Index of this process's host
    pub host_index: usize,
    /// Number of distinct hosts in the job
    pub host_count: usize,
    /// Rank of this process among the processes on its host
    pub rank_on_host: usize,
    /// Number of processes on this host
    pub count_on_host: usize,
}

impl HostAssignment {
    /// Assignment of a job that consists of a single process
    pub fn single() -> Self {
        Self {
            proc_num: 0,
            num_procs: 1,
            host_index: 0,
            host_count: 1,
            rank_on_host: 0,
            count_on_host: 1,
        }
    }

    /// True if the whole job runs on one host
    pub fn is_single_host(&self) -> bool {
        self.host_count == 1
    }

    fn validate(&self) -> Result<(), TopologyError> {
        if self.host_index >= self.host_count
            || self.count_on_host == 0
            || self.rank_on_host >= self.count_on_host
            || self.count_on_host > self.num_procs
        {
            return Err(TopologyError::InconsistentProcessGroup(format!(
                "process {} received host {} of {}, rank {} of {} on host",
                self.proc_num,
                self.host_index,
                self.host_count,
                self.rank_on_host,
                self.count_on_host
            )));
        }
        Ok(())
    }
}

/// Rank-to-host table built by the coordinating process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTable {
    /// Member ranks of every host, keyed by identifier in first-appearance order
    hosts: IndexMap<String, Vec<usize>>,
    /// Host index of every rank
    host_by_proc: Vec<usize>,
}

impl HostTable {
    /// Build the table from one host identifier per rank, in rank order
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut hosts: IndexMap<String, Vec<usize>> = IndexMap::new();
        let mut host_by_proc = Vec::with_capacity(names.len());

        for (proc, name) in names.iter().enumerate() {
            let entry = hosts.entry(name.as_ref().to_string());
            host_by_proc.push(entry.index());
            entry.or_default().push(proc);
        }

        for procs in hosts.values_mut() {
            procs.sort_unstable();
        }

        Self {
            hosts,
            host_by_proc,
        }
    }

    /// Number of distinct hosts
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Number of ranks in the table
    pub fn proc_count(&self) -> usize {
        self.host_by_proc.len()
    }

    /// Host identifiers in host-index order
    pub fn host_names(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    /// Ranks on a host, ascending
    pub fn procs_on_host(&self, host: usize) -> &[usize] {
        self.hosts
            .get_index(host)
            .map(|(_, procs)| procs.as_slice())
            .unwrap_or(&[])
    }

    /// Host index of every rank
    pub fn host_by_proc(&self) -> &[usize] {
        &self.host_by_proc
    }

    /// Number of processes on the host of every rank
    pub fn count_on_host_by_proc(&self) -> Vec<usize> {
        self.host_by_proc
            .iter()
            .map(|&host| self.procs_on_host(host).len())
            .collect()
    }

    /// Rank on host of every rank
    pub fn rank_on_host_by_proc(&self) -> Vec<usize> {
        let mut ranks = vec![0; self.proc_count()];
        for procs in self.hosts.values() {
            for (rank_on_host, &proc) in procs.iter().enumerate() {
                ranks[proc] = rank_on_host;
            }
        }
        ranks
    }

    /// Full assignment of one rank
    pub fn assignment(&self, proc: usize) -> Option<HostAssignment> {
        let host_index = *self.host_by_proc.get(proc)?;
        let procs = self.procs_on_host(host_index);
        let rank_on_host = procs.iter().position(|&p| p == proc)?;
        Some(HostAssignment {
            proc_num: proc,
            num_procs: self.proc_count(),
            host_index,
            host_count: self.host_count(),
            rank_on_host,
            count_on_host: procs.len(),
        })
    }
}

/// Determine the host assignment of the calling process
///
/// Every member of `comm` must call this collectively. A group of one
/// returns the trivial assignment without any collective call. A rank that
/// fails aborts the group, so its peers fail too instead of waiting for it.
pub fn resolve_host_mapping(
    comm: &dyn Communicator,
    identity: &dyn HostIdentity,
) -> Result<HostAssignment, TopologyError> {
    let num_procs = comm.size();
    let proc_num = comm.rank();

    if num_procs == 0 || proc_num >= num_procs {
        return Err(TopologyError::InconsistentProcessGroup(format!(
            "rank {proc_num} in a group of {num_procs}"
        )));
    }

    if num_procs == 1 {
        tracing::debug!("Single process, skipping host mapping exchange");
        return Ok(HostAssignment::single());
    }

    tracing::debug!("This is process {} of {}", proc_num, num_procs);

    exchange_host_mapping(comm, identity).map_err(|err| {
        comm.abort(&err.to_string());
        err
    })
}

fn exchange_host_mapping(
    comm: &dyn Communicator,
    identity: &dyn HostIdentity,
) -> Result<HostAssignment, TopologyError> {
    let num_procs = comm.size();
    let proc_num = comm.rank();

    let host_id = identity.host_id()?;
    let gathered = comm.gather(ROOT, &host_id)?;

    let table = if proc_num == ROOT {
        let names = gathered.ok_or_else(|| {
            TopologyError::Communication("gather returned nothing on the root".into())
        })?;
        if names.len() != num_procs {
            return Err(TopologyError::InconsistentProcessGroup(format!(
                "gathered {} host names from a group of {}",
                names.len(),
                num_procs
            )));
        }

        let table = HostTable::from_names(&names);
        for (host, name) in table.host_names().enumerate() {
            tracing::info!(
                host,
                procs = table.procs_on_host(host).len(),
                "Host {}: {}",
                host,
                name
            );
        }
        Some(table)
    } else {
        None
    };

    let host_count = comm.broadcast(ROOT, table.as_ref().map(HostTable::host_count))?;
    let host_index = comm.scatter(ROOT, table.as_ref().map(HostTable::host_by_proc))?;

    let counts = table.as_ref().map(HostTable::count_on_host_by_proc);
    let count_on_host = comm.scatter(ROOT, counts.as_deref())?;

    let ranks = table.as_ref().map(HostTable::rank_on_host_by_proc);
    let rank_on_host = comm.scatter(ROOT, ranks.as_deref())?;

    let assignment = HostAssignment {
        proc_num,
        num_procs,
        host_index,
        host_count,
        rank_on_host,
        count_on_host,
    };
    assignment.validate()?;

    tracing::info!(
        rank = proc_num,
        host = host_index,
        "Process runs on host {} of {}, process {} of {} on this host",
        host_index,
        host_count,
        rank_on_host,
        count_on_host
    );

    Ok(assignment)
}
