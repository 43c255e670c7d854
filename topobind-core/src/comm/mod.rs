//! Collective communication between worker processes.
//!
//! Host mapping only needs rank/size plus three rooted collectives and a way
//! to tell peers that setup failed, so the communicator surface is kept to
//! exactly those operations.

mod local;

pub use local::{LocalComm, LocalGroup, DEFAULT_RECV_TIMEOUT};

use crate::error::TopologyError;

/// Rank that coordinates every rooted collective.
pub const ROOT: usize = 0;

/// Abstraction over the process group a job runs in.
///
/// Every collective must be entered by all members of the group, in the same
/// order, with the same `root`.
pub trait Communicator: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Gather one string from every rank at `root`.
    ///
    /// Returns `Some` with one entry per rank (in rank order) on the root and
    /// `None` everywhere else.
    fn gather(&self, root: usize, value: &str) -> Result<Option<Vec<String>>, TopologyError>;

    /// Broadcast a value from `root`. Only the root's `value` is read.
    fn broadcast(&self, root: usize, value: Option<usize>) -> Result<usize, TopologyError>;

    /// Scatter one value per rank from `root`. Only the root's `values` are read.
    fn scatter(&self, root: usize, values: Option<&[usize]>) -> Result<usize, TopologyError>;

    /// Tell every other rank that this rank cannot continue.
    ///
    /// Peers blocked in, or later entering, a collective fail with
    /// [`TopologyError::Communication`] instead of waiting for this rank.
    fn abort(&self, reason: &str);
}

/// Process group with exactly one member.
///
/// Collectives pass values through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn gather(&self, _root: usize, value: &str) -> Result<Option<Vec<String>>, TopologyError> {
        Ok(Some(vec![value.to_string()]))
    }

    fn broadcast(&self, _root: usize, value: Option<usize>) -> Result<usize, TopologyError> {
        value.ok_or_else(|| TopologyError::Communication("broadcast root supplied no value".into()))
    }

    fn scatter(&self, _root: usize, values: Option<&[usize]>) -> Result<usize, TopologyError> {
        match values {
            Some([value]) => Ok(*value),
            Some(values) => Err(TopologyError::InconsistentProcessGroup(format!(
                "scatter of {} values over a group of 1",
                values.len()
            ))),
            None => Err(TopologyError::Communication(
                "scatter root supplied no values".into(),
            )),
        }
    }

    fn abort(&self, reason: &str) {
        tracing::debug!("Single process aborting: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_rank_and_size() {
        let comm = SingleProcess;
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
    }

    #[test]
    fn single_process_collectives_pass_through() {
        let comm = SingleProcess;
        assert_eq!(
            comm.gather(ROOT, "node0").unwrap(),
            Some(vec!["node0".to_string()])
        );
        assert_eq!(comm.broadcast(ROOT, Some(3)).unwrap(), 3);
        assert_eq!(comm.scatter(ROOT, Some(&[5])).unwrap(), 5);
    }

    #[test]
    fn single_process_scatter_size_mismatch() {
        let comm = SingleProcess;
        assert!(comm.scatter(ROOT, Some(&[1, 2])).is_err());
        assert!(comm.scatter(ROOT, None).is_err());
        assert!(comm.broadcast(ROOT, None).is_err());
    }
}
