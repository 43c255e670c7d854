//! In-process communicator group.
//!
//! Each participant runs on its own thread and talks to the others over
//! unbounded channels. Messages from one sender arrive in order, which is all
//! the rooted collectives need.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::comm::Communicator;
use crate::error::TopologyError;

/// How long a participant waits for a peer before giving up.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum Packet {
    Name { from: usize, name: String },
    Value(usize),
    Abort { from: usize, reason: String },
}

/// One member of a [`LocalGroup`].
pub struct LocalComm {
    rank: usize,
    peers: Vec<Sender<Packet>>,
    inbox: Receiver<Packet>,
    timeout: Duration,
}

impl LocalComm {
    /// Change how long collectives wait for peers.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn send(&self, to: usize, packet: Packet) -> Result<(), TopologyError> {
        self.peers[to]
            .send(packet)
            .map_err(|_| TopologyError::Communication(format!("rank {to} left the group")))
    }

    fn recv(&self) -> Result<Packet, TopologyError> {
        let packet = self.inbox.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TopologyError::Communication(format!(
                "rank {} timed out after {:?} waiting for a peer",
                self.rank, self.timeout
            )),
            RecvTimeoutError::Disconnected => {
                TopologyError::Communication(format!("rank {} lost its peers", self.rank))
            }
        })?;

        match packet {
            Packet::Abort { from, reason } => Err(TopologyError::Communication(format!(
                "rank {from} aborted: {reason}"
            ))),
            packet => Ok(packet),
        }
    }

    fn recv_value(&self) -> Result<usize, TopologyError> {
        match self.recv()? {
            Packet::Value(value) => Ok(value),
            other => Err(TopologyError::Communication(format!(
                "rank {} expected a value, got {other:?}",
                self.rank
            ))),
        }
    }

    fn check_root(&self, root: usize) -> Result<(), TopologyError> {
        if root >= self.size() {
            return Err(TopologyError::InconsistentProcessGroup(format!(
                "root {root} outside a group of {}",
                self.size()
            )));
        }
        Ok(())
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn gather(&self, root: usize, value: &str) -> Result<Option<Vec<String>>, TopologyError> {
        self.check_root(root)?;
        if self.rank != root {
            self.send(
                root,
                Packet::Name {
                    from: self.rank,
                    name: value.to_string(),
                },
            )?;
            return Ok(None);
        }

        let mut slots: Vec<Option<String>> = vec![None; self.size()];
        slots[root] = Some(value.to_string());
        for _ in 1..self.size() {
            match self.recv()? {
                Packet::Name { from, name } if from < slots.len() && slots[from].is_none() => {
                    slots[from] = Some(name);
                }
                other => {
                    return Err(TopologyError::Communication(format!(
                        "root received unexpected {other:?} during gather"
                    )))
                }
            }
        }

        let names = slots.into_iter().flatten().collect::<Vec<_>>();
        Ok(Some(names))
    }

    fn broadcast(&self, root: usize, value: Option<usize>) -> Result<usize, TopologyError> {
        self.check_root(root)?;
        if self.rank != root {
            return self.recv_value();
        }

        let value = value.ok_or_else(|| {
            TopologyError::Communication("broadcast root supplied no value".into())
        })?;
        for peer in (0..self.size()).filter(|&r| r != root) {
            self.send(peer, Packet::Value(value))?;
        }
        Ok(value)
    }

    fn scatter(&self, root: usize, values: Option<&[usize]>) -> Result<usize, TopologyError> {
        self.check_root(root)?;
        if self.rank != root {
            return self.recv_value();
        }

        let values = values.ok_or_else(|| {
            TopologyError::Communication("scatter root supplied no values".into())
        })?;
        if values.len() != self.size() {
            return Err(TopologyError::InconsistentProcessGroup(format!(
                "scatter of {} values over a group of {}",
                values.len(),
                self.size()
            )));
        }
        for peer in (0..self.size()).filter(|&r| r != root) {
            self.send(peer, Packet::Value(values[peer]))?;
        }
        Ok(values[root])
    }

    fn abort(&self, reason: &str) {
        for peer in (0..self.size()).filter(|&r| r != self.rank) {
            // Peers that already left need no notice
            let _ = self.send(
                peer,
                Packet::Abort {
                    from: self.rank,
                    reason: reason.to_string(),
                },
            );
        }
    }
}

/// Factory for in-process groups.
pub struct LocalGroup;

impl LocalGroup {
    /// Create the members of a group of `size` participants.
    pub fn create(size: usize) -> Vec<LocalComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank,
                peers: senders.clone(),
                inbox,
                timeout: DEFAULT_RECV_TIMEOUT,
            })
            .collect()
    }

    /// Run `f` once per member, each on its own thread, and collect the
    /// results in rank order.
    pub fn run<F, R>(size: usize, f: F) -> Result<Vec<R>, TopologyError>
    where
        F: Fn(LocalComm) -> R + Sync,
        R: Send,
    {
        if size == 0 {
            return Err(TopologyError::InconsistentProcessGroup(
                "a group needs at least one member".into(),
            ));
        }

        let comms = Self::create(size);
        let f = &f;
        crossbeam_utils::thread::scope(|scope| -> Result<Vec<R>, TopologyError> {
            let mut handles = Vec::with_capacity(size);
            for comm in comms {
                let handle = scope
                    .builder()
                    .name(format!("local-rank-{}", comm.rank))
                    .spawn(move |_| f(comm))?;
                handles.push(handle);
            }

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle.join().map_err(|_| {
                        TopologyError::Communication(format!("rank {rank} panicked"))
                    })
                })
                .collect::<Result<Vec<R>, TopologyError>>()
        })
        .map_err(|_| TopologyError::Communication("local group panicked".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ROOT;

    #[test]
    fn test_group_ranks() {
        let ranks = LocalGroup::run(4, |comm| (comm.rank(), comm.size())).unwrap();
        assert_eq!(ranks, vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    }

    #[test]
    fn test_gather_in_rank_order() {
        let gathered = LocalGroup::run(3, |comm| {
            let name = format!("host-{}", comm.rank());
            comm.gather(ROOT, &name).unwrap()
        })
        .unwrap();

        assert_eq!(
            gathered[0],
            Some(vec![
                "host-0".to_string(),
                "host-1".to_string(),
                "host-2".to_string()
            ])
        );
        assert_eq!(gathered[1], None);
        assert_eq!(gathered[2], None);
    }

    #[test]
    fn test_broadcast_and_scatter() {
        let results = LocalGroup::run(4, |comm| {
            let root = comm.rank() == ROOT;
            let count = comm.broadcast(ROOT, root.then_some(7)).unwrap();
            let table = [10, 11, 12, 13];
            let mine = comm.scatter(ROOT, root.then_some(&table[..])).unwrap();
            (count, mine)
        })
        .unwrap();

        assert_eq!(results, vec![(7, 10), (7, 11), (7, 12), (7, 13)]);
    }

    #[test]
    fn test_scatter_wrong_length_fails_on_root() {
        let comms = LocalGroup::create(2);
        let root = &comms[0];
        assert!(matches!(
            root.scatter(ROOT, Some(&[1, 2, 3])),
            Err(TopologyError::InconsistentProcessGroup(_))
        ));
    }

    #[test]
    fn test_recv_times_out() {
        let mut comms = LocalGroup::create(2);
        let follower = comms.pop().unwrap().with_timeout(Duration::from_millis(10));
        assert!(matches!(
            follower.broadcast(ROOT, None),
            Err(TopologyError::Communication(_))
        ));
    }

    #[test]
    fn test_abort_wakes_waiting_peers() {
        let comms = LocalGroup::create(3);
        comms[1].abort("no host name");

        match comms[0].gather(ROOT, "node0") {
            Err(TopologyError::Communication(msg)) => {
                assert!(msg.contains("rank 1 aborted: no host name"))
            }
            other => panic!("expected an abort, got {other:?}"),
        }
        assert!(matches!(
            comms[2].broadcast(ROOT, None),
            Err(TopologyError::Communication(_))
        ));
    }

    #[test]
    fn test_empty_group_rejected() {
        assert!(LocalGroup::run(0, |comm| comm.rank()).is_err());
    }
}
