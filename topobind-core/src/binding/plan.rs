//! Thread-to-PU placement
//!
//! Every process on a host computes its own slice of the host-wide placement
//! from counts all of them share. Threads are numbered process by process,
//! then packed onto cores `smt_threads_used` at a time.

use std::fmt;

use crate::error::TopologyError;
use crate::host::HostAssignment;
use crate::topology::HardwareInventory;

/// Placement of one worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadPlacement {
    /// Thread index within the process
    pub thread: usize,
    /// Thread index within the host
    pub host_thread: usize,
    /// Logical index of the target core
    pub core: usize,
    /// Logical index of the target PU
    pub pu: usize,
}

/// A condition that lets binding proceed on a best-effort basis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementWarning {
    /// More threads per core than the hardware has PUs per core
    Oversubscribed {
        /// Threads placed per core
        smt_threads_used: usize,
        /// Hardware threads per core
        pus_per_core: usize,
    },
    /// Threads per process is not a multiple of threads per core
    Uneven {
        /// Threads per process
        threads_per_process: usize,
        /// Threads placed per core
        smt_threads_used: usize,
    },
}

impl fmt::Display for PlacementWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversubscribed {
                smt_threads_used,
                pus_per_core,
            } => write!(
                f,
                "{smt_threads_used} threads per core exceed the {pus_per_core} hardware SMT threads"
            ),
            Self::Uneven {
                threads_per_process,
                smt_threads_used,
            } => write!(
                f,
                "{threads_per_process} threads per process are not a multiple of {smt_threads_used} threads per core"
            ),
        }
    }
}

/// Placement of every thread of the calling process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingPlan {
    threads_per_process: usize,
    rank_on_host: usize,
    count_on_host: usize,
    core_count: usize,
    pus_per_core: usize,
    smt_threads_used: usize,
}

impl BindingPlan {
    /// Compute the plan for a process running `threads_per_process` threads
    ///
    /// Every process on the host is assumed to run the same number of threads.
    pub fn new(
        inventory: &HardwareInventory,
        assignment: &HostAssignment,
        threads_per_process: usize,
    ) -> Result<Self, TopologyError> {
        if threads_per_process == 0 {
            return Err(TopologyError::InvalidConfig(
                "a process needs at least one thread".into(),
            ));
        }

        let total_threads = threads_per_process * assignment.count_on_host;
        let smt_threads_used = total_threads.div_ceil(inventory.core_count());

        Ok(Self {
            threads_per_process,
            rank_on_host: assignment.rank_on_host,
            count_on_host: assignment.count_on_host,
            core_count: inventory.core_count(),
            pus_per_core: inventory.pus_per_core(),
            smt_threads_used,
        })
    }

    /// Threads in the calling process
    pub fn threads_per_process(&self) -> usize {
        self.threads_per_process
    }

    /// Threads placed on the host by all of its processes
    pub fn total_threads(&self) -> usize {
        self.threads_per_process * self.count_on_host
    }

    /// Threads placed on each core
    pub fn smt_threads_used(&self) -> usize {
        self.smt_threads_used
    }

    /// True if cores receive more threads than they have PUs
    pub fn is_oversubscribed(&self) -> bool {
        self.smt_threads_used > self.pus_per_core
    }

    /// Conditions under which the placement is only best effort
    pub fn warnings(&self) -> Vec<PlacementWarning> {
        let mut warnings = Vec::new();
        if self.is_oversubscribed() {
            warnings.push(PlacementWarning::Oversubscribed {
                smt_threads_used: self.smt_threads_used,
                pus_per_core: self.pus_per_core,
            });
        }
        if self.threads_per_process % self.smt_threads_used != 0 {
            warnings.push(PlacementWarning::Uneven {
                threads_per_process: self.threads_per_process,
                smt_threads_used: self.smt_threads_used,
            });
        }
        warnings
    }

    /// True if this process speaks for its host when warning
    pub fn reports_for_host(&self) -> bool {
        self.rank_on_host == 0
    }

    /// Log the placement figures and warnings, once per host
    pub fn report(&self) {
        if !self.reports_for_host() {
            return;
        }

        tracing::info!(
            "There are {} PUs per core (aka hardware SMT threads)",
            self.pus_per_core
        );
        tracing::info!(
            "There are {} threads per core (aka SMT threads used)",
            self.smt_threads_used
        );
        for warning in self.warnings() {
            tracing::warn!("{}", warning);
        }
    }

    /// Placement of one thread of the calling process
    pub fn placement(&self, thread: usize) -> ThreadPlacement {
        let host_thread = self.rank_on_host * self.threads_per_process + thread;
        let core = host_thread / self.smt_threads_used;
        // Oversubscribed cores wrap around their own PUs
        let pu_offset = (host_thread % self.smt_threads_used) % self.pus_per_core;

        ThreadPlacement {
            thread,
            host_thread,
            core,
            pu: core * self.pus_per_core + pu_offset,
        }
    }

    /// Placements of all threads of the calling process, in thread order
    pub fn placements(&self) -> impl Iterator<Item = ThreadPlacement> + '_ {
        (0..self.threads_per_process).map(move |thread| self.placement(thread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn on_host(rank_on_host: usize, count_on_host: usize) -> HostAssignment {
        HostAssignment {
            proc_num: rank_on_host,
            num_procs: count_on_host,
            host_index: 0,
            host_count: 1,
            rank_on_host,
            count_on_host,
        }
    }

    fn host_plans(cores: usize, smt: usize, procs: usize, threads: usize) -> Vec<BindingPlan> {
        let inventory = HardwareInventory::new(cores, cores * smt).unwrap();
        (0..procs)
            .map(|p| BindingPlan::new(&inventory, &on_host(p, procs), threads).unwrap())
            .collect()
    }

    #[test]
    fn test_four_single_threaded_processes() {
        let plans = host_plans(4, 1, 4, 1);
        assert_eq!(plans[2].smt_threads_used(), 1);

        let placement = plans[2].placement(0);
        assert_eq!(placement.core, 2);
        assert_eq!(placement.pu, 2);
        assert!(plans.iter().all(|p| p.warnings().is_empty()));
    }

    #[test]
    fn test_two_processes_on_smt2() {
        let plans = host_plans(4, 2, 2, 4);
        assert_eq!(plans[1].total_threads(), 8);
        assert_eq!(plans[1].smt_threads_used(), 2);

        let placement = plans[1].placement(3);
        assert_eq!(placement.host_thread, 7);
        assert_eq!(placement.core, 3);
        assert_eq!(placement.pu, 7);
    }

    #[test]
    fn test_packs_cores_before_moving_on() {
        // 1 process, 4 threads on 4 cores x 2: one thread per core
        let plan = host_plans(4, 2, 1, 4)[0];
        let pus: Vec<usize> = plan.placements().map(|p| p.pu).collect();
        assert_eq!(pus, vec![0, 2, 4, 6]);

        // 1 process, 8 threads: both PUs of each core
        let plan = host_plans(4, 2, 1, 8)[0];
        let pus: Vec<usize> = plan.placements().map(|p| p.pu).collect();
        assert_eq!(pus, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_injective_without_oversubscription() {
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..500 {
            let cores = rng.gen_range(1..16);
            let smt = rng.gen_range(1..5);
            let procs = rng.gen_range(1..8);
            let max_threads = cores * smt / procs;
            if max_threads == 0 {
                continue;
            }
            let threads = rng.gen_range(1..=max_threads);

            let plans = host_plans(cores, smt, procs, threads);
            let mut seen = HashSet::new();
            for plan in &plans {
                assert!(!plan.is_oversubscribed());
                for placement in plan.placements() {
                    assert!(placement.pu < cores * smt);
                    assert!(seen.insert(placement.pu), "PU {} placed twice", placement.pu);
                }
            }
        }
    }

    #[test]
    fn test_oversubscribed_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let cores = rng.gen_range(1..8);
            let smt = rng.gen_range(1..3);
            let procs = rng.gen_range(1..6);
            let threads = rng.gen_range(1..12);
            if threads * procs <= cores * smt {
                continue;
            }

            let plans = host_plans(cores, smt, procs, threads);
            for plan in &plans {
                assert!(plan.is_oversubscribed());
                for placement in plan.placements() {
                    assert!(placement.core < cores);
                    assert!(placement.pu < cores * smt);
                    assert_eq!(placement.pu / smt, placement.core);
                }
            }

            let reporting = plans
                .iter()
                .filter(|p| p.reports_for_host() && !p.warnings().is_empty())
                .count();
            assert_eq!(reporting, 1);
        }
    }

    #[test]
    fn test_warnings() {
        // 3 threads on 2 cores x 1: oversubscribed and uneven
        let plan = host_plans(2, 1, 1, 3)[0];
        assert_eq!(plan.smt_threads_used(), 2);
        assert_eq!(
            plan.warnings(),
            vec![
                PlacementWarning::Oversubscribed {
                    smt_threads_used: 2,
                    pus_per_core: 1
                },
                PlacementWarning::Uneven {
                    threads_per_process: 3,
                    smt_threads_used: 2
                },
            ]
        );
        assert!(plan.warnings()[0].to_string().contains("exceed"));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let inventory = HardwareInventory::new(2, 2).unwrap();
        assert!(BindingPlan::new(&inventory, &HostAssignment::single(), 0).is_err());
    }
}
