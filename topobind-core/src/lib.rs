//! Topobind Core - Thread affinity for multi-host parallel jobs
//!
//! This library decides, once at startup, which hardware thread every worker
//! thread of every process on a host runs on, and publishes the cache
//! geometry of the host to numerics code.

use anyhow::Context;
use rayon::ThreadPool;

/// Thread-to-PU placement and binding
pub mod binding;

/// Cache geometry extraction
pub mod cache;

/// Collective communication between processes
pub mod comm;

/// Setup configuration
pub mod config;

/// Operator reports
pub mod diagnostics;

/// Error types
pub mod error;

/// Process-to-host mapping
pub mod host;

/// Logging setup
pub mod logging;

/// Hardware topology queries
pub mod topology;

pub use binding::{BindOutcome, BindingPlan, ThreadBinding, ThreadPlacement};
pub use cache::{CacheLevelInfo, NodeTopologyInfo};
pub use comm::{Communicator, LocalGroup, SingleProcess};
pub use config::{BindingPolicy, HostIdentityKind, TopologyConfig};
pub use error::TopologyError;
pub use host::HostAssignment;
pub use topology::{HardwareInventory, SyntheticTopology, SysfsTopology, TopologyService};

/// Everything topology setup determined for the calling process
#[derive(Debug, Clone)]
pub struct SystemTopology {
    /// Where this process sits among hosts
    pub assignment: HostAssignment,
    /// Core and PU counts of this host
    pub inventory: HardwareInventory,
    /// Bindings applied to the worker pool, in worker order (empty if none were applied)
    pub bindings: Vec<ThreadBinding>,
    /// Figures published to numerics code
    pub info: NodeTopologyInfo,
}

/// Run topology setup for the calling process
///
/// Every member of `comm` must call this collectively. Binding applies to the
/// workers of `pool`, which keep their binding for the rest of the run.
pub fn system_topology(
    config: &TopologyConfig,
    comm: &dyn Communicator,
    service: &dyn TopologyService,
    pool: &ThreadPool,
) -> anyhow::Result<SystemTopology> {
    let identity = config.host_identity.strategy();
    let assignment = host::resolve_host_mapping(comm, identity.as_ref())
        .context("Failed to determine the process-to-host mapping")?;

    let support = service.support();
    if config.report_topology {
        diagnostics::report_support(&support);
        diagnostics::report_objects(service);
        diagnostics::report_bindings(pool, service);
    }

    let threads_per_process = pool.current_num_threads();
    let inventory =
        HardwareInventory::query(service).context("Failed to query the hardware inventory")?;
    let plan = inventory
        .map(|inv| BindingPlan::new(&inv, &assignment, threads_per_process))
        .transpose()
        .context("Failed to compute thread placement")?;

    let mut bindings = Vec::new();
    if config.set_thread_bindings.should_bind() {
        match plan {
            _ if !support.set_thread_binding => {
                tracing::info!("Cannot set thread CPU bindings");
            }
            None => {
                tracing::info!("Topology reports no cores or PUs, leaving threads unbound");
            }
            Some(ref plan) => {
                tracing::info!("Setting thread CPU bindings:");
                bindings = binding::bind_worker_pool(pool, service, plan, &assignment)
                    .context("Failed to bind worker threads")?;
                if config.report_topology {
                    diagnostics::report_bindings(pool, service);
                }
            }
        }
    } else {
        tracing::debug!("Thread binding disabled ({})", config.set_thread_bindings.description());
    }

    let (inventory, plan) = match (inventory, plan) {
        (Some(inventory), Some(plan)) => (inventory, plan),
        _ => {
            // Reports which object kind is missing
            HardwareInventory::require(service)
                .context("Cannot determine SMT threads per core")?;
            anyhow::bail!("Hardware inventory unavailable");
        }
    };

    plan.report();
    let info = NodeTopologyInfo::load(service, &plan).context("Failed to read cache topology")?;

    Ok(SystemTopology {
        assignment,
        inventory,
        bindings,
        info,
    })
}

/// Run topology setup and collapse the outcome to a status code
///
/// Returns 0 on success and 1 on failure; the failure is logged.
pub fn system_topology_status(
    config: &TopologyConfig,
    comm: &dyn Communicator,
    service: &dyn TopologyService,
    pool: &ThreadPool,
) -> (i32, Option<SystemTopology>) {
    match system_topology(config, comm, service, pool) {
        Ok(topology) => (0, Some(topology)),
        Err(err) => {
            tracing::error!("Topology setup failed: {:#}", err);
            (1, None)
        }
    }
}

/// Set up a single-process job on the local host
///
/// Builds the worker pool from `config`, discovers the host through sysfs and
/// releases the topology once setup is done.
pub fn setup_single_process(config: &TopologyConfig) -> anyhow::Result<(ThreadPool, SystemTopology)> {
    let pool = binding::build_worker_pool(config.num_threads)
        .context("Failed to build the worker pool")?;
    let service = SysfsTopology::detect();
    let topology = system_topology(config, &SingleProcess, &service, &pool)?;
    Ok((pool, topology))
}
