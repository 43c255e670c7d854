//! Applying a binding plan to worker threads
//!
//! Each worker of the pool binds itself to the PU its placement names. The
//! results come back in a per-thread vector and are logged by the caller.

use rayon::ThreadPool;

use crate::binding::{BindingPlan, ThreadPlacement};
use crate::error::TopologyError;
use crate::host::HostAssignment;
use crate::topology::{BindMode, TopologyObject, TopologyService};

/// Result of attempting to bind a thread to its PU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// Bound strictly to the requested PU
    Strict,
    /// Strict binding was refused, bound as a hint instead
    Loose,
    /// Binding is not supported on this host
    Unsupported,
    /// Both binding attempts failed; the thread runs unbound
    Failed(String),
}

impl BindOutcome {
    /// True if the thread ended up bound
    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Strict | Self::Loose)
    }
}

/// Binding applied to one worker thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadBinding {
    /// Where the plan put the thread
    pub placement: ThreadPlacement,
    /// Target core, if the topology knows it
    pub core: Option<TopologyObject>,
    /// Target PU, if the topology knows it
    pub pu: Option<TopologyObject>,
    /// What happened
    pub outcome: BindOutcome,
}

/// Bind the calling thread according to its placement
///
/// Tries a strict binding first and falls back to a loose one. Never fails:
/// problems are reported in the returned outcome.
pub fn bind_current_thread(
    service: &dyn TopologyService,
    placement: ThreadPlacement,
) -> ThreadBinding {
    let core = service.core(placement.core);
    let pu = service.pu(placement.pu);

    let outcome = match pu {
        Some(pu_obj) => match service.bind_current_thread(&pu_obj, BindMode::Strict) {
            Ok(()) => BindOutcome::Strict,
            Err(TopologyError::BindingUnsupported) => BindOutcome::Unsupported,
            Err(strict_err) => match service.bind_current_thread(&pu_obj, BindMode::Loose) {
                Ok(()) => {
                    tracing::debug!("Strict binding refused ({}), bound loosely", strict_err);
                    BindOutcome::Loose
                }
                Err(TopologyError::BindingUnsupported) => BindOutcome::Unsupported,
                Err(err) => BindOutcome::Failed(err.to_string()),
            },
        },
        None => BindOutcome::Failed(format!("topology has no PU L#{}", placement.pu)),
    };

    ThreadBinding {
        placement,
        core,
        pu,
        outcome,
    }
}

/// Bind every worker of `pool` to its PU
///
/// Runs once on each worker through a single broadcast; the result vector is
/// indexed by worker index. The pool must have `plan.threads_per_process()`
/// workers.
pub fn bind_worker_pool(
    pool: &ThreadPool,
    service: &dyn TopologyService,
    plan: &BindingPlan,
    assignment: &HostAssignment,
) -> Result<Vec<ThreadBinding>, TopologyError> {
    if pool.current_num_threads() != plan.threads_per_process() {
        return Err(TopologyError::InvalidConfig(format!(
            "plan covers {} threads but the pool has {}",
            plan.threads_per_process(),
            pool.current_num_threads()
        )));
    }

    let bindings = pool.broadcast(|ctx| bind_current_thread(service, plan.placement(ctx.index())));

    for binding in &bindings {
        log_binding(binding, assignment);
    }

    Ok(bindings)
}

fn log_binding(binding: &ThreadBinding, assignment: &HostAssignment) {
    let placement = &binding.placement;
    let describe = |obj: Option<TopologyObject>, logical: usize| match obj {
        Some(obj) => obj.to_string(),
        None => format!("L#{logical} (P#?)"),
    };

    tracing::info!(
        rank = assignment.proc_num,
        host = assignment.host_index,
        "thr {} of proc {} (thr {} on host {}): core {}, PU {}",
        placement.thread,
        assignment.proc_num,
        placement.host_thread,
        assignment.host_index,
        describe(binding.core, placement.core),
        describe(binding.pu, placement.pu)
    );

    match &binding.outcome {
        BindOutcome::Strict | BindOutcome::Loose => {}
        BindOutcome::Unsupported => {
            tracing::info!("Cannot set CPU binding for thread {}", placement.thread);
        }
        BindOutcome::Failed(reason) => {
            tracing::warn!(
                "Could not set CPU binding for thread {}: {}",
                placement.thread,
                reason
            );
        }
    }
}
