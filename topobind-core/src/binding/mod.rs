//! Thread-to-PU binding
//!
//! This module is responsible for:
//! - Computing where each worker thread of a process belongs on its host
//! - Building the worker pool whose threads get bound
//! - Pinning those threads, strictly where possible

mod apply;
mod plan;

pub use apply::{bind_current_thread, bind_worker_pool, BindOutcome, ThreadBinding};
pub use plan::{BindingPlan, PlacementWarning, ThreadPlacement};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::TopologyError;

/// Build the fork-join pool whose workers are bound
///
/// `None` sizes the pool to the number of logical CPUs.
pub fn build_worker_pool(num_threads: Option<usize>) -> Result<ThreadPool, TopologyError> {
    let num_threads = num_threads.unwrap_or_else(num_cpus::get);
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|idx| format!("topobind-worker-{idx}"))
        .build()?;
    Ok(pool)
}
