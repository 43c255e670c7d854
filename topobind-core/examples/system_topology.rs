//! System topology example.
//!
//! Runs topology setup for a single process on this machine and prints what
//! the rest of an application would see. Configure through the
//! `TOPOBIND_*` environment variables, e.g.
//! `TOPOBIND_SET_THREAD_BINDINGS=no TOPOBIND_NUM_THREADS=4`.

use topobind_core::{logging, setup_single_process, TopologyConfig};

fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = TopologyConfig::from_env()?;
    println!("Binding policy: {}", config.set_thread_bindings.description());

    let (pool, topology) = setup_single_process(&config)?;

    println!("Worker threads: {}", pool.current_num_threads());
    println!(
        "Cores: {}, PUs per core: {}",
        topology.inventory.core_count(),
        topology.inventory.pus_per_core()
    );
    println!("SMT threads used per core: {}", topology.info.num_smt_threads());

    let mut line_sizes = [0usize; 4];
    let mut strides = [0usize; 4];
    let levels = topology.info.cache_info(&mut line_sizes, &mut strides);
    for level in 0..levels.min(line_sizes.len()) {
        println!(
            "L{} cache: line size {} bytes, stride {} bytes",
            level + 1,
            line_sizes[level],
            strides[level]
        );
    }
    if levels > line_sizes.len() {
        println!("({} more cache levels not shown)", levels - line_sizes.len());
    }

    for binding in &topology.bindings {
        println!(
            "Worker {} -> PU L#{}: {:?}",
            binding.placement.thread, binding.placement.pu, binding.outcome
        );
    }

    Ok(())
}
