//! Topology and binding reports for operators.

use rayon::ThreadPool;

use crate::topology::{BindingSupport, CacheAttributes, TopologyService};

/// Log which discovery and binding operations the topology service supports.
pub fn report_support(support: &BindingSupport) {
    let yes_no = |flag: bool| if flag { "yes" } else { "no" };

    tracing::info!("Topology support:");
    tracing::info!("  {:<28}: {}", "discovery->pu", yes_no(support.discovery_pu));
    tracing::info!("  {:<28}: {}", "cpubind->set_thisthread", yes_no(support.set_thread_binding));
    tracing::info!("  {:<28}: {}", "cpubind->get_thisthread", yes_no(support.get_thread_binding));
    tracing::info!("  {:<28}: {}", "cpubind->strict", yes_no(support.strict_binding));
}

/// Log the cores, PUs and data caches of this host.
pub fn report_objects(service: &dyn TopologyService) {
    let (Some(cores), Some(pus)) = (service.core_count(), service.pu_count()) else {
        tracing::info!("Hardware objects in this node: not reported");
        return;
    };

    tracing::info!("Hardware objects in this node:");
    let pus_per_core = if cores > 0 { pus / cores } else { 0 };
    for core_idx in 0..cores {
        let Some(core) = service.core(core_idx) else {
            continue;
        };
        let core_pus: Vec<String> = (core_idx * pus_per_core..(core_idx + 1) * pus_per_core)
            .filter_map(|pu_idx| service.pu(pu_idx))
            .map(|pu| pu.to_string())
            .collect();
        tracing::info!("  Core {}: PU {}", core, core_pus.join(", PU "));
    }

    for level in 1.. {
        let Some(cache) = service.data_cache(level) else {
            break;
        };
        tracing::info!("  {}", describe_cache(&cache));
    }
}

fn describe_cache(cache: &CacheAttributes) -> String {
    format!(
        "L{} {} cache: size {} linesize {} associativity {} stride {}",
        cache.level,
        cache.kind,
        cache.size,
        cache.line_size,
        cache.associativity,
        cache.stride()
    )
}

/// Collect the current CPU binding of every pool worker and log it.
///
/// Each worker reports through one broadcast; the calling thread logs the
/// collected bindings in worker order. Returns `None` if the service cannot
/// read bindings.
pub fn report_bindings(
    pool: &ThreadPool,
    service: &dyn TopologyService,
) -> Option<Vec<Option<Vec<usize>>>> {
    if !service.support().get_thread_binding {
        tracing::info!("Cannot determine thread CPU bindings");
        return None;
    }

    let bindings = pool.broadcast(|_| service.current_thread_binding().ok());

    tracing::info!("Thread CPU bindings:");
    for (thread, binding) in bindings.iter().enumerate() {
        match binding {
            Some(pus) => tracing::info!("  Worker thread {}: PU set P#{{{}}}", thread, format_pu_set(pus)),
            None => tracing::warn!("Could not obtain CPU binding for thread {}", thread),
        }
    }

    Some(bindings)
}

/// Format OS indices as a compact list like "0-3,8,10-11".
pub fn format_pu_set(pus: &[usize]) -> String {
    let mut sorted = pus.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(",")
}
