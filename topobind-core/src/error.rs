//! Error types for topology setup.

use std::fmt;

/// Kind of hardware object the topology service is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Physical core
    Core,
    /// Processing unit (hardware thread)
    Pu,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core => write!(f, "core"),
            Self::Pu => write!(f, "PU"),
        }
    }
}

/// Errors that can occur while resolving hosts, discovering hardware or binding threads.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// Process group reported sizes or ranks that cannot be reconciled.
    #[error("Inconsistent process group: {0}")]
    InconsistentProcessGroup(String),

    /// A collective operation could not complete.
    #[error("Communication failure: {0}")]
    Communication(String),

    /// The host identifier could not be determined.
    #[error("Host identity unavailable: {0}")]
    HostIdentity(String),

    /// The topology service does not report objects of this kind.
    #[error("Topology does not report any {0} objects")]
    MissingObjects(ObjectKind),

    /// Hardware inventory violates its invariants.
    #[error("Inconsistent hardware topology: {0}")]
    InconsistentTopology(String),

    /// A cache level reported impossible geometry.
    #[error("Invalid cache geometry at level {level}: {reason}")]
    InvalidCache {
        /// Cache level, starting at 1
        level: usize,
        /// What was wrong
        reason: String,
    },

    /// Thread binding is not available on this host.
    #[error("Thread binding not supported")]
    BindingUnsupported,

    /// The bind request for a PU was refused.
    #[error("Binding to PU P#{pu} rejected: {reason}")]
    BindRejected {
        /// OS index of the PU
        pu: usize,
        /// Reason reported by the service
        reason: String,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Worker pool could not be built.
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TopologyError {
    /// Returns true if this error must abort topology setup.
    ///
    /// Capability absence and per-thread bind failures are absorbed by the
    /// caller; everything else leaves the host counts unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TopologyError::BindingUnsupported | TopologyError::BindRejected { .. }
        )
    }
}
