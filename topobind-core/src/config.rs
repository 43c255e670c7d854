//! Configuration for topology setup
//!
//! This module defines whether thread bindings are applied, how large the
//! worker pool is, and how a process identifies the host it runs on.

use std::fmt;
use std::str::FromStr;

use crate::error::TopologyError;
use crate::host::{CoordinateIdentity, HostIdentity, Hostname, StaticIdentity};

/// Environment variable selecting the binding policy
pub const ENV_SET_THREAD_BINDINGS: &str = "TOPOBIND_SET_THREAD_BINDINGS";
/// Environment variable fixing the worker pool size
pub const ENV_NUM_THREADS: &str = "TOPOBIND_NUM_THREADS";
/// Environment variable with hardware coordinates, e.g. `0,1,2,0,1,7`
pub const ENV_HOST_COORDS: &str = "TOPOBIND_HOST_COORDS";
/// Environment variable with an explicit host identifier
pub const ENV_HOST_ID: &str = "TOPOBIND_HOST_ID";
/// Environment variable enabling the hardware object report
pub const ENV_REPORT: &str = "TOPOBIND_REPORT";

/// Whether worker threads get pinned to hardware threads
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingPolicy {
    /// Always bind
    Yes,

    /// Discover and report topology only, never bind
    No,

    /// Let the library decide; currently binds on every system
    #[default]
    Auto,
}

impl fmt::Debug for BindingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yes => write!(f, "yes"),
            Self::No => write!(f, "no"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl fmt::Display for BindingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for BindingPolicy {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            "auto" => Ok(Self::Auto),
            other => Err(TopologyError::InvalidConfig(format!(
                "set_thread_bindings must be one of yes, no, auto (got {other:?})"
            ))),
        }
    }
}

impl BindingPolicy {
    /// Returns true if thread bindings should be applied
    pub fn should_bind(&self) -> bool {
        match self {
            Self::Yes | Self::Auto => true,
            Self::No => false,
        }
    }

    /// Returns a human-readable description of this policy
    pub fn description(&self) -> String {
        match self {
            Self::Yes => "Bind every worker thread to one PU".to_string(),
            Self::No => "Report topology only, leave threads unbound".to_string(),
            Self::Auto => "Automatic (binds every worker thread to one PU)".to_string(),
        }
    }
}

/// How a process computes the string that identifies its host
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostIdentityKind {
    /// Use the reported host name
    #[default]
    Hostname,

    /// Use hardware coordinates; the trailing per-node core index is dropped
    Coordinates(Vec<u32>),

    /// Use a fixed identifier
    Static(String),
}

impl HostIdentityKind {
    /// Build the identity strategy this kind selects
    pub fn strategy(&self) -> Box<dyn HostIdentity> {
        match self {
            Self::Hostname => Box::new(Hostname),
            Self::Coordinates(coords) => Box::new(CoordinateIdentity::from_hardware_coords(coords)),
            Self::Static(id) => Box::new(StaticIdentity::new(id.clone())),
        }
    }
}

/// Settings for one topology setup pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    /// Binding policy
    pub set_thread_bindings: BindingPolicy,

    /// Worker pool size; `None` uses one thread per logical CPU
    pub num_threads: Option<usize>,

    /// Host identification strategy
    pub host_identity: HostIdentityKind,

    /// Log the support table and hardware objects during setup
    pub report_topology: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            set_thread_bindings: BindingPolicy::default(),
            num_threads: None,
            host_identity: HostIdentityKind::default(),
            report_topology: true,
        }
    }
}

impl TopologyConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, TopologyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// Missing keys keep their defaults. `TOPOBIND_HOST_ID` takes precedence
    /// over `TOPOBIND_HOST_COORDS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TopologyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(policy) = lookup(ENV_SET_THREAD_BINDINGS) {
            config.set_thread_bindings = policy.parse()?;
        }

        if let Some(threads) = lookup(ENV_NUM_THREADS) {
            let count = threads.trim().parse::<usize>().map_err(|e| {
                TopologyError::InvalidConfig(format!("{ENV_NUM_THREADS}={threads:?}: {e}"))
            })?;
            if count == 0 {
                return Err(TopologyError::InvalidConfig(format!(
                    "{ENV_NUM_THREADS} must be at least 1"
                )));
            }
            config.num_threads = Some(count);
        }

        if let Some(id) = lookup(ENV_HOST_ID) {
            config.host_identity = HostIdentityKind::Static(id.trim().to_string());
        } else if let Some(coords) = lookup(ENV_HOST_COORDS) {
            config.host_identity = HostIdentityKind::Coordinates(parse_coords(&coords)?);
        }

        if let Some(report) = lookup(ENV_REPORT) {
            config.report_topology = match report.trim().to_ascii_lowercase().as_str() {
                "1" | "yes" | "true" => true,
                "0" | "no" | "false" => false,
                other => {
                    return Err(TopologyError::InvalidConfig(format!(
                        "{ENV_REPORT} must be yes or no (got {other:?})"
                    )))
                }
            };
        }

        Ok(config)
    }
}

/// Parse a coordinate list like "0,1,2,0,1,7"
fn parse_coords(s: &str) -> Result<Vec<u32>, TopologyError> {
    let coords = s
        .split(',')
        .map(|part| part.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TopologyError::InvalidConfig(format!("{ENV_HOST_COORDS}={s:?}: {e}")))?;

    if coords.len() < 2 {
        return Err(TopologyError::InvalidConfig(format!(
            "{ENV_HOST_COORDS} needs the node coordinates followed by the core index"
        )));
    }
    Ok(coords)
}
