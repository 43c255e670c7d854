//! Host identification strategies
//!
//! Processes on one physical node must produce byte-identical identifiers.
//! The reported host name works almost everywhere; on machines whose name
//! embeds per-process information the hardware coordinates of the node are
//! used instead.

use sysinfo::{System, SystemExt};

use crate::error::TopologyError;

/// Computes the string that identifies the calling process's host
pub trait HostIdentity: Send + Sync {
    /// Identifier shared by every process on this host
    fn host_id(&self) -> Result<String, TopologyError>;
}

/// Uses the host name reported by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct Hostname;

impl HostIdentity for Hostname {
    fn host_id(&self) -> Result<String, TopologyError> {
        System::new()
            .host_name()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| TopologyError::HostIdentity("operating system reports no host name".into()))
    }
}

/// Uses a node's hardware coordinates
///
/// The coordinates passed to [`CoordinateIdentity::from_hardware_coords`]
/// end with the core index inside the node, which differs between processes
/// on the same node and is therefore dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinateIdentity {
    node_coords: Vec<u32>,
}

impl CoordinateIdentity {
    /// Build from the full coordinate tuple of the calling process
    pub fn from_hardware_coords(coords: &[u32]) -> Self {
        let node_len = coords.len().saturating_sub(1);
        Self {
            node_coords: coords[..node_len].to_vec(),
        }
    }

    /// Coordinates of the node, without the core index
    pub fn node_coords(&self) -> &[u32] {
        &self.node_coords
    }
}

impl HostIdentity for CoordinateIdentity {
    fn host_id(&self) -> Result<String, TopologyError> {
        if self.node_coords.is_empty() {
            return Err(TopologyError::HostIdentity(
                "no node coordinates available".into(),
            ));
        }
        let parts: Vec<String> = self.node_coords.iter().map(u32::to_string).collect();
        Ok(format!("({})", parts.join(",")))
    }
}

/// Uses a fixed, externally supplied identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity(String);

impl StaticIdentity {
    /// Create a new static identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl HostIdentity for StaticIdentity {
    fn host_id(&self) -> Result<String, TopologyError> {
        if self.0.is_empty() {
            return Err(TopologyError::HostIdentity("empty host identifier".into()));
        }
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_detect() {
        // Containers without a host name report an error instead of ""
        if let Ok(name) = Hostname.host_id() {
            println!("Detected host name: {name}");
            assert!(!name.is_empty());
        }
    }

    #[test]
    fn test_coordinates_drop_core_index() {
        let a = CoordinateIdentity::from_hardware_coords(&[0, 1, 2, 3, 4, 0]);
        let b = CoordinateIdentity::from_hardware_coords(&[0, 1, 2, 3, 4, 15]);
        assert_eq!(a.node_coords(), &[0, 1, 2, 3, 4]);
        assert_eq!(a.host_id().unwrap(), "(0,1,2,3,4)");
        assert_eq!(a.host_id().unwrap(), b.host_id().unwrap());

        let other_node = CoordinateIdentity::from_hardware_coords(&[0, 1, 2, 3, 5, 0]);
        assert_ne!(a.host_id().unwrap(), other_node.host_id().unwrap());
    }

    #[test]
    fn test_coordinates_need_a_node() {
        assert!(CoordinateIdentity::from_hardware_coords(&[7]).host_id().is_err());
        assert!(CoordinateIdentity::from_hardware_coords(&[]).host_id().is_err());
    }

    #[test]
    fn test_static_identity() {
        assert_eq!(StaticIdentity::new("node-a").host_id().unwrap(), "node-a");
        assert!(StaticIdentity::new("").host_id().is_err());
    }
}
