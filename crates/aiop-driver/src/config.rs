//! Tunables and validated names.

use crate::error::{AiopError, Result};
use aiop_mc::layout::{CONTAINER_NAME_MAX, DEFAULT_CONTAINER};

/// A validated fsl-mc container object name such as `dprc.5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerName(String);

impl ContainerName {
    /// Validate a container name.
    ///
    /// # Errors
    ///
    /// Returns [`AiopError::InvalidContainerName`] if the name is empty,
    /// longer than ten characters, or contains a path separator.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("empty")
        } else if name.chars().count() > CONTAINER_NAME_MAX {
            Some("longer than 10 characters")
        } else if name.contains('/') {
            Some("contains '/'")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(AiopError::InvalidContainerName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// Name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContainerName {
    fn default() -> Self {
        Self(DEFAULT_CONTAINER.to_string())
    }
}

impl std::fmt::Display for ContainerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ContainerName {
    type Err = AiopError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Capacities of the [`ResourcePool`](crate::ResourcePool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Maximum groups held at once
    pub groups: usize,
    /// Maximum containers held at once
    pub containers: usize,
    /// Maximum groups attached to one container
    pub groups_per_container: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            groups: 1,
            containers: 1,
            groups_per_container: 1,
        }
    }
}

/// Bounds on MC command completion polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Status reads before giving up
    pub max_polls: u32,
    /// Yield the thread every this many reads
    pub yield_interval: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_polls: 1_000_000,
            yield_interval: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_limits() {
        assert!(ContainerName::new("dprc.5").is_ok());
        assert!(ContainerName::new("dprc.12345").is_ok());
        assert!(ContainerName::new("dprc.123456").is_err());
        assert!(ContainerName::new("").is_err());
        assert!(ContainerName::new("../dprc").is_err());
    }

    #[test]
    fn default_container() {
        assert_eq!(ContainerName::default().as_str(), "dprc.5");
        let parsed: ContainerName = "dprc.7".parse().unwrap();
        assert_eq!(parsed.to_string(), "dprc.7");
    }

    #[test]
    fn rejection_is_a_validation_error() {
        let err = ContainerName::new("").unwrap_err();
        assert!(err.is_validation());
    }
}
