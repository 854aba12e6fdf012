//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::NameError;

/// Natural key of a tunnel: (local port, remote port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardKey {
    pub local_port: u16,
    pub remote_port: u16,
}

impl ForwardKey {
    /// Create a new key
    pub fn new(local_port: u16, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_port,
        }
    }
}

impl fmt::Display for ForwardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local_port, self.remote_port)
    }
}

/// Identifies one application inside one namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppRef {
    pub namespace: String,
    pub application: String,
}

impl AppRef {
    /// Create a new application reference
    pub fn new(namespace: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            application: application.into(),
        }
    }

    /// Check both parts are Kubernetes names
    ///
    /// They become path components under the data directory, so anything
    /// else (separators, `..`, upper case) is refused.
    pub fn validate(&self) -> Result<(), NameError> {
        if !is_dns_label(&self.namespace) {
            return Err(NameError {
                field: "namespace",
                value: self.namespace.clone(),
            });
        }
        if !is_dns_subdomain(&self.application) {
            return Err(NameError {
                field: "application",
                value: self.application.clone(),
            });
        }
        Ok(())
    }
}

/// RFC 1123 label: `[a-z0-9]([-a-z0-9]*[a-z0-9])?`, at most 63 bytes
fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// RFC 1123 subdomain: dot-separated labels, at most 253 bytes
fn is_dns_subdomain(s: &str) -> bool {
    s.len() <= 253 && s.split('.').all(is_dns_label)
}

impl fmt::Display for AppRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.application)
    }
}

/// Persisted status of a port-forward
///
/// The serialized names are part of the on-disk format and are read by
/// clients listing tunnel health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortForwardStatus {
    /// Record written, stream not yet ready
    #[default]
    #[serde(rename = "New")]
    New,
    /// Stream ready and the last heartbeat succeeded
    #[serde(rename = "LISTEN")]
    Listen,
    /// Stream closed, waiting to retry
    #[serde(rename = "RECONNECTING")]
    Reconnecting,
    /// Stream open but the heartbeat probe failed
    #[serde(rename = "HeartBeatLoss")]
    HeartBeatLoss,
    /// Terminal failure, no further retries
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
}

impl PortForwardStatus {
    /// Wire/storage name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            PortForwardStatus::New => "New",
            PortForwardStatus::Listen => "LISTEN",
            PortForwardStatus::Reconnecting => "RECONNECTING",
            PortForwardStatus::HeartBeatLoss => "HeartBeatLoss",
            PortForwardStatus::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for PortForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which daemon instance owns a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeLevel {
    /// Daemon running with normal user permissions
    Unprivileged,
    /// Daemon running elevated (root)
    Privileged,
}

impl PrivilegeLevel {
    /// Build from the persisted `ownerIsPrivileged` flag
    pub fn from_flag(privileged: bool) -> Self {
        if privileged {
            PrivilegeLevel::Privileged
        } else {
            PrivilegeLevel::Unprivileged
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, PrivilegeLevel::Privileged)
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivilegeLevel::Unprivileged => write!(f, "unprivileged"),
            PrivilegeLevel::Privileged => write!(f, "privileged"),
        }
    }
}
