//! Application profile document
//!
//! One profile exists per (namespace, application). It is stored as a YAML
//! blob and carries the desired port-forwards of every service next to
//! metadata owned by other tools. Fields this crate does not model are kept
//! in `extra` so a read-modify-write never drops them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::types::{ForwardKey, PortForwardStatus, PrivilegeLevel};

/// Substring identifying a profile key, also in older layouts
pub const PROFILE_KEY_MARKER: &str = "profile.v2";

/// Service type assumed when neither the command nor the profile names one
pub const DEFAULT_SERVICE_TYPE: &str = "deployment";

/// Primary key of the profile blob for an application
pub fn profile_key(namespace: &str, application: &str) -> String {
    format!("{}.{}.{}", namespace, application, PROFILE_KEY_MARKER)
}

/// Persisted state of one tunnel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardRecord {
    #[serde(alias = "localport")]
    pub local_port: u16,

    #[serde(alias = "remoteport")]
    pub remote_port: u16,

    #[serde(default, alias = "podname")]
    pub pod_name: String,

    #[serde(default, alias = "servicetype")]
    pub service_type: String,

    #[serde(default, alias = "servicename")]
    pub service_name: String,

    #[serde(default)]
    pub role: String,

    #[serde(default)]
    pub status: PortForwardStatus,

    #[serde(default)]
    pub reason: String,

    #[serde(default, alias = "updated")]
    pub updated_at: String,

    /// Which daemon instance supervises the tunnel
    #[serde(default, alias = "sudo")]
    pub owner_is_privileged: bool,

    /// Diagnostic only; never used to decide liveness
    #[serde(default, alias = "daemonserverpid")]
    pub owner_process_id: u32,
}

impl PortForwardRecord {
    pub fn key(&self) -> ForwardKey {
        ForwardKey::new(self.local_port, self.remote_port)
    }

    pub fn owner(&self) -> PrivilegeLevel {
        PrivilegeLevel::from_flag(self.owner_is_privileged)
    }
}

/// Per-service section of a profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProfile {
    #[serde(default)]
    pub actual_name: String,

    #[serde(default, rename = "serviceType", alias = "type")]
    pub service_type: String,

    #[serde(default)]
    pub dev_port_forward_list: Vec<PortForwardRecord>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ServiceProfile {
    pub fn new(actual_name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            actual_name: actual_name.into(),
            service_type: service_type.into(),
            ..Default::default()
        }
    }

    fn matches(&self, name: &str, service_type: &str) -> bool {
        self.actual_name == name && self.service_type.eq_ignore_ascii_case(service_type)
    }
}

/// Aggregate document persisted per (namespace, application)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationProfile {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default)]
    pub svc_profile: Vec<ServiceProfile>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ApplicationProfile {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Service section, created when missing
    pub fn service_mut(&mut self, name: &str, service_type: &str) -> &mut ServiceProfile {
        let idx = match self
            .svc_profile
            .iter()
            .position(|s| s.matches(name, service_type))
        {
            Some(idx) => idx,
            None => {
                self.svc_profile.push(ServiceProfile::new(name, service_type));
                self.svc_profile.len() - 1
            }
        };
        &mut self.svc_profile[idx]
    }

    /// Find a record by key in any service
    pub fn find_record(&self, key: ForwardKey) -> Option<(&ServiceProfile, &PortForwardRecord)> {
        self.svc_profile.iter().find_map(|svc| {
            svc.dev_port_forward_list
                .iter()
                .find(|r| r.key() == key)
                .map(|r| (svc, r))
        })
    }

    pub fn find_record_mut(&mut self, key: ForwardKey) -> Option<&mut PortForwardRecord> {
        self.svc_profile
            .iter_mut()
            .flat_map(|svc| svc.dev_port_forward_list.iter_mut())
            .find(|r| r.key() == key)
    }

    /// Insert or replace the record for its key
    ///
    /// A record with the same key under another service is removed first so
    /// the key stays unique within the application.
    pub fn upsert_record(&mut self, service: &str, service_type: &str, record: PortForwardRecord) {
        let key = record.key();
        for svc in self
            .svc_profile
            .iter_mut()
            .filter(|s| !s.matches(service, service_type))
        {
            svc.dev_port_forward_list.retain(|r| r.key() != key);
        }

        let svc = self.service_mut(service, service_type);
        match svc.dev_port_forward_list.iter_mut().find(|r| r.key() == key) {
            Some(existing) => *existing = record,
            None => svc.dev_port_forward_list.push(record),
        }
    }

    /// Remove the record for `key`; returns whether one existed
    pub fn remove_record(&mut self, key: ForwardKey) -> bool {
        let mut removed = false;
        for svc in &mut self.svc_profile {
            let before = svc.dev_port_forward_list.len();
            svc.dev_port_forward_list.retain(|r| r.key() != key);
            removed |= svc.dev_port_forward_list.len() != before;
        }
        removed
    }

    /// Every record with the service it belongs to
    pub fn records(&self) -> impl Iterator<Item = (&ServiceProfile, &PortForwardRecord)> {
        self.svc_profile
            .iter()
            .flat_map(|svc| svc.dev_port_forward_list.iter().map(move |r| (svc, r)))
    }
}
