//! Target resolution data model (spec §3, §4.2).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved inventory/target group name; its presence in an input file is a
/// hard error (spec §3 "Invariant").
pub const RESERVED_ALL: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Destination {
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub proxy_command: Option<String>,
}

impl Destination {
    /// Port defaults to 22 when zero (spec §3 "Destination").
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 { 22 } else { self.port }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.host.as_str())
    }

    /// Identity tuple for deduplication (spec §3, §4.2).
    pub fn identity(&self, user_fallback: &str) -> (String, u16, String) {
        (
            self.host.clone(),
            self.effective_port(),
            self.user.clone().unwrap_or_else(|| user_fallback.to_string()),
        )
    }
}

/// Any non-empty subset of `{hosts, groups, names, tags}` (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Target {
    #[serde(default)]
    pub hosts: Vec<Destination>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Target {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.groups.is_empty() && self.names.is_empty() && self.tags.is_empty()
    }
}

/// `{groups: map<name, []Destination>, hosts: []Destination}` plus the
/// synthesized `all` group (spec §3 "InventoryData").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InventoryData {
    #[serde(default)]
    pub groups: HashMap<String, Vec<Destination>>,
    #[serde(default)]
    pub hosts: Vec<Destination>,
}

impl InventoryData {
    /// Reject `all` present in raw input; the group is synthesized, never
    /// declared (spec §3).
    pub fn validate_no_reserved_group(&self) -> Result<(), String> {
        if self.groups.contains_key(RESERVED_ALL) {
            return Err(format!("inventory group name '{RESERVED_ALL}' is reserved"));
        }
        Ok(())
    }

    /// Materialize the synthetic `all` group: every host from every group
    /// plus top-level `hosts`, sorted by host name (spec §3, §4.1 step 9).
    pub fn materialize_all(&mut self, default_user: Option<&str>) {
        for dest in self.hosts.iter_mut().chain(self.groups.values_mut().flatten()) {
            if dest.port == 0 {
                dest.port = 22;
            }
            if dest.user.is_none() {
                dest.user = default_user.map(|s| s.to_string());
            }
        }

        let mut all: Vec<Destination> = self.hosts.clone();
        let mut group_names: Vec<&String> = self.groups.keys().collect();
        group_names.sort();
        for name in group_names {
            all.extend(self.groups[name].iter().cloned());
        }
        all.sort_by(|a, b| a.host.cmp(&b.host));
        self.groups.insert(RESERVED_ALL.to_string(), all);
    }

    pub fn all(&self) -> &[Destination] {
        self.groups
            .get(RESERVED_ALL)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn group(&self, name: &str) -> &[Destination] {
        self.groups.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// CLI-provided overrides (spec §3 "Overrides").
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub user: Option<String>,
    pub inventory: Option<String>,
    pub environment: HashMap<String, String>,
    pub ad_hoc_command: Option<String>,
    pub ssh_shell: Option<String>,
}
