//! Group definition for the converge inventory.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// A group of hosts in the inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Group name
    pub name: String,

    /// Host names belonging directly to this group, in declaration order
    #[serde(default)]
    pub hosts: IndexSet<String>,

    /// Child group names
    #[serde(default)]
    pub children: IndexSet<String>,

    /// Parent group names (computed from children relationships)
    #[serde(skip)]
    pub parents: IndexSet<String>,

    /// Group-specific variables
    #[serde(default)]
    pub vars: IndexMap<String, serde_json::Value>,
}

impl Group {
    /// Create a new group with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: IndexSet::new(),
            children: IndexSet::new(),
            parents: IndexSet::new(),
            vars: IndexMap::new(),
        }
    }

    /// Add a host to this group
    pub fn add_host(&mut self, host: impl Into<String>) {
        self.hosts.insert(host.into());
    }

    /// Add a child group
    pub fn add_child(&mut self, child: impl Into<String>) {
        self.children.insert(child.into());
    }

    /// Record a parent group
    pub fn add_parent(&mut self, parent: impl Into<String>) {
        self.parents.insert(parent.into());
    }

    /// Set a group variable
    pub fn set_var(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.vars.insert(key.into(), value);
    }
}
