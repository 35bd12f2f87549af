//! Per-host runtime state
//!
//! Every host in a run owns exactly one [`HostContext`]. It is moved into
//! the tokio task that runs the host's play and handed back when the play
//! finishes, so nothing about a host is ever shared between tasks. Facts and
//! registered results survive from one play to the next.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::inventory::{Host, Inventory};
use crate::playbook::Play;
use crate::template::{TemplateEngine, TemplateVars};

/// Recap counters for one host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    /// Tasks that succeeded, changed ones included
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unreachable: usize,
    /// Failures tolerated by `ignore_errors`
    pub ignored: usize,
    /// Block failures recovered by `rescue`
    pub rescued: usize,
}

/// Values shared by every host of one play
#[derive(Clone, Copy)]
pub struct PlayScope<'a> {
    pub engine: &'a TemplateEngine,
    pub inventory: &'a Inventory,
    pub play: &'a Play,
    /// Hosts selected for the play
    pub play_hosts: &'a [String],
    /// Inventory variables of every host, keyed by host name
    pub hostvars: &'a JsonValue,
    /// Group name to member host names
    pub groups: &'a JsonValue,
    pub extra_vars: &'a IndexMap<String, JsonValue>,
}

impl<'a> PlayScope<'a> {
    /// Inventory variables of every host
    pub fn inventory_hostvars(inventory: &Inventory) -> JsonValue {
        JsonValue::Object(
            inventory
                .hosts()
                .map(|h| {
                    let vars: serde_json::Map<_, _> = inventory.host_vars(h).into_iter().collect();
                    (h.name.clone(), JsonValue::Object(vars))
                })
                .collect(),
        )
    }

    /// Group membership as a JSON object
    pub fn inventory_groups(inventory: &Inventory) -> JsonValue {
        JsonValue::Object(
            inventory
                .groups_map()
                .into_iter()
                .map(|(group, hosts)| {
                    (
                        group,
                        JsonValue::Array(hosts.into_iter().map(JsonValue::String).collect()),
                    )
                })
                .collect(),
        )
    }
}

/// State owned by one host for the whole run
#[derive(Debug)]
pub struct HostContext {
    pub host: Host,
    /// Gathered facts without the `ansible_` prefix
    pub facts: TemplateVars,
    /// Results stored by `register`
    pub registered: IndexMap<String, JsonValue>,
    /// Handlers notified in the current play, in first-notified order
    pending_handlers: IndexSet<String>,
    pub stats: HostStats,
    /// Unrecovered task failure; the host takes no part in later plays
    pub failed: bool,
    pub unreachable: bool,
    /// Tasks were left unissued because the run was stopped
    pub cancelled: bool,
    facts_gathered: bool,
    connection: Option<Arc<dyn Connection>>,
}

impl HostContext {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            facts: TemplateVars::new(),
            registered: IndexMap::new(),
            pending_handlers: IndexSet::new(),
            stats: HostStats::default(),
            failed: false,
            unreachable: false,
            cancelled: false,
            facts_gathered: false,
            connection: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.host.name
    }

    /// Whether the host can take part in a play
    pub fn is_active(&self) -> bool {
        !self.failed && !self.unreachable
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.clone()
    }

    pub fn set_connection(&mut self, connection: Arc<dyn Connection>) {
        self.connection = Some(connection);
    }

    pub fn facts_gathered(&self) -> bool {
        self.facts_gathered
    }

    /// Merge facts reported by a module
    pub fn merge_facts(&mut self, facts: &serde_json::Map<String, JsonValue>) {
        for (key, value) in facts {
            trace!(host = %self.host.name, fact = %key, "Setting fact");
            self.facts.insert(key.clone(), value.clone());
        }
    }

    pub fn mark_facts_gathered(&mut self) {
        self.facts_gathered = true;
    }

    pub fn register(&mut self, name: impl Into<String>, result: JsonValue) {
        let name = name.into();
        debug!(host = %self.host.name, var = %name, "Registered result");
        self.registered.insert(name, result);
    }

    /// Queue handlers; a name already pending keeps its position
    pub fn notify<'n>(&mut self, names: impl IntoIterator<Item = &'n String>) {
        for name in names {
            if self.pending_handlers.insert(name.clone()) {
                debug!(host = %self.host.name, handler = %name, "Handler notified");
            }
        }
    }

    pub fn has_pending_handlers(&self) -> bool {
        !self.pending_handlers.is_empty()
    }

    /// Drain the pending set in first-notified order
    pub fn take_pending_handlers(&mut self) -> IndexSet<String> {
        std::mem::take(&mut self.pending_handlers)
    }

    /// Forget notifications left over from a previous play
    pub fn begin_play(&mut self) {
        self.pending_handlers.clear();
    }

    /// Variables visible to templates for this host.
    ///
    /// Later sources win: inventory variables, play variables, facts,
    /// registered results, extra variables, then the magic variables.
    pub fn template_vars(&self, scope: &PlayScope<'_>) -> TemplateVars {
        let mut vars = TemplateVars::new();

        for (key, value) in scope.inventory.host_vars(&self.host) {
            vars.insert(key, value);
        }

        // Play variables may reference inventory variables and each other.
        for (key, value) in &scope.play.vars {
            let resolved = scope
                .engine
                .render_value(value, &vars)
                .unwrap_or_else(|_| value.clone());
            vars.insert(key.clone(), resolved);
        }

        if !self.facts.is_empty() {
            for (key, value) in &self.facts {
                vars.insert(format!("ansible_{}", key), value.clone());
            }
            vars.insert(
                "ansible_facts".to_string(),
                JsonValue::Object(self.facts.clone()),
            );
        }

        for (key, value) in &self.registered {
            vars.insert(key.clone(), value.clone());
        }

        for (key, value) in scope.extra_vars {
            vars.insert(key.clone(), value.clone());
        }

        let short = self
            .host
            .name
            .split('.')
            .next()
            .unwrap_or(&self.host.name)
            .to_string();
        vars.insert(
            "inventory_hostname".to_string(),
            JsonValue::String(self.host.name.clone()),
        );
        vars.insert(
            "inventory_hostname_short".to_string(),
            JsonValue::String(short),
        );
        vars.insert(
            "group_names".to_string(),
            JsonValue::Array(
                scope
                    .inventory
                    .group_names(&self.host)
                    .into_iter()
                    .map(JsonValue::String)
                    .collect(),
            ),
        );
        vars.insert("groups".to_string(), scope.groups.clone());
        vars.insert("hostvars".to_string(), scope.hostvars.clone());
        let play_hosts = JsonValue::Array(
            scope
                .play_hosts
                .iter()
                .cloned()
                .map(JsonValue::String)
                .collect(),
        );
        vars.insert("play_hosts".to_string(), play_hosts.clone());
        vars.insert("ansible_play_hosts".to_string(), play_hosts);

        vars
    }
}
