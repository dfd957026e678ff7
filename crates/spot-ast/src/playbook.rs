//! Playbook and Task data model (spec §3).

use crate::command::{CmdOptions, Command};
use crate::secrets::SecretsProvider;
use crate::target::Target;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Named, ordered sequence of commands (spec §3 "Task").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub options: Option<CmdOptions>,
    #[serde(default)]
    pub on_error: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    pub commands: Vec<Command>,
}

/// Top-level document (spec §3 "Playbook").
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Playbook {
    pub user: Option<String>,
    /// SSH identity file path (spec §6 full-shape schema). Key loading
    /// itself is the SSH transport's concern (§1 "Explicitly out of
    /// scope"); this field only carries the path through to the
    /// `Executor` collaborator's `Connect` call.
    pub ssh_key: Option<String>,
    pub ssh_shell: Option<String>,
    pub local_shell: Option<String>,
    pub inventory: Option<String>,
    #[serde(default)]
    pub targets: HashMap<String, Target>,
    pub tasks: Vec<Task>,

    /// All resolved secret values, used for log masking (§3 "non-serialized
    /// fields"). Populated by the loader, never read from the file.
    #[serde(skip)]
    pub secrets: Vec<String>,
    /// The secrets backend used to resolve `options.secrets` keys.
    #[serde(skip)]
    pub secrets_provider: Option<Arc<dyn SecretsProvider>>,
}

impl std::fmt::Debug for Playbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Playbook")
            .field("user", &self.user)
            .field("ssh_shell", &self.ssh_shell)
            .field("local_shell", &self.local_shell)
            .field("inventory", &self.inventory)
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .field("tasks", &self.tasks.iter().map(|t| &t.name).collect::<Vec<_>>())
            .field("secrets_provider", &self.secrets_provider.is_some())
            .finish()
    }
}

/// Minimal shape accepted for the "simple" playbook form (spec §4.1 step 4,
/// §6 "Simple shape"): `task: [...]` plus flat `target`/`targets` strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimplePlaybook {
    pub user: Option<String>,
    pub ssh_key: Option<String>,
    pub ssh_shell: Option<String>,
    pub local_shell: Option<String>,
    pub inventory: Option<String>,
    #[serde(default)]
    pub task: Vec<Command>,
    pub target: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}
