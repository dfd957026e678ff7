//! Playbook loader (spec §4.1): parse file (two shapes x two formats),
//! validate, merge overrides, populate secrets, load inventory.

use crate::resolver::{self, ResolveError};
use spot_ast::{Action, CmdOptions, Command, Destination, InventoryData, Overrides, Playbook, SecretsProvider, SimplePlaybook, Target, Task, RESERVED_ALL};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TASK_NAME: &str = "default";
const DEFAULT_TARGET_NAME: &str = "default";
const AD_HOC_TASK_NAME: &str = "ad-hoc";
const INVENTORY_ENV_VAR: &str = "SPOT_INVENTORY";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no playbook file found and no ad-hoc command given")]
    NoPlaybook,
    #[error("failed to parse playbook as either full or simple shape: full-shape error: {full}; simple-shape error: {simple}")]
    Parse { full: String, simple: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("secret {0:?} declared but no secrets provider configured")]
    NoSecretsProvider(String),
    #[error("failed to resolve secret {0:?}: {1}")]
    SecretResolution(String, String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("inventory fetch error: {0}")]
    Inventory(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("task {0:?} not found")]
    TaskNotFound(String),
}

/// Playbook plus its resolved inventory and the overrides it was loaded
/// with -- the runtime view the resolver/runner/gen modules operate on.
/// Mirrors spec §4.1 "Public accessors".
pub struct LoadedPlaybook {
    pub playbook: Playbook,
    pub inventory: Option<InventoryData>,
    pub overrides: Overrides,
}

impl LoadedPlaybook {
    /// `AllTasks()`: deep copy of the task list.
    pub fn all_tasks(&self) -> Vec<Task> {
        self.playbook.tasks.clone()
    }

    /// `Task(name)`: deep copy of one task with overrides applied. The
    /// special name `ad-hoc` synthesizes a task from
    /// `overrides.ad_hoc_command` regardless of whether it appears in the
    /// file.
    pub fn task(&self, name: &str) -> Result<Task, LoadError> {
        if name == AD_HOC_TASK_NAME {
            let script = self
                .overrides
                .ad_hoc_command
                .clone()
                .ok_or_else(|| LoadError::TaskNotFound(name.to_string()))?;
            return Ok(ad_hoc_task(&script));
        }

        let mut task = self
            .playbook
            .tasks
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| LoadError::TaskNotFound(name.to_string()))?;

        if let Some(user) = &self.overrides.user {
            task.user = Some(user.clone());
        }
        for cmd in task.commands.iter_mut() {
            for (k, v) in &self.overrides.environment {
                cmd.environment.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        Ok(task)
    }

    /// `TargetHosts(name)`.
    pub fn target_hosts(&self, name: &str) -> Result<Vec<Destination>, ResolveError> {
        resolver::resolve(&self.playbook, self.inventory.as_ref(), &self.overrides, None, name)
    }

    /// Resolve `name` with a task's own default user folded into the
    /// precedence chain (spec §4.2 "User precedence").
    pub fn target_hosts_for_task(&self, task_user: Option<&str>, name: &str) -> Result<Vec<Destination>, ResolveError> {
        resolver::resolve(&self.playbook, self.inventory.as_ref(), &self.overrides, task_user, name)
    }

    /// `AllSecretValues()`: sorted list of all secret values, for masking.
    pub fn all_secret_values(&self) -> Vec<String> {
        let mut values = self.playbook.secrets.clone();
        values.sort();
        values
    }

    /// `UpdateTasksTargets(vars)`: replace `$name`-prefixed target strings
    /// in every task with `vars[name]`; drop if unresolved. A literal `$`
    /// alone is not a variable.
    pub fn update_tasks_targets(&mut self, vars: &HashMap<String, String>) {
        for task in self.playbook.tasks.iter_mut() {
            task.targets = task
                .targets
                .iter()
                .filter_map(|t| match t.strip_prefix('$') {
                    Some("") | None => Some(t.clone()),
                    Some(name) => vars.get(name).cloned(),
                })
                .collect();
        }
    }
}

fn ad_hoc_task(script: &str) -> Task {
    Task {
        name: AD_HOC_TASK_NAME.to_string(),
        user: None,
        options: None,
        on_error: None,
        targets: vec![DEFAULT_TARGET_NAME.to_string()],
        commands: vec![command_from_script(script)],
    }
}

fn command_from_script(script: &str) -> Command {
    Command {
        name: None,
        action: Action::Script(script.to_string()),
        environment: HashMap::new(),
        condition: None,
        register: Vec::new(),
        on_exit: None,
        options: CmdOptions::default(),
        ssh_shell: None,
        local_shell: None,
        secrets: HashMap::new(),
    }
}

/// Load a playbook from `path`. If `path` is `None` or doesn't exist and
/// `overrides.ad_hoc_command` is set, synthesizes a fake single-task
/// playbook and skips straight to inventory loading (spec §4.1 step 1).
pub async fn load(
    path: Option<&Path>,
    overrides: Overrides,
    secrets_provider: Option<Arc<dyn SecretsProvider>>,
) -> Result<LoadedPlaybook, LoadError> {
    let mut playbook = match path.filter(|p| p.exists()) {
        Some(p) => {
            let content = tokio::fs::read_to_string(p).await?;
            parse_playbook(&content, p)?
        }
        None => {
            let script = overrides.ad_hoc_command.clone().ok_or(LoadError::NoPlaybook)?;
            synth_ad_hoc_playbook(&script)
        }
    };

    validate(&playbook)?;
    merge_task_options(&mut playbook);
    inject_shells(&mut playbook, &overrides);
    load_secrets(&mut playbook, secrets_provider.as_ref())?;

    let inventory = load_inventory(&playbook, &overrides).await?;

    Ok(LoadedPlaybook {
        playbook,
        inventory,
        overrides,
    })
}

fn synth_ad_hoc_playbook(script: &str) -> Playbook {
    Playbook {
        tasks: vec![ad_hoc_task(script)],
        ..Default::default()
    }
}

/// Determine format by extension: `.yml`/`.yaml`/no-extension -> YAML
/// strict mode; `.toml` -> TOML (spec §4.1 step 2). Attempt full-shape
/// first, then simple-shape (steps 3-5).
fn parse_playbook(content: &str, path: &Path) -> Result<Playbook, LoadError> {
    let is_toml = path.extension().map(|e| e == "toml").unwrap_or(false);

    let full_result: Result<Playbook, String> = if is_toml {
        toml::from_str(content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    };

    let full_is_nonempty = matches!(&full_result, Ok(pb) if !pb.tasks.is_empty());
    if full_is_nonempty {
        return Ok(full_result.unwrap());
    }

    let simple_result: Result<SimplePlaybook, String> = if is_toml {
        toml::from_str(content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    };

    match simple_result {
        Ok(simple) if !simple.task.is_empty() => Ok(synthesize_from_simple(simple)),
        Ok(_) => Err(LoadError::Parse {
            full: full_result.err().unwrap_or_else(|| "produced zero tasks".to_string()),
            simple: "produced zero commands".to_string(),
        }),
        Err(simple_err) => Err(LoadError::Parse {
            full: full_result.err().unwrap_or_else(|| "produced zero tasks".to_string()),
            simple: simple_err,
        }),
    }
}

/// Normalize the simple shape into a full playbook with one task named
/// `default` and one target named `default` (spec §4.1 step 4, §6 "Simple
/// shape").
fn synthesize_from_simple(simple: SimplePlaybook) -> Playbook {
    let mut target_strings = simple.targets.clone();
    if let Some(t) = simple.target {
        target_strings.push(t);
    }
    if target_strings.is_empty() {
        target_strings.push(DEFAULT_TARGET_NAME.to_string());
    }

    let has_inventory = simple.inventory.is_some() || std::env::var(INVENTORY_ENV_VAR).is_ok();
    let mut targets = HashMap::new();
    for t in &target_strings {
        let target = if let Some((host, port)) = t.split_once(':') {
            Target {
                hosts: vec![Destination {
                    host: host.to_string(),
                    port: port.parse().unwrap_or(22),
                    ..Default::default()
                }],
                ..Default::default()
            }
        } else if has_inventory {
            Target {
                names: vec![t.clone()],
                ..Default::default()
            }
        } else {
            Target {
                hosts: vec![Destination {
                    host: t.clone(),
                    port: 22,
                    ..Default::default()
                }],
                ..Default::default()
            }
        };
        targets.insert(t.clone(), target);
    }

    Playbook {
        user: simple.user,
        ssh_key: simple.ssh_key,
        ssh_shell: simple.ssh_shell,
        local_shell: simple.local_shell,
        inventory: simple.inventory,
        targets,
        tasks: vec![Task {
            name: DEFAULT_TASK_NAME.to_string(),
            user: None,
            options: None,
            on_error: None,
            targets: target_strings,
            commands: simple.task,
        }],
        secrets: Vec::new(),
        secrets_provider: None,
    }
}

/// Unique non-empty task names; at least one command per task; no target
/// named `all` (spec §4.1 step 6).
fn validate(playbook: &Playbook) -> Result<(), LoadError> {
    if playbook.tasks.is_empty() {
        return Err(LoadError::Validation("playbook has no tasks".to_string()));
    }

    let mut seen = std::collections::HashSet::new();
    for task in &playbook.tasks {
        if task.name.is_empty() {
            return Err(LoadError::Validation("task name must not be empty".to_string()));
        }
        if !seen.insert(&task.name) {
            return Err(LoadError::Validation(format!("duplicate task name {:?}", task.name)));
        }
        if task.commands.is_empty() {
            return Err(LoadError::Validation(format!("task {:?} has no commands", task.name)));
        }
    }

    if playbook.targets.contains_key(RESERVED_ALL) {
        return Err(LoadError::Validation(format!("target name {RESERVED_ALL:?} is reserved")));
    }

    Ok(())
}

/// Merge task-level `options` into every command (spec §4.1 step 7):
/// secrets/only_on lists append; boolean flags override only when true.
fn merge_task_options(playbook: &mut Playbook) {
    for task in playbook.tasks.iter_mut() {
        let Some(task_opts) = task.options.clone() else {
            continue;
        };
        for cmd in task.commands.iter_mut() {
            cmd.options.merge_task_default(&task_opts);
        }
    }
}

/// Inject the resolved SSH shell and local shell into every command so
/// later execution is self-contained (spec §4.1 step 7).
fn inject_shells(playbook: &mut Playbook, overrides: &Overrides) {
    let ssh_shell = overrides.ssh_shell.clone().or_else(|| playbook.ssh_shell.clone());
    let local_shell = playbook.local_shell.clone().or_else(|| std::env::var("SHELL").ok());

    for task in playbook.tasks.iter_mut() {
        for cmd in task.commands.iter_mut() {
            cmd.ssh_shell = ssh_shell.clone();
            cmd.local_shell = local_shell.clone();
        }
    }
}

/// Resolve every declared secret key exactly once via the provider,
/// populating both the playbook's masking list and each command's private
/// secrets map (spec §4.1 step 8).
fn load_secrets(playbook: &mut Playbook, provider: Option<&Arc<dyn SecretsProvider>>) -> Result<(), LoadError> {
    let mut cache: HashMap<String, String> = HashMap::new();

    for task in playbook.tasks.iter_mut() {
        for cmd in task.commands.iter_mut() {
            if cmd.options.secrets.is_empty() {
                continue;
            }
            let Some(provider) = provider else {
                return Err(LoadError::NoSecretsProvider(cmd.options.secrets[0].clone()));
            };
            for key in &cmd.options.secrets {
                if !cache.contains_key(key) {
                    let value = provider
                        .get(key)
                        .map_err(|e| LoadError::SecretResolution(key.clone(), e.to_string()))?;
                    cache.insert(key.clone(), value);
                }
                cmd.secrets.insert(key.clone(), cache[key].clone());
            }
        }
    }

    playbook.secrets = cache.into_values().collect();
    playbook.secrets_provider = provider.cloned();
    Ok(())
}

/// Load inventory from the first of: `overrides.inventory` >
/// `playbook.inventory` > `SPOT_INVENTORY` env var (spec §4.1 step 9).
async fn load_inventory(playbook: &Playbook, overrides: &Overrides) -> Result<Option<InventoryData>, LoadError> {
    let source = overrides
        .inventory
        .clone()
        .or_else(|| playbook.inventory.clone())
        .or_else(|| std::env::var(INVENTORY_ENV_VAR).ok());

    let Some(source) = source else {
        return Ok(None);
    };

    let is_http = url::Url::parse(&source)
        .map(|u| u.scheme() == "http" || u.scheme() == "https")
        .unwrap_or(false);

    let content = if is_http {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LoadError::Inventory(e.to_string()))?;
        let resp = client.get(&source).send().await.map_err(|e| LoadError::Inventory(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(LoadError::Inventory(format!("inventory fetch returned {}", resp.status())));
        }
        resp.text().await.map_err(|e| LoadError::Inventory(e.to_string()))?
    } else {
        tokio::fs::read_to_string(&source).await?
    };

    let is_toml = source.ends_with(".toml");
    let mut inventory: InventoryData = if is_toml {
        toml::from_str(&content).map_err(|e| LoadError::Inventory(e.to_string()))?
    } else {
        serde_yaml::from_str(&content).map_err(|e| LoadError::Inventory(e.to_string()))?
    };

    inventory
        .validate_no_reserved_group()
        .map_err(LoadError::Validation)?;
    inventory.materialize_all(playbook.user.as_deref());

    Ok(Some(inventory))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StaticSecrets;

    #[tokio::test]
    async fn simple_shape_single_command_resolves_to_bare_host() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("play.yml");
        tokio::fs::write(&file, "task:\n  - name: greet\n    script: echo hi\ntarget: \"h1:22\"\n")
            .await
            .unwrap();

        let loaded = load(Some(&file), Overrides::default(), None).await.unwrap();
        assert_eq!(loaded.playbook.tasks.len(), 1);
        assert_eq!(loaded.playbook.tasks[0].name, "default");
        let hosts = loaded.target_hosts("h1:22").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].host, "h1");
        assert_eq!(hosts[0].effective_port(), 22);
    }

    #[tokio::test]
    async fn duplicate_task_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("play.yml");
        let yaml = r#"
tasks:
  - name: dup
    commands: [{script: "echo 1"}]
  - name: dup
    commands: [{script: "echo 2"}]
"#;
        tokio::fs::write(&file, yaml).await.unwrap();
        let err = load(Some(&file), Overrides::default(), None).await.unwrap_err();
        assert!(matches!(err, LoadError::Validation(_)));
    }

    #[tokio::test]
    async fn reserved_all_target_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("play.yml");
        let yaml = r#"
targets:
  all: { hosts: [{host: h1}] }
tasks:
  - name: t
    commands: [{script: "echo 1"}]
"#;
        tokio::fs::write(&file, yaml).await.unwrap();
        let err = load(Some(&file), Overrides::default(), None).await.unwrap_err();
        assert!(matches!(err, LoadError::Validation(_)));
    }

    #[tokio::test]
    async fn secret_without_provider_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("play.yml");
        let yaml = r#"
tasks:
  - name: t
    commands:
      - script: "echo $API_KEY"
        options: { secrets: [API_KEY] }
"#;
        tokio::fs::write(&file, yaml).await.unwrap();
        let err = load(Some(&file), Overrides::default(), None).await.unwrap_err();
        assert!(matches!(err, LoadError::NoSecretsProvider(_)));
    }

    #[tokio::test]
    async fn secret_loaded_and_masked() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("play.yml");
        let yaml = r#"
tasks:
  - name: t
    commands:
      - script: "echo $API_KEY"
        options: { secrets: [API_KEY] }
"#;
        tokio::fs::write(&file, yaml).await.unwrap();
        let provider: Arc<dyn SecretsProvider> = Arc::new(StaticSecrets(HashMap::from([(
            "API_KEY".to_string(),
            "s3cr3t".to_string(),
        )])));
        let loaded = load(Some(&file), Overrides::default(), Some(provider)).await.unwrap();
        assert_eq!(loaded.playbook.secrets, vec!["s3cr3t".to_string()]);
        assert_eq!(
            loaded.playbook.tasks[0].commands[0].secrets.get("API_KEY"),
            Some(&"s3cr3t".to_string())
        );
    }

    #[tokio::test]
    async fn ad_hoc_without_file_synthesizes_single_task() {
        let overrides = Overrides {
            ad_hoc_command: Some("uptime".to_string()),
            ..Default::default()
        };
        let loaded = load(Some(Path::new("/nonexistent/play.yml")), overrides, None).await.unwrap();
        assert_eq!(loaded.playbook.tasks.len(), 1);
        assert_eq!(loaded.playbook.tasks[0].name, AD_HOC_TASK_NAME);
    }

    #[tokio::test]
    async fn ssh_key_field_is_accepted_in_full_shape() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("play.yml");
        let yaml = r#"
user: deploy
ssh_key: ~/.ssh/deploy_key
tasks:
  - name: t
    commands: [{script: "echo 1"}]
"#;
        tokio::fs::write(&file, yaml).await.unwrap();
        let loaded = load(Some(&file), Overrides::default(), None).await.unwrap();
        assert_eq!(loaded.playbook.ssh_key.as_deref(), Some("~/.ssh/deploy_key"));
    }

    #[tokio::test]
    async fn update_tasks_targets_substitutes_dollar_vars() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("play.yml");
        let yaml = r#"
tasks:
  - name: t
    targets: ["$env_target", "literal"]
    commands: [{script: "echo 1"}]
"#;
        tokio::fs::write(&file, yaml).await.unwrap();
        let mut loaded = load(Some(&file), Overrides::default(), None).await.unwrap();
        let vars = HashMap::from([("env_target".to_string(), "resolved".to_string())]);
        loaded.update_tasks_targets(&vars);
        assert_eq!(loaded.playbook.tasks[0].targets, vec!["resolved".to_string(), "literal".to_string()]);
    }
}
