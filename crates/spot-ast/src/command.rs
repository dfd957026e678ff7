//! Command sum type (spec §3, §9 "Command sum type").
//!
//! The playbook file represents a command as one record with several
//! mutually-exclusive optional action fields (`script`, `copy`, `sync`, ...)
//! and a runtime "exactly one set" check. We deserialize into that raw shape
//! (so the file format in §6 is unchanged) but convert immediately into a
//! tagged `Action` enum, so every call site after loading matches on a
//! total, already-validated variant instead of re-checking optionality.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CopySpec {
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub mkdir: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub chmod_x: bool,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSpec {
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeleteSpec {
    pub path: String,
    #[serde(alias = "recur", default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitSpec {
    pub cmd: String,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub interval: Option<Duration>,
}

impl WaitSpec {
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_secs(24 * 3600))
    }

    pub fn effective_interval(&self) -> Duration {
        self.interval.unwrap_or(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LineSpec {
    pub file: String,
    #[serde(rename = "match", default)]
    pub match_: Option<String>,
    #[serde(default)]
    pub replace: Option<String>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub append: Option<String>,
    #[serde(default)]
    pub anchor: Option<String>,
}

/// Tagged action variant. Exactly one of the raw file's action fields
/// produced this -- see `CommandRaw::try_into_action`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Action {
    Script(String),
    Copy(CopySpec),
    Mcopy(Vec<CopySpec>),
    Sync(SyncSpec),
    Msync(Vec<SyncSpec>),
    Delete(DeleteSpec),
    Mdelete(Vec<DeleteSpec>),
    Wait(WaitSpec),
    Echo(String),
    Line(LineSpec),
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Script(_) => "script",
            Action::Copy(_) => "copy",
            Action::Mcopy(_) => "mcopy",
            Action::Sync(_) => "sync",
            Action::Msync(_) => "msync",
            Action::Delete(_) => "delete",
            Action::Mdelete(_) => "mdelete",
            Action::Wait(_) => "wait",
            Action::Echo(_) => "echo",
            Action::Line(_) => "line",
        }
    }

    /// `register` is only meaningful for scripts (spec §3).
    pub fn supports_register(&self) -> bool {
        matches!(self, Action::Script(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CmdOptions {
    #[serde(default)]
    pub ignore_errors: bool,
    #[serde(default)]
    pub no_auto: bool,
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default)]
    pub sudo_password: Option<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub only_on: Vec<String>,
}

impl CmdOptions {
    /// Merge a task-level default into a command's own options per §3:
    /// "secrets and only_on lists append; boolean flags override only when
    /// true". `self` is the command's own options; `task_default` is the
    /// task's `options` block.
    pub fn merge_task_default(&mut self, task_default: &CmdOptions) {
        let mut secrets = task_default.secrets.clone();
        secrets.extend(self.secrets.iter().cloned());
        self.secrets = secrets;

        let mut only_on = task_default.only_on.clone();
        only_on.extend(self.only_on.iter().cloned());
        self.only_on = only_on;

        self.ignore_errors = self.ignore_errors || task_default.ignore_errors;
        self.no_auto = self.no_auto || task_default.no_auto;
        self.local = self.local || task_default.local;
        self.sudo = self.sudo || task_default.sudo;
        if self.sudo_password.is_none() {
            self.sudo_password = task_default.sudo_password.clone();
        }
    }
}

/// Raw, file-shaped representation: one optional field per action, plus the
/// shared envelope fields. Deserializing into this (rather than `Command`
/// directly) keeps `deny_unknown_fields` strict-YAML behavior (§6) while
/// still producing a tagged `Action` by construction.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CommandRaw {
    name: Option<String>,
    script: Option<String>,
    copy: Option<CopySpec>,
    mcopy: Option<Vec<CopySpec>>,
    sync: Option<SyncSpec>,
    msync: Option<Vec<SyncSpec>>,
    delete: Option<DeleteSpec>,
    mdelete: Option<Vec<DeleteSpec>>,
    wait: Option<WaitSpec>,
    echo: Option<String>,
    line: Option<LineSpec>,
    environment: HashMap<String, String>,
    condition: Option<String>,
    register: Vec<String>,
    on_exit: Option<String>,
    options: CmdOptions,
}

#[derive(Debug, Clone)]
pub struct CommandValidationError(pub String);

impl std::fmt::Display for CommandValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for CommandValidationError {}

impl TryFrom<CommandRaw> for Action {
    type Error = CommandValidationError;

    fn try_from(raw: CommandRaw) -> Result<Self, Self::Error> {
        let mut set = Vec::new();
        if let Some(v) = raw.script.clone() {
            set.push(Action::Script(v));
        }
        if let Some(v) = raw.copy.clone() {
            set.push(Action::Copy(v));
        }
        if let Some(v) = raw.mcopy.clone() {
            set.push(Action::Mcopy(v));
        }
        if let Some(v) = raw.sync.clone() {
            set.push(Action::Sync(v));
        }
        if let Some(v) = raw.msync.clone() {
            set.push(Action::Msync(v));
        }
        if let Some(v) = raw.delete.clone() {
            set.push(Action::Delete(v));
        }
        if let Some(v) = raw.mdelete.clone() {
            set.push(Action::Mdelete(v));
        }
        if let Some(v) = raw.wait.clone() {
            set.push(Action::Wait(v));
        }
        if let Some(v) = raw.echo.clone() {
            set.push(Action::Echo(v));
        }
        if let Some(v) = raw.line.clone() {
            if v.match_.is_none() && v.append.is_none() {
                return Err(CommandValidationError(
                    "line command has neither match nor append set (zero-action line)".into(),
                ));
            }
            set.push(Action::Line(v));
        }

        match set.len() {
            1 => Ok(set.into_iter().next().unwrap()),
            0 => Err(CommandValidationError(
                "command has no action set (expected exactly one of: script, copy, mcopy, sync, msync, delete, mdelete, wait, echo, line)".into(),
            )),
            n => Err(CommandValidationError(format!(
                "command has {n} action fields set, expected exactly one"
            ))),
        }
    }
}

/// One command: the shared envelope plus a tagged `Action`.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: Option<String>,
    pub action: Action,
    pub environment: HashMap<String, String>,
    pub condition: Option<String>,
    pub register: Vec<String>,
    pub on_exit: Option<String>,
    pub options: CmdOptions,
    /// Resolved SSH shell, injected by the loader (§4.1 step 7) so a
    /// prepared command is self-contained.
    pub ssh_shell: Option<String>,
    /// Resolved local shell, injected by the loader.
    pub local_shell: Option<String>,
    /// Resolved secret values for this command's declared `options.secrets`
    /// keys, injected by the loader (§4.1 step 8).
    pub secrets: HashMap<String, String>,
}

impl Command {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.action.kind())
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = CommandRaw::deserialize(deserializer)?;
        let name = raw.name.clone();
        let environment = raw.environment.clone();
        let condition = raw.condition.clone();
        let register = raw.register.clone();
        let on_exit = raw.on_exit.clone();
        let options = raw.options.clone();
        let action = Action::try_from(raw).map_err(serde::de::Error::custom)?;

        if !register.is_empty() && !action.supports_register() {
            return Err(serde::de::Error::custom(
                "register is only allowed on script commands",
            ));
        }

        Ok(Command {
            name,
            action,
            environment,
            condition,
            register,
            on_exit,
            options,
            ssh_shell: None,
            local_shell: None,
            secrets: HashMap::new(),
        })
    }
}

impl Serialize for Command {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut st = serializer.serialize_struct("Command", 6)?;
        st.serialize_field("name", &self.name)?;
        st.serialize_field("kind", self.action.kind())?;
        st.serialize_field("environment", &self.environment)?;
        st.serialize_field("condition", &self.condition)?;
        st.serialize_field("register", &self.register)?;
        st.serialize_field("on_exit", &self.on_exit)?;
        st.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_action_required() {
        let yaml = "name: nope\n";
        let err = serde_yaml::from_str::<Command>(yaml).unwrap_err();
        assert!(err.to_string().contains("no action set"));
    }

    #[test]
    fn two_actions_rejected() {
        let yaml = "script: echo hi\necho: hi\n";
        let err = serde_yaml::from_str::<Command>(yaml).unwrap_err();
        assert!(err.to_string().contains("2 action fields"));
    }

    #[test]
    fn line_requires_match_or_append() {
        let yaml = "line: {file: /etc/hosts}\n";
        let err = serde_yaml::from_str::<Command>(yaml).unwrap_err();
        assert!(err.to_string().contains("zero-action"));
    }

    #[test]
    fn register_requires_script() {
        let yaml = "echo: hi\nregister: [FOO]\n";
        let err = serde_yaml::from_str::<Command>(yaml).unwrap_err();
        assert!(err.to_string().contains("register"));
    }

    #[test]
    fn single_script_parses() {
        let yaml = "name: greet\nscript: echo hi\n";
        let cmd: Command = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cmd.name.as_deref(), Some("greet"));
        assert_eq!(cmd.action, Action::Script("echo hi".to_string()));
    }

    #[test]
    fn delete_recur_alias() {
        let yaml = "delete: {path: /tmp/x, recur: true}\n";
        let cmd: Command = serde_yaml::from_str(yaml).unwrap();
        match cmd.action {
            Action::Delete(d) => {
                assert_eq!(d.path, "/tmp/x");
                assert!(d.recursive);
            }
            _ => panic!("expected delete"),
        }
    }

    #[test]
    fn options_merge_booleans_override_only_when_true() {
        let mut cmd_opts = CmdOptions {
            ignore_errors: false,
            ..Default::default()
        };
        let task_opts = CmdOptions {
            ignore_errors: true,
            secrets: vec!["a".into()],
            only_on: vec!["h1".into()],
            ..Default::default()
        };
        cmd_opts.secrets = vec!["b".into()];
        cmd_opts.merge_task_default(&task_opts);
        assert!(cmd_opts.ignore_errors);
        assert_eq!(cmd_opts.secrets, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cmd_opts.only_on, vec!["h1".to_string()]);
    }
}
