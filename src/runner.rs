//! Task runner (spec §4.5): bounded-concurrency fan-out across resolved
//! hosts, sequential per-host command execution, variable propagation,
//! `on_exit` drain, `on_error` invocation.

use crate::executor::{execute, ExecContext, ExecError, Executor, RunOpts};
use crate::loader::{LoadError, LoadedPlaybook};
use crate::local::{DryExecutor, LocalExecutor};
use crate::ssh::RemoteExecutor;
use crate::template::{render, TemplateContext};
use spot_ast::{Command, Destination, Task};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Worker pool size (spec §4.5 step 2, §5 "Scheduling model"). Zero is
    /// treated as one.
    pub concurrency: usize,
    /// Force every command onto `LocalExecutor` regardless of its own
    /// `options.local` (spec §4.5 step 6 "process-wide `Local` flag").
    pub local: bool,
    /// Record would-be invocations instead of running them (spec §5
    /// "dry-run").
    pub dry_run: bool,
    /// Run only these named commands (spec §4.5 step 6 `shouldRunCmd`).
    pub only: Vec<String>,
    /// Skip these named commands.
    pub skip: Vec<String>,
    pub identity_file: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub hosts: usize,
    pub commands: u64,
    pub vars: HashMap<String, String>,
    pub registered: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Resolve(#[from] crate::resolver::ResolveError),
    #[error("{failed} of {total} host(s) failed: {first_error}")]
    HostsFailed {
        failed: usize,
        total: usize,
        first_error: String,
    },
}

/// Cross-host state the bounded worker pool merges into as each host
/// finishes (spec §5 "Shared-resource policy": aggregation mutex, atomic
/// command counter with the first-host-only quirk, first-error cell).
#[derive(Default)]
struct Aggregator {
    vars: Mutex<HashMap<String, String>>,
    registered: Mutex<HashMap<String, String>>,
    commands: AtomicU64,
    commands_written: AtomicBool,
    first_error: Mutex<Option<String>>,
    failed_hosts: AtomicU64,
}

impl Aggregator {
    fn record_success(&self, command_count: u64, vars: HashMap<String, String>, registered: HashMap<String, String>) {
        // Only the first host to arrive writes the representative command
        // count -- a deliberate quirk, not a bug (spec §9, §5).
        if !self.commands_written.swap(true, Ordering::SeqCst) {
            self.commands.store(command_count, Ordering::SeqCst);
        }
        let mut v = self.vars.lock().unwrap();
        for (k, val) in vars {
            v.insert(k, val); // last writer wins across hosts (spec §5 "Ordering guarantees")
        }
        drop(v);
        let mut r = self.registered.lock().unwrap();
        for (k, val) in registered {
            r.insert(k, val);
        }
    }

    fn record_failure(&self, message: String) {
        self.failed_hosts.fetch_add(1, Ordering::SeqCst);
        let mut first = self.first_error.lock().unwrap();
        if first.is_none() {
            *first = Some(message);
        }
    }
}

/// Run `task_name` against `target_name` (spec §4.5 full algorithm).
pub async fn run(loaded: &LoadedPlaybook, task_name: &str, target_name: &str, opts: RunOptions) -> Result<RunSummary, RunError> {
    let task = loaded.task(task_name)?;
    let hosts = loaded.target_hosts_for_task(task.user.as_deref(), target_name)?;
    let task_user = task
        .user
        .clone()
        .or_else(|| loaded.overrides.user.clone())
        .or_else(|| loaded.playbook.user.clone())
        .unwrap_or_else(|| "root".to_string());

    let needs_remote = !opts.dry_run && !opts.local && task.commands.iter().any(|c| !c.options.local);

    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let aggregator = Arc::new(Aggregator::default());
    let task = Arc::new(task);
    let identity = opts.identity_file.clone().or_else(|| loaded.playbook.ssh_key.clone());

    let mut set = tokio::task::JoinSet::new();
    for host in hosts.clone() {
        let semaphore = semaphore.clone();
        let aggregator = aggregator.clone();
        let task = task.clone();
        let opts = opts.clone();
        let task_user = task_user.clone();
        let identity = identity.clone();

        set.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            let host_label = host.display_name().to_string();
            info!(progress = "start", task = %host_label);
            let started = std::time::Instant::now();
            match run_on_host(&task, &host, &task_user, &opts, needs_remote, identity.as_deref()).await {
                Ok((count, vars, registered)) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(progress = "done", task = %host_label, duration_ms, "host completed");
                    aggregator.record_success(count, vars, registered);
                }
                Err(message) => {
                    error!(progress = "failed", task = %host_label, error = %message, "host failed");
                    aggregator.record_failure(message);
                }
            }
        });
    }

    while set.join_next().await.is_some() {}

    let failed = aggregator.failed_hosts.load(Ordering::SeqCst);
    let first_error = aggregator.first_error.lock().unwrap().clone();

    if failed > 0 {
        if let Some(script) = &task.on_error {
            run_on_error(script, first_error.as_deref().unwrap_or(""), &task_user, opts.dry_run).await;
        }
        return Err(RunError::HostsFailed {
            failed: failed as usize,
            total: hosts.len(),
            first_error: first_error.unwrap_or_default(),
        });
    }

    Ok(RunSummary {
        hosts: hosts.len(),
        commands: aggregator.commands.load(Ordering::SeqCst),
        vars: aggregator.vars.lock().unwrap().clone(),
        registered: aggregator.registered.lock().unwrap().clone(),
    })
}

/// One worker: `connect → {execute | skip | fail}* → drain-on-exit → close`
/// (spec §4.5 "State machine per host").
async fn run_on_host(
    task: &Task,
    host: &Destination,
    task_user: &str,
    opts: &RunOptions,
    needs_remote: bool,
    identity_file: Option<&str>,
) -> Result<(u64, HashMap<String, String>, HashMap<String, String>), String> {
    let mut task = task.clone();

    let remote: Option<RemoteExecutor> = if needs_remote {
        match RemoteExecutor::connect(host, identity_file).await {
            Ok(session) => Some(session),
            Err(e) => return Err(format!("connect: {e}")),
        }
    } else {
        None
    };
    let local = LocalExecutor;
    let dry = if opts.dry_run { Some(DryExecutor::default()) } else { None };

    let ctx = ExecContext {
        host,
        task_name: &task.name,
        task_user,
        is_remote: needs_remote,
    };

    let mut propagated: HashMap<String, String> = HashMap::new();
    let mut registered: HashMap<String, String> = HashMap::new();
    let mut command_count: u64 = 0;
    let mut on_exit_queue: Vec<Command> = Vec::new();
    let mut failure: Option<String> = None;

    for cmd in task.commands.iter_mut() {
        if !should_run_cmd(cmd, opts, host) {
            continue;
        }

        for (k, v) in &propagated {
            cmd.environment.entry(k.clone()).or_insert_with(|| v.clone());
        }

        let executor: &dyn Executor = if let Some(dry) = &dry {
            dry
        } else if cmd.options.local || opts.local {
            &local
        } else {
            remote
                .as_ref()
                .map(|r| r as &dyn Executor)
                .unwrap_or(&local as &dyn Executor)
        };

        command_count += 1;
        match execute(cmd, &ctx, executor).await {
            Ok(outcome) => {
                if let Some(on_exit) = outcome.on_exit {
                    on_exit_queue.push(on_exit);
                }
                if !outcome.skipped {
                    // First wins across commands in the same task: a key
                    // already set by an earlier command's setvar is never
                    // overridden by a later one (spec §8 "duplicate keys").
                    for (k, v) in outcome.vars {
                        propagated.entry(k).or_insert(v);
                    }
                    registered.extend(outcome.registered);
                }
            }
            Err(failed) => {
                if let Some(on_exit) = failed.on_exit {
                    on_exit_queue.push(on_exit);
                }
                if cmd.options.ignore_errors {
                    warn!(command = cmd.display_name(), error = %failed.error, "ignoring command failure");
                    continue;
                }
                failure = Some(format!("{}: {}", cmd.display_name(), failed.error));
                break;
            }
        }
    }

    for on_exit in &on_exit_queue {
        let executor: &dyn Executor = if let Some(dry) = &dry {
            dry
        } else if on_exit.options.local || opts.local {
            &local
        } else {
            remote.as_ref().map(|r| r as &dyn Executor).unwrap_or(&local as &dyn Executor)
        };
        if let Err(e) = execute(on_exit, &ctx, executor).await {
            warn!(command = on_exit.display_name(), error = %e, "on_exit command failed, continuing");
        }
    }

    if let Some(r) = &remote {
        r.close().await;
    }

    match failure {
        Some(message) => Err(message),
        None => Ok((command_count, propagated, registered)),
    }
}

/// `shouldRunCmd` (spec §4.5 step 6): `Only`/`Skip` name filters, `no_auto`,
/// and `only_on[]` host filter (`!`-prefixed entries exclude).
fn should_run_cmd(cmd: &Command, opts: &RunOptions, host: &Destination) -> bool {
    let name = cmd.display_name();

    if !opts.only.is_empty() && !opts.only.iter().any(|o| o == name) {
        return false;
    }
    if opts.skip.iter().any(|s| s == name) {
        return false;
    }
    if cmd.options.no_auto && !opts.only.iter().any(|o| o == name) {
        return false;
    }

    if !cmd.options.only_on.is_empty() {
        let matches = |pat: &str| pat == host.host || pat == host.display_name();
        let mut has_include = false;
        let mut included = false;
        for entry in &cmd.options.only_on {
            match entry.strip_prefix('!') {
                Some(excluded) => {
                    if matches(excluded) {
                        return false;
                    }
                }
                None => {
                    has_include = true;
                    if matches(entry) {
                        included = true;
                    }
                }
            }
        }
        if has_include && !included {
            return false;
        }
    }

    true
}

/// Run the task's `on_error` script locally (never remote) with
/// `SPOT_ERROR` templated to the first unwrapped failure (spec §4.5 step 9).
async fn run_on_error(script: &str, error: &str, task_user: &str, dry_run: bool) {
    let host = Destination::default();
    let tctx = TemplateContext {
        host: Some(&host),
        task_user: Some(task_user),
        command_name: Some("on_error"),
        task_name: None,
        error: Some(error),
        environment: None,
    };
    let rendered = render(script, &tctx);

    let result = if dry_run {
        DryExecutor::default().run(&rendered, RunOpts::default()).await
    } else {
        LocalExecutor.run(&format!("/bin/sh -c '{rendered}'"), RunOpts::default()).await
    };

    match result {
        Ok(_) => info!("on_error script completed"),
        Err(e) => error!(error = %e, "on_error script itself failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spot_ast::CmdOptions;

    fn cmd_named(name: &str) -> Command {
        Command {
            name: Some(name.to_string()),
            action: spot_ast::Action::Echo("hi".to_string()),
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

    fn dest(host: &str) -> Destination {
        Destination {
            host: host.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn only_filters_out_unlisted_commands() {
        let opts = RunOptions {
            only: vec!["a".to_string()],
            ..Default::default()
        };
        assert!(should_run_cmd(&cmd_named("a"), &opts, &dest("h1")));
        assert!(!should_run_cmd(&cmd_named("b"), &opts, &dest("h1")));
    }

    #[test]
    fn skip_excludes_named_command() {
        let opts = RunOptions {
            skip: vec!["a".to_string()],
            ..Default::default()
        };
        assert!(!should_run_cmd(&cmd_named("a"), &opts, &dest("h1")));
        assert!(should_run_cmd(&cmd_named("b"), &opts, &dest("h1")));
    }

    #[test]
    fn no_auto_requires_explicit_only() {
        let mut cmd = cmd_named("a");
        cmd.options.no_auto = true;
        let opts = RunOptions::default();
        assert!(!should_run_cmd(&cmd, &opts, &dest("h1")));

        let opts_only = RunOptions {
            only: vec!["a".to_string()],
            ..Default::default()
        };
        assert!(should_run_cmd(&cmd, &opts_only, &dest("h1")));
    }

    #[test]
    fn only_on_excludes_negated_host() {
        let mut cmd = cmd_named("a");
        cmd.options.only_on = vec!["!h1".to_string()];
        let opts = RunOptions::default();
        assert!(!should_run_cmd(&cmd, &opts, &dest("h1")));
        assert!(should_run_cmd(&cmd, &opts, &dest("h2")));
    }

    #[test]
    fn only_on_includes_only_matching_host() {
        let mut cmd = cmd_named("a");
        cmd.options.only_on = vec!["h1".to_string()];
        let opts = RunOptions::default();
        assert!(should_run_cmd(&cmd, &opts, &dest("h1")));
        assert!(!should_run_cmd(&cmd, &opts, &dest("h2")));
    }

    #[test]
    fn aggregator_keeps_first_command_count_and_first_error() {
        let agg = Aggregator::default();
        agg.record_success(5, HashMap::new(), HashMap::new());
        agg.record_success(9, HashMap::new(), HashMap::new());
        assert_eq!(agg.commands.load(Ordering::SeqCst), 5);

        agg.record_failure("first".to_string());
        agg.record_failure("second".to_string());
        assert_eq!(agg.first_error.lock().unwrap().as_deref(), Some("first"));
        assert_eq!(agg.failed_hosts.load(Ordering::SeqCst), 2);
    }
}
