use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use spot::loader;
use spot::progress::{MaskingWriter, PrettyProgressLayer};
use spot::runner::{self, RunOptions};
use spot::secrets::EnvSecrets;
use spot_ast::{Overrides, SecretsProvider};

#[derive(Parser)]
#[command(name = "spot")]
#[command(about = "Concurrent remote command orchestrator", long_about = None)]
struct Cli {
    /// Path to the playbook file
    #[arg(short, long, global = true)]
    playbook: Option<PathBuf>,

    /// Override the playbook's/host's user
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Inventory file or URL override
    #[arg(short, long, global = true)]
    inventory: Option<String>,

    /// SSH identity file
    #[arg(long, global = true)]
    identity_file: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress progress output, only show the final summary
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task against a target
    Run {
        /// Task name, or `ad-hoc` to run --command directly
        task: String,

        /// Target name, host, group, tag, or raw [user@]host[:port]
        target: String,

        /// Ad-hoc script body, used when task is `ad-hoc`
        #[arg(long)]
        command: Option<String>,

        /// Worker pool size
        #[arg(long, default_value_t = 5)]
        concurrency: usize,

        /// Force local execution of every command
        #[arg(long)]
        local: bool,

        /// Print what would run without executing it
        #[arg(long)]
        dry_run: bool,

        /// Run only these named commands
        #[arg(long)]
        only: Vec<String>,

        /// Skip these named commands
        #[arg(long)]
        skip: Vec<String>,
    },

    /// List the tasks defined in the playbook
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate the playbook file
    Validate,

    /// Preview which hosts a target resolves to
    Gen {
        /// Target names to resolve
        targets: Vec<String>,

        /// Text template applied per destination ({{name}}, {{host}}, {{port}}, {{user}})
        #[arg(long)]
        template: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let overrides = Overrides {
        user: cli.user.clone(),
        inventory: cli.inventory.clone(),
        environment: std::env::vars().collect(),
        ad_hoc_command: match &cli.command {
            Commands::Run { task, command, .. } if task == "ad-hoc" => command.clone(),
            _ => None,
        },
        ssh_shell: None,
    };

    let secrets_provider: Option<Arc<dyn SecretsProvider>> = Some(Arc::new(EnvSecrets));
    let loaded = loader::load(cli.playbook.as_deref(), overrides, secrets_provider)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    setup_tracing(cli.verbose, cli.quiet, loaded.all_secret_values());

    match cli.command {
        Commands::List { format } => {
            print_list(&loaded, &format);
            Ok(())
        }
        Commands::Validate => {
            println!("{} playbook is valid", "✓".green());
            println!("  {} task(s) defined", loaded.all_tasks().len());
            Ok(())
        }
        Commands::Gen { targets, template } => {
            let out = spot::gen::preview(
                &loaded.playbook,
                loaded.inventory.as_ref(),
                &loaded.overrides,
                &targets,
                template.as_deref(),
            )
            .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{out}");
            Ok(())
        }
        Commands::Run {
            task,
            target,
            command: _,
            concurrency,
            local,
            dry_run,
            only,
            skip,
        } => {
            let opts = RunOptions {
                concurrency,
                local,
                dry_run,
                only,
                skip,
                identity_file: cli.identity_file,
            };
            match runner::run(&loaded, &task, &target, opts).await {
                Ok(summary) => {
                    print_summary(&summary);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("{} {e}", "✗".red());
                    std::process::exit(1);
                }
            }
        }
    }
}

fn print_list(loaded: &loader::LoadedPlaybook, format: &str) {
    let tasks = loaded.all_tasks();
    match format {
        "json" => {
            #[derive(serde::Serialize)]
            struct TaskInfo {
                name: String,
                targets: Vec<String>,
                commands: usize,
            }
            let out: Vec<TaskInfo> = tasks
                .iter()
                .map(|t| TaskInfo {
                    name: t.name.clone(),
                    targets: t.targets.clone(),
                    commands: t.commands.len(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out).unwrap());
        }
        _ => {
            println!("{}", "Tasks:".bold());
            for task in &tasks {
                let targets = if task.targets.is_empty() {
                    String::new()
                } else {
                    format!(" (targets: {})", task.targets.join(", "))
                };
                println!("  {} {}{}", "•".cyan(), task.name, targets.dimmed());
            }
        }
    }
}

fn print_summary(summary: &runner::RunSummary) {
    println!("\n{}", "Results:".bold());
    println!("  {} host(s) touched", summary.hosts);
    println!("  {} command(s) executed", summary.commands);
    if !summary.registered.is_empty() {
        println!("  {}", "registered:".dimmed());
        for (k, v) in &summary.registered {
            println!("    {k} = {v}");
        }
    }
}

/// Starts logging only after the playbook is loaded, since the secret list
/// needed for masking (spec §10.1) isn't known until then; any load failure
/// is reported via plain `anyhow` output instead of through tracing.
fn setup_tracing(verbose: bool, quiet: bool, secrets: Vec<String>) {
    if quiet {
        return;
    }

    let progress_layer = PrettyProgressLayer::with_secrets(secrets.clone());

    if verbose {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(MaskingWriter::new(secrets));
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spot=debug"));

        tracing_subscriber::registry()
            .with(progress_layer)
            .with(fmt_layer.with_filter(filter))
            .init();
    } else {
        tracing_subscriber::registry().with(progress_layer).init();
    }
}
