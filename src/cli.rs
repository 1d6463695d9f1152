use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{DeployConfig, ProjectConfig, PublishConfig};

#[derive(Parser, Debug)]
#[command(
    name = "patchwarden",
    about = "Detects drifted page-extraction routines and repairs them",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the probes and repair whatever fails
    Run {
        /// Only run the named probe (repeatable)
        #[arg(long = "probe")]
        probes: Vec<String>,

        /// Environment profile from the config file
        #[arg(long)]
        environment: Option<String>,

        /// Validate candidates but never write, publish or deploy
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the probes and print verdicts, without repairing
    Check {
        #[arg(long = "probe")]
        probes: Vec<String>,

        #[arg(long)]
        environment: Option<String>,
    },

    /// List backups of the target file, newest first
    Backups {
        #[arg(long)]
        environment: Option<String>,
    },

    /// Write a backup back over the target file
    Restore {
        /// Backup file to restore
        backup: PathBuf,

        /// File to overwrite (defaults to the environment's target file)
        #[arg(long)]
        target: Option<PathBuf>,

        #[arg(long)]
        environment: Option<String>,
    },

    /// Show project configuration
    Config {
        /// Emit JSON instead of the human-readable view
        #[arg(long)]
        json: bool,
    },
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .patchwarden/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

fn publish_detail(publish: &PublishConfig) -> String {
    match publish {
        PublishConfig::None => "none".to_string(),
        PublishConfig::Git { remote, branch } => format!("git ({remote}/{branch})"),
        PublishConfig::Github {
            owner, repo, branch, ..
        } => format!("github ({owner}/{repo}@{branch})"),
    }
}

fn deploy_detail(deploy: &DeployConfig) -> String {
    match deploy {
        DeployConfig::None => "none".to_string(),
        DeployConfig::Touch { path } => format!("touch {}", path.display()),
        DeployConfig::Command { program, args } => {
            if args.is_empty() {
                format!("command {program}")
            } else {
                format!("command {program} {}", args.join(" "))
            }
        }
    }
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Defaults\n");
    push_kv(&mut output, "environment", &config.defaults.environment);
    output.push('\n');

    output.push_str("Conversation\n");
    push_kv(&mut output, "base_url", &config.conversation.base_url);
    push_kv(&mut output, "api_key_secret", &config.conversation.api_key_secret);
    push_kv(
        &mut output,
        "poll_initial_delay",
        format!("{}ms", config.conversation.poll_initial_delay_millis),
    );
    push_kv(&mut output, "max_retries", config.conversation.max_retries);
    push_kv(&mut output, "timeout", format!("{}s", config.conversation.timeout_secs));
    output.push('\n');

    output.push_str("Sandbox\n");
    push_kv(&mut output, "interpreter", &config.sandbox.interpreter);
    if config.sandbox.args.is_empty() {
        push_kv(&mut output, "args", "(none)");
    } else {
        push_kv(&mut output, "args", config.sandbox.args.join(", "));
    }
    if config.sandbox.wrapper.is_empty() {
        push_kv(&mut output, "wrapper", "(none)");
    } else {
        push_kv(&mut output, "wrapper", config.sandbox.wrapper.join(" "));
    }
    push_kv(&mut output, "timeout", format!("{}s", config.sandbox.timeout_secs));
    output.push('\n');

    output.push_str("Alerts\n");
    push_kv(&mut output, "log_file", &config.alerts.log_file);
    push_kv(
        &mut output,
        "endpoint",
        config.alerts.endpoint.as_deref().unwrap_or("(none)"),
    );
    output.push('\n');

    output.push_str("Environments\n");
    if config.environments.is_empty() {
        push_kv(&mut output, "local", "(built-in defaults)");
    }
    for (name, env) in &config.environments {
        output.push_str(&format!("  [{name}]\n"));
        push_kv(&mut output, "source_root", env.source_root.display());
        push_kv(&mut output, "target_file", env.target_file.display());
        push_kv(&mut output, "backup_dir", env.backup_dir.display());
        push_kv(&mut output, "publish", publish_detail(&env.publish));
        push_kv(&mut output, "publish_timeout", format!("{}s", env.publish_timeout_secs));
        push_kv(&mut output, "deploy", deploy_detail(&env.deploy));
    }
    output.push('\n');

    output.push_str("Probes\n");
    if config.probes.is_empty() {
        push_kv(&mut output, "entries", "(none)");
    }
    for probe in &config.probes {
        output.push_str(&format!("  - {} => {}\n", probe.name, probe.routine));
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let environments: serde_json::Map<String, serde_json::Value> = config
        .environments
        .iter()
        .map(|(name, env)| {
            (
                name.clone(),
                serde_json::json!({
                    "source_root": env.source_root.display().to_string(),
                    "target_file": env.target_file.display().to_string(),
                    "backup_dir": env.backup_dir.display().to_string(),
                    "publish": env.publish.label(),
                    "publish_timeout_secs": env.publish_timeout_secs,
                    "deploy": env.deploy.label(),
                }),
            )
        })
        .collect();

    let probes: Vec<serde_json::Value> = config
        .probes
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": &p.name,
                "routine": &p.routine,
                "page_url": p.page_url.clone(),
                "labels": &p.labels,
            })
        })
        .collect();

    let payload = serde_json::json!({
        "defaults": {
            "environment": &config.defaults.environment
        },
        "conversation": {
            "base_url": &config.conversation.base_url,
            "api_key_secret": &config.conversation.api_key_secret,
            "poll_initial_delay_millis": config.conversation.poll_initial_delay_millis,
            "max_retries": config.conversation.max_retries,
            "timeout_secs": config.conversation.timeout_secs
        },
        "sandbox": {
            "interpreter": &config.sandbox.interpreter,
            "args": &config.sandbox.args,
            "wrapper": &config.sandbox.wrapper,
            "timeout_secs": config.sandbox.timeout_secs
        },
        "alerts": {
            "log_file": &config.alerts.log_file,
            "endpoint": config.alerts.endpoint.clone()
        },
        "environments": environments,
        "probes": probes,
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
