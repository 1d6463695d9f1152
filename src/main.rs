use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use patchwarden::alert::{self, Severity};
use patchwarden::cli::{Cli, Command, render_config_human, render_config_json};
use patchwarden::config::{ProjectConfig, PublishConfig, ResolvedEnvironment};
use patchwarden::conversation::{AssistantsClient, SystemClock};
use patchwarden::log::{ExecutionLog, LogEvent};
use patchwarden::page::HttpPageSource;
use patchwarden::patch;
use patchwarden::paths;
use patchwarden::pipeline::{Collaborators, RepairPipeline, RunContext};
use patchwarden::probe::{Probe, ProbeRunner, Verdict};
use patchwarden::publish::{deployer_for, publisher_for};
use patchwarden::python::{PythonRoutineHost, PythonRuntime};
use patchwarden::sandbox::SandboxExecutor;
use patchwarden::secrets::{self, SecretSource};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "patchwarden=warn",
        0 => "patchwarden=info",
        1 => "patchwarden=debug",
        _ => "patchwarden=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match execute(cli, is_config_command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("patchwarden: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn execute(cli: Cli, is_config_command: bool) -> Result<ExitCode> {
    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;
    let project_root = paths::resolve_project_root(&cwd, config_path.as_deref());

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .patchwarden/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            probes,
            environment,
            dry_run,
        } => {
            let env = config.environment(environment.as_deref(), &project_root)?;
            run(&config, &env, &project_root, &probes, dry_run)
        }
        Command::Check {
            probes,
            environment,
        } => {
            let env = config.environment(environment.as_deref(), &project_root)?;
            check(&config, &env, &probes)
        }
        Command::Backups { environment } => {
            let env = config.environment(environment.as_deref(), &project_root)?;
            let entries = patch::list_backups(&env.backup_dir, &env.target_file)
                .with_context(|| format!("failed to list {}", env.backup_dir.display()))?;
            if entries.is_empty() {
                println!("no backups of {} in {}", env.target_file.display(), env.backup_dir.display());
            }
            for entry in entries {
                println!("{}  {}", entry.timestamp.format("%Y-%m-%d %H:%M:%S"), entry.path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Restore {
            backup,
            target,
            environment,
        } => {
            let target = match target {
                Some(t) => t,
                None => config.environment(environment.as_deref(), &project_root)?.target_file,
            };
            let sha = patch::restore(&backup, &target)?;
            println!("restored {} from {} (sha256 {sha})", target.display(), backup.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn python_runtime(config: &ProjectConfig) -> Result<PythonRuntime> {
    let runtime = PythonRuntime::from_config(&config.sandbox);
    if !runtime.is_available() {
        bail!("interpreter '{}' is not available", runtime.interpreter());
    }
    Ok(runtime)
}

fn check(config: &ProjectConfig, env: &ResolvedEnvironment, names: &[String]) -> Result<ExitCode> {
    let probes = config.select_probes(names)?;
    if probes.is_empty() {
        warn!("no probes configured");
        return Ok(ExitCode::SUCCESS);
    }

    let host = PythonRoutineHost::new(python_runtime(config)?, &env.source_root, &env.module_name());
    let runner = ProbeRunner::new(&host);
    let mut failed = 0;
    for probe_config in &probes {
        let mut probe = Probe::from_config(probe_config);
        let verdict = runner.run(&mut probe);
        match &probe.failure {
            Some(why) => println!("{:<7} {:<24} {why}", verdict.to_string(), probe.name),
            None => println!("{:<7} {}", verdict.to_string(), probe.name),
        }
        if verdict != Verdict::Pass {
            failed += 1;
        }
    }

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn secret_or_none(secrets: &dyn SecretSource, name: Option<&str>) -> Result<Option<String>> {
    match name {
        Some(name) => secrets.get(name).map(Some),
        None => Ok(None),
    }
}

fn run(
    config: &ProjectConfig,
    env: &ResolvedEnvironment,
    project_root: &Path,
    names: &[String],
    dry_run: bool,
) -> Result<ExitCode> {
    let probes = config
        .select_probes(names)?
        .iter()
        .map(|p| p.resolved())
        .collect::<Result<Vec<_>>>()?;
    if probes.is_empty() {
        warn!("no probes configured");
        return Ok(ExitCode::SUCCESS);
    }

    let secrets = secrets::from_config(&config.secrets)?;
    let api_key = secrets
        .get(&config.conversation.api_key_secret)
        .context("conversation service key")?;
    let alert_key = secret_or_none(secrets.as_ref(), config.alerts.endpoint_key_secret.as_deref())?;
    let token_secret = match &env.publish {
        PublishConfig::Github { token_secret, .. } => Some(token_secret.as_str()),
        _ => None,
    };
    let token = secret_or_none(secrets.as_ref(), token_secret)?;

    let alerts = alert::install(&config.alerts, &paths::state_dir(project_root), alert_key)?;
    let run_id = uuid::Uuid::new_v4().to_string();
    let log = ExecutionLog::for_run(&paths::logs_dir(project_root), &run_id)?;

    let runtime = python_runtime(config)?;
    let host = PythonRoutineHost::new(runtime.clone(), &env.source_root, &env.module_name());
    let sandbox = SandboxExecutor::new(runtime)
        .with_prelude_from(&env.target_file)
        .guarding(&env.backup_dir)
        .guarding(&paths::config_file(project_root));
    let client = AssistantsClient::new(
        &config.conversation.base_url,
        &api_key,
        config.conversation.request_timeout(),
    );
    let pages = HttpPageSource::new(&config.page);
    let publisher = publisher_for(env, token.as_deref())?;
    let deployer = deployer_for(env);

    let mut ctx = RunContext::new(&run_id, dry_run, alerts.alerter().for_run(&run_id)).with_log(log);
    ctx.record(LogEvent::RunStarted {
        environment: env.name.clone(),
        target: env.target_file.display().to_string(),
        probes: probes.len(),
        dry_run,
    });
    info!(
        run = %run_id,
        environment = %env.name,
        target = %env.target_file.display(),
        probes = probes.len(),
        dry_run,
        "run started"
    );

    let parts = Collaborators {
        host: &host,
        conversations: &client,
        clock: &SystemClock,
        sandbox: &sandbox,
        pages: &pages,
        publisher: publisher.as_ref(),
        deployer: deployer.as_ref(),
    };
    let pipeline = RepairPipeline::new(parts, &env.target_file, &env.backup_dir)
        .with_poll_policy(config.conversation.poll_policy())
        .with_chunk_chars(config.page.chunk_chars)
        .with_commit_message(&env.commit_message);
    let outcomes = pipeline.run(&mut ctx, &probes);
    ctx.flush_alerts();

    for (name, outcome) in &outcomes {
        println!("{:<10} {name}", outcome.label());
    }
    if let Some(path) = ctx.log_path() {
        println!("execution log: {}", path.display());
    }

    let worst = ctx.max_severity();
    info!(
        run = %run_id,
        patched = ctx.patched.len(),
        alerts = ctx.alerts.len(),
        max_severity = worst.map(Severity::level).unwrap_or(0),
        "run finished"
    );
    Ok(if ctx.requires_intervention() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}
