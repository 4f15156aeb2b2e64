mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use lessor_core::domain::{
    AgentId, EventKind, Heartbeat, NewTask, ProtocolMessage, ResourceRef, TaskId, format_event,
    ttl_from_millis,
};
use lessor_core::event_log::EventLog;
use lessor_core::impls::sqlite::{SqliteRuntimeState, lock};
use lessor_core::ports::{Clock, RuntimeState, SystemClock};
use lessor_core::{
    AcquireLease, Coordinator, ReservationManager, RuntimeConfig, open_runtime_state, open_sqlite,
};

use crate::cli::{Cli, Commands, ResourceArg};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(cli.verbose || config.verbose);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("lessor_core=debug,lessor=debug")
    } else {
        EnvFilter::new("lessor_core=info,lessor=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Commands, config: RuntimeConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match command {
        Commands::Enqueue {
            id,
            priority,
            payload,
            policy,
        } => {
            let id = match id {
                Some(id) => TaskId::parse(id)?,
                None => TaskId::generate(),
            };
            let mut new_task = NewTask::new(id).with_priority(priority);
            if let Some(raw) = payload {
                let value = serde_json::from_str(&raw).context("--payload is not valid JSON")?;
                new_task = new_task.with_payload(value);
            }
            if let Some(label) = policy {
                new_task = new_task.with_policy_label(label);
            }
            let sqlite = open_sqlite(&config, clock).await?;
            let task = blocking(move || sqlite.scheduler().create_task(new_task)).await?;
            print_json(&task)
        }
        Commands::Reserve { agent, ttl_ms } => {
            let agent = AgentId::parse(agent)?;
            let sqlite = open_sqlite(&config, clock).await?;
            let ttl = ttl_ms.map(ttl_from_millis).transpose()?.unwrap_or(config.default_ttl);
            let claim = blocking(move || sqlite.scheduler().reserve(&agent, ttl)).await?;
            print_json(&json!({ "claim": claim }))
        }
        Commands::Renew {
            resource,
            agent,
            ttl_ms,
        } => {
            let ttl = ttl_from_millis(ttl_ms)?;
            let runtime = open_runtime_state(&config, clock).await?;
            let renewed = runtime.renew(&resource_ref(resource)?, &agent, ttl).await?;
            print_json(&json!({ "renewed": renewed }))
        }
        Commands::Release { resource, agent } => {
            let runtime = open_runtime_state(&config, clock).await?;
            let released = runtime.release_lease(&resource_ref(resource)?, &agent).await?;
            print_json(&json!({ "released": released }))
        }
        Commands::AcquireFile {
            path,
            agent,
            ttl_ms,
            reason,
            r#override,
        } => {
            let ttl = ttl_from_millis(ttl_ms)?;
            let manager = reservations(&config, clock, agent).await?;
            let mut request = AcquireLease::new(path, ttl);
            if let Some(reason) = reason {
                request = request.with_reason(reason);
            }
            if r#override {
                request = request.overriding();
            }
            let reservation = blocking(move || manager.acquire_lease(request)).await?;
            print_json(&reservation)
        }
        Commands::ReleaseFile { path, agent } => {
            let manager = reservations(&config, clock, agent).await?;
            let released = blocking(move || manager.release_lease(&path)).await?;
            print_json(&json!({ "released": released }))
        }
        Commands::Check { paths, agent } => {
            let manager = reservations(&config, clock, agent).await?;
            let result = blocking(move || manager.perform_reservation_check(paths.as_slice())).await?;
            print_json(&result)
        }
        Commands::Heartbeat {
            agent,
            task,
            ttl_ms,
            phase,
            busy,
        } => {
            let ttl = ttl_ms.map(ttl_from_millis).transpose()?;
            let runtime = open_runtime_state(&config, Arc::clone(&clock)).await?;
            let mut heartbeat = Heartbeat::new(agent.clone(), clock.now());
            if let Some(task) = &task {
                heartbeat = heartbeat.with_task(task.clone());
            }
            if let Some(phase) = phase {
                heartbeat = heartbeat.with_phase(phase, !busy);
            }
            runtime.upsert_heartbeat(heartbeat).await?;

            let renewed = match (task, ttl) {
                (Some(task), Some(ttl)) => Some(
                    runtime
                        .renew(&ResourceRef::task(TaskId::parse(task)?), &agent, ttl)
                        .await?,
                ),
                _ => None,
            };
            print_json(&json!({ "recorded": true, "renewed": renewed }))
        }
        Commands::Refresh => {
            let runtime = open_runtime_state(&config, clock).await?;
            print_json(&runtime.refresh().await?)
        }
        Commands::Expire => {
            let runtime = open_runtime_state(&config, Arc::clone(&clock)).await?;
            let expired = runtime.expire_leases(clock.now()).await?;
            print_json(&json!({ "expired": expired }))
        }
        Commands::Send { message } => {
            let message: ProtocolMessage =
                serde_json::from_str(&message).context("message is not a valid protocol message")?;
            let runtime = open_runtime_state(&config, clock).await?;
            print_json(&runtime.enqueue(message).await?)
        }
        Commands::Drain { limit } => {
            let sqlite = open_sqlite(&config, clock).await?;
            let scheduler = sqlite.scheduler().clone();
            let runtime: Arc<dyn RuntimeState> = Arc::new(sqlite);
            let coordinator = Coordinator::new(scheduler, runtime);
            print_json(&coordinator.drain_queue(limit).await?)
        }
        Commands::Events {
            resource,
            kind,
            limit,
        } => {
            let kind = kind
                .map(|k| k.parse::<EventKind>())
                .transpose()
                .context("unknown event kind")?;
            let sqlite = open_sqlite(&config, clock).await?;
            let displays = blocking(move || {
                let conn = lock(sqlite.scheduler().connection())?;
                let log = EventLog::new(&conn);
                let records = match (resource, kind) {
                    (Some(resource), kind) => {
                        let mut records = log.task_events(&resource);
                        if let Some(kind) = kind {
                            records.retain(|r| r.kind == kind.as_str());
                        }
                        records
                    }
                    (None, Some(kind)) => log.events_by_kind(kind, limit),
                    (None, None) => log.all_events(limit),
                };
                Ok(records.iter().map(format_event).collect::<Vec<_>>())
            })
            .await?;
            print_json(&displays)
        }
        Commands::Status => {
            let runtime = open_runtime_state(&config, clock).await?;
            let status = runtime.status().await?;
            print_json(&json!({ "backend": runtime.backend(), "status": status }))
        }
    }
}

fn resource_ref(arg: ResourceArg) -> Result<ResourceRef> {
    match (arg.task, arg.file) {
        (Some(task), None) => Ok(ResourceRef::task(TaskId::parse(task)?)),
        (None, Some(file)) => Ok(ResourceRef::file(file)),
        _ => bail!("pass exactly one of --task or --file"),
    }
}

async fn reservations(
    config: &RuntimeConfig,
    clock: Arc<dyn Clock>,
    agent: String,
) -> Result<ReservationManager> {
    let agent = AgentId::parse(agent)?;
    let sqlite: SqliteRuntimeState = open_sqlite(config, Arc::clone(&clock)).await?;
    Ok(
        ReservationManager::new(sqlite.scheduler().connection().clone(), clock, agent)
            .with_allow_override(config.allow_override),
    )
}

/// SQLite engine calls are synchronous; keep them off the runtime threads.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, lessor_core::LeaseError> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}
