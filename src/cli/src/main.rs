use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use runplex_core::{
    HttpBackend, HttpEventSource, RunCoordinator, RunLifecycleEvent, RunOutcome, RunState,
    RunplexConfig, SqliteStore, Store, ThreadKey,
};
use tokio::sync::broadcast::error::RecvError;

const USAGE: &str = "usage: runplex-cli <message> <room/thread> [<room/thread>...]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_filter())
        .init();

    let mut args = env::args().skip(1);
    let message = args.next().ok_or(USAGE)?;
    let keys = args
        .map(|arg| {
            ThreadKey::parse(&arg)
                .ok_or_else(|| format!("invalid thread `{arg}`; expected room/thread"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if keys.is_empty() {
        return Err(USAGE.into());
    }

    let mut config = RunplexConfig::load()?;
    if let Ok(base_url) = env::var("RUNPLEX_BASE_URL") {
        config.backend.base_url = base_url;
    }
    if let Ok(token) = env::var("RUNPLEX_AUTH_TOKEN") {
        config.backend.auth_token = Some(token);
    }
    let db_path = match env::var("RUNPLEX_DB_PATH") {
        Ok(path) => Some(PathBuf::from(path)),
        Err(_) => config.db_path()?,
    };
    let store: Option<Arc<dyn Store>> = match db_path {
        Some(path) => Some(Arc::new(SqliteStore::open(&path)?)),
        None => None,
    };

    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    let source = Arc::new(HttpEventSource::new(&config.backend)?);
    let coordinator = RunCoordinator::from_config(&config, backend, source, store);
    let registry = coordinator.registry().clone();
    let mut events = registry.lifecycle_events();

    let mut pending = 0usize;
    for key in &keys {
        match coordinator.start_run(key.clone(), message.clone(), None).await {
            Ok(run_id) => {
                tracing::info!(%key, %run_id, "run started");
                pending += 1;
            }
            Err(e) => tracing::error!(%key, error = %e, "run did not start"),
        }
    }

    while pending > 0 {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("cancelling active runs");
                for key in registry.active_keys() {
                    coordinator.cancel_run(&key);
                }
            }
            event = events.recv() => match event {
                Ok(RunLifecycleEvent::RunStarted { key }) => {
                    tracing::debug!(%key, "run registered");
                }
                Ok(RunLifecycleEvent::RunCompleted { key, outcome }) => {
                    pending = pending.saturating_sub(1);
                    report(registry.get_run_state(&key).as_ref(), &key, &outcome);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "lifecycle events lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    coordinator.shutdown();
    registry.dispose();
    Ok(())
}

fn report(state: Option<&RunState>, key: &ThreadKey, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Success => println!("[{key}] finished"),
        RunOutcome::Failed { message } => println!("[{key}] failed: {message}"),
        RunOutcome::Cancelled { reason } => println!("[{key}] cancelled: {reason}"),
    }
    let text = state
        .and_then(|state| state.conversation())
        .and_then(|conversation| conversation.last_assistant_text());
    if let Some(text) = text {
        println!("{text}");
    }
}

fn tracing_filter() -> tracing_subscriber::EnvFilter {
    let explicit = env::var("RUNPLEX_LOG").or_else(|_| env::var("RUST_LOG")).ok();
    if let Some(filter) = explicit {
        return tracing_subscriber::EnvFilter::new(filter);
    }
    if matches!(
        env::var("RUNPLEX_DEBUG").as_deref(),
        Ok("1" | "true" | "TRUE" | "yes" | "YES")
    ) {
        return tracing_subscriber::EnvFilter::new("debug");
    }
    tracing_subscriber::EnvFilter::new("info")
}
