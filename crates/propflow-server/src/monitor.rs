//! Command drop-directory monitor
//!
//! Watches `commands/` for `WorkflowCommand` JSON files, executes each one and
//! files it with its outcome under `commands/processed/` or `commands/failed/`.
//! Runs the outbox watcher, an event log and redelivery of queued events alongside.

use crate::commands::Engine;
use crate::notifier::LogNotifier;
use anyhow::Context;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use propflow_core::workflow::{BroadcastEventSink, OutboxWatcher};
use propflow_core::{paths, PropflowConfig};
use propflow_types::{CommandOutcome, ErrorPayload, WorkflowCommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;

/// Run until one of the watchers stops
pub async fn run(engine: Arc<Engine>, config: &PropflowConfig, events: Arc<BroadcastEventSink>) -> anyhow::Result<()> {
    let data_root = config.storage.data_root.clone();

    let event_log_handle = tokio::spawn(log_events(events.receiver()));
    let poll_interval = Duration::from_secs(config.events.poll_interval_secs.max(1));
    let redelivery_handle = tokio::spawn(redeliver_events(engine.clone(), poll_interval));

    let outbox_handle = if config.events.outbox {
        let watcher = Arc::new(OutboxWatcher::new(
            &data_root,
            Arc::new(LogNotifier),
            poll_interval,
        )?);
        Some(tokio::spawn(watcher.start()))
    } else {
        log::info!("Outbox disabled; events are only broadcast in-process");
        None
    };

    let commands_handle = tokio::spawn(async move { monitor_commands(engine, data_root).await });

    let outbox_finished = async {
        match outbox_handle {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = commands_handle => match result {
            Ok(Ok(())) => log::info!("Command monitor exited normally"),
            Ok(Err(e)) => {
                log::error!("Command monitor failed: {}", e);
                return Err(e);
            }
            Err(e) => {
                log::error!("Command monitor task panicked: {}", e);
                return Err(e.into());
            }
        },
        result = outbox_finished => {
            if let Err(e) = result {
                log::error!("Outbox watcher task panicked: {}", e);
                return Err(e.into());
            }
        }
        result = event_log_handle => {
            if let Err(e) = result {
                log::error!("Event log task panicked: {}", e);
                return Err(e.into());
            }
        }
        result = redelivery_handle => {
            if let Err(e) = result {
                log::error!("Event redelivery task panicked: {}", e);
                return Err(e.into());
            }
        }
    }

    Ok(())
}

async fn log_events(mut receiver: broadcast::Receiver<propflow_types::DomainEvent>) {
    loop {
        match receiver.recv().await {
            Ok(event) => log::debug!(
                "Event {} {:?} on {}: {:?} -> {}",
                event.event_id,
                event.action,
                event.request_id,
                event.old_status,
                event.new_status
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Event log fell behind, skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Push events that were committed but never delivered, starting with whatever
/// an earlier process left behind
async fn redeliver_events(engine: Arc<Engine>, interval: Duration) {
    loop {
        if let Err(e) = engine.redeliver_pending().await {
            log::error!("Event redelivery failed: {}", e);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn monitor_commands(engine: Arc<Engine>, data_root: PathBuf) -> anyhow::Result<()> {
    let commands_path = paths::commands_dir(&data_root);
    let processed_path = paths::commands_processed_dir(&data_root);
    let failed_path = paths::commands_failed_dir(&data_root);

    log::info!("Monitoring workflow commands in {}/", commands_path.display());

    // Ensure directories exist
    for dir in [&commands_path, &processed_path, &failed_path] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    // Set up file system watcher
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| {
            if let Ok(event) = result {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(&commands_path, RecursiveMode::NonRecursive)?;

    // Process existing files first, oldest name first
    let mut pending: Vec<PathBuf> = std::fs::read_dir(&commands_path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_command_file(path))
        .collect();
    pending.sort();
    for path in pending {
        if let Err(e) = process_command_file(&engine, &path, &processed_path, &failed_path).await {
            log::error!("Failed to process command file {:?}: {}", path, e);
        }
    }

    // Monitor for new files
    while let Some(event) = rx.recv().await {
        log::debug!("File system event: {:?}", event);

        if let EventKind::Create(_) | EventKind::Modify(_) = event.kind {
            for path in event.paths {
                if is_command_file(&path) {
                    if let Err(e) = process_command_file(&engine, &path, &processed_path, &failed_path).await {
                        log::error!("Failed to process command file {:?}: {}", path, e);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Writers drop `*.json` via rename; anything else (temp files, editors) is ignored
fn is_command_file(path: &Path) -> bool {
    paths::is_pending_json(path, "")
}

/// Execute one command file and move it next to its outcome. Returns whether the command succeeded.
pub async fn process_command_file(
    engine: &Engine,
    command_path: &Path,
    processed_path: &Path,
    failed_path: &Path,
) -> anyhow::Result<bool> {
    let file_name = command_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Invalid file name")?
        .to_string();
    let stem = file_name.trim_end_matches(".json");

    log::info!("Processing command file: {}", file_name);

    let content = tokio::fs::read_to_string(command_path).await?;

    let (ok, outcome_json) = match serde_json::from_str::<WorkflowCommand>(&content) {
        Ok(command) => {
            let outcome: CommandOutcome = engine.execute(&command).await;
            match &outcome.error {
                None => log::info!("Command {} from {} succeeded", outcome.command, file_name),
                Some(error) => log::info!("Command {} from {} failed: {}", outcome.command, file_name, error.code),
            }
            (outcome.ok, serde_json::to_string_pretty(&outcome)?)
        }
        Err(e) => {
            log::warn!("Unparseable command file {}: {}", file_name, e);
            let payload = ErrorPayload {
                code: "invalid_request".to_string(),
                message: format!("Failed to parse WorkflowCommand JSON: {}", e),
                current_status: None,
                attempted_status: None,
            };
            (false, serde_json::to_string_pretty(&payload)?)
        }
    };

    // Determine destination based on result
    let destination_dir = if ok { processed_path } else { failed_path };

    tokio::fs::write(destination_dir.join(format!("{}.outcome.json", stem)), outcome_json).await?;
    tokio::fs::rename(command_path, destination_dir.join(&file_name)).await?;

    log::debug!(
        "Moved command file to {}: {}",
        if ok { "processed" } else { "failed" },
        file_name
    );

    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::build_engine;
    use propflow_core::config::StorageBackend;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        engine: Engine,
        commands: PathBuf,
        processed: PathBuf,
        failed: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = PropflowConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config.storage.data_root = temp_dir.path().to_path_buf();
        config.events.outbox = false;

        let root = temp_dir.path();
        let fixture = Fixture {
            engine: build_engine(&config, None).unwrap(),
            commands: paths::commands_dir(root),
            processed: paths::commands_processed_dir(root),
            failed: paths::commands_failed_dir(root),
            _temp_dir: temp_dir,
        };
        for dir in [&fixture.commands, &fixture.processed, &fixture.failed] {
            std::fs::create_dir_all(dir).unwrap();
        }
        fixture
    }

    fn drop_command(fixture: &Fixture, name: &str, body: &str) -> PathBuf {
        let path = fixture.commands.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_successful_command_moves_to_processed() {
        let fx = fixture();
        let path = drop_command(
            &fx,
            "001_create.json",
            r#"{"command": "create", "kind": "transfer", "actor": {"id": "registrar"}}"#,
        );

        let ok = process_command_file(&fx.engine, &path, &fx.processed, &fx.failed).await.unwrap();
        assert!(ok);
        assert!(!path.exists());
        assert!(fx.processed.join("001_create.json").exists());

        let outcome: CommandOutcome = serde_json::from_str(
            &std::fs::read_to_string(fx.processed.join("001_create.outcome.json")).unwrap(),
        )
        .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.command, "create");
        assert_eq!(outcome.record.unwrap().status, propflow_types::Status::Upcoming);
    }

    #[tokio::test]
    async fn test_rejected_command_moves_to_failed_with_code() {
        let fx = fixture();
        let body = format!(
            r#"{{"command": "cancel", "request_id": "{}", "actor": {{"id": "registrar"}}}}"#,
            propflow_types::RequestId::new()
        );
        let path = drop_command(&fx, "002_cancel.json", &body);

        let ok = process_command_file(&fx.engine, &path, &fx.processed, &fx.failed).await.unwrap();
        assert!(!ok);

        let outcome: CommandOutcome = serde_json::from_str(
            &std::fs::read_to_string(fx.failed.join("002_cancel.outcome.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(outcome.error.unwrap().code, "not_found");
    }

    #[tokio::test]
    async fn test_unparseable_command_is_filed_as_failed() {
        let fx = fixture();
        let path = drop_command(&fx, "003_garbage.json", "{\"command\": \"launch\"}");

        let ok = process_command_file(&fx.engine, &path, &fx.processed, &fx.failed).await.unwrap();
        assert!(!ok);
        assert!(fx.failed.join("003_garbage.json").exists());

        let payload: ErrorPayload = serde_json::from_str(
            &std::fs::read_to_string(fx.failed.join("003_garbage.outcome.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(payload.code, "invalid_request");
    }

    #[test]
    fn test_only_json_files_are_commands() {
        let fx = fixture();
        let json = drop_command(&fx, "004.json", "{}");
        let tmp = drop_command(&fx, "005.json.tmp", "{}");
        assert!(is_command_file(&json));
        assert!(!is_command_file(&tmp));
    }
}
