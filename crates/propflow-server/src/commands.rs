//! Engine wiring and argument parsing shared by the one-shot subcommands and the monitor

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use propflow_core::config::StorageBackend;
use propflow_core::workflow::{
    BroadcastEventSink, FileStore, MemoryStore, OutboxEventSink, RequestFilter, StatusCountMap, WorkflowEngine,
    WorkflowStore,
};
use propflow_core::{PropflowConfig, Result, StatusRegister};
use propflow_types::{Actor, ErrorPayload, Status, StepActor, StepAssignment};
use serde::Serialize;
use std::sync::Arc;

/// Engine over whichever store the configuration selects
pub type Engine = WorkflowEngine<dyn WorkflowStore>;

/// Build the engine with the configured store and event sinks
pub fn build_engine(config: &PropflowConfig, broadcast: Option<Arc<BroadcastEventSink>>) -> Result<Engine> {
    let data_root = &config.storage.data_root;

    let store: Arc<dyn WorkflowStore> = match config.storage.backend {
        StorageBackend::File => {
            log::info!("Using file store at {}", data_root.display());
            Arc::new(FileStore::new(data_root)?)
        }
        StorageBackend::Memory => {
            log::warn!("Using in-memory store; nothing survives this process");
            Arc::new(MemoryStore::new())
        }
    };

    let mut engine = WorkflowEngine::new(store, config);

    if let Some(sink) = broadcast {
        engine = engine.with_sink(sink);
    }

    if config.events.outbox {
        let outbox = OutboxEventSink::new(data_root)?;
        log::debug!("Queueing events in {}", outbox.outbox_dir().display());
        engine = engine.with_sink(Arc::new(outbox));
    }

    Ok(engine)
}

pub fn build_actor<'a>(id: &str, capabilities: impl IntoIterator<Item = &'a String>) -> Actor {
    capabilities
        .into_iter()
        .fold(Actor::new(id), |actor, capability| actor.with_capability(capability.as_str()))
        .with_context("channel", "cli")
}

/// `code=actor_id` for a user, `code=Name|Title` for an outside signatory
pub fn parse_step_assignment(arg: &str) -> std::result::Result<StepAssignment, String> {
    let (code, who) = arg
        .split_once('=')
        .ok_or_else(|| format!("step '{}' must look like code=actor", arg))?;

    let code = code.trim();
    if code.is_empty() || who.trim().is_empty() {
        return Err(format!("step '{}' must look like code=actor", arg));
    }

    let actor = match who.split_once('|') {
        Some((name, title)) => StepActor::external(name.trim(), title.trim()),
        None => StepActor::internal(who.trim()),
    };

    Ok(StepAssignment::new(code, actor))
}

/// RFC 3339 timestamp, or a plain date taken as the start (or end) of that day in UTC
pub fn parse_timestamp(arg: &str, end_of_day: bool) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(arg) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(arg, "%Y-%m-%d")
        .map_err(|e| format!("'{}' is neither a date nor an RFC 3339 timestamp: {}", arg, e))?;
    let naive = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| format!("'{}' has no valid time of day", arg))?;

    Ok(Utc.from_utc_datetime(&naive))
}

/// Filter arguments as given on the command line, before validation
#[derive(Debug, Default)]
pub struct FilterArgs<'a> {
    pub kind: Option<&'a str>,
    pub status: Option<&'a str>,
    pub department: Option<&'a str>,
    pub created_by: Option<&'a str>,
    pub from: Option<&'a str>,
    pub to: Option<&'a str>,
}

pub fn build_filter(args: &FilterArgs<'_>) -> Result<RequestFilter> {
    let register = StatusRegister::global();

    let kind = args.kind.map(|k| register.parse_kind(k)).transpose()?;
    let status = match (kind, args.status) {
        (Some(kind), Some(status)) => Some(register.parse_status(kind, status)?),
        (None, Some(status)) => Some(status.parse::<Status>()?),
        (_, None) => None,
    };

    let invalid = propflow_core::WorkflowError::InvalidRequest;
    Ok(RequestFilter {
        kind,
        status,
        from: args.from.map(|s| parse_timestamp(s, false)).transpose().map_err(invalid)?,
        to: args.to.map(|s| parse_timestamp(s, true)).transpose().map_err(invalid)?,
        department_id: args.department.map(str::to_string),
        created_by: args.created_by.map(propflow_types::ActorId::new),
    })
}

#[derive(Debug, Serialize)]
pub struct StatusCountRow {
    pub status: String,
    pub label: &'static str,
    pub count: usize,
}

/// Report-friendly rendering of a status count map
pub fn summary_rows(counts: &StatusCountMap) -> Vec<StatusCountRow> {
    counts
        .iter()
        .map(|(status, count)| StatusCountRow {
            status: status.as_str().to_string(),
            label: status.label(),
            count,
        })
        .collect()
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print an error payload and exit non-zero
pub fn fail(payload: &ErrorPayload) -> ! {
    match serde_json::to_string_pretty(payload) {
        Ok(json) => println!("{}", json),
        Err(_) => println!("{{\"code\": \"{}\"}}", payload.code),
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use propflow_types::{RequestKind, CAN_MANAGE_STATUS};
    use tempfile::TempDir;

    #[test]
    fn test_parse_internal_and_external_steps() {
        let internal = parse_step_assignment("noted_by=bob").unwrap();
        assert_eq!(internal.code, "noted_by");
        assert_eq!(internal.actor, StepActor::internal("bob"));

        let external = parse_step_assignment("approved_by=Dr. Cruz | VP Finance").unwrap();
        assert_eq!(external.actor, StepActor::external("Dr. Cruz", "VP Finance"));

        assert!(parse_step_assignment("approved_by").is_err());
        assert!(parse_step_assignment("=bob").is_err());
        assert!(parse_step_assignment("noted_by= ").is_err());
    }

    #[test]
    fn test_parse_timestamp_accepts_dates_and_rfc3339() {
        let start = parse_timestamp("2024-03-01", false).unwrap();
        let end = parse_timestamp("2024-03-01", true).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2024-03-01T23:59:59+00:00");

        let exact = parse_timestamp("2024-03-01T08:30:00+08:00", false).unwrap();
        assert_eq!(exact.to_rfc3339(), "2024-03-01T00:30:00+00:00");

        assert!(parse_timestamp("March 1st", false).is_err());
    }

    #[test]
    fn test_build_filter_validates_codes() {
        let filter = build_filter(&FilterArgs {
            kind: Some("off_campus_loan"),
            status: Some("still_out"),
            department: Some("library"),
            from: Some("2024-01-01"),
            ..FilterArgs::default()
        })
        .unwrap();
        assert_eq!(filter.kind, Some(RequestKind::OffCampusLoan));
        assert_eq!(filter.status, Some(Status::StillOut));
        assert_eq!(filter.department_id.as_deref(), Some("library"));
        assert!(filter.from.is_some());

        let wrong_status = build_filter(&FilterArgs {
            kind: Some("transfer"),
            status: Some("lost"),
            ..FilterArgs::default()
        })
        .unwrap_err();
        assert_eq!(wrong_status.code(), "invalid_status");

        let wrong_kind = build_filter(&FilterArgs {
            kind: Some("parking_permit"),
            ..FilterArgs::default()
        })
        .unwrap_err();
        assert_eq!(wrong_kind.code(), "invalid_kind");

        let bad_date = build_filter(&FilterArgs {
            to: Some("yesterday"),
            ..FilterArgs::default()
        })
        .unwrap_err();
        assert_eq!(bad_date.code(), "invalid_request");
    }

    #[test]
    fn test_build_actor_carries_capabilities() {
        let caps = vec![CAN_MANAGE_STATUS.to_string()];
        let actor = build_actor("registrar", &caps);
        assert!(actor.can(CAN_MANAGE_STATUS));
        assert_eq!(actor.context.get("channel").and_then(|v| v.as_str()), Some("cli"));
    }

    #[tokio::test]
    async fn test_build_engine_with_file_backend() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = PropflowConfig::default();
        config.storage.data_root = temp_dir.path().to_path_buf();

        let engine = build_engine(&config, None).unwrap();
        let record = engine
            .create(
                RequestKind::Transfer,
                &Actor::new("registrar"),
                propflow_types::NewRequest::default(),
            )
            .await
            .unwrap();

        assert!(propflow_core::paths::kind_dir(temp_dir.path(), RequestKind::Transfer)
            .join(propflow_core::paths::record_file_name(record.id.as_str()))
            .exists());
        assert_eq!(
            std::fs::read_dir(propflow_core::paths::outbox_dir(temp_dir.path()))
                .unwrap()
                .count(),
            1
        );
    }

    #[test]
    fn test_summary_rows_use_labels() {
        let mut counts = StatusCountMap::new();
        counts.increment(Status::ReturnedLate);
        counts.increment(Status::ReturnedLate);

        let rows = summary_rows(&counts);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "returned_late");
        assert_eq!(rows[0].label, "Returned (Late)");
        assert_eq!(rows[0].count, 2);
    }
}
