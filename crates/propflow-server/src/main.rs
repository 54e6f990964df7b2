//! Propflow workflow server
//!
//! One-shot subcommands for every engine operation, plus a `monitor` mode
//! that executes commands dropped into the data directory.

mod commands;
mod monitor;
mod notifier;

use clap::{Arg, ArgAction, ArgMatches, Command};
use commands::{build_actor, build_engine, build_filter, fail, parse_step_assignment, print_json, FilterArgs};
use propflow_core::workflow::BroadcastEventSink;
use propflow_core::{PropflowConfig, WorkflowError};
use propflow_types::{NewRequest, RequestId, StepAssignment, WorkflowCommand};
use std::path::PathBuf;
use std::sync::Arc;

fn request_id_arg() -> Arg {
    Arg::new("id")
        .long("id")
        .value_name("REQUEST_ID")
        .help("Request identifier")
        .required(true)
}

fn cli() -> Command {
    Command::new("propflow-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Property request approval workflow")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Configuration file path (JSON); defaults plus PROPFLOW__* variables when omitted")
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory, overrides storage.data_root")
                .global(true),
        )
        .arg(
            Arg::new("actor")
                .long("actor")
                .value_name("ID")
                .env("PROPFLOW_ACTOR")
                .help("Authenticated actor issuing the command")
                .global(true),
        )
        .arg(
            Arg::new("capability")
                .long("capability")
                .value_name("NAME")
                .help("Capability held by the actor (repeatable)")
                .action(ArgAction::Append)
                .global(true),
        )
        .subcommand(
            Command::new("create")
                .about("Create a request")
                .arg(Arg::new("kind").long("kind").value_name("KIND").required(true))
                .arg(Arg::new("department").long("department").value_name("ID"))
                .arg(
                    Arg::new("data")
                        .long("data")
                        .value_name("JSON")
                        .help("Opaque request data"),
                )
                .arg(
                    Arg::new("step")
                        .long("step")
                        .value_name("CODE=ACTOR")
                        .help("Step assignment: code=actor_id or code=Name|Title (repeatable)")
                        .action(ArgAction::Append),
                ),
        )
        .subcommand(
            Command::new("transition")
                .about("Move a request to another status")
                .arg(request_id_arg())
                .arg(Arg::new("to").long("to").value_name("STATUS").required(true))
                .arg(Arg::new("notes").long("notes").value_name("TEXT")),
        )
        .subcommand(
            Command::new("act")
                .about("Approve or reject an approval step")
                .arg(request_id_arg())
                .arg(
                    Arg::new("step")
                        .long("step")
                        .value_name("ORDER")
                        .value_parser(clap::value_parser!(u32))
                        .required(true),
                )
                .arg(
                    Arg::new("decision")
                        .long("decision")
                        .value_name("DECISION")
                        .value_parser(["approved", "rejected"])
                        .required(true),
                )
                .arg(Arg::new("notes").long("notes").value_name("TEXT")),
        )
        .subcommand(
            Command::new("cancel")
                .about("Cancel a request")
                .arg(request_id_arg())
                .arg(Arg::new("reason").long("reason").value_name("TEXT")),
        )
        .subcommand(
            Command::new("show")
                .about("Show a request with its steps")
                .arg(request_id_arg()),
        )
        .subcommand(
            Command::new("history")
                .about("Show the audit trail of a request")
                .arg(request_id_arg()),
        )
        .subcommand(
            Command::new("list")
                .about("List requests for reports")
                .arg(Arg::new("kind").long("kind").value_name("KIND"))
                .arg(Arg::new("status").long("status").value_name("STATUS"))
                .arg(Arg::new("department").long("department").value_name("ID"))
                .arg(Arg::new("created-by").long("created-by").value_name("ACTOR"))
                .arg(Arg::new("from").long("from").value_name("DATE"))
                .arg(Arg::new("to").long("to").value_name("DATE"))
                .arg(
                    Arg::new("summary")
                        .long("summary")
                        .help("Print per-status counts instead of records")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("monitor").about("Watch the command directory and deliver queued events"))
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<PropflowConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            let config = PropflowConfig::from_file(path)?;
            log::info!("Loaded configuration from {}", path);
            config
        }
        None => PropflowConfig::from_env()?,
    };

    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.storage.data_root = PathBuf::from(data_dir);
    }

    log::info!("Using data directory: {}", config.storage.data_root.display());

    Ok(config)
}

fn actor_from(matches: &ArgMatches) -> propflow_types::Actor {
    let id = matches.get_one::<String>("actor").cloned().unwrap_or_else(|| {
        fail(&WorkflowError::InvalidRequest("--actor (or PROPFLOW_ACTOR) is required".to_string()).to_payload())
    });
    let capabilities: Vec<String> = matches
        .get_many::<String>("capability")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    build_actor(&id, &capabilities)
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .unwrap_or_default()
}

fn optional(matches: &ArgMatches, name: &str) -> Option<String> {
    matches.get_one::<String>(name).cloned()
}

fn parse_request_id(matches: &ArgMatches) -> RequestId {
    RequestId::from_string(required(matches, "id")).unwrap_or_else(|e| fail(&WorkflowError::from(e).to_payload()))
}

fn create_command(matches: &ArgMatches, sub: &ArgMatches) -> WorkflowCommand {
    let mut request = NewRequest::default();

    if let Some(department) = sub.get_one::<String>("department") {
        request = request.with_department(department.as_str());
    }

    if let Some(data) = sub.get_one::<String>("data") {
        let data = serde_json::from_str(data).unwrap_or_else(|e| {
            fail(&WorkflowError::InvalidRequest(format!("--data is not valid JSON: {}", e)).to_payload())
        });
        request = request.with_data(data);
    }

    if let Some(steps) = sub.get_many::<String>("step") {
        request.steps = steps
            .map(|arg| parse_step_assignment(arg))
            .collect::<Result<Vec<StepAssignment>, String>>()
            .unwrap_or_else(|e| fail(&WorkflowError::InvalidRequest(e).to_payload()));
    }

    WorkflowCommand::Create {
        kind: required(sub, "kind").to_string(),
        actor: actor_from(matches),
        request,
    }
}

async fn execute_and_print(engine: &commands::Engine, command: WorkflowCommand) -> anyhow::Result<()> {
    let outcome = engine.execute(&command).await;
    print_json(&outcome)?;
    if !outcome.ok {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with INFO as default if RUST_LOG not set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    let events = Arc::new(BroadcastEventSink::new(config.events.channel_capacity));
    let engine = build_engine(&config, Some(events.clone()))?;

    log::debug!("Initialized workflow engine");

    match matches.subcommand() {
        Some(("create", sub)) => execute_and_print(&engine, create_command(&matches, sub)).await?,
        Some(("transition", sub)) => {
            let command = WorkflowCommand::Transition {
                request_id: parse_request_id(sub).to_string(),
                actor: actor_from(&matches),
                target: required(sub, "to").to_string(),
                notes: optional(sub, "notes"),
            };
            execute_and_print(&engine, command).await?
        }
        Some(("act", sub)) => {
            let command = WorkflowCommand::ActOnStep {
                request_id: parse_request_id(sub).to_string(),
                step_order: sub.get_one::<u32>("step").copied().unwrap_or_default(),
                actor: actor_from(&matches),
                decision: required(sub, "decision").to_string(),
                notes: optional(sub, "notes"),
            };
            execute_and_print(&engine, command).await?
        }
        Some(("cancel", sub)) => {
            let command = WorkflowCommand::Cancel {
                request_id: parse_request_id(sub).to_string(),
                actor: actor_from(&matches),
                reason: optional(sub, "reason"),
            };
            execute_and_print(&engine, command).await?
        }
        Some(("show", sub)) => match engine.get(&parse_request_id(sub)).await {
            Ok(aggregate) => print_json(&serde_json::json!({
                "record": aggregate.record(),
                "label": aggregate.status().label(),
                "steps": aggregate.steps(),
            }))?,
            Err(e) => fail(&e.to_payload()),
        },
        Some(("history", sub)) => match engine.history(&parse_request_id(sub)).await {
            Ok(history) => print_json(&history.into_vec())?,
            Err(e) => fail(&e.to_payload()),
        },
        Some(("list", sub)) => {
            let filter = build_filter(&FilterArgs {
                kind: sub.get_one::<String>("kind").map(String::as_str),
                status: sub.get_one::<String>("status").map(String::as_str),
                department: sub.get_one::<String>("department").map(String::as_str),
                created_by: sub.get_one::<String>("created-by").map(String::as_str),
                from: sub.get_one::<String>("from").map(String::as_str),
                to: sub.get_one::<String>("to").map(String::as_str),
            })
            .unwrap_or_else(|e| fail(&e.to_payload()));

            if sub.get_flag("summary") {
                match engine.summarize(&filter).await {
                    Ok(counts) => print_json(&serde_json::json!({
                        "total": counts.total(),
                        "statuses": commands::summary_rows(&counts),
                    }))?,
                    Err(e) => fail(&e.to_payload()),
                }
            } else {
                match engine.query(&filter).await {
                    Ok(records) => print_json(&records)?,
                    Err(e) => fail(&e.to_payload()),
                }
            }
        }
        Some(("monitor", _)) => {
            log::info!("Starting workflow monitor mode");
            monitor::run(Arc::new(engine), &config, events).await?;
        }
        _ => {
            log::error!("No action specified. Use --help for options.");
            std::process::exit(1);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn test_create_arguments() {
        let matches = cli().get_matches_from([
            "propflow-server",
            "--actor",
            "alice",
            "--capability",
            "can_manage_status",
            "create",
            "--kind",
            "off_campus_loan",
            "--department",
            "library",
            "--data",
            r#"{"asset_count": 1}"#,
            "--step",
            "prepared_by=alice",
            "--step",
            "approved_by=Dr. Cruz|Library Director",
        ]);
        let (_, sub) = matches.subcommand().unwrap();

        match create_command(&matches, sub) {
            WorkflowCommand::Create { kind, actor, request } => {
                assert_eq!(kind, "off_campus_loan");
                assert_eq!(actor.id.as_str(), "alice");
                assert!(actor.can("can_manage_status"));
                assert_eq!(request.department_id.as_deref(), Some("library"));
                assert_eq!(request.data["asset_count"], 1);
                assert_eq!(request.steps.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_act_arguments_are_typed() {
        let matches = cli().get_matches_from([
            "propflow-server",
            "act",
            "--id",
            "7f1c1a8e-0d7e-4d5a-9a43-3f0f1f1b2c3d",
            "--step",
            "2",
            "--decision",
            "rejected",
        ]);
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "act");
        assert_eq!(sub.get_one::<u32>("step").copied(), Some(2));
        assert!(cli()
            .try_get_matches_from(["propflow-server", "act", "--id", "x", "--step", "2", "--decision", "maybe"])
            .is_err());
    }
}
