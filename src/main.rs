mod runner;

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weaver_core::config::AppConfig;
use weaver_core::definition::WorkflowDefinition;
use weaver_core::event::{EventKind, ExecutionEvent, StreamFrame};
use weaver_core::types::ExecutionStatus;
use weaver_engine::{StartRequest, WorkflowEngine};
use weaver_gateway::GatewayServer;

use crate::runner::ShellRunner;

#[derive(Parser)]
#[command(name = "weaver", version, about = "Workflow execution engine for agent graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weaver.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run a workflow file to completion, streaming its events
    Run {
        /// Workflow definition (.json or .toml)
        workflow: PathBuf,
        /// Initial variable as NAME=VALUE (VALUE is parsed as JSON when possible)
        #[arg(long = "var", value_parser = parse_assignment)]
        vars: Vec<(String, Value)>,
        /// Work item passed to every node, as JSON
        #[arg(long)]
        work_item: Option<String>,
        /// Pre-decided gate as GATE=OPTION; undecided gates prompt on stdin
        #[arg(long = "decide", value_parser = parse_decision)]
        decisions: Vec<(String, String)>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Validate a workflow file without running it
    Validate {
        workflow: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_assignment(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

fn parse_decision(raw: &str) -> Result<(String, String), String> {
    let (gate, option) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected GATE=OPTION, got '{}'", raw))?;
    Ok((gate.trim().to_string(), option.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weaver=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "weaver", &mut io::stdout());
        }
        Commands::Validate { workflow } => {
            let definition = load_workflow(&workflow)?;
            match weaver_engine::validate(&definition) {
                Ok(_) => println!(
                    "{}: ok ({} nodes, {} transitions, {} gates)",
                    workflow.display(),
                    definition.nodes.len(),
                    definition.transitions.len(),
                    definition.gates.len()
                ),
                Err(e) => {
                    eprintln!("{}: {}", workflow.display(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Config => {
            let config = AppConfig::load_or_default(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Serve { bind } => {
            let config = AppConfig::load_or_default(&cli.config)?;
            let mut gateway_config = config.gateway.clone();
            if let Some(bind) = bind {
                gateway_config.bind = bind;
            }
            let runner = Arc::new(ShellRunner::new(&config.runner));
            let engine = WorkflowEngine::new(config, runner);
            info!(bind = %gateway_config.bind, "Starting gateway");
            let server = GatewayServer::new(gateway_config, engine);

            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Run {
            workflow,
            vars,
            work_item,
            decisions,
            json,
        } => {
            let config = AppConfig::load_or_default(&cli.config)?;
            let runner = Arc::new(ShellRunner::new(&config.runner));
            let engine = WorkflowEngine::new(config, runner);

            let mut request = StartRequest::new(load_workflow(&workflow)?);
            for (name, value) in vars {
                request = request.with_variable(name, value);
            }
            if let Some(raw) = work_item {
                let item = serde_json::from_str(&raw).context("--work-item must be valid JSON")?;
                request = request.with_work_item(item);
            }

            let status = run_workflow(&engine, request, decisions.into_iter().collect(), json).await?;
            if status != ExecutionStatus::Completed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Load a workflow definition; `.toml` files are parsed as TOML, anything else as JSON.
fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read workflow {}", path.display()))?;
    let definition = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("invalid workflow TOML in {}", path.display()))?,
        _ => serde_json::from_str(&content)
            .with_context(|| format!("invalid workflow JSON in {}", path.display()))?,
    };
    Ok(definition)
}

async fn run_workflow(
    engine: &WorkflowEngine,
    request: StartRequest,
    mut decisions: HashMap<String, String>,
    json: bool,
) -> anyhow::Result<ExecutionStatus> {
    let started = engine.start(request).await?;
    let id = started.execution_id.to_string();
    let mut frames = engine.event_stream(&id, Some(0)).await?;

    let abort_engine = engine.clone();
    let abort_id = id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(execution_id = %abort_id, "Interrupted, aborting execution");
            let _ = abort_engine
                .abort(&abort_id, Some("interrupted".to_string()))
                .await;
        }
    });

    let mut final_status = ExecutionStatus::Failed;
    while let Some(frame) = frames.next().await {
        let StreamFrame::Event(event) = frame else {
            continue;
        };
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }

        match &event.kind {
            EventKind::GateWaiting {
                gate_id, options, ..
            } => {
                let node_id = event.node_id.clone().unwrap_or_default();
                let option = match decisions.remove(gate_id) {
                    Some(option) => Some(option),
                    None => prompt_gate(gate_id.clone(), options.clone()).await?,
                };
                if let Some(option) = option {
                    if let Err(e) = engine
                        .decide_gate(&id, gate_id, &node_id, &option, "cli", None)
                        .await
                    {
                        eprintln!("gate {}: {}", gate_id, e);
                    }
                }
            }
            EventKind::StreamEnd { final_status: status } => final_status = *status,
            _ => {}
        }
    }

    Ok(final_status)
}

/// Ask on stdin which option to take; EOF or a blank line leaves the gate to its timeout.
async fn prompt_gate(gate_id: String, options: Vec<String>) -> anyhow::Result<Option<String>> {
    let answer = tokio::task::spawn_blocking(move || -> io::Result<Option<String>> {
        let mut stdout = io::stdout();
        loop {
            print!("gate {} [{}]: ", gate_id, options.join("/"));
            stdout.flush()?;
            let mut input = String::new();
            if io::stdin().lock().read_line(&mut input)? == 0 {
                return Ok(None);
            }
            let choice = input.trim();
            if choice.is_empty() {
                return Ok(None);
            }
            if options.iter().any(|o| o == choice) {
                return Ok(Some(choice.to_string()));
            }
            println!("unknown option '{}'", choice);
        }
    })
    .await??;
    Ok(answer)
}

fn print_event(event: &ExecutionEvent) {
    match &event.kind {
        EventKind::CliOutput { text } => print!("{}", text),
        EventKind::CliError { text } => eprint!("{}", text),
        kind => {
            let payload = serde_json::to_value(kind)
                .ok()
                .and_then(|v| v.get("payload").cloned())
                .map(|p| format!(" {}", p))
                .unwrap_or_default();
            let node = event
                .node_id
                .as_deref()
                .map(|n| format!(" {}", n))
                .unwrap_or_default();
            println!(
                "[{}] #{} {}{}{}",
                event.timestamp.format("%H:%M:%S"),
                event.id,
                event.event_type(),
                node,
                payload
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assignments_parse_json_or_fall_back_to_string() {
        assert_eq!(parse_assignment("n=3").unwrap(), ("n".into(), json!(3)));
        assert_eq!(
            parse_assignment("branch=main").unwrap(),
            ("branch".into(), json!("main"))
        );
        assert_eq!(
            parse_assignment("tags=[\"a\"]").unwrap(),
            ("tags".into(), json!(["a"]))
        );
        assert!(parse_assignment("novalue").is_err());
    }

    #[test]
    fn decisions_parse() {
        assert_eq!(
            parse_decision("review=approve").unwrap(),
            ("review".into(), "approve".into())
        );
        assert!(parse_decision("review").is_err());
    }

    #[test]
    fn workflow_files_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("flow.json");
        std::fs::write(
            &json_path,
            r#"{"id":"j","nodes":[{"id":"a","type":"coder"}]}"#,
        )
        .unwrap();
        assert_eq!(load_workflow(&json_path).unwrap().id, "j");

        let toml_path = dir.path().join("flow.toml");
        std::fs::write(
            &toml_path,
            "id = \"t\"\n\n[[nodes]]\nid = \"a\"\ntype = \"coder\"\n",
        )
        .unwrap();
        let definition = load_workflow(&toml_path).unwrap();
        assert_eq!(definition.id, "t");
        assert_eq!(definition.nodes.len(), 1);

        assert!(load_workflow(&dir.path().join("missing.json")).is_err());
    }
}
