use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use task_engine::Engine;
use task_engine::api::{ControlApi, ListRequest, SubmitRequest};
use task_engine::config::EngineConfig;
use task_engine::error::ControlError;
use task_engine::task::TaskState;
use task_engine::tools::ToolRegistry;
use task_engine::tools::builtin::register_builtin_tools;

/// Caller scope for submissions typed at the local console.
const OPERATOR_SCOPE: &str = "operator";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env().context("invalid TASK_ENGINE_* configuration")?;

    eprintln!("Task Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Artifacts: {}", config.artifact_dir.display());
    for pool in &config.pools {
        eprintln!(
            "   Pool {}: {} workers, queue limit {}",
            pool.resource_class, pool.workers, pool.queue_limit
        );
    }
    eprintln!("   Type `help` for commands, `quit` to exit.\n");

    let tools = Arc::new(ToolRegistry::new());
    register_builtin_tools(&tools);

    let db_path = config.db_path.clone();
    let engine = Engine::open(config, tools)
        .await
        .with_context(|| format!("failed to open engine at {}", db_path.display()))?;
    engine.start().await;

    let api = engine.api();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprint!("> ");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            eprint!("> ");
            continue;
        }
        if matches!(line, "quit" | "exit" | "/quit") {
            break;
        }

        run_command(&api, line).await;
        eprint!("> ");
    }

    engine.shutdown().await;
    Ok(())
}

async fn run_command(api: &ControlApi, line: &str) {
    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut args = rest.split_whitespace();

    match command {
        "help" => print_help(),
        "submit" => match parse_submit(rest) {
            Ok(request) => print(api.submit_task(OPERATOR_SCOPE, request).await),
            Err(message) => print_usage(&message),
        },
        "status" => match args.next() {
            Some(id) => print(api.get_task_status(id).await),
            None => print_usage("status <task_id>"),
        },
        "logs" => match args.next() {
            Some(id) => {
                let cursor = args.next();
                let limit = args.next().and_then(|l| l.parse().ok()).unwrap_or(0);
                print(api.tail_task_logs(id, cursor, limit).await)
            }
            None => print_usage("logs <task_id> [cursor] [limit]"),
        },
        "result" => match args.next() {
            Some(id) => print(api.get_task_result(id).await),
            None => print_usage("result <task_id>"),
        },
        "cancel" => match args.next() {
            Some(id) => {
                let reason = rest[id.len()..].trim();
                let reason = (!reason.is_empty()).then_some(reason);
                print(api.cancel_task(id, reason).await)
            }
            None => print_usage("cancel <task_id> [reason]"),
        },
        "list" => {
            let mut states = Vec::new();
            for raw in args {
                match raw.parse::<TaskState>() {
                    Ok(state) => states.push(state),
                    Err(e) => return print_usage(&e),
                }
            }
            print(api.list_tasks(ListRequest { states, ..Default::default() }).await)
        }
        "events" => match args.next() {
            Some(id) => print(api.list_task_events(id).await),
            None => print_usage("events <task_id>"),
        },
        "stats" => print(api.engine_stats().await),
        "tools" => print(Ok::<_, ControlError>(api.tools().await)),
        other => print_usage(&format!("unknown command '{other}', try `help`")),
    }
}

/// `submit {json request}` or `submit <tool> [json inputs]`.
fn parse_submit(rest: &str) -> Result<SubmitRequest, String> {
    if rest.starts_with('{') {
        return serde_json::from_str(rest).map_err(|e| format!("invalid request JSON: {e}"));
    }

    let (tool, inputs) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    if tool.is_empty() {
        return Err("submit <tool> [json inputs] | submit {request}".to_string());
    }
    let inputs = match inputs.trim() {
        "" => serde_json::Value::Null,
        raw => serde_json::from_str(raw).map_err(|e| format!("invalid inputs JSON: {e}"))?,
    };
    Ok(SubmitRequest {
        tool_name: tool.to_string(),
        inputs,
        ..Default::default()
    })
}

fn print<T: Serialize>(result: Result<T, ControlError>) {
    let value = match result {
        Ok(value) => serde_json::to_value(value),
        Err(e) => Ok(serde_json::json!({ "error": e.kind(), "message": e.to_string() })),
    };
    match value.and_then(|v| serde_json::to_string_pretty(&v)) {
        Ok(text) => println!("{text}"),
        Err(e) => tracing::error!("Failed to render response: {}", e),
    }
}

fn print_usage(message: &str) {
    eprintln!("{message}");
}

fn print_help() {
    eprintln!(
        "Commands:
  submit <tool> [json inputs]      submit with defaults
  submit {{json request}}            full request (tool_name, inputs, resources, priority, ...)
  status <task_id>
  logs <task_id> [cursor] [limit]
  result <task_id>
  cancel <task_id> [reason]
  list [state ...]
  events <task_id>
  stats
  tools
  quit"
    );
}
