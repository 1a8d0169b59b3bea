// orchestrator-service-rs/src/main.rs
// Command-line entry point: routes the request given as arguments, or every
// line read from stdin, and prints each RouteResult as JSON.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use agent_registry::CapabilityRegistry;
use config_rs::AssistantConfig;
use error_handling_rs::{init_logging, log_structured_error};
use orchestrator::{Assistant, RouteResult, RoutingTable};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

const CAPABILITIES_VAR: &str = "ASSISTANT_CAPABILITIES";
const ROUTES_VAR: &str = "ASSISTANT_ROUTES";

fn print_result(result: &RouteResult) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string(result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AssistantConfig::load()?;
    let _log_guard = init_logging(&config.logging)?;

    let capabilities_path = env::var(CAPABILITIES_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/capabilities.toml"));
    let probes = CapabilityRegistry::load_probes(&capabilities_path)?;
    let capabilities = CapabilityRegistry::from_probes(&probes);

    let mut builder = Assistant::builder(config).capabilities(capabilities);
    if let Ok(path) = env::var(ROUTES_VAR) {
        builder = builder.routes(RoutingTable::load(&PathBuf::from(path))?);
    }
    let assistant = Arc::new(builder.build().await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = assistant.spawn_background(shutdown_rx);

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            print_result(&assistant.handle(&line).await)?;
        }
    } else {
        print_result(&assistant.handle(&args.join(" ")).await)?;
    }

    // Finish improvement work triggered by this session before exiting.
    match assistant.process_improvements().await {
        Ok(cycle) => tracing::info!(
            delegated = cycle.delegated,
            implemented = cycle.outcomes.len(),
            "Improvement cycle finished"
        ),
        Err(err) => log_structured_error(&err),
    }

    let _ = shutdown_tx.send(true);
    for handle in background {
        let _ = handle.await;
    }
    tracing::info!("Orchestrator shut down");
    Ok(())
}
