// Copyright 2026 The Rampart Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use rampart::config;
use rampart::hardening::ServiceGuards;
use rampart::registry::{ReloadController, SharedRegistry};
use rampart::scanner::Scanner;
use rampart::server::{self, AppState};
use rampart::telemetry::Telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rampart", about = "Layer-0 security scanner for LLM pipelines")]
struct Cli {
    /// Path to the rampart.yaml config file
    #[arg(long, default_value = "rampart.yaml", env = "RAMPART_CONFIG")]
    config: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8600, env = "RAMPART_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
    tracing::info!(%addr, "rampart starting");

    let source = config::FileSource {
        path: std::path::PathBuf::from(cli.config),
    };
    let config = match config::load_config(&source) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        environment = %config.environment,
        fail_open = config.scan.fail_open,
        contract_hash = %config.contract_hash,
        datasets = config.datasets.paths.len(),
        "config loaded"
    );

    let registry = SharedRegistry::empty();
    let telemetry = Arc::new(Telemetry::new());
    let reloader = Arc::new(ReloadController::new(
        Arc::clone(&config),
        registry.clone(),
    ));

    // Startup load is the first "reload": fail-closed refuses to serve
    // without a verified rule set.
    match reloader.reload().await {
        Ok(report) => {
            tracing::info!(
                rule_set_version = %report.rule_set_version,
                total_rules = report.total_rules,
                "initial rule set loaded"
            );
        }
        Err(e) => {
            tracing::error!("failed to load datasets: {e}");
            std::process::exit(1);
        }
    }

    let scanner = Arc::new(Scanner::new(
        Arc::clone(&config),
        registry,
        Arc::clone(&telemetry),
    ));

    let guards = ServiceGuards::new(&config.server);

    let app = server::build_router(AppState {
        scanner,
        reloader,
        telemetry,
        guards,
        config,
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    tracing::info!(%addr, "rampart listening");

    axum::serve(listener, app)
        .await
        .expect("server error");
}
