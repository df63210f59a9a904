use std::process::ExitCode;
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::net::TcpListener;

use dispatch::config::Config;
use dispatch::discovery;
use dispatch::reporter::PrintReporter;
use dispatch::server;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let manifest = config
        .test_manifest
        .clone()
        .expect("TEST_MANIFEST must point to a discovery manifest");

    let listener = TcpListener::bind(config.address)
        .await
        .expect("failed to bind server address");
    tracing::info!("listening on {}", config.address);

    let passed = server::run(
        config,
        move || discovery::load_manifest(&manifest),
        vec![Arc::new(PrintReporter {})],
        listener,
    )
    .await;

    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
