use oracle_node::{
    Config,
    node::NodeError,
};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let node = config.build().await?;
    let cancellation_token = CancellationToken::new();

    let mut node_future = Box::pin(node.run(cancellation_token.clone()));

    tokio::select! {
        result = &mut node_future => {
            handle_node_result(result);
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C signal, initiating graceful shutdown");
            cancellation_token.cancel();
            handle_node_result(node_future.await);
        }
    }

    Ok(())
}

/// Handle the result of the node
fn handle_node_result(result: Result<(), NodeError>) {
    match result {
        Ok(()) => tracing::info!("Oracle node shutdown gracefully"),
        Err(e) => {
            tracing::error!("Oracle node encountered an error: {}", e);
        }
    }
}
