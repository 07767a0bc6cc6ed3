mod commands;

use anyhow::Result;
use sync_connection::ConnectionManager;
use sync_core::{Config, SyncContext};
use sync_router::{run as run_sync, SessionHandle};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting sync client");

    let config = Config::from_env();
    let ctx = SyncContext::new(config)?;
    tracing::info!("Sync context initialized for {}", ctx.user_id);

    let connection = ConnectionManager::from_config(&ctx.config);
    let (handle, command_rx) = SessionHandle::channel(32);

    let ctx_clone = ctx.clone();
    let connection_clone = connection.clone();
    let consumer = tokio::spawn(async move {
        if let Err(e) = run_sync(ctx_clone, connection_clone, command_rx).await {
            tracing::error!("Sync consumer error: {}", e);
        }
    });

    if let Err(e) = connection.connect(&ctx.token).await {
        tracing::warn!("Initial connection failed, retrying in background: {}", e);
    }

    println!("{}", commands::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::debug!("stdin closed, running until interrupted");
                        stdin_open = false;
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("Failed to read stdin: {}", e);
                        stdin_open = false;
                        continue;
                    }
                };
                let input = match commands::parse(&line) {
                    Ok(Some(input)) => input,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                match commands::dispatch(&handle, &ctx.user_id, input).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Shutting down");
    if let Err(e) = handle.logout().await {
        tracing::debug!("Session already closed: {}", e);
    }
    connection.disconnect();
    let _ = consumer.await;

    Ok(())
}
