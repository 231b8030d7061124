//! Relay process wiring: listeners, background tasks, shutdown.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::relay::Relay;
use crate::transport::stream;

/// Bind the configured listeners and serve until `shutdown` fires.
pub async fn run_relay(config: RelayConfig, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    serve(listener, config, shutdown).await
}

/// Serve the relay on an already bound listener.
///
/// Split out from [`run_relay`] so tests can bind port 0 and read the
/// address back before the relay starts.
pub async fn serve(
    listener: TcpListener,
    config: RelayConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let relay = Relay::new(config);
    let maintenance = relay.spawn_maintenance();

    let tcp_control = match relay.config().tcp_control_addr.clone() {
        Some(addr) => {
            let control = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind control listener {addr}"))?;
            log::info!("[Relay] Accepting raw TCP agents on {addr}");
            Some(tokio::spawn(accept_loop(
                control,
                relay.clone(),
                shutdown.child_token(),
            )))
        }
        None => None,
    };

    let local_addr = listener.local_addr().context("Listener has no local address")?;
    log::info!(
        "[Relay] Listening on {local_addr} (control path {})",
        relay.config().control_path
    );

    let app = crate::http::router(relay.clone());
    let drain = relay.clone();
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.cancelled().await;
            drain.shutdown();
        })
        .await
        .context("HTTP server failed")?;

    relay.close_all("relay shutting down");
    if let Some(task) = tcp_control {
        task.abort();
    }
    for task in maintenance {
        let _ = task.await;
    }
    log::info!("[Relay] Stopped");
    Ok(())
}

/// Accept raw TCP control connections (length-prefixed frames).
async fn accept_loop(listener: TcpListener, relay: Relay, shutdown: CancellationToken) {
    let max_frame_size = relay.config().max_frame_size;
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                let _ = socket.set_nodelay(true);
                let relay = relay.clone();
                tokio::spawn(async move {
                    let (writer, reader) = stream::split(socket, max_frame_size);
                    match relay.accept(reader, writer).await {
                        Ok(id) => log::debug!("[Relay] TCP control session {id} from {peer} ended"),
                        Err(e) => log::warn!("[Relay] TCP control connection from {peer} rejected: {e:#}"),
                    }
                });
            }
            Err(e) => {
                log::error!("[Relay] Accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    log::debug!("[Relay] TCP control accept loop stopped");
}
