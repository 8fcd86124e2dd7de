//! Diagnostics Endpoint
//!
//! Tiny local-only listener reporting current player and game counts as
//! plaintext. Read-only, unauthenticated, and therefore never bound to
//! anything but loopback.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::network::session::Services;

/// Render the status report body.
async fn render_report(services: &Services) -> String {
    let logins = services.players.logins().await;
    let titles = services.games.titles().await;
    format!(
        "Users ({}):\n{}\nGames ({}):\n{}\n",
        logins.len(),
        logins.join("\n"),
        titles.len(),
        titles.join("\n"),
    )
}

/// Serve status reports until shutdown.
///
/// Refuses to start on a non-loopback address; the report has no
/// authentication of any kind.
pub async fn run_control_server(
    addr: SocketAddr,
    services: Services,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    if !addr.ip().is_loopback() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "control server must bind to loopback",
        ));
    }

    let listener = TcpListener::bind(addr).await?;
    info!("control server listening on http://{}", listener.local_addr()?);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (mut stream, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("control accept error: {}", e);
                        continue;
                    }
                };

                let body = render_report(&services).await;
                let response = format!(
                    "HTTP/1.0 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                if let Err(e) = stream.write_all(response.as_bytes()).await {
                    debug!("control reply to {} failed: {}", peer, e);
                }
                let _ = stream.shutdown().await;
            }
            _ = shutdown.recv() => {
                info!("control server shutting down");
                return Ok(());
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
