use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpListener;

/// How many consecutive ports are tried before giving up
pub const PORT_ATTEMPTS: u16 = 10;

/// Binds `bind:port`, moving to the next port while the address is in use.
pub async fn bind_with_fallback(bind: IpAddr, port: u16) -> io::Result<TcpListener> {
    let mut last_err = None;

    for offset in 0..PORT_ATTEMPTS {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        let addr = SocketAddr::new(bind, candidate);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if offset > 0 {
                    tracing::warn!(requested = port, bound = candidate, "Requested port in use, using fallback");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::debug!(port = candidate, "Port in use");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no free port")))
}

/// Resolves when the process receives ctrl-c.
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown requested"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}
