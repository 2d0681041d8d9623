//! Workload listener.
//!
//! The port the OS assigns here is the port the agent advertises. The
//! workload itself is a placeholder: connections are accepted and closed.

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::AgentError;

/// Bind an ephemeral TCP port on `address`.
pub async fn bind(address: IpAddr) -> Result<(TcpListener, u16), AgentError> {
    let addr = SocketAddr::new(address, 0);
    let listener = TcpListener::bind(addr).await.map_err(|source| AgentError::Bind {
        address: addr.to_string(),
        source,
    })?;
    let port = listener
        .local_addr()
        .map_err(|source| AgentError::Bind {
            address: addr.to_string(),
            source,
        })?
        .port();

    info!(%address, port, "listener bound");
    Ok((listener, port))
}

/// Accept and drop connections until shutdown.
///
/// An accept error ends the loop; the caller treats it as fatal.
pub async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AgentError> {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted.map_err(AgentError::Accept)?;
                debug!(%peer_addr, "connection accepted");
                drop(stream);
            }
            _ = shutdown.changed() => break,
        }
    }

    info!("listener shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    use super::*;

    #[tokio::test]
    async fn bind_assigns_nonzero_port() {
        let (listener, port) = bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn two_binds_get_distinct_ports() {
        let (_a, port_a) = bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();
        let (_b, port_b) = bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();
        assert_ne!(port_a, port_b);
    }

    #[tokio::test]
    async fn bind_unavailable_address_fails() {
        // TEST-NET-1 is never assigned to a local interface.
        let err = bind("192.0.2.1".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, AgentError::Bind { .. }));
    }

    #[tokio::test]
    async fn accepted_connections_are_closed() {
        let (listener, port) = bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(listener, shutdown_rx));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
