//! UDP listener setup

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

/// Bind a blocking UDP socket whose reads give up after `read_timeout`.
///
/// Address reuse is left off so a port held by another source or process
/// surfaces as a bind failure instead of a silent takeover.
pub fn create_socket(
    addr: SocketAddr,
    read_timeout: Duration,
    recv_buffer_size: Option<usize>,
) -> Result<UdpSocket, NetworkError> {
    let bind_failed = |e: std::io::Error| NetworkError::BindFailed {
        port: addr.port(),
        reason: e.to_string(),
    };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_failed)?;

    if let Some(size) = recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::warn!("Could not set receive buffer to {} bytes: {}", size, e);
        }
    }

    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.set_read_timeout(Some(read_timeout)).map_err(bind_failed)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_bind_ephemeral() {
        let socket = create_socket(loopback(0), Duration::from_millis(10), None).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_read_times_out() {
        let socket = create_socket(loopback(0), Duration::from_millis(20), Some(64 * 1024)).unwrap();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn test_port_conflict_is_bind_failure() {
        let first = create_socket(loopback(0), Duration::from_millis(10), None).unwrap();
        let port = first.local_addr().unwrap().port();

        let err = create_socket(loopback(port), Duration::from_millis(10), None).unwrap_err();
        assert!(matches!(err, NetworkError::BindFailed { port: p, .. } if p == port));
    }
}
