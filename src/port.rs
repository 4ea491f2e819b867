//! Port selection and listener construction.
//!
//! The selector walks `[start, start + width)` in ascending order and
//! reports the first port a fresh socket can bind. That trial socket is
//! closed right away so the real listener can take the port.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

/// Number of consecutive ports tried by default
pub const DEFAULT_SCAN_WIDTH: u16 = 100;

/// Listen backlog for the serving socket
const LISTEN_BACKLOG: i32 = 1024;

/// Port selection errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Every port in the scan range is taken
    Exhausted { start: u16, width: u16 },
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortError::Exhausted { start, width } => write!(
                f,
                "Could not find an available port in {} ports starting from {}",
                width, start
            ),
        }
    }
}

impl std::error::Error for PortError {}

/// Candidate ports for a scan, clipped at 65535.
///
/// Returns `None` for an empty scan.
pub fn scan_range(start: u16, width: u16) -> Option<RangeInclusive<u16>> {
    if width == 0 {
        return None;
    }
    let end = (start as u32 + width as u32 - 1).min(u16::MAX as u32) as u16;
    Some(start..=end)
}

/// Find the lowest port in `[start, start + width)` that can be bound on `host`.
pub fn find_available_port(host: IpAddr, start: u16, width: u16) -> Result<u16, PortError> {
    let exhausted = PortError::Exhausted { start, width };
    let range = scan_range(start, width).ok_or_else(|| exhausted.clone())?;

    for port in range {
        if can_bind(SocketAddr::new(host, port)) {
            debug!(port, "Found available port");
            return Ok(port);
        }
        trace!(port, "Port in use");
    }

    Err(exhausted)
}

/// Try a single bind without address reuse; the socket is dropped on return.
fn can_bind(addr: SocketAddr) -> bool {
    let socket = match new_socket(addr) {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    socket.bind(&addr.into()).is_ok()
}

fn new_socket(addr: SocketAddr) -> io::Result<Socket> {
    Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )
}

/// Create the serving listener.
///
/// `SO_REUSEADDR` lets a restart reclaim a port left in TIME_WAIT. The
/// socket is non-blocking so it can be handed to tokio.
pub fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = new_socket(addr)?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
