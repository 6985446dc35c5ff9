//! Ephemeral port allocation for the managed backend's listening socket.

use std::io::ErrorKind;
use std::net::Ipv4Addr;

use rand::Rng;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default search range.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (1000, 65535);

/// Upper bound on bind attempts before giving up on a range.
pub const MAX_PORT_ATTEMPTS: u32 = 1000;

/// Finds a random unused TCP port in `min..=max`.
///
/// The listener used to test the port is closed before returning, so
/// another process may grab the port before the caller binds it. Callers
/// must treat a bind failure on the returned port as retryable.
pub async fn find_open_port(min: u16, max: u16) -> Result<u16> {
    find_open_port_within(min, max, MAX_PORT_ATTEMPTS).await
}

/// Same as [`find_open_port`] with an explicit attempt budget.
pub async fn find_open_port_within(min: u16, max: u16, max_attempts: u32) -> Result<u16> {
    // Port 0 would let the OS pick a port outside the range.
    if min == 0 || min > max {
        return Err(Error::config(format!("invalid port range {}..={}", min, max)));
    }

    let mut failures = 0u32;
    while failures < max_attempts {
        let candidate = rand::thread_rng().gen_range(min..=max);

        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, candidate)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                drop(listener);
                debug!(port, attempts = failures + 1, "found open port");
                return Ok(port);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                failures += 1;
                if failures % 10 == 0 {
                    warn!("find_open_port: {} iterations, no open port found", failures);
                }
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }

    Err(Error::PortExhausted {
        min,
        max,
        attempts: failures,
    })
}
