//! Free TCP port selection on the loopback interface.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

const ALLOCATION_ATTEMPTS: usize = 64;

/// True when nothing is listening on `127.0.0.1:port` right now.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Pick a port for a background process.
///
/// A non-zero `requested` port is used when it is free and not `reserved`;
/// otherwise an ephemeral port is allocated, skipping anything in `reserved`
/// (ports already handed out whose processes may not have bound yet).
pub fn choose_port(requested: u16, reserved: &HashSet<u16>) -> Result<u16> {
    if requested != 0 && !reserved.contains(&requested) && is_port_free(requested) {
        return Ok(requested);
    }
    if requested != 0 {
        debug!(requested, "requested port unavailable, allocating another");
    }
    allocate_ephemeral(reserved)
}

fn allocate_ephemeral(reserved: &HashSet<u16>) -> Result<u16> {
    for _ in 0..ALLOCATION_ATTEMPTS {
        let listener =
            TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("bind ephemeral port")?;
        let port = listener.local_addr().context("read bound address")?.port();
        if !reserved.contains(&port) {
            return Ok(port);
        }
    }
    Err(anyhow!(
        "no free port found after {ALLOCATION_ATTEMPTS} attempts"
    ))
}

/// Choose one port per request, never handing out the same port twice.
pub fn choose_ports(requested: &[u16], reserved: &HashSet<u16>) -> Result<Vec<u16>> {
    let mut taken = reserved.clone();
    let mut chosen = Vec::with_capacity(requested.len());
    for &port in requested {
        let port = choose_port(port, &taken)?;
        taken.insert(port);
        chosen.push(port);
    }
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_port_falls_back_to_another() {
        let holder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let busy = holder.local_addr().expect("addr").port();
        let chosen = choose_port(busy, &HashSet::new()).expect("choose");
        assert_ne!(chosen, busy);
    }

    #[test]
    fn zero_requests_get_distinct_ports() {
        let chosen = choose_ports(&[0, 0, 0], &HashSet::new()).expect("choose");
        let unique: HashSet<u16> = chosen.iter().copied().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn reserved_ports_are_skipped() {
        let first = choose_port(0, &HashSet::new()).expect("first");
        let reserved: HashSet<u16> = [first].into_iter().collect();
        let requested_again = choose_port(first, &reserved).expect("second");
        assert_ne!(requested_again, first);
    }
}
