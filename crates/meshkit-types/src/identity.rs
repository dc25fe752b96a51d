//! Identity helpers: node ids and advertise-address resolution.

use uuid::Uuid;

use crate::{Error, Result};

/// Generates a node id of the form `<name>-<uuid>`.
pub fn node_id(name: &str) -> String {
    format!("{name}-{}", Uuid::new_v4())
}

/// Resolves the address a process should announce to its peers.
///
/// Prefers `advertise` when set, otherwise falls back to the bind
/// `address`. The host part must be a routable host: unspecified hosts
/// (`0.0.0.0`, `::`, empty) cannot be handed to a remote peer.
///
/// # Errors
///
/// Returns [`Error::NotAvailable`] until the server reports a usable
/// address; callers are expected to retry briefly during startup.
pub fn advertise_address(advertise: &str, address: &str) -> Result<String> {
    let addr = if advertise.is_empty() { address } else { advertise };
    if addr.is_empty() {
        return Err(Error::NotAvailable);
    }

    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (addr, None),
    };

    if !routable(host) {
        return Err(Error::NotAvailable);
    }

    match port {
        Some(port) => Ok(format!("{host}:{port}")),
        None => Ok(host.to_string()),
    }
}

fn routable(host: &str) -> bool {
    !matches!(host, "" | "0.0.0.0" | "::" | "[::]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn node_ids_are_unique() {
        assert_ne!(node_id("greeter"), node_id("greeter"));
        assert!(node_id("greeter").starts_with("greeter-"));
    }

    #[test_case("10.1.2.3:8080", "" => "10.1.2.3:8080"; "advertise wins")]
    #[test_case("", "192.168.0.7:9000" => "192.168.0.7:9000"; "falls back to bind address")]
    #[test_case("node-a.internal", "" => "node-a.internal"; "bare host passes through")]
    fn resolves(advertise: &str, address: &str) -> String {
        advertise_address(advertise, address).unwrap()
    }

    #[test_case("", ""; "nothing to announce")]
    #[test_case("0.0.0.0:8080", ""; "unspecified v4")]
    #[test_case("", "[::]:8080"; "unspecified v6")]
    fn rejects(advertise: &str, address: &str) {
        assert!(matches!(
            advertise_address(advertise, address),
            Err(Error::NotAvailable)
        ));
    }
}
