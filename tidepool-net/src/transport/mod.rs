//! Transport layers: byte movers at the bottom of a protocol stack.

/// Layer contracts (receive policy, downward ops, application, transport).
pub mod contract;

/// UDP transport serving many peer endpoints through one socket.
pub mod datagram;

/// TCP transport for a single connection.
pub mod stream;

pub(crate) mod cache;

pub use contract::{Application, ReceivePolicy, Transport, TransportOps};
pub use datagram::{DatagramAppFactory, DatagramTransport};
pub use stream::StreamTransport;

/// Split a locator of the form `scheme://authority/path` into
/// `(authority, path)`. Plain paths yield an empty authority.
pub(crate) fn split_locator(locator: &str) -> (&str, &str) {
    let Some(stripped) = locator.split_once("://").map(|(_, rest)| rest) else {
        return ("", locator);
    };
    match stripped.find('/') {
        Some(slash) => (&stripped[..slash], &stripped[slash..]),
        None => (stripped, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::split_locator;

    #[test]
    fn test_split_locator() {
        assert_eq!(split_locator("/name/dummy"), ("", "/name/dummy"));
        assert_eq!(
            split_locator("udp://127.0.0.1:4000/name/dummy"),
            ("127.0.0.1:4000", "/name/dummy")
        );
        assert_eq!(split_locator("tcp://peer:80"), ("peer:80", ""));
    }
}
