//! Configuration for the networking layer.

use serde::{Deserialize, Serialize};
use tidepool_core::NodeId;

/// Tunables recognized by the networking layer.
///
/// Field names map to the host's `middleman.*` option keys; defaults follow
/// the host defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Size of the deserialization worker pool (`middleman.workers`).
    /// `None` derives `min(3, available_parallelism / 4) + 1`.
    pub workers: Option<usize>,

    /// Application identifiers advertised during handshakes
    /// (`middleman.app-identifiers`). Peers must share at least one.
    pub app_identifiers: Vec<String>,

    /// Bound of the header buffer cache (`middleman.max-header-buffers`).
    pub max_header_buffers: usize,

    /// Bound of the payload buffer cache (`middleman.max-payload-buffers`).
    pub max_payload_buffers: usize,

    /// Reads performed per read event before yielding back to the
    /// multiplexer (`middleman.max-consecutive-reads`).
    pub max_consecutive_reads: usize,

    /// Identity of this process (`middleman.this-node`).
    pub this_node: NodeId,

    /// Port the TCP backend's listener binds to (`middleman.tcp-port`);
    /// 0 binds an ephemeral port.
    pub tcp_port: u16,
}

impl NetConfig {
    /// Default application identifier.
    pub const DEFAULT_APP_IDENTIFIER: &'static str = "tidepool";

    /// Effective worker pool size.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(count) => count.max(1),
            None => {
                let parallelism = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (parallelism / 4).min(3) + 1
            }
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            workers: None,
            app_identifiers: vec![Self::DEFAULT_APP_IDENTIFIER.to_string()],
            max_header_buffers: 10,
            max_payload_buffers: 10,
            max_consecutive_reads: 50,
            this_node: NodeId::invalid(),
            tcp_port: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.app_identifiers, vec!["tidepool".to_string()]);
        assert_eq!(cfg.max_header_buffers, 10);
        assert_eq!(cfg.max_payload_buffers, 10);
    }

    #[test]
    fn test_worker_count_floor() {
        let cfg = NetConfig {
            workers: Some(0),
            ..NetConfig::default()
        };
        assert_eq!(cfg.worker_count(), 1);

        let cfg = NetConfig {
            workers: Some(8),
            ..NetConfig::default()
        };
        assert_eq!(cfg.worker_count(), 8);
    }

    #[test]
    fn test_derived_worker_count_bounds() {
        let cfg = NetConfig::default();
        let derived = cfg.worker_count();
        assert!((1..=4).contains(&derived));
    }
}
