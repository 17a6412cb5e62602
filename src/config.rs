use std::net::SocketAddr;
use std::time::Duration;

/// Hard ceiling on a DNS-over-UDP datagram; anything larger is dropped.
pub const MAX_PACKET_SIZE: usize = 512;

/// Receive buffer size. Larger than MAX_PACKET_SIZE so oversized datagrams
/// can be read (and then rejected) instead of silently truncated.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Kernel socket buffer size for both UDP sockets.
pub const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Local address the client socket binds to.
    pub listen_addr: SocketAddr,
    /// The single upstream resolver, resolved once at startup.
    pub upstream_addr: SocketAddr,
    /// How long a forwarded request may wait for its reply.
    pub request_timeout: Duration,
    /// How often the sweeper culls timed-out requests.
    pub scan_interval: Duration,
    /// Number of processor workers draining the ingress queue.
    pub processors: usize,
    /// Response cache toggle; off unless asked for.
    pub cache: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_addr: default_upstream_addr(),
            request_timeout: default_request_timeout(),
            scan_interval: default_scan_interval(),
            processors: 1,
            cache: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:53".parse().expect("static listen addr")
}

fn default_upstream_addr() -> SocketAddr {
    "8.8.8.8:53".parse().expect("static upstream addr")
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(2000)
}

fn default_scan_interval() -> Duration {
    Duration::from_millis(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_expectations() {
        let settings = ServerSettings::default();
        assert_eq!(settings.listen_addr.port(), 53);
        assert_eq!(settings.upstream_addr.port(), 53);
        assert_eq!(settings.request_timeout, Duration::from_millis(2000));
        assert_eq!(settings.scan_interval, Duration::from_millis(1000));
        assert!(!settings.cache);
    }

    #[test]
    fn scan_interval_shorter_than_request_timeout() {
        // The sweeper must get at least one pass inside the timeout window.
        let settings = ServerSettings::default();
        assert!(settings.scan_interval < settings.request_timeout);
    }
}
