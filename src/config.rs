use std::time::Duration;

/// Client-wide configuration. Timing constants default to the values the
/// service and its peers expect; changing them unilaterally mostly makes
/// sense in tests.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// host:port of the matchmaking/presence service
    pub server_host: String,

    pub username: String,
    pub password: String,
    /// optional pre-shared login token
    pub token: String,

    /// 32-byte key for the end-to-end frame encryption; None disables
    /// encryption (loopback testing only)
    pub encryption_key: Option<Vec<u8>>,

    /// retransmit cadence for unanswered CONNECT / CONNECT_ACK packets
    pub handshake_retransmit_interval: Duration,
    /// PING cadence right after a peer becomes active
    pub keepalive_interval: Duration,
    /// PING cadence once a PONG confirmed the peer is alive
    pub keepalive_slow_interval: Duration,
    /// a peer with no traffic for this long is declared dead
    pub peer_liveness_timeout: Duration,
    /// cadence of the scheduler's liveness sweep
    pub liveness_sweep_interval: Duration,
    /// FINISHED is retransmitted at most this many times; the peer is gone
    /// either way
    pub finished_retransmit_limit: u32,
}

impl ClientConfig {
    pub fn new(server_host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> ClientConfig {
        ClientConfig {
            server_host: server_host.into(),
            username: username.into(),
            password: password.into(),
            token: String::new(),
            encryption_key: None,
            handshake_retransmit_interval: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(10),
            keepalive_slow_interval: Duration::from_secs(15),
            peer_liveness_timeout: Duration::from_secs(60),
            liveness_sweep_interval: Duration::from_secs(1),
            finished_retransmit_limit: 5,
        }
    }
}
