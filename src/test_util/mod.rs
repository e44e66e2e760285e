pub mod datagram;
pub mod executor;
pub mod fake_server;
