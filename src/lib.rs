pub mod client;
pub mod config;
pub mod protocol;
pub mod requests;
pub mod rooms;
pub mod signaling;
pub mod transport;
pub mod util;
pub mod test_util;

pub use client::MatchmakingClient;
