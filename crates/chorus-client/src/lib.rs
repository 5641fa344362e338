//! Connection layer for the chorus chat client.

pub mod connection;

pub use connection::{
    run_connection, ConnectionConfig, IdentityGate, LinkEvent, LinkState, ReconnectPolicy,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY,
};
