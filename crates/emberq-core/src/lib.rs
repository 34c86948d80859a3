//! EmberQ Core - Sessions, transport and lifecycle for the embedded broker
//!
//! This crate contains:
//! - Broker: lifecycle controller that starts and stops everything
//! - SessionManager: connections, sessions, producers and consumers
//! - TransportListener: TCP accept loop and per-connection protocol handlers
//! - Client: a small async client for the wire protocol

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
mod handler;
pub mod listener;
pub mod manager;
pub mod session;

// Re-exports
pub use broker::{exit_code, Broker, BrokerState, ShutdownReport};
pub use client::Client;
pub use config::BrokerConfig;
pub use connection::Connection;
pub use listener::{ListenerState, StopOutcome, TransportListener};
pub use manager::SessionManager;
pub use session::{Consumer, Producer, Session};
