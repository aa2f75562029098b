//! WhatsApp Web transport for milesguard.
//!
//! The [`connection`] module owns the connection lifecycle: a pure state
//! machine classifying open/close signals plus an async driver that talks to
//! a [`Transport`]. [`sidecar::SidecarTransport`] implements the transport
//! over a local WebSocket to a Baileys (Node.js) sidecar process.

pub mod connection;
pub mod error;
pub mod process;
pub mod session;
pub mod sidecar;
pub mod transport;
pub mod types;

pub use {
    connection::{
        CloseAction, ConnectionHandle, ConnectionMachine, ConnectionSettings, ConnectionSnapshot,
        ConnectionState, InboundEvent, spawn_connection,
    },
    error::{Error, Result},
    process::{SidecarConfig, SidecarProcess, find_sidecar_dir, start_sidecar},
    session::SessionDir,
    sidecar::SidecarTransport,
    transport::Transport,
    types::{
        CloseCause, CloseReason, ConnectionUpdate, GroupUpdate, LinkState, RawMessage,
        TransportEvent,
    },
};
