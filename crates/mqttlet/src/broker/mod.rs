//! Message broker connections.
//!
//! - [`options`]: addresses, credentials, client ids and the last will
//! - [`state`]: the connection state machine
//! - [`client`]: the [`BusClient`] seam and the rumqttc driver task
//! - [`connection`]: role handles over a (possibly shared) physical connection

pub mod client;
pub mod connection;
pub mod options;
pub mod state;

use tokio::sync::mpsc;

pub use client::BusClient;
pub use connection::BrokerConnection;
pub use options::{
    AddressError, BrokerAddress, ClientIdentity, ConnectionConfig, Credentials, LastWill, Role,
};
pub use state::{ConnectionState, ConnectionStateMachine, ProtocolEvent};

/// A publish received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What a connection driver reports to its owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message(InboundMessage),
    State(ConnectionState),
    /// The broker refused us for good. The driver has stopped.
    Rejected(ConnectError),
}

/// Event stream of one physical connection.
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Fatal problems establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("broker at {url} rejected our credentials")]
    Unauthorized { url: String },

    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
}

impl ConnectError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// Failures of individual broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("{role} connection is closed")]
    Closed { role: Role },

    #[error("broker client: {0}")]
    Client(String),
}
