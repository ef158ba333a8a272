//! mqttlet: message-bus-to-process bridge for MQTT microservices.

pub mod broker;
pub mod config;
pub mod controller;
pub mod ipc;
pub mod router;
pub mod subscriptions;
pub mod supervisor;
pub mod telemetry;
mod version;

pub use broker::{
    BrokerConnection, BrokerError, BusClient, ClientIdentity, ConnectError, ConnectionConfig,
    ConnectionEvent, ConnectionState, Credentials, InboundMessage, LastWill, Role,
};
pub use config::{AdapterConfig, ConfigError, InstanceId};
pub use controller::{
    Adapter, AdapterError, AdapterHandle, ControlError, ShutdownReason, ShutdownState,
};
pub use ipc::{Envelope, FrameParseError, FrameReader, LineCodec, frame_reader};
pub use router::{Delivery, Mode, Route, RouterConfig, TopicRouter};
pub use subscriptions::{AddOutcome, RemoveOutcome, StoreError, Subscription, SubscriptionStore};
pub use supervisor::{
    CommandSpawner, ExitInfo, SpawnError, WorkerCommand, WorkerError, WorkerSpawner, WorkerState,
    WorkerSupervisor,
};
pub use telemetry::{BusLogLayer, LogRecord, bus_log_layer};
pub use version::{MQTTLET_VERSION, VersionInfo};
