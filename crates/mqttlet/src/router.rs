//! Topic router - one routing decision per message.
//!
//! Decisions ([`Route`]) are pure and computed from the immutable [`RouterConfig`];
//! [`TopicRouter::deliver`] carries them out against the publisher connection or
//! the worker. Nothing here blocks: publishes go to the client's queue and a
//! publisher that is not `Connected` means the message is skipped, not buffered.

use std::fmt;
use std::str::FromStr;

use crate::broker::{BrokerConnection, InboundMessage};
use crate::ipc::protocol::{self, Envelope, FrameParseError};
use crate::subscriptions::is_unprefixed;
use crate::supervisor::{WorkerError, WorkerSupervisor};

/// Operating mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Forward bus messages to the worker and publish its output.
    #[default]
    Process,
    /// Relay between two connections, rewriting the namespace.
    Bridge,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Bridge => "bridge",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown mode {0:?} (expected \"process\" or \"bridge\")")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "bridge" => Ok(Self::Bridge),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    pub mode: Mode,
    pub namespace_listener: String,
    pub namespace_publisher: String,
}

impl RouterConfig {
    pub fn new(
        mode: Mode,
        namespace_listener: impl Into<String>,
        namespace_publisher: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            namespace_listener: namespace_listener.into(),
            namespace_publisher: namespace_publisher.into(),
        }
    }

    pub fn same_namespace(&self) -> bool {
        self.namespace_listener == self.namespace_publisher
    }
}

/// Why a message went nowhere.
#[derive(Debug)]
pub enum DropReason {
    Malformed(FrameParseError),
    /// Empty worker line.
    Blank,
    /// A worker-bound message with no worker (bridge mode).
    NoWorker,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed record: {e}"),
            Self::Blank => f.write_str("blank line"),
            Self::NoWorker => f.write_str("no worker"),
        }
    }
}

/// Where a message goes.
#[derive(Debug)]
pub enum Route {
    /// One canonical JSON line for the worker's stdin.
    ToWorker(String),
    Publish { topic: String, payload: Vec<u8> },
    Drop(DropReason),
}

/// What actually happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Written,
    Published,
    /// Publisher not connected (or its queue refused); the message is gone.
    Skipped,
    Dropped,
}

/// Map `topic` from the listener namespace into the publisher namespace.
///
/// Replaces the first `{listener}/` with `{publisher}/`. The `null` namespace has
/// no prefix: from `null` the publisher prefix is prepended, to `null` the
/// listener prefix is removed.
pub fn rewrite_namespace(topic: &str, listener: &str, publisher: &str) -> String {
    if listener == publisher {
        return topic.to_string();
    }
    if is_unprefixed(listener) {
        return if is_unprefixed(publisher) {
            topic.to_string()
        } else {
            format!("{publisher}/{topic}")
        };
    }
    let to = if is_unprefixed(publisher) {
        String::new()
    } else {
        format!("{publisher}/")
    };
    topic.replacen(&format!("{listener}/"), &to, 1)
}

pub struct TopicRouter {
    config: RouterConfig,
    publisher: BrokerConnection,
}

impl TopicRouter {
    pub fn new(config: RouterConfig, publisher: BrokerConnection) -> Self {
        Self { config, publisher }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn publisher(&self) -> &BrokerConnection {
        &self.publisher
    }

    /// Decide what to do with a message received on the listener connection.
    pub fn route_inbound(&self, message: &InboundMessage) -> Route {
        match self.config.mode {
            Mode::Process => match protocol::canonicalize(&message.payload) {
                Ok(line) => Route::ToWorker(line),
                Err(e) => Route::Drop(DropReason::Malformed(e)),
            },
            Mode::Bridge => {
                if let Err(e) = Envelope::from_slice(&message.payload) {
                    return Route::Drop(DropReason::Malformed(e));
                }
                if self.config.same_namespace() {
                    return Route::Publish {
                        topic: message.topic.clone(),
                        payload: message.payload.clone(),
                    };
                }
                let topic = rewrite_namespace(
                    &message.topic,
                    &self.config.namespace_listener,
                    &self.config.namespace_publisher,
                );
                match protocol::rewrite_topic(&message.payload, &topic) {
                    Ok(payload) => Route::Publish {
                        topic,
                        payload: payload.into_bytes(),
                    },
                    Err(e) => Route::Drop(DropReason::Malformed(e)),
                }
            }
        }
    }

    /// Decide what to do with one line of worker stdout.
    ///
    /// The line is published verbatim on the topic its envelope names.
    pub fn route_worker_line(&self, line: &str) -> Route {
        if line.trim().is_empty() {
            return Route::Drop(DropReason::Blank);
        }
        match Envelope::parse(line) {
            Ok(envelope) => Route::Publish {
                topic: envelope.topic,
                payload: line.as_bytes().to_vec(),
            },
            Err(e) => Route::Drop(DropReason::Malformed(e)),
        }
    }

    /// Carry out a decision. Only a failed worker write is an error.
    pub fn deliver(
        &self,
        route: Route,
        worker: Option<&WorkerSupervisor>,
    ) -> Result<Delivery, WorkerError> {
        match route {
            Route::ToWorker(line) => {
                let Some(worker) = worker else {
                    tracing::warn!("{}, dropping message", DropReason::NoWorker);
                    return Ok(Delivery::Dropped);
                };
                worker.write_line(&line)?;
                tracing::trace!(bytes = line.len(), "Forwarded message to worker");
                Ok(Delivery::Written)
            }
            Route::Publish { topic, payload } => Ok(self.publish(&topic, payload)),
            Route::Drop(DropReason::Blank) => {
                tracing::trace!("Skipping blank worker line");
                Ok(Delivery::Dropped)
            }
            Route::Drop(reason) => {
                tracing::warn!(%reason, "Dropping message");
                Ok(Delivery::Dropped)
            }
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Delivery {
        if !self.publisher.is_connected() {
            tracing::warn!(
                %topic,
                state = %self.publisher.state(),
                "Publisher not connected, skipping publish"
            );
            return Delivery::Skipped;
        }
        match self.publisher.publish(topic, payload) {
            Ok(()) => {
                tracing::debug!(%topic, "Published");
                Delivery::Published
            }
            Err(e) => {
                tracing::warn!(%topic, error = %e, "Publish skipped");
                Delivery::Skipped
            }
        }
    }
}
