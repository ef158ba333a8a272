//! Broker client seam and the rumqttc driver behind it.
//!
//! [`BusClient`] is the only surface the rest of the adapter uses to talk to the
//! broker: non-blocking, fire-and-forget requests that land in the client's own
//! queue. The driver task polls the rumqttc event loop, translates protocol
//! events into [`ProtocolEvent`]s for the state machine, and forwards inbound
//! publishes as [`ConnectionEvent::Message`].

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, Transport,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::options::{BrokerAddress, ConnectionConfig, LastWill};
use super::state::{ConnectionState, ConnectionStateMachine, ProtocolEvent};
use super::{BrokerError, ConnectError, ConnectionEvent, InboundMessage};

/// Capacity of the rumqttc request queue.
const REQUEST_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// How long a closing connection keeps polling to flush its DISCONNECT.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

/// Non-blocking broker operations.
///
/// Implementations queue the request and return immediately; back-pressure shows
/// up as an error, never as a wait.
pub trait BusClient: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;
    fn disconnect(&self) -> Result<(), BrokerError>;
}

impl BusClient for AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.try_unsubscribe(topic)
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        self.try_disconnect()
            .map_err(|e| BrokerError::Client(e.to_string()))
    }
}

/// Build rumqttc options for one physical connection.
pub fn mqtt_options(
    config: &ConnectionConfig,
    client_id: &str,
    last_will: &LastWill,
) -> Result<MqttOptions, ConnectError> {
    let address = BrokerAddress::parse(&config.url)?;

    let mut options = MqttOptions::new(client_id, address.host, address.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    options.set_last_will(rumqttc::LastWill::new(
        &last_will.topic,
        last_will.payload.clone(),
        QoS::AtMostOnce,
        false,
    ));
    if let Some(ref credentials) = config.credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }
    if address.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    Ok(options)
}

/// Create the client and its event loop. Nothing touches the network until the
/// event loop is polled by [`drive`].
pub fn create_client(options: MqttOptions) -> (AsyncClient, EventLoop) {
    AsyncClient::new(options, REQUEST_CAPACITY)
}

/// What a single poll result means for the adapter.
#[derive(Debug)]
pub(crate) enum Signal {
    Protocol(ProtocolEvent),
    Message(InboundMessage),
    Rejected(ConnectError),
    /// Every client handle is gone; the loop cannot do anything useful.
    RequestsDone,
    Ignore,
}

pub(crate) fn translate(url: &str, polled: Result<Event, ConnectionError>) -> Signal {
    match polled {
        Ok(Event::Incoming(Packet::ConnAck(ack))) => match ack.code {
            ConnectReturnCode::Success => Signal::Protocol(ProtocolEvent::ConnAck),
            code => refused(url, code),
        },
        Ok(Event::Incoming(Packet::Publish(publish))) => Signal::Message(InboundMessage {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        }),
        Ok(Event::Incoming(Packet::Disconnect)) => Signal::Protocol(ProtocolEvent::ConnectionLost),
        Ok(Event::Outgoing(Outgoing::Disconnect)) => Signal::Protocol(ProtocolEvent::Closed),
        Ok(_) => Signal::Ignore,
        Err(ConnectionError::ConnectionRefused(code)) => refused(url, code),
        Err(ConnectionError::RequestsDone) => Signal::RequestsDone,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Broker connection error");
            Signal::Protocol(ProtocolEvent::ConnectionLost)
        }
    }
}

fn refused(url: &str, code: ConnectReturnCode) -> Signal {
    match code {
        ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => {
            Signal::Rejected(ConnectError::Unauthorized {
                url: url.to_string(),
            })
        }
        other => {
            tracing::warn!(url = %url, code = ?other, "Broker refused connection");
            Signal::Protocol(ProtocolEvent::ConnectionLost)
        }
    }
}

/// Poll the event loop until cancelled, rejected, or abandoned.
///
/// Reconnection is the client's business: after an error the loop waits with
/// exponential backoff, reports `Reconnecting`, and polls again.
pub(crate) async fn drive(
    url: String,
    mut event_loop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
) {
    let mut machine = ConnectionStateMachine::new();
    let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

    let apply = |machine: &mut ConnectionStateMachine, event: ProtocolEvent| {
        if let Some(state) = machine.on_event(event) {
            tracing::info!(url = %url, state = %state, "Broker connection state changed");
            state_tx.send_replace(state);
            let _ = events_tx.send(ConnectionEvent::State(state));
        }
    };

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => {
                flush_disconnect(&mut event_loop).await;
                break;
            }
            polled = event_loop.poll() => polled,
        };

        match translate(&url, polled) {
            Signal::Protocol(ProtocolEvent::ConnAck) => {
                reconnect_delay = INITIAL_RECONNECT_DELAY;
                apply(&mut machine, ProtocolEvent::ConnAck);
            }
            Signal::Protocol(ProtocolEvent::ConnectionLost) => {
                apply(&mut machine, ProtocolEvent::ConnectionLost);
                tracing::debug!(
                    url = %url,
                    retry_in_ms = reconnect_delay.as_millis() as u64,
                    "Waiting before reconnect"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
                reconnect_delay = std::cmp::min(reconnect_delay * 2, MAX_RECONNECT_DELAY);
                apply(&mut machine, ProtocolEvent::Retrying);
            }
            Signal::Protocol(event) => {
                apply(&mut machine, event);
                if machine.state().is_terminal() {
                    break;
                }
            }
            Signal::Message(message) => {
                if events_tx.send(ConnectionEvent::Message(message)).is_err() {
                    tracing::debug!(url = %url, "Event consumer gone, stopping driver");
                    break;
                }
            }
            Signal::Rejected(error) => {
                tracing::error!(url = %url, error = %error, "Broker rejected connection");
                let _ = events_tx.send(ConnectionEvent::Rejected(error));
                break;
            }
            Signal::RequestsDone => break,
            Signal::Ignore => {}
        }
    }

    apply(&mut machine, ProtocolEvent::Closed);
    tracing::debug!(url = %url, "Broker driver exiting");
}

async fn flush_disconnect(event_loop: &mut EventLoop) {
    let flushed = tokio::time::timeout(DISCONNECT_FLUSH, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        tracing::debug!("Timed out flushing DISCONNECT");
    }
}
