//! Role handles over a physical broker connection.
//!
//! When listener and publisher are configured identically they share one
//! connection: the publisher handle is derived from the listener with
//! [`BrokerConnection::share`], so both observe the same state stream. Closing is
//! role-keyed: a handle closes its own role, and the physical connection is torn
//! down when the last open role closes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::client::{self, BusClient};
use super::options::{ClientIdentity, ConnectionConfig, LastWill, Role};
use super::state::ConnectionState;
use super::{BrokerError, ConnectError, ConnectionEvents};

struct Physical {
    config: ConnectionConfig,
    client_id: String,
    client: Box<dyn BusClient>,
    state_rx: watch::Receiver<ConnectionState>,
    open_roles: Mutex<HashSet<Role>>,
    driver: CancellationToken,
}

/// One role's view of a broker connection.
#[derive(Clone)]
pub struct BrokerConnection {
    physical: Arc<Physical>,
    role: Role,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("url", &self.physical.config.url)
            .field("client_id", &self.physical.client_id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl BrokerConnection {
    /// Open a connection for `role` and start its driver task.
    ///
    /// Returns immediately in `Connecting`; progress is reported on the event
    /// stream and the state watch.
    pub fn connect(
        config: ConnectionConfig,
        identity: &ClientIdentity,
        role: Role,
        last_will: &LastWill,
    ) -> Result<(Self, ConnectionEvents), ConnectError> {
        let client_id = identity.client_id(role);
        let options = client::mqtt_options(&config, &client_id, last_will)?;
        let (mqtt, event_loop) = client::create_client(options);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let driver = CancellationToken::new();

        tracing::info!(url = %config.url, %client_id, %role, "Connecting to broker");
        tokio::spawn(client::drive(
            config.url.clone(),
            event_loop,
            state_tx,
            events_tx,
            driver.clone(),
        ));

        let connection = Self::from_parts(config, client_id, role, Box::new(mqtt), state_rx, driver);
        Ok((connection, events_rx))
    }

    /// Assemble a handle around an existing client and state stream.
    pub fn from_parts(
        config: ConnectionConfig,
        client_id: String,
        role: Role,
        client: Box<dyn BusClient>,
        state_rx: watch::Receiver<ConnectionState>,
        driver: CancellationToken,
    ) -> Self {
        Self {
            physical: Arc::new(Physical {
                config,
                client_id,
                client,
                state_rx,
                open_roles: Mutex::new(HashSet::from([role])),
                driver,
            }),
            role,
        }
    }

    /// Handle for another role on the same physical connection.
    pub fn share(&self, role: Role) -> Self {
        self.open_roles().insert(role);
        tracing::debug!(
            client_id = %self.physical.client_id,
            %role,
            "Sharing broker connection between roles"
        );
        Self {
            physical: Arc::clone(&self.physical),
            role,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn client_id(&self) -> &str {
        &self.physical.client_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.physical.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.physical.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.is_open() && self.state().is_connected()
    }

    /// Watch of the physical connection's state, shared by every role handle.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.physical.state_rx.clone()
    }

    /// Whether both handles drive the same physical connection.
    pub fn same_connection(&self, other: &BrokerConnection) -> bool {
        Arc::ptr_eq(&self.physical, &other.physical)
    }

    pub fn is_open(&self) -> bool {
        self.open_roles().contains(&self.role)
    }

    pub fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.ready()?;
        self.physical.client.subscribe(topic)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.ready()?;
        self.physical.client.unsubscribe(topic)
    }

    /// Queue a publish. Fails with `NotConnected` unless the state is `Connected`.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        self.ready()?;
        self.physical.client.publish(topic, payload.into())
    }

    /// Close this role. The last role to close disconnects and stops the driver.
    ///
    /// Returns true if this call tore down the physical connection.
    pub fn close(&self) -> bool {
        let last = {
            let mut roles = self.open_roles();
            if !roles.remove(&self.role) {
                return false;
            }
            roles.is_empty()
        };

        tracing::debug!(client_id = %self.physical.client_id, role = %self.role, last, "Closing broker role");
        if !last {
            return false;
        }

        if let Err(e) = self.physical.client.disconnect() {
            tracing::debug!(error = %e, "Disconnect request not queued");
        }
        self.physical.driver.cancel();
        true
    }

    fn ready(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Closed { role: self.role });
        }
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(BrokerError::NotConnected { state }),
        }
    }

    fn open_roles(&self) -> std::sync::MutexGuard<'_, HashSet<Role>> {
        // The set is only ever mutated by insert/remove; a poisoned guard is still consistent.
        self.physical
            .open_roles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory broker client for exercising routing without a network.

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Publish { topic: String, payload: String },
        Subscribe(String),
        Unsubscribe(String),
        Disconnect,
    }

    #[derive(Default, Clone)]
    pub struct RecordingClient {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl RecordingClient {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn publishes(&self) -> Vec<(String, String)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Publish { topic, payload } => Some((topic, payload)),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: Call) -> Result<(), BrokerError> {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    impl BusClient for RecordingClient {
        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
            self.record(Call::Publish {
                topic: topic.to_string(),
                payload: String::from_utf8(payload).unwrap(),
            })
        }

        fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
            self.record(Call::Subscribe(topic.to_string()))
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
            self.record(Call::Unsubscribe(topic.to_string()))
        }

        fn disconnect(&self) -> Result<(), BrokerError> {
            self.record(Call::Disconnect)
        }
    }

    /// A connection backed by a [`RecordingClient`] whose state the test controls.
    pub fn recording_connection(
        role: Role,
        state: ConnectionState,
    ) -> (
        BrokerConnection,
        RecordingClient,
        watch::Sender<ConnectionState>,
    ) {
        let client = RecordingClient::default();
        let (state_tx, state_rx) = watch::channel(state);
        let connection = BrokerConnection::from_parts(
            ConnectionConfig::new("tcp://mqtt:1883"),
            format!("test_{role}"),
            role,
            Box::new(client.clone()),
            state_rx,
            CancellationToken::new(),
        );
        (connection, client, state_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Call, recording_connection};
    use super::*;

    #[test]
    fn publish_requires_connected() {
        let (conn, client, state_tx) = recording_connection(Role::Publisher, ConnectionState::Offline);

        assert!(matches!(
            conn.publish("ns/x", "{}"),
            Err(BrokerError::NotConnected {
                state: ConnectionState::Offline
            })
        ));
        assert!(client.calls().is_empty());

        state_tx.send_replace(ConnectionState::Connected);
        conn.publish("ns/x", "{}").unwrap();
        assert_eq!(client.publishes(), vec![("ns/x".to_string(), "{}".to_string())]);
    }

    #[test]
    fn shared_handles_see_one_state() {
        let (listener, _client, state_tx) =
            recording_connection(Role::Listener, ConnectionState::Connecting);
        let publisher = listener.share(Role::Publisher);

        assert!(listener.same_connection(&publisher));
        state_tx.send_replace(ConnectionState::Connected);
        assert!(listener.is_connected());
        assert!(publisher.is_connected());
    }

    #[test]
    fn closing_one_role_keeps_the_other() {
        let (listener, client, _state_tx) =
            recording_connection(Role::Listener, ConnectionState::Connected);
        let publisher = listener.share(Role::Publisher);

        assert!(!publisher.close());
        assert!(matches!(
            publisher.publish("ns/x", "{}"),
            Err(BrokerError::Closed {
                role: Role::Publisher
            })
        ));
        listener.subscribe("ns/tick").unwrap();
        assert_eq!(client.calls(), vec![Call::Subscribe("ns/tick".to_string())]);
    }

    #[test]
    fn last_role_disconnects_once() {
        let (listener, client, _state_tx) =
            recording_connection(Role::Listener, ConnectionState::Connected);
        let publisher = listener.share(Role::Publisher);

        assert!(!listener.close());
        assert!(publisher.close());
        assert!(!publisher.close());
        assert_eq!(client.calls(), vec![Call::Disconnect]);
    }

    #[test]
    fn close_cancels_driver() {
        let client = testing::RecordingClient::default();
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let driver = CancellationToken::new();
        let conn = BrokerConnection::from_parts(
            ConnectionConfig::new("tcp://mqtt:1883"),
            "id".to_string(),
            Role::Listener,
            Box::new(client),
            state_rx,
            driver.clone(),
        );

        assert!(conn.close());
        assert!(driver.is_cancelled());
    }

    #[test]
    fn subscribe_while_offline_is_refused() {
        let (listener, client, _state_tx) =
            recording_connection(Role::Listener, ConnectionState::Reconnecting);
        assert!(listener.subscribe("ns/tick").is_err());
        assert!(client.calls().is_empty());
    }
}
