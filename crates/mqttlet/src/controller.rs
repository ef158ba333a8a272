//! Lifecycle controller - wires connections, worker and router into one event loop.
//!
//! Startup:
//! 1. Connect listener (and publisher, unless it shares the listener's connection)
//! 2. Spawn the worker (process mode only)
//! 3. Load subscriptions; (re)issue them whenever the listener reports `Connected`
//!
//! The loop then routes one message at a time until a shutdown trigger fires:
//! a signal, a broker authorization failure, worker exit, or a fault. Draining
//! publishes a final diagnostic, closes connections, stops the worker and waits
//! the grace delay. Nothing is routed once draining has begun.

use std::fmt;
use std::future::{Future, pending};

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, oneshot, watch};

use crate::broker::{
    BrokerConnection, ConnectError, ConnectionEvent, ConnectionEvents, ConnectionState, Role,
};
use crate::config::AdapterConfig;
use crate::ipc::FrameReader;
use crate::router::{Mode, TopicRouter};
use crate::subscriptions::{
    AddOutcome, RemoveOutcome, StoreError, Subscription, SubscriptionStore, namespaced,
};
use crate::supervisor::{
    CommandSpawner, ExitInfo, SpawnError, WorkerSpawner, WorkerState, WorkerSupervisor,
};
use crate::telemetry::{BusLogFormat, LogRecord, TELEMETRY_TARGET, WORKER_STDERR_TARGET};

const CONTROL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Why the adapter stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Interrupt or terminate signal.
    Signal,
    /// [`AdapterHandle::shutdown`].
    Requested,
    Unauthorized(String),
    WorkerExited(ExitInfo),
    WorkerFailed(String),
    Fault(String),
}

impl ShutdownReason {
    /// Short event name used in the final diagnostic.
    pub fn event(&self) -> &'static str {
        match self {
            Self::Signal => "signal received",
            Self::Requested => "shutdown requested",
            Self::Unauthorized(_) => "not authorized",
            Self::WorkerExited(_) => "processor exited",
            Self::WorkerFailed(_) => "processor failed",
            Self::Fault(_) => "internal fault",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal => f.write_str("received shutdown signal"),
            Self::Requested => f.write_str("shutdown requested"),
            Self::Unauthorized(detail) => f.write_str(detail),
            Self::WorkerExited(info) => write!(f, "processor exited with {info}"),
            Self::WorkerFailed(detail) => write!(f, "processor failed: {detail}"),
            Self::Fault(detail) => f.write_str(detail),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("adapter is not running")]
    Stopped,
}

enum Control {
    Subscribe(
        Subscription,
        oneshot::Sender<Result<AddOutcome, StoreError>>,
    ),
    Unsubscribe(
        Subscription,
        oneshot::Sender<Result<RemoveOutcome, StoreError>>,
    ),
    Shutdown,
}

/// Cloneable handle for requests into a running adapter.
#[derive(Clone)]
pub struct AdapterHandle {
    control_tx: mpsc::Sender<Control>,
    state_rx: watch::Receiver<ShutdownState>,
}

impl AdapterHandle {
    /// Add a subscription suffix. Persisted before the broker subscribe is issued.
    pub async fn subscribe(&self, suffix: &str) -> Result<AddOutcome, ControlError> {
        let subscription = Subscription::new(suffix)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Control::Subscribe(subscription, reply_tx))
            .await?;
        Ok(reply_rx.await.map_err(|_| ControlError::Stopped)??)
    }

    /// Remove a subscription suffix. Persisted before the broker unsubscribe is issued.
    pub async fn unsubscribe(&self, suffix: &str) -> Result<RemoveOutcome, ControlError> {
        let subscription = Subscription::new(suffix)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Control::Unsubscribe(subscription, reply_tx))
            .await?;
        Ok(reply_rx.await.map_err(|_| ControlError::Stopped)??)
    }

    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.request(Control::Shutdown).await
    }

    pub fn state(&self) -> ShutdownState {
        *self.state_rx.borrow()
    }

    /// Resolves once the adapter has fully terminated.
    pub async fn terminated(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|s| *s == ShutdownState::Terminated).await;
    }

    async fn request(&self, control: Control) -> Result<(), ControlError> {
        self.control_tx
            .send(control)
            .await
            .map_err(|_| ControlError::Stopped)
    }
}

pub struct Adapter {
    config: AdapterConfig,
    listener: BrokerConnection,
    listener_events: ConnectionEvents,
    publisher_events: Option<ConnectionEvents>,
    router: TopicRouter,
    worker: Option<WorkerSupervisor>,
    worker_stdout: Option<FrameReader<ChildStdout>>,
    store: SubscriptionStore,
    logs: Option<mpsc::UnboundedReceiver<LogRecord>>,
    log_format: BusLogFormat,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    state_tx: watch::Sender<ShutdownState>,
}

impl Adapter {
    pub fn start(config: AdapterConfig) -> Result<Self, AdapterError> {
        Self::start_with(config, &CommandSpawner)
    }

    pub fn start_with(
        config: AdapterConfig,
        spawner: &dyn WorkerSpawner,
    ) -> Result<Self, AdapterError> {
        tracing::info!(
            service = %config.service_name,
            instance = %config.instance_id,
            mode = %config.mode,
            namespace_listener = %config.namespace_listener,
            namespace_publisher = %config.namespace_publisher,
            "Starting adapter"
        );

        let identity = config.identity();
        let last_will = config.last_will();

        let (listener, listener_events) = BrokerConnection::connect(
            config.listener.clone(),
            &identity,
            Role::Listener,
            &last_will,
        )?;
        let (publisher, publisher_events) = if config.shares_connection() {
            (listener.share(Role::Publisher), None)
        } else {
            match BrokerConnection::connect(
                config.publisher.clone(),
                &identity,
                Role::Publisher,
                &last_will,
            ) {
                Ok((publisher, events)) => (publisher, Some(events)),
                Err(e) => {
                    listener.close();
                    return Err(e.into());
                }
            }
        };

        let worker = match config.mode {
            Mode::Process => {
                let spawned = config
                    .worker_command()
                    .and_then(|command| WorkerSupervisor::start(spawner, &command, config.shutdown_grace));
                match spawned {
                    Ok(worker) => Some(worker),
                    Err(e) => {
                        publisher.close();
                        listener.close();
                        return Err(e.into());
                    }
                }
            }
            Mode::Bridge => None,
        };

        let mut store = config.subscription_store();
        if let Err(e) = store.load() {
            publisher.close();
            listener.close();
            return Err(e.into());
        }

        Ok(Self::assemble(
            config,
            listener,
            listener_events,
            publisher,
            publisher_events,
            worker,
            store,
        ))
    }

    fn assemble(
        config: AdapterConfig,
        listener: BrokerConnection,
        listener_events: ConnectionEvents,
        publisher: BrokerConnection,
        publisher_events: Option<ConnectionEvents>,
        mut worker: Option<WorkerSupervisor>,
        store: SubscriptionStore,
    ) -> Self {
        let worker_stdout = worker.as_mut().and_then(|w| w.take_stdout_lines());
        if let Some(stderr) = worker.as_mut().and_then(|w| w.take_stderr_lines()) {
            tokio::spawn(log_worker_stderr(stderr));
        }

        let log_format = BusLogFormat {
            namespace: config.namespace_publisher.clone(),
            service_name: config.service_name.clone(),
            service_uuid: config.instance_id.to_string(),
            service_host: config.host.clone(),
        };
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (state_tx, _) = watch::channel(ShutdownState::Running);

        Self {
            router: TopicRouter::new(config.router_config(), publisher),
            config,
            listener,
            listener_events,
            publisher_events,
            worker,
            worker_stdout,
            store,
            logs: None,
            log_format,
            control_tx,
            control_rx,
            state_tx,
        }
    }

    /// Publish captured log records on the bus while the publisher is connected.
    pub fn with_bus_logs(mut self, logs: mpsc::UnboundedReceiver<LogRecord>) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn handle(&self) -> AdapterHandle {
        AdapterHandle {
            control_tx: self.control_tx.clone(),
            state_rx: self.state_tx.subscribe(),
        }
    }

    /// Route until a shutdown trigger fires, then drain.
    pub async fn run<F>(mut self, shutdown_signal: F) -> ShutdownReason
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown_signal);

        let reason = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_signal => break ShutdownReason::Signal,

                state = worker_exit(self.worker.as_ref()) => {
                    break match state {
                        WorkerState::Exited(info) => ShutdownReason::WorkerExited(info),
                        WorkerState::Failed(e) => ShutdownReason::WorkerFailed(e),
                        other => ShutdownReason::Fault(format!("unexpected worker state {other:?}")),
                    };
                }

                event = self.listener_events.recv() => {
                    let Some(event) = event else {
                        break ShutdownReason::Fault("listener connection driver stopped".to_string());
                    };
                    if let Some(reason) = self.on_listener_event(event) {
                        break reason;
                    }
                }

                event = recv_or_pending(&mut self.publisher_events) => {
                    let Some(event) = event else {
                        break ShutdownReason::Fault("publisher connection driver stopped".to_string());
                    };
                    if let Some(reason) = self.on_publisher_event(event) {
                        break reason;
                    }
                }

                line = next_line(&mut self.worker_stdout) => match line {
                    Some(Ok(line)) => {
                        let route = self.router.route_worker_line(&line);
                        if let Err(e) = self.router.deliver(route, None) {
                            break ShutdownReason::WorkerFailed(e.to_string());
                        }
                    }
                    Some(Err(e)) => break ShutdownReason::WorkerFailed(format!("stdout read failed: {e}")),
                    None => {
                        tracing::debug!("Worker stdout closed");
                        self.worker_stdout = None;
                    }
                },

                Some(control) = self.control_rx.recv() => {
                    if let Some(reason) = self.on_control(control) {
                        break reason;
                    }
                }

                record = recv_or_pending(&mut self.logs) => match record {
                    Some(record) => self.publish_log(&record),
                    None => self.logs = None,
                },
            }
        };

        self.drain(reason).await
    }

    fn on_listener_event(&mut self, event: ConnectionEvent) -> Option<ShutdownReason> {
        match event {
            ConnectionEvent::Message(message) => {
                tracing::trace!(topic = %message.topic, bytes = message.payload.len(), "Received message");
                let route = self.router.route_inbound(&message);
                if let Err(e) = self.router.deliver(route, self.worker.as_ref()) {
                    return Some(ShutdownReason::WorkerFailed(e.to_string()));
                }
                None
            }
            ConnectionEvent::State(ConnectionState::Connected) => {
                tracing::info!(client_id = %self.listener.client_id(), "Listener connected");
                self.subscribe_all();
                None
            }
            ConnectionEvent::State(state) => {
                tracing::info!(%state, "Listener connection state changed");
                None
            }
            ConnectionEvent::Rejected(e) => Some(ShutdownReason::Unauthorized(e.to_string())),
        }
    }

    fn on_publisher_event(&mut self, event: ConnectionEvent) -> Option<ShutdownReason> {
        match event {
            ConnectionEvent::Message(message) => {
                tracing::debug!(topic = %message.topic, "Ignoring message on publisher connection");
                None
            }
            ConnectionEvent::State(state) => {
                tracing::info!(%state, "Publisher connection state changed");
                None
            }
            ConnectionEvent::Rejected(e) => Some(ShutdownReason::Unauthorized(e.to_string())),
        }
    }

    fn on_control(&mut self, control: Control) -> Option<ShutdownReason> {
        match control {
            Control::Subscribe(subscription, reply) => {
                let result = self.store.add(&subscription);
                if let Ok(AddOutcome::Added) = result {
                    self.broker_subscribe(&subscription);
                }
                let _ = reply.send(result);
                None
            }
            Control::Unsubscribe(subscription, reply) => {
                let result = self.store.remove(&subscription);
                if let Ok(RemoveOutcome::Removed) = result {
                    let topic = subscription.topic(&self.config.namespace_listener);
                    if self.listener.is_connected() {
                        if let Err(e) = self.listener.unsubscribe(&topic) {
                            tracing::warn!(%topic, error = %e, "Unsubscribe failed");
                        }
                    }
                    tracing::info!(%topic, "Unsubscribed");
                }
                let _ = reply.send(result);
                None
            }
            Control::Shutdown => Some(ShutdownReason::Requested),
        }
    }

    fn subscribe_all(&self) {
        if self.store.entries().is_empty() {
            tracing::warn!("No subscriptions configured");
        }
        for subscription in self.store.entries() {
            self.broker_subscribe(subscription);
        }
    }

    /// Subscribe now if connected; otherwise the next `Connected` picks it up.
    fn broker_subscribe(&self, subscription: &Subscription) {
        let topic = subscription.topic(&self.config.namespace_listener);
        if !self.listener.is_connected() {
            tracing::debug!(%topic, "Listener not connected, subscribing on connect");
            return;
        }
        match self.listener.subscribe(&topic) {
            Ok(()) => tracing::info!(%topic, "Subscribed"),
            Err(e) => tracing::warn!(%topic, error = %e, "Subscribe failed"),
        }
    }

    fn publish_log(&self, record: &LogRecord) {
        let publisher = self.router.publisher();
        if !publisher.is_connected() {
            return;
        }
        let (topic, body) = self.log_format.render(record);
        if let Err(e) = publisher.publish(&topic, body) {
            tracing::trace!(target: TELEMETRY_TARGET, %topic, error = %e, "Log record not published");
        }
    }

    fn diagnostic_topic(&self) -> String {
        namespaced(&self.config.namespace_publisher, "log")
    }

    async fn drain(mut self, reason: ShutdownReason) -> ShutdownReason {
        self.state_tx.send_replace(ShutdownState::Draining);
        match &reason {
            ShutdownReason::Signal | ShutdownReason::Requested => {
                tracing::info!(%reason, "Shutting down")
            }
            _ => tracing::error!(event = reason.event(), %reason, "Shutting down"),
        }
        self.worker_stdout = None;

        // Queue any records logged up to now (including the line above) ahead of the diagnostic.
        if let Some(mut logs) = self.logs.take() {
            while let Ok(record) = logs.try_recv() {
                self.publish_log(&record);
            }
        }

        let publisher = self.router.publisher();
        if publisher.is_connected() {
            let diagnostic = serde_json::json!({
                "service": self.config.service_name,
                "event": reason.event(),
                "reason": reason.to_string(),
                "reaction": "termination",
            });
            let topic = self.diagnostic_topic();
            if let Err(e) = publisher.publish(&topic, diagnostic.to_string()) {
                tracing::warn!(%topic, error = %e, "Final diagnostic not published");
            }
        } else {
            tracing::debug!("Publisher not connected, skipping final diagnostic");
        }

        publisher.close();
        self.listener.close();

        if let Some(worker) = self.worker.as_mut() {
            worker.terminate();
        }
        tokio::time::sleep(self.config.shutdown_grace).await;

        self.state_tx.send_replace(ShutdownState::Terminated);
        tracing::info!("Adapter terminated");
        reason
    }
}

async fn worker_exit(worker: Option<&WorkerSupervisor>) -> WorkerState {
    match worker {
        Some(worker) => worker.exited().await,
        None => pending().await,
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn next_line(
    reader: &mut Option<FrameReader<ChildStdout>>,
) -> Option<std::io::Result<String>> {
    match reader {
        Some(reader) => reader.next().await,
        None => pending().await,
    }
}

async fn log_worker_stderr<R>(mut lines: FrameReader<R>)
where
    R: AsyncRead + Unpin,
{
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => tracing::warn!(target: WORKER_STDERR_TARGET, "{}", line),
            Err(e) => {
                tracing::debug!(error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
}
