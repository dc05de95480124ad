//! The hub task: sole owner of connection, room, typing and presence state.
//!
//! Connection tasks, the notification bridge and HTTP handlers never touch
//! that state directly. They send [`Command`]s over one bounded channel and the
//! hub applies them in arrival order, which gives per-connection ordering and
//! per-room ordering without any locks on membership.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::auth::identity::Identity;

use super::dispatcher::{Dispatcher, SweepPolicy};
use super::events::{ClientEvent, EventError, NotificationEvent};
use super::registry::{ConnectionId, OutboundSender};

pub use super::dispatcher::HubStats;

/// Longest pause between two sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Shortest pause between two sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

pub enum Command {
    Connect {
        outbound: OutboundSender,
        identity: Option<Identity>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Event {
        connection_id: ConnectionId,
        event: ClientEvent,
    },
    Touch(ConnectionId),
    Disconnect(ConnectionId),
    Notify(NotificationEvent),
    Stats(oneshot::Sender<HubStats>),
    Shutdown,
}

/// Why a command did not reach the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The hub has stopped.
    Closed,
    /// The command queue stayed full for the whole send window.
    Busy,
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("realtime hub is not running"),
            Self::Busy => f.write_str("realtime hub is busy"),
        }
    }
}

impl std::error::Error for HubError {}

/// Cloneable sender side of the hub. Store in `AppState`.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
}

impl HubHandle {
    /// Register a connection and wait for its id.
    pub async fn connect(
        &self,
        outbound: OutboundSender,
        identity: Option<Identity>,
    ) -> Result<ConnectionId, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            outbound,
            identity,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Forward one inbound event. Waits for queue space so a connection's
    /// events keep their order.
    pub async fn event(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), HubError> {
        self.send(Command::Event {
            connection_id,
            event,
        })
        .await
    }

    /// Record activity. Skipped when the hub is saturated; the next frame
    /// touches again.
    pub fn touch(&self, connection_id: ConnectionId) {
        let _ = self.commands.try_send(Command::Touch(connection_id));
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let _ = self.send(Command::Disconnect(connection_id)).await;
    }

    /// Queue a notification, waiting at most `timeout` for queue space.
    pub async fn notify(
        &self,
        event: NotificationEvent,
        timeout: Duration,
    ) -> Result<(), HubError> {
        self.commands
            .send_timeout(Command::Notify(event), timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => HubError::Busy,
                SendTimeoutError::Closed(_) => HubError::Closed,
            })
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Ask the hub to close every connection and stop. Returns immediately;
    /// await the `JoinHandle` from [`Hub::spawn`] to wait for it.
    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }
}

pub struct Hub {
    dispatcher: Dispatcher,
    policy: SweepPolicy,
}

impl Hub {
    /// Start the hub task.
    pub fn spawn(
        dispatcher: Dispatcher,
        policy: SweepPolicy,
        queue_capacity: usize,
    ) -> (HubHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(queue_capacity.max(1));
        let hub = Self { dispatcher, policy };
        let task = tokio::spawn(hub.run(rx));
        (HubHandle { commands }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut sweep = time::interval(sweep_interval(&self.policy));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!("realtime hub started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.apply(command),
                },
                _ = sweep.tick() => self.dispatcher.sweep(self.policy),
            }
        }

        let stats = self.dispatcher.stats();
        self.dispatcher.close_all();
        tracing::info!(connections = stats.connections, "realtime hub stopped");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Connect {
                outbound,
                identity,
                reply,
            } => {
                let id = self.dispatcher.connect(outbound, identity);
                if reply.send(id).is_err() {
                    // The connection task gave up waiting.
                    self.dispatcher.disconnect(id);
                }
            }
            Command::Event {
                connection_id,
                event,
            } => {
                let name = event.name();
                if let Err(e) = self.dispatcher.handle(connection_id, event) {
                    log_rejected(connection_id, name, &e);
                }
            }
            Command::Touch(id) => self.dispatcher.touch(id),
            Command::Disconnect(id) => {
                self.dispatcher.disconnect(id);
            }
            Command::Notify(event) => {
                self.dispatcher.notify(event);
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.dispatcher.stats());
            }
            Command::Shutdown => {}
        }
    }
}

fn log_rejected(connection_id: ConnectionId, event: &str, error: &EventError) {
    tracing::warn!(connection_id = %connection_id, event, %error, "event rejected");
}

/// Sweep often enough that idle and typing deadlines are honoured within
/// half their length.
fn sweep_interval(policy: &SweepPolicy) -> Duration {
    MAX_SWEEP_INTERVAL
        .min(policy.idle_timeout / 2)
        .min(policy.typing_ttl / 2)
        .max(MIN_SWEEP_INTERVAL)
}
