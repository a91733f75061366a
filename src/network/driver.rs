use crate::messages::{Operation, RequestId};
use crate::network::callbacks::RequestCallbacks;
use crate::network::client::ClientOptions;
use crate::network::connection::ConnectionEvent;
use crate::network::pending::Registration;
use crate::network::session::{Session, SessionSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace};

const MIN_STALE_CHECK_PERIOD: Duration = Duration::from_millis(10);

/// Work posted to the driver by client handles (and by the driver itself, for flush ticks)
pub(crate) enum Command {
    Request {
        operation: Operation,
        callbacks: Arc<dyn RequestCallbacks>,
        registration: Registration,
    },
    Unsubscribe {
        id: RequestId,
        registration: Registration,
    },
    Close,
    Flush,
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// The single task that owns a [`Session`]. Every state change happens here.
pub(crate) struct SessionDriver {
    session: Session,
    commands: mpsc::UnboundedReceiver<Command>,
    ticks: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl SessionDriver {
    pub(crate) fn new(
        options: &ClientOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        ticks: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        Self {
            session: Session::new(options, event_tx),
            commands,
            ticks,
            events,
        }
    }

    #[instrument(name = "session_driver", skip(self))]
    pub(crate) async fn run(mut self) {
        let reconnect_sleep = tokio::time::sleep_until(Instant::now());
        tokio::pin!(reconnect_sleep);
        let mut reconnect_armed = false;

        let stale_timeout = self.session.stale_connection_timeout();
        let mut stale_check = tokio::time::interval(
            stale_timeout
                .map(|timeout| (timeout / 2).max(MIN_STALE_CHECK_PERIOD))
                .unwrap_or(Duration::from_secs(3600)),
        );
        stale_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut commands_open = true;

        loop {
            self.schedule_flush();
            if let Some(delay) = self.session.take_reconnect_request() {
                debug!(delay_ms = delay.as_millis() as u64, "Arming reconnect timer");
                reconnect_sleep.as_mut().reset(Instant::now() + delay);
                reconnect_armed = true;
            } else if reconnect_armed && !self.session.reconnect_pending() {
                trace!("Reconnect timer cancelled");
                reconnect_armed = false;
            }

            if self.session.is_finished() {
                break;
            }

            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All client handles dropped, closing session");
                        commands_open = false;
                        self.session.close();
                    }
                },
                Some(event) = self.events.recv() => {
                    self.session.handle_event(event);
                }
                () = &mut reconnect_sleep, if reconnect_armed => {
                    reconnect_armed = false;
                    self.session.reconnect_timer_fired();
                }
                _ = stale_check.tick(), if stale_timeout.is_some() => {
                    self.session.reap_stale_connections(std::time::Instant::now());
                }
            }
        }

        info!("Session finished, driver exiting");
    }

    /// Post the flush behind every command already queued so they join the batch
    fn schedule_flush(&mut self) {
        if !self.session.take_flush_tick() {
            return;
        }
        let posted = self
            .ticks
            .upgrade()
            .map(|tx| tx.send(Command::Flush).is_ok())
            .unwrap_or(false);
        if !posted {
            self.session.flush();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request {
                operation,
                callbacks,
                registration,
            } => self.session.request(operation, callbacks, registration),
            Command::Unsubscribe { id, registration } => {
                self.session.unsubscribe(&id, registration)
            }
            Command::Close => self.session.close(),
            Command::Flush => self.session.flush(),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
        }
    }
}
