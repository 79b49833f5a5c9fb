// mskit-messaging-core/src/connection.rs
//! Reconnect coordinator: owns the single broker connection.
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, trace};

use crate::{
    broker::{Broker, BrokerConnection, ConnectionEvent, CONNECTION_CLOSING},
    AmqpConfig, MessagingError, Result,
};

const SERVICE_NAME: &str = "AmqpService";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

struct ConnState {
    phase: ConnectionPhase,
    connection: Option<Arc<dyn BrokerConnection>>,
    /// Bumped whenever the live connection is replaced or dropped, so that
    /// events from an older connection are ignored.
    generation: u64,
    /// The reconnect flag: `Some` while a reconnect is scheduled.
    reconnect_timer: Option<JoinHandle<()>>,
}

pub(crate) struct ConnectionSupervisor {
    broker: Arc<dyn Broker>,
    config: AmqpConfig,
    state: Mutex<ConnState>,
    init_lock: AsyncMutex<()>,
}

impl ConnectionSupervisor {
    pub(crate) fn new(broker: Arc<dyn Broker>, config: AmqpConfig) -> Self {
        Self {
            broker,
            config,
            state: Mutex::new(ConnState {
                phase: ConnectionPhase::Disconnected,
                connection: None,
                generation: 0,
                reconnect_timer: None,
            }),
            init_lock: AsyncMutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnState> {
        // A poisoned lock only means another thread panicked mid-update; the
        // state itself is always left consistent.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn config(&self) -> &AmqpConfig {
        &self.config
    }

    pub(crate) fn phase(&self) -> ConnectionPhase {
        self.state().phase
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    /// The live connection, or `NotInitialized`.
    pub(crate) fn connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let st = self.state();
        match (&st.phase, &st.connection) {
            (ConnectionPhase::Connected, Some(conn)) => Ok(Arc::clone(conn)),
            _ => Err(MessagingError::NotInitialized(SERVICE_NAME.into())),
        }
    }

    pub(crate) async fn init(self: &Arc<Self>) -> bool {
        let _guard = self.init_lock.lock().await;

        if self.is_initialized() {
            trace!("already initialized..");
            return true;
        }

        if let Err(e) = self.config.validate() {
            error!(error = %e, "input parameters validation failed");
            return false;
        }

        {
            let mut st = self.state();
            if let Some(timer) = st.reconnect_timer.take() {
                timer.abort();
            }
            st.phase = ConnectionPhase::Connecting;
        }

        match self.broker.connect(&self.config.uri()).await {
            Ok(link) => {
                let generation = {
                    let mut st = self.state();
                    st.generation += 1;
                    st.connection = Some(link.connection);
                    st.phase = ConnectionPhase::Connected;
                    st.generation
                };
                tokio::spawn(watch_connection(Arc::downgrade(self), generation, link.events));
                info!(host = %self.config.host, "connected to host");
                true
            }
            Err(e) => {
                error!(host = %self.config.host, error = %e, "failed to connect to broker");
                self.schedule_reconnect();
                false
            }
        }
    }

    /// Schedules a single delayed `init`. Drops the current connection.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        let mut st = self.state();
        if st.reconnect_timer.is_some() {
            trace!("already started to reconnect..");
            return;
        }

        let stale = st.connection.take();
        st.generation += 1;
        st.phase = ConnectionPhase::ReconnectPending;

        let this = Arc::clone(self);
        let delay = self.config.reconnect_delay();
        let deadline = Instant::now() + delay;
        st.reconnect_timer = Some(tokio::spawn(async move {
            if let Some(conn) = stale {
                if let Err(e) = conn.close().await {
                    debug!(error = %e, "closing stale connection failed");
                }
            }
            sleep_until(deadline).await;
            this.state().reconnect_timer = None;
            this.init().await;
        }));
        trace!(delay_ms = delay.as_millis() as u64, "try to reconnect..");
    }

    fn on_connection_closed(self: &Arc<Self>, generation: u64) {
        {
            let st = self.state();
            if st.phase == ConnectionPhase::Disconnected {
                return;
            }
            if st.generation != generation {
                if st.reconnect_timer.is_some() {
                    trace!("already started to reconnect..");
                }
                return;
            }
        }
        self.schedule_reconnect();
    }

    pub(crate) async fn close(&self) -> Result<()> {
        let conn = {
            let mut st = self.state();
            if let Some(timer) = st.reconnect_timer.take() {
                timer.abort();
            }
            st.generation += 1;
            st.phase = ConnectionPhase::Disconnected;
            st.connection.take()
        };
        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

async fn watch_connection(
    supervisor: Weak<ConnectionSupervisor>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            return;
        };
        match event {
            ConnectionEvent::Error(msg) => {
                if msg == CONNECTION_CLOSING {
                    trace!("connection closing");
                } else {
                    error!(error = %msg, "broker connection error");
                }
            }
            ConnectionEvent::Closed => {
                trace!("reconnecting...");
                supervisor.on_connection_closed(generation);
            }
        }
    }
}
