//! Session manager
//!
//! Owns the registry of live sessions, the observer event channel and, in
//! real-time mode, the wall-clock ticker shared by every device. All of this
//! is process-scoped state created by [`SessionManager::new`] and torn down
//! by [`SessionManager::shutdown`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mbit_protocol::DeviceId;
use mbit_sim::RadioDomain;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{HubConfig, TimeMode};
use crate::error::HubError;
use crate::events::{InputEvent, SessionId, SessionInfo, SimEvent};
use crate::session::{run_session, SessionCommand, SessionContext};

struct SessionEntry {
    info: SessionInfo,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

struct Inner {
    config: HubConfig,
    domain: Arc<RadioDomain>,
    next_id: AtomicU32,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    events: broadcast::Sender<SimEvent>,
    ticks: Option<watch::Receiver<u64>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    closed: watch::Sender<bool>,
    /// Signalled whenever a session leaves the registry
    session_ended: Notify,
}

/// Accepts client connections and runs one session per connection
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager over an injected radio domain
    ///
    /// In real-time mode this spawns the ticker task, so it must be called
    /// from within a Tokio runtime.
    pub fn new(config: HubConfig, domain: Arc<RadioDomain>) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (closed, _) = watch::channel(false);

        let (ticks, ticker) = match config.time_mode {
            TimeMode::Virtual => (None, None),
            TimeMode::RealTime { tick_millis } => {
                let (tick_tx, tick_rx) = watch::channel(0u64);
                let period = Duration::from_millis(tick_millis.max(1));
                info!("Real-time mode: ticking every {:?}", period);
                (Some(tick_rx), Some(tokio::spawn(run_ticker(period, tick_tx))))
            }
        };

        Self {
            inner: Arc::new(Inner {
                config,
                domain,
                next_id: AtomicU32::new(1),
                sessions: Mutex::new(HashMap::new()),
                events,
                ticks,
                ticker: Mutex::new(ticker),
                closed,
                session_ended: Notify::new(),
            }),
        }
    }

    /// The shared radio medium
    pub fn domain(&self) -> &Arc<RadioDomain> {
        &self.inner.domain
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Start a session over an established transport
    ///
    /// The session gets a fresh device and greets the client with `Hello`.
    pub fn accept<S>(&self, stream: S, peer: Option<String>) -> Result<SessionInfo, HubError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(HubError::ShutDown);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let info = SessionInfo {
            session: SessionId(id),
            device: DeviceId(id),
            peer,
        };
        let (cmd_tx, cmd_rx) = mpsc::channel(self.inner.config.session.input_buffer.max(1));

        let ctx = SessionContext {
            session: info.session,
            device: info.device,
            config: self.inner.config.session.clone(),
            device_config: self.inner.config.device.clone(),
            time_mode: self.inner.config.time_mode,
            domain: Arc::clone(&self.inner.domain),
            events: self.inner.events.clone(),
            ticks: self.inner.ticks.clone(),
        };

        self.inner.sessions.lock().insert(
            info.session,
            SessionEntry {
                info: info.clone(),
                cmd_tx,
            },
        );
        info!(
            "Accepted {} as {} ({})",
            info.session,
            info.device,
            info.peer.as_deref().unwrap_or("local")
        );
        let _ = self.inner.events.send(SimEvent::SessionOpened { info: info.clone() });

        let inner = Arc::clone(&self.inner);
        let session = info.session;
        let device = info.device;
        tokio::spawn(async move {
            let (reason, stats) = run_session(stream, ctx, cmd_rx).await;
            inner.sessions.lock().remove(&session);
            let _ = inner.events.send(SimEvent::SessionClosed {
                session,
                device,
                reason,
                stats,
            });
            inner.session_ended.notify_waiters();
        });

        Ok(info)
    }

    /// Accept TCP connections until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        let mut closed = self.inner.closed.subscribe();
        match listener.local_addr() {
            Ok(addr) => info!("Listening on {}", addr),
            Err(e) => warn!("Listening on unknown address: {}", e),
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("set_nodelay failed for {}: {}", addr, e);
                            }
                            if let Err(e) = self.accept(stream, Some(addr.to_string())) {
                                warn!("Refused {}: {}", addr, e);
                            }
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            let _ = self.inner.events.send(SimEvent::Error {
                                source: "listener".to_string(),
                                message: e.to_string(),
                            });
                        }
                    }
                }

                _ = closed.wait_for(|closed| *closed) => {
                    info!("Listener stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Apply a physical input to the device with the given id
    pub async fn inject_input(&self, device: DeviceId, input: InputEvent) -> Result<(), HubError> {
        let cmd_tx = {
            let sessions = self.inner.sessions.lock();
            sessions
                .values()
                .find(|entry| entry.info.device == device)
                .map(|entry| entry.cmd_tx.clone())
        };
        let cmd_tx = cmd_tx.ok_or(HubError::DeviceNotFound(device))?;
        cmd_tx
            .send(SessionCommand::Input(input))
            .await
            .map_err(|_| HubError::DeviceNotFound(device))
    }

    /// End a session; its device is torn down
    pub async fn terminate(&self, session: SessionId) -> Result<(), HubError> {
        let cmd_tx = self
            .inner
            .sessions
            .lock()
            .get(&session)
            .map(|entry| entry.cmd_tx.clone())
            .ok_or(HubError::SessionNotFound(session))?;
        cmd_tx
            .send(SessionCommand::Terminate)
            .await
            .map_err(|_| HubError::SessionNotFound(session))
    }

    /// Live sessions ordered by id
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .sessions
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by_key(|info| info.session);
        sessions
    }

    /// Subscribe to the observer event stream
    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Stop accepting, end every session and wait for them to finish
    pub async fn shutdown(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        info!("Shutting down hub");

        if let Some(ticker) = self.inner.ticker.lock().take() {
            ticker.abort();
        }

        loop {
            // Register interest before checking so a session ending in between is not missed
            let ended = self.inner.session_ended.notified();
            let senders: Vec<_> = self
                .inner
                .sessions
                .lock()
                .values()
                .map(|entry| entry.cmd_tx.clone())
                .collect();
            if senders.is_empty() {
                break;
            }
            for tx in senders {
                let _ = tx.send(SessionCommand::Shutdown).await;
            }
            ended.await;
        }
        info!("Hub shut down");
    }
}

/// Publish elapsed wall-clock microseconds at a fixed period
///
/// Sessions take the difference between consecutive values, so a session
/// that misses ticks still advances by the full elapsed time.
async fn run_ticker(period: Duration, tick_tx: watch::Sender<u64>) {
    let start = Instant::now();
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        timer.tick().await;
        let elapsed = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        tick_tx.send_replace(elapsed);
    }
}
