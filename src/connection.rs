use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex, PoisonError,
};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::ApiClient;
use crate::commands::{CommandKind, CommandOutcome};
use crate::error::SyncError;
use crate::events::AgentEvent;
use crate::models::{CommandResponse, DeviceCommand};
use crate::session::AuthProvider;
use crate::settings::Settings;
use crate::state::{CommandCursor, ConnectionState, ConnectionStatus};
use crate::utils::unix_timestamp;

struct LoopSet {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct ConnectionInner {
    api: Arc<ApiClient>,
    auth: Arc<dyn AuthProvider>,
    settings: Arc<Settings>,
    cursor: CommandCursor,
    state_tx: watch::Sender<ConnectionState>,
    event_sender: broadcast::Sender<AgentEvent>,
    retry_count: AtomicU32,
    // Guards against overlapping re-registrations triggered by polling.
    registering: AtomicBool,
    // Cancelled by disconnect/auth expiry; parent of the loop tokens.
    lifecycle: Mutex<CancellationToken>,
    loops: Mutex<Option<LoopSet>>,
}

/// Owns registration, command polling and heartbeats for one device/app
/// pairing.
///
/// `Disconnected -> Registering -> Connected`, with `Error` once initial
/// registration has exhausted its attempts. A 401 anywhere invalidates the
/// session and returns to `Disconnected` without retrying.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(
        api: Arc<ApiClient>,
        auth: Arc<dyn AuthProvider>,
        settings: Arc<Settings>,
        cursor: CommandCursor,
        event_sender: broadcast::Sender<AgentEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ConnectionInner {
                api,
                auth,
                settings,
                cursor,
                state_tx,
                event_sender,
                retry_count: AtomicU32::new(0),
                registering: AtomicBool::new(false),
                lifecycle: Mutex::new(CancellationToken::new()),
                loops: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn cursor(&self) -> &CommandCursor {
        &self.inner.cursor
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    /// Register the device and, once accepted, start polling and heartbeats.
    ///
    /// Does nothing (beyond a log line) if the session is not valid. Retries
    /// transient registration failures a bounded number of times.
    pub async fn connect(&self) -> Result<(), SyncError> {
        if !self.inner.auth.is_valid() {
            warn!("connect() called without a valid session; ignoring");
            return Ok(());
        }
        info!(app_id = %self.inner.api.app_id(), "Connecting device");

        // Restart cleanly if a previous lifecycle is still running.
        self.inner.lifecycle_token().cancel();
        self.stop_loops().await?;

        let cancel = CancellationToken::new();
        *self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cancel.clone();
        self.inner.retry_count.store(0, Ordering::SeqCst);

        self.inner.register_with_retry(&cancel).await
    }

    /// Stop every loop and go to `Disconnected`. The session is left alone.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        info!("Disconnecting device");
        self.inner.lifecycle_token().cancel();
        self.stop_loops().await?;
        self.inner.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// One command poll: fetch commands newer than the cursor, answer each,
    /// then advance the cursor. Returns the number of commands handled.
    pub async fn poll_commands(&self) -> Result<usize, SyncError> {
        self.inner.poll_commands().await
    }

    /// One heartbeat exchange.
    pub async fn send_heartbeat(&self) -> Result<(), SyncError> {
        self.inner.send_heartbeat().await
    }

    async fn stop_loops(&self) -> Result<(), SyncError> {
        let loops = self.inner.take_loops();
        if let Some(set) = loops {
            set.cancel.cancel();
            for handle in set.handles {
                handle.await?;
            }
            debug!("Connection loops stopped");
        }
        Ok(())
    }
}

impl ConnectionStatus for ConnectionManager {
    fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow() == ConnectionState::Connected
    }

    fn is_authenticated(&self) -> bool {
        self.inner.auth.is_valid()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("last_processed_id", &self.inner.cursor.get())
            .finish()
    }
}

impl ConnectionInner {
    fn lifecycle_token(&self) -> CancellationToken {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_loops(&self) -> Option<LoopSet> {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn send_event(&self, event: AgentEvent) {
        // No subscribers is not an error.
        let _ = self.event_sender.send(event);
    }

    fn set_state(&self, new_state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != new_state {
                *current = new_state.clone();
                true
            } else {
                false
            }
        });
        if changed {
            debug!(state = new_state.as_str(), "Connection state changed");
            self.send_event(AgentEvent::ConnectionStateChanged(new_state));
        }
    }

    fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    async fn register_with_retry(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.set_state(ConnectionState::Registering);
        let max_attempts = self.settings.max_registration_attempts.max(1);

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Registration cancelled");
                    return Err(SyncError::Cancelled);
                }
                res = self.api.register_device() => res,
            };

            match result {
                Ok(()) => {
                    info!("Device registered");
                    self.auth.touch();
                    self.set_state(ConnectionState::Connected);
                    self.send_event(AgentEvent::Registered);
                    self.start_loops(cancel);
                    return Ok(());
                }
                Err(e) if e.is_auth_error() => {
                    warn!(error = %e, "Registration rejected the session token");
                    self.handle_auth_expired();
                    return Err(SyncError::TokenExpired);
                }
                Err(e) => {
                    let attempts = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempts >= max_attempts {
                        error!(error = %e, attempts, "Registration failed, giving up");
                        self.enter_error(format!("Registration failed: {}", e));
                        return Err(SyncError::RegistrationFailed(attempts));
                    }
                    let delay = self.settings.registration_retry_delay;
                    warn!(error = %e, attempts, ?delay, "Registration failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Re-register after the server forgot this device. At most one runs at
    /// a time and the retry counter carries over from earlier attempts.
    fn trigger_reregistration(self: &Arc<Self>) {
        if self.registering.swap(true, Ordering::SeqCst) {
            debug!("Re-registration already in flight");
            return;
        }
        let inner = self.clone();
        let cancel = self.lifecycle_token();
        tokio::spawn(async move {
            info!("Server no longer knows this device, re-registering");
            if let Err(e) = inner.register_with_retry(&cancel).await {
                warn!(error = %e, "Re-registration failed");
            }
            inner.registering.store(false, Ordering::SeqCst);
        });
    }

    fn start_loops(self: &Arc<Self>, lifecycle: &CancellationToken) {
        let mut guard = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.as_ref().is_some_and(|set| !set.cancel.is_cancelled()) {
            return;
        }
        let cancel = lifecycle.child_token();
        let handles = vec![
            tokio::spawn(self.clone().poll_loop(cancel.clone())),
            tokio::spawn(self.clone().heartbeat_loop(cancel.clone())),
        ];
        *guard = Some(LoopSet { cancel, handles });
        debug!("Polling and heartbeat loops started");
    }

    fn cancel_loops(&self) {
        if let Some(set) = self.take_loops() {
            set.cancel.cancel();
        }
    }

    fn enter_error(&self, reason: String) {
        self.cancel_loops();
        self.set_state(ConnectionState::Error(reason));
    }

    fn handle_auth_expired(&self) {
        warn!("Server rejected the session token; invalidating session and halting loops");
        self.auth.invalidate();
        self.cancel_loops();
        self.lifecycle_token().cancel();
        self.set_state(ConnectionState::Disconnected);
        self.send_event(AgentEvent::AuthExpired);
    }

    fn ticker(period: Duration) -> tokio::time::Interval {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = Self::ticker(self.settings.poll_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.is_connected() {
                trace!("Skipping command poll while not connected");
                continue;
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.poll_commands() => res,
            };
            match result {
                Ok(count) => trace!(count, "Command poll finished"),
                Err(e) if e.is_auth_error() => break,
                Err(SyncError::DeviceNotFound) => {}
                Err(e) => warn!(error = %e, "Command poll failed, will retry next tick"),
            }
        }
        debug!("Command poll loop exited");
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = Self::ticker(self.settings.heartbeat_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.is_connected() {
                continue;
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.send_heartbeat() => res,
            };
            match result {
                Ok(()) => trace!("Heartbeat acknowledged"),
                Err(e) if e.is_auth_error() => break,
                Err(e) => warn!(error = %e, "Heartbeat failed"),
            }
        }
        debug!("Heartbeat loop exited");
    }

    async fn send_heartbeat(self: &Arc<Self>) -> Result<(), SyncError> {
        match self.api.heartbeat().await {
            Ok(()) => {
                self.auth.touch();
                Ok(())
            }
            Err(e) => {
                if e.is_auth_error() {
                    self.handle_auth_expired();
                }
                Err(e)
            }
        }
    }

    async fn poll_commands(self: &Arc<Self>) -> Result<usize, SyncError> {
        let last_id = self.cursor.get();
        let response = match self.api.fetch_commands(last_id).await {
            Ok(response) => response,
            Err(SyncError::DeviceNotFound) => {
                self.trigger_reregistration();
                return Err(SyncError::DeviceNotFound);
            }
            Err(e) => {
                if e.is_auth_error() {
                    self.handle_auth_expired();
                }
                return Err(e);
            }
        };
        self.auth.touch();

        let mut commands: Vec<DeviceCommand> = response
            .commands
            .into_iter()
            .filter(|c| c.id > last_id)
            .collect();
        commands.sort_by_key(|c| c.id);

        let mut max_id = last_id;
        let mut handled = 0;
        for command in commands {
            let kind = CommandKind::from(&command);
            let outcome = self.execute(&command, &kind);
            debug!(id = command.id, kind = kind.name(), status = outcome.status, "Command processed");

            let reply = CommandResponse {
                command_id: command.id,
                app_id: self.api.app_id().to_string(),
                status: outcome.status.to_string(),
                message: outcome.message,
                timestamp: unix_timestamp(),
            };
            match self.api.post_command_response(&reply).await {
                Ok(()) => {}
                Err(e) if e.is_auth_error() => {
                    // Keep this command pending; everything before it is done.
                    self.advance_cursor(max_id).await;
                    self.handle_auth_expired();
                    return Err(e);
                }
                Err(e) => {
                    warn!(id = command.id, error = %e, "Failed to post command response");
                }
            }
            max_id = max_id.max(command.id);
            handled += 1;
        }

        self.advance_cursor(max_id).await;
        Ok(handled)
    }

    async fn advance_cursor(&self, id: i64) {
        if let Err(e) = self.cursor.advance(id).await {
            warn!(error = %e, id, "Failed to persist command cursor");
        }
    }

    fn execute(&self, command: &DeviceCommand, kind: &CommandKind) -> CommandOutcome {
        self.send_event(AgentEvent::CommandReceived {
            id: command.id,
            kind: kind.clone(),
        });
        match kind {
            CommandKind::Ping => CommandOutcome::success("pong"),
            CommandKind::RefreshMedia => CommandOutcome::success("media refresh scheduled"),
            CommandKind::ClearCache => CommandOutcome::success("cache clear scheduled"),
            CommandKind::Status => {
                let state = self.state_tx.borrow().clone();
                let report = serde_json::json!({
                    "state": state.as_str(),
                    "lastProcessedId": self.cursor.get(),
                    "authenticated": self.auth.is_valid(),
                });
                CommandOutcome::success(report.to_string())
            }
            CommandKind::Unknown(raw) => {
                CommandOutcome::error(format!("Unknown command type: {}", raw))
            }
        }
    }
}
