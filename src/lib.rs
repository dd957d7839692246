pub mod arbitration;
pub use arbitration::{
    arbitrate, ActiveMediaSelection, ArbitrationEngine, MediaSignals, PollOutcome,
    PresentationSink, SelectionKind, SelectionPolicy,
};
pub mod cache;
pub use cache::{CacheEntry, CacheManifest, DownloadJob, MediaCache};
mod client;
pub use client::{classify_status, ApiClient, ApiResponse};
mod commands;
pub use commands::{CommandKind, CommandOutcome, STATUS_ERROR, STATUS_SUCCESS};
mod connection;
pub use connection::ConnectionManager;
pub mod display;
pub use display::{desired_surface, DisplayController, DisplayPolicy, Reconcile, Surface};
mod error;
pub use error::SyncError;
mod events;
pub use events::AgentEvent;
mod models;
pub use models::{
    CommandResponse, CommandsResponse, DeviceCommand, HeartbeatRequest, MediaDescriptor,
    MediaItem, MediaKind, MediaSlots, MediaStatusResponse, RegisterRequest,
};
mod session;
pub use session::{AuthProvider, Session, SessionStore};
mod settings;
pub use settings::Settings;
mod state;
pub use state::{CommandCursor, ConnectionState, ConnectionStatus};
mod utils;
pub use utils::{lenient, linear_backoff, parse_content_range, sanitize_filename};

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct AgentTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    display: Option<JoinHandle<DisplayController>>,
}

/// Device-side agent: keeps the device registered with the control server,
/// mirrors the server's chosen image or video into a local cache and keeps
/// exactly one display surface active for it.
///
/// The agent only wires components together. Each of them
/// ([`ConnectionManager`], [`MediaCache`], [`ArbitrationEngine`],
/// [`DisplayController`]) can also be used on its own.
///
/// # Logging
///
/// This library uses the `tracing` crate for logging. To see logs, install a
/// tracing subscriber in your application.
///
/// Example using `tracing_subscriber`:
/// ```no_run
/// use tracing::Level;
/// use tracing_subscriber::FmtSubscriber;
///
/// let subscriber = FmtSubscriber::builder()
///     .with_max_level(Level::DEBUG)
///     .finish();
///
/// tracing::subscriber::set_global_default(subscriber)
///     .expect("Failed to set tracing subscriber");
/// ```
///
/// The log levels control what information is displayed:
/// - `TRACE`: every poll tick and streamed chunk
/// - `DEBUG`: state transitions, chunk progress, skipped work
/// - `INFO`: registration, selection changes, downloads, evictions
/// - `WARN`: recoverable failures, auth expiry, identity mismatches
/// - `ERROR`: registration giving up
pub struct DeviceAgent {
    settings: Arc<Settings>,
    auth: Arc<dyn AuthProvider>,
    connection: ConnectionManager,
    cache: MediaCache,
    engine: ArbitrationEngine,
    presenter: Option<Arc<dyn PresentationSink>>,
    event_sender: broadcast::Sender<AgentEvent>,
    surface_rx: watch::Receiver<Surface>,
    display: Mutex<Option<DisplayController>>,
    tasks: Mutex<Option<AgentTasks>>,
}

impl DeviceAgent {
    /// Build every component. Opens the cache directory and, when enabled,
    /// loads the persisted command cursor.
    pub async fn new(
        settings: Settings,
        auth: Arc<dyn AuthProvider>,
        presenter: Option<Arc<dyn PresentationSink>>,
    ) -> Result<Self, SyncError> {
        let settings = Arc::new(settings);
        let (event_sender, _) = broadcast::channel(settings.event_buffer_capacity.max(1));
        let api = Arc::new(ApiClient::new(&settings, auth.clone())?);

        tokio::fs::create_dir_all(&settings.cache_dir).await?;
        let cursor = if settings.persist_command_cursor {
            CommandCursor::load(&settings.cursor_path()).await
        } else {
            CommandCursor::in_memory()
        };

        let connection = ConnectionManager::new(
            api.clone(),
            auth.clone(),
            settings.clone(),
            cursor,
            event_sender.clone(),
        );
        let cache = MediaCache::open(api.clone(), settings.clone(), event_sender.clone()).await?;
        let engine = ArbitrationEngine::new(
            api,
            cache.clone(),
            Arc::new(connection.clone()),
            auth.clone(),
            settings.clone(),
            presenter.clone(),
            event_sender.clone(),
        );
        let display = DisplayController::new(
            DisplayPolicy::from_settings(&settings),
            presenter.clone(),
            Some(event_sender.clone()),
        );
        let surface_rx = display.surface_receiver();

        Ok(Self {
            settings,
            auth,
            connection,
            cache,
            engine,
            presenter,
            event_sender,
            surface_rx,
            display: Mutex::new(Some(display)),
            tasks: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn cache(&self) -> &MediaCache {
        &self.cache
    }

    pub fn engine(&self) -> &ArbitrationEngine {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_sender.subscribe()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_receiver()
    }

    pub fn surface_receiver(&self) -> watch::Receiver<Surface> {
        self.surface_rx.clone()
    }

    /// Start the event router, the display controller and media polling,
    /// then connect. Returns the outcome of the initial registration.
    pub async fn start(&self) -> Result<(), SyncError> {
        if !self.auth.is_valid() {
            warn!("Agent started without a valid session; waiting for login");
        }
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if tasks.is_none() {
                let cancel = CancellationToken::new();
                let handles = vec![tokio::spawn(route_events(
                    self.event_sender.subscribe(),
                    self.connection.clone(),
                    self.cache.clone(),
                    self.engine.clone(),
                    self.presenter.clone(),
                    cancel.clone(),
                ))];
                let display = self
                    .display
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                let display = display.map(|display| {
                    tokio::spawn(display.run(self.engine.signals_receiver(), cancel.clone()))
                });
                *tasks = Some(AgentTasks {
                    cancel,
                    handles,
                    display,
                });
            }
        }

        self.engine.start();
        info!(app_id = %self.settings.app_id, "Device agent started");
        self.connection.connect().await
    }

    /// Stop every loop and download. Cached files and the session are left
    /// intact.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        info!("Shutting down device agent");
        self.engine.stop().await;
        self.connection.disconnect().await?;
        self.cache.cancel_in_flight().await;

        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tasks) = tasks {
            tasks.cancel.cancel();
            for handle in tasks.handles {
                handle.await?;
            }
            if let Some(display) = tasks.display {
                let display = display.await?;
                *self.display.lock().unwrap_or_else(PoisonError::into_inner) = Some(display);
            }
        }
        debug!("Device agent stopped");
        Ok(())
    }

    /// Run until Ctrl-C, then shut down.
    pub async fn run_until_ctrl_c(&self) -> Result<(), SyncError> {
        if let Err(e) = self.start().await {
            error!(error = %e, "Initial connection failed");
        }
        tokio::signal::ctrl_c().await?;
        self.shutdown().await
    }
}

/// React to events that cross component boundaries.
async fn route_events(
    mut events: broadcast::Receiver<AgentEvent>,
    connection: ConnectionManager,
    cache: MediaCache,
    engine: ArbitrationEngine,
    presenter: Option<Arc<dyn PresentationSink>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(AgentEvent::AuthExpired) => {
                warn!("Session expired; halting all polling until re-login");
                engine.stop().await;
                cache.cancel_in_flight().await;
                if let Err(e) = connection.disconnect().await {
                    warn!(error = %e, "Disconnect after auth expiry failed");
                }
            }
            Ok(AgentEvent::CommandReceived {
                kind: CommandKind::RefreshMedia,
                ..
            }) => {
                debug!("Refresh requested by server");
                engine.refresh();
            }
            Ok(AgentEvent::CommandReceived {
                kind: CommandKind::ClearCache,
                ..
            }) => {
                if let Some(presenter) = &presenter {
                    presenter.clear();
                }
                match cache.clear_all().await {
                    Ok(()) => engine.reset_rendered(),
                    Err(e) => warn!(error = %e, "Cache clear failed"),
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event router lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Event router stopped");
}
