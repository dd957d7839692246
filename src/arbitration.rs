//! Decides which single media artifact is authoritative and keeps the local
//! cache and the presentation layer in step with it.
//!
//! The engine polls the media status endpoint, applies video precedence and
//! sticky selection, and starts a cache fetch only when the selected
//! `(kind, id)` differs from what is already rendered (or being fetched).

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cache::MediaCache;
use crate::client::ApiClient;
use crate::display::Surface;
use crate::error::SyncError;
use crate::events::AgentEvent;
use crate::models::{MediaDescriptor, MediaKind, MediaStatusResponse};
use crate::session::AuthProvider;
use crate::settings::Settings;
use crate::state::ConnectionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionKind {
    #[default]
    None,
    Image,
    Video,
}

impl SelectionKind {
    pub fn media_kind(self) -> Option<MediaKind> {
        match self {
            SelectionKind::None => None,
            SelectionKind::Image => Some(MediaKind::Image),
            SelectionKind::Video => Some(MediaKind::Video),
        }
    }
}

/// The authoritative media decision. `last_*_id` hold the most recent id
/// asserted for each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveMediaSelection {
    pub kind: SelectionKind,
    pub last_image_id: Option<i64>,
    pub last_video_id: Option<i64>,
}

impl ActiveMediaSelection {
    /// `(kind, id)` currently selected, if any.
    pub fn current(&self) -> Option<(MediaKind, i64)> {
        match self.kind {
            SelectionKind::None => None,
            SelectionKind::Image => self.last_image_id.map(|id| (MediaKind::Image, id)),
            SelectionKind::Video => self.last_video_id.map(|id| (MediaKind::Video, id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub sticky: bool,
    pub active_flag_tiebreak: bool,
}

impl SelectionPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            sticky: settings.sticky_selection,
            active_flag_tiebreak: settings.active_flag_tiebreak,
        }
    }
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            sticky: true,
            active_flag_tiebreak: false,
        }
    }
}

/// Fold one poll result into the previous selection.
///
/// Video wins whenever one is asserted. The only exception is the optional
/// tie-break: an image explicitly flagged active beats a video explicitly
/// flagged inactive. With nothing asserted the previous kind is kept when
/// sticky, otherwise the selection drops to `None`.
pub fn arbitrate(
    prev: &ActiveMediaSelection,
    image: Option<&MediaDescriptor>,
    video: Option<&MediaDescriptor>,
    policy: SelectionPolicy,
) -> ActiveMediaSelection {
    let mut next = *prev;
    if let Some(image) = image {
        next.last_image_id = Some(image.id);
    }
    if let Some(video) = video {
        next.last_video_id = Some(video.id);
    }
    next.kind = match (image, video) {
        (Some(i), Some(v))
            if policy.active_flag_tiebreak
                && i.is_active == Some(true)
                && v.is_active == Some(false) =>
        {
            SelectionKind::Image
        }
        (_, Some(_)) => SelectionKind::Video,
        (Some(_), None) => SelectionKind::Image,
        (None, None) if policy.sticky => prev.kind,
        (None, None) => SelectionKind::None,
    };
    next
}

/// What the display controller consumes. Never both true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaSignals {
    pub has_image: bool,
    pub has_video: bool,
}

impl From<&ActiveMediaSelection> for MediaSignals {
    fn from(selection: &ActiveMediaSelection) -> Self {
        Self {
            has_image: selection.kind == SelectionKind::Image,
            has_video: selection.kind == SelectionKind::Video,
        }
    }
}

/// The rendering collaborator. Implementations should return quickly; they
/// are called from async tasks.
pub trait PresentationSink: Send + Sync {
    /// A cached file is ready to be shown on the `kind` surface.
    fn present(&self, kind: MediaKind, path: &Path, media: &MediaDescriptor);
    /// Make `surface` the only visible surface.
    fn set_surface(&self, surface: Surface);
    /// Stop showing anything (cache was wiped).
    fn clear(&self);
}

/// Result of a single poll tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    NotReady,
    Ignored,
    Selected {
        selection: ActiveMediaSelection,
        fetch_started: bool,
    },
}

#[derive(Debug, Default)]
struct RenderState {
    current: Option<(MediaKind, i64)>,
    pending: Option<(MediaKind, i64)>,
    last_shown_image: Option<i64>,
    last_shown_video: Option<i64>,
    fetch_task: Option<JoinHandle<()>>,
}

struct EngineInner {
    api: Arc<ApiClient>,
    cache: MediaCache,
    status: Arc<dyn ConnectionStatus>,
    auth: Arc<dyn AuthProvider>,
    settings: Arc<Settings>,
    presenter: Option<Arc<dyn PresentationSink>>,
    event_sender: broadcast::Sender<AgentEvent>,
    selection_tx: watch::Sender<ActiveMediaSelection>,
    signals_tx: watch::Sender<MediaSignals>,
    render: Mutex<RenderState>,
    wake: Notify,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// One engine for both media kinds.
#[derive(Clone)]
pub struct ArbitrationEngine {
    inner: Arc<EngineInner>,
}

impl ArbitrationEngine {
    pub fn new(
        api: Arc<ApiClient>,
        cache: MediaCache,
        status: Arc<dyn ConnectionStatus>,
        auth: Arc<dyn AuthProvider>,
        settings: Arc<Settings>,
        presenter: Option<Arc<dyn PresentationSink>>,
        event_sender: broadcast::Sender<AgentEvent>,
    ) -> Self {
        let (selection_tx, _) = watch::channel(ActiveMediaSelection::default());
        let (signals_tx, _) = watch::channel(MediaSignals::default());
        Self {
            inner: Arc::new(EngineInner {
                api,
                cache,
                status,
                auth,
                settings,
                presenter,
                event_sender,
                selection_tx,
                signals_tx,
                render: Mutex::new(RenderState::default()),
                wake: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn selection(&self) -> ActiveMediaSelection {
        *self.inner.selection_tx.borrow()
    }

    pub fn selection_receiver(&self) -> watch::Receiver<ActiveMediaSelection> {
        self.inner.selection_tx.subscribe()
    }

    pub fn signals_receiver(&self) -> watch::Receiver<MediaSignals> {
        self.inner.signals_tx.subscribe()
    }

    /// `(kind, id)` of the media last handed to the presenter.
    pub fn rendered(&self) -> Option<(MediaKind, i64)> {
        self.inner.render_state().current
    }

    pub fn last_shown(&self, kind: MediaKind) -> Option<i64> {
        let render = self.inner.render_state();
        match kind {
            MediaKind::Image => render.last_shown_image,
            MediaKind::Video => render.last_shown_video,
        }
    }

    /// Forget what is on screen so the next poll fetches again.
    pub fn reset_rendered(&self) {
        {
            let mut render = self.inner.render_state();
            render.current = None;
            render.pending = None;
        }
        self.inner.cache.set_protected(None);
        debug!("Rendered media reset");
    }

    /// Wait for the most recently started fetch to finish.
    pub async fn settle(&self) {
        let task = self.inner.render_state().fetch_task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Media fetch task failed");
            }
        }
    }

    /// Run one poll tick now.
    pub async fn poll_once(&self) -> Result<PollOutcome, SyncError> {
        self.inner.poll_once().await
    }

    /// Ask the running loop to poll immediately instead of waiting a tick.
    pub fn refresh(&self) {
        self.inner.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(cancel, _)| !cancel.is_cancelled())
    }

    /// Start the periodic poll loop. Calling it twice is harmless.
    pub fn start(&self) {
        let mut task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|(cancel, _)| !cancel.is_cancelled()) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().poll_loop(cancel.clone()));
        *task = Some((cancel, handle));
        info!(interval = ?self.inner.settings.media_poll_interval, "Media arbitration started");
    }

    /// Stop the poll loop. The current selection and cache stay as they are.
    pub async fn stop(&self) {
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Media arbitration loop panicked");
            }
            debug!("Media arbitration stopped");
        }
    }
}

impl EngineInner {
    fn render_state(&self) -> std::sync::MutexGuard<'_, RenderState> {
        self.render.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_event(&self, event: AgentEvent) {
        let _ = self.event_sender.send(event);
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.settings.media_poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.poll_once() => res,
            };
            match result {
                Ok(outcome) => trace!(?outcome, "Media poll finished"),
                Err(e) if e.is_auth_error() => break,
                // Already logged where detected.
                Err(SyncError::SecurityMismatch(_)) => {}
                Err(e) => warn!(error = %e, "Media poll failed, keeping current media"),
            }
        }
        debug!("Media poll loop exited");
    }

    async fn poll_once(self: &Arc<Self>) -> Result<PollOutcome, SyncError> {
        if !self.status.is_connected() {
            trace!("Skipping media poll while not connected");
            return Ok(PollOutcome::NotReady);
        }

        let payload = match self.api.fetch_media_status().await {
            Ok(payload) => payload,
            Err(e) if e.is_auth_error() => {
                warn!(error = %e, "Media status rejected the session token");
                self.auth.invalidate();
                self.send_event(AgentEvent::AuthExpired);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.auth.touch();

        if payload.success == Some(false) {
            debug!("Media status reported failure, ignoring payload");
            return Ok(PollOutcome::Ignored);
        }
        if let Err(e) = self.validate_identity(&payload) {
            warn!(error = %e, "Discarding media status for another identity");
            if let SyncError::SecurityMismatch(reason) = &e {
                self.send_event(AgentEvent::SecurityMismatch(reason.clone()));
            }
            return Err(e);
        }

        let image = payload.image();
        let video = payload.video();
        let prev = *self.selection_tx.borrow();
        let next = arbitrate(
            &prev,
            image.as_ref(),
            video.as_ref(),
            SelectionPolicy::from_settings(&self.settings),
        );
        if next != prev {
            info!(
                kind = ?next.kind,
                image = ?next.last_image_id,
                video = ?next.last_video_id,
                "Media selection changed"
            );
            self.selection_tx.send_replace(next);
            self.send_event(AgentEvent::SelectionChanged(next));
        }
        self.signals_tx.send_replace(MediaSignals::from(&next));

        let target = match next.kind {
            SelectionKind::Image => image,
            SelectionKind::Video => video,
            SelectionKind::None => None,
        };
        let fetch_started = match target {
            Some(descriptor) => self.begin_fetch(descriptor).await,
            None => false,
        };
        Ok(PollOutcome::Selected {
            selection: next,
            fetch_started,
        })
    }

    /// The payload must echo this device and the logged in user.
    fn validate_identity(&self, payload: &MediaStatusResponse) -> Result<(), SyncError> {
        let local_user = self.auth.user_id();
        if payload.user_id.is_none() || payload.user_id != local_user {
            return Err(SyncError::SecurityMismatch(format!(
                "userId {:?} does not match session user {:?}",
                payload.user_id, local_user
            )));
        }
        let local_device = self.api.device_id();
        if payload.device_id.as_deref() != Some(local_device) {
            return Err(SyncError::SecurityMismatch(format!(
                "deviceId {:?} does not match {}",
                payload.device_id, local_device
            )));
        }
        Ok(())
    }

    async fn begin_fetch(self: &Arc<Self>, descriptor: MediaDescriptor) -> bool {
        let key = (descriptor.kind, descriptor.id);
        let abandoned = {
            let mut render = self.render_state();
            if render.pending == Some(key) {
                return false;
            }
            if render.current == Some(key) {
                // Back to what is on screen: drop any fetch for other media.
                render.pending.take()
            } else {
                info!(kind = descriptor.kind.as_str(), media_id = descriptor.id, "Fetching newly selected media");
                render.pending = Some(key);
                let engine = self.clone();
                render.fetch_task = Some(tokio::spawn(async move {
                    engine.complete_fetch(descriptor).await;
                }));
                return true;
            }
        };
        if let Some((kind, media_id)) = abandoned {
            info!(kind = kind.as_str(), media_id, "Selection returned to the rendered media, cancelling fetch");
            self.cache.cancel_in_flight().await;
        }
        false
    }

    async fn complete_fetch(&self, descriptor: MediaDescriptor) {
        let key = (descriptor.kind, descriptor.id);
        let result = self.cache.fetch(&descriptor).await;

        let selected = self.selection_tx.borrow().current();
        let mut render = self.render_state();
        if render.pending != Some(key) {
            debug!(media_id = descriptor.id, "Fetch finished after being superseded");
            return;
        }
        render.pending = None;
        if selected != Some(key) {
            debug!(media_id = descriptor.id, "Fetched media is no longer selected, not presenting");
            return;
        }
        let entry = match result {
            Ok(entry) => entry,
            Err(SyncError::Cancelled) => {
                debug!(media_id = descriptor.id, "Fetch cancelled");
                return;
            }
            Err(e) => {
                warn!(media_id = descriptor.id, error = %e, "Fetch failed, will retry on next poll");
                return;
            }
        };
        render.current = Some(key);
        match descriptor.kind {
            MediaKind::Image => render.last_shown_image = Some(descriptor.id),
            MediaKind::Video => render.last_shown_video = Some(descriptor.id),
        }
        drop(render);

        self.cache.set_protected(Some(descriptor.id));
        if let Some(presenter) = &self.presenter {
            presenter.present(descriptor.kind, &entry.local_path, &descriptor);
        }
        info!(
            kind = descriptor.kind.as_str(),
            media_id = descriptor.id,
            path = %entry.local_path.display(),
            "Media ready"
        );
        self.send_event(AgentEvent::MediaReady {
            kind: descriptor.kind,
            media_id: descriptor.id,
            path: entry.local_path,
        });
    }
}
