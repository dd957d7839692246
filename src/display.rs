//! Keeps exactly one of the image and video surfaces visible.
//!
//! Pure reconciliation over [`MediaSignals`]; no network access. Switches are
//! rate limited so bursty signal changes do not flicker the screen.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::arbitration::{MediaSignals, PresentationSink};
use crate::events::AgentEvent;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Surface {
    #[default]
    Image,
    Video,
}

impl Surface {
    pub fn as_str(self) -> &'static str {
        match self {
            Surface::Image => "image",
            Surface::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayPolicy {
    pub video_priority: bool,
    pub maintain_last_active: bool,
    pub debounce: Duration,
}

impl DisplayPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            video_priority: settings.video_priority,
            maintain_last_active: settings.maintain_last_active,
            debounce: settings.surface_debounce,
        }
    }
}

impl Default for DisplayPolicy {
    fn default() -> Self {
        Self {
            video_priority: true,
            maintain_last_active: true,
            debounce: Duration::from_millis(100),
        }
    }
}

/// Surface that should be visible for `signals`, given the current one.
pub fn desired_surface(signals: MediaSignals, current: Surface, policy: &DisplayPolicy) -> Surface {
    match (signals.has_image, signals.has_video) {
        (true, false) => Surface::Image,
        (false, true) => Surface::Video,
        (true, true) if policy.video_priority => Surface::Video,
        (true, true) => Surface::Image,
        (false, false) if policy.maintain_last_active => current,
        (false, false) => Surface::Image,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    Unchanged,
    Switched(Surface),
    /// A switch is due but the debounce window is still open.
    Deferred { target: Surface, until: Instant },
}

pub struct DisplayController {
    policy: DisplayPolicy,
    active: Surface,
    last_switch: Option<Instant>,
    sink: Option<Arc<dyn PresentationSink>>,
    surface_tx: watch::Sender<Surface>,
    event_sender: Option<broadcast::Sender<AgentEvent>>,
}

impl DisplayController {
    pub fn new(
        policy: DisplayPolicy,
        sink: Option<Arc<dyn PresentationSink>>,
        event_sender: Option<broadcast::Sender<AgentEvent>>,
    ) -> Self {
        let (surface_tx, _) = watch::channel(Surface::default());
        Self {
            policy,
            active: Surface::default(),
            last_switch: None,
            sink,
            surface_tx,
            event_sender,
        }
    }

    pub fn active(&self) -> Surface {
        self.active
    }

    pub fn surface_receiver(&self) -> watch::Receiver<Surface> {
        self.surface_tx.subscribe()
    }

    /// Tell the sink which surface starts out visible.
    pub fn initialize(&self) {
        if let Some(sink) = &self.sink {
            sink.set_surface(self.active);
        }
        debug!(surface = self.active.as_str(), "Display initialized");
    }

    pub fn reconcile(&mut self, signals: MediaSignals, now: Instant) -> Reconcile {
        let target = desired_surface(signals, self.active, &self.policy);
        if target == self.active {
            return Reconcile::Unchanged;
        }
        if let Some(last) = self.last_switch {
            let ready_at = last + self.policy.debounce;
            if now < ready_at {
                debug!(target = target.as_str(), "Surface switch deferred");
                return Reconcile::Deferred {
                    target,
                    until: ready_at,
                };
            }
        }
        self.switch_to(target, now);
        Reconcile::Switched(target)
    }

    fn switch_to(&mut self, surface: Surface, now: Instant) {
        info!(from = self.active.as_str(), to = surface.as_str(), "Switching display surface");
        self.active = surface;
        self.last_switch = Some(now);
        if let Some(sink) = &self.sink {
            sink.set_surface(surface);
        }
        self.surface_tx.send_replace(surface);
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(AgentEvent::SurfaceChanged(surface));
        }
    }

    /// Follow `signals` until cancelled or the sender goes away, then hand
    /// the controller back so it can be run again.
    pub async fn run(
        mut self,
        mut signals: watch::Receiver<MediaSignals>,
        cancel: CancellationToken,
    ) -> Self {
        self.initialize();
        let mut deadline: Option<Instant> = None;
        loop {
            let wait_deadline = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = signals.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = wait_deadline => {}
            }
            let current = *signals.borrow_and_update();
            deadline = match self.reconcile(current, Instant::now()) {
                Reconcile::Deferred { until, .. } => Some(until),
                _ => None,
            };
        }
        debug!("Display controller stopped");
        self
    }
}

impl std::fmt::Debug for DisplayController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayController")
            .field("policy", &self.policy)
            .field("active", &self.active)
            .finish()
    }
}
