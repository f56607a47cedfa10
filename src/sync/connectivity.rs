//! Connectivity Monitor
//!
//! Tracks whether the notes backend is reachable. Every Offline -> Online
//! transition emits exactly one reconnect event, which the sync manager turns
//! into a replay run. Going offline only updates the signal.

use super::api::NoteBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Online/offline signal shared by the queue, the UI and the replay trigger
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<Connectivity>>,
    reconnects: broadcast::Sender<()>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (state, _) = watch::channel(initial);
        let (reconnects, _) = broadcast::channel(16);
        Self {
            state: Arc::new(state),
            reconnects,
        }
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == Connectivity::Online
    }

    /// Feed a platform connectivity signal.
    ///
    /// Returns true when this call moved the state from Offline to Online.
    pub fn set_online(&self, online: bool) -> bool {
        self.update(Connectivity::from_online(online))
    }

    pub fn update(&self, next: Connectivity) -> bool {
        let mut previous = next;
        self.state.send_if_modified(|current| {
            previous = *current;
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if previous == next {
            return false;
        }

        log::info!("Connectivity changed: {} -> {}", previous.as_str(), next.as_str());

        let reconnected = previous == Connectivity::Offline && next == Connectivity::Online;
        if reconnected {
            // No subscribers is fine
            let _ = self.reconnects.send(());
        }
        reconnected
    }

    /// Current state plus change notifications
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// One event per Offline -> Online transition
    pub fn subscribe_reconnects(&self) -> broadcast::Receiver<()> {
        self.reconnects.subscribe()
    }

    /// Call `handler` with each new state until the monitor is dropped
    pub fn on_change<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(Connectivity) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                handler(state);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Online)
    }
}

/// Drive `monitor` from periodic backend pings.
///
/// A ping that gets no HTTP answer means offline; any answer, including
/// an authorization failure, means online.
pub fn spawn_probe(
    monitor: ConnectivityMonitor,
    backend: Arc<dyn NoteBackend>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        log::info!("Connectivity probe started (interval: {:?})", interval);

        loop {
            ticker.tick().await;

            let online = match backend.ping().await {
                Ok(()) => true,
                Err(e) if e.is_transport() => {
                    log::debug!("Connectivity probe failed: {}", e);
                    false
                }
                Err(_) => true,
            };

            monitor.set_online(online);
        }
    })
}
