//! Session-scoped fan-out of live samples to observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use slog::{debug, warn, Logger};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{error::TrySendError, Sender};
use uuid::Uuid;

pub mod observer;

pub use observer::{DeviceStatus, ObserverEvent, ObserverMessage};

pub type ObserverId = Uuid;

/// Events an observer may have queued before further ones are dropped.
pub const OBSERVER_QUEUE_LEN: usize = 256;

/// Members and device binding of one session.
#[derive(Default)]
struct SessionChannel {
    observers: Mutex<HashMap<ObserverId, Sender<ObserverEvent>>>,
    device_id: Mutex<Option<String>>,
}

impl SessionChannel {
    fn is_idle(&self) -> bool {
        self.observers.lock().is_empty() && self.device_id.lock().is_none()
    }
}

pub struct SessionRouter {
    sessions: RwLock<HashMap<String, Arc<SessionChannel>>>,
    /// device id -> session id, the reverse of each channel's binding.
    bindings: Mutex<HashMap<String, String>>,
    updates: broadcast::Sender<ObserverEvent>,
    dropped: AtomicU64,
    logger: Logger,
}

impl SessionRouter {
    pub fn new(logger: Logger) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            sessions: RwLock::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            updates,
            dropped: AtomicU64::new(0),
            logger,
        }
    }

    fn channel(&self, session_id: &str) -> Option<Arc<SessionChannel>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Runs `f` on the session's channel, creating it if needed. The map stays
    /// write-locked meanwhile so idle cleanup cannot drop the channel under us.
    fn with_channel<R>(&self, session_id: &str, f: impl FnOnce(&SessionChannel) -> R) -> R {
        let mut sessions = self.sessions.write();
        let channel = sessions.entry(session_id.to_string()).or_default();
        f(channel)
    }

    fn drop_if_idle(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if sessions.get(session_id).map_or(false, |c| c.is_idle()) {
            sessions.remove(session_id);
        }
    }

    /// Adds an observer. Only batches published from now on reach it.
    pub fn join(&self, session_id: &str, observer: ObserverId, outbound: Sender<ObserverEvent>) {
        self.with_channel(session_id, |channel| {
            channel.observers.lock().insert(observer, outbound);
        });
        debug!(self.logger, "observer joined"; "session_id" => session_id, "observer" => %observer);
    }

    /// Removes an observer; no-op if it was not a member.
    pub fn leave(&self, session_id: &str, observer: ObserverId) {
        if let Some(channel) = self.channel(session_id) {
            channel.observers.lock().remove(&observer);
            self.drop_if_idle(session_id);
        }
    }

    pub fn leave_all(&self, observer: ObserverId, session_ids: impl IntoIterator<Item = String>) {
        for session_id in session_ids {
            self.leave(&session_id, observer);
        }
    }

    /// Hands `event` to every current member of the session without waiting on
    /// any of them. A member whose queue is full misses the event; a member
    /// whose queue is closed is removed. Returns how many members accepted it.
    pub fn publish(&self, session_id: &str, event: ObserverEvent) -> usize {
        let Some(channel) = self.channel(session_id) else {
            return 0;
        };
        let members: Vec<(ObserverId, Sender<ObserverEvent>)> = channel
            .observers
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in members {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(self.logger, "observer queue full, event dropped";
                        "session_id" => session_id, "observer" => %id, "dropped_total" => total);
                }
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }

        if !gone.is_empty() {
            let mut observers = channel.observers.lock();
            for id in &gone {
                observers.remove(id);
            }
            drop(observers);
            debug!(self.logger, "dropped closed observers"; "session_id" => session_id, "count" => gone.len());
            self.drop_if_idle(session_id);
        }
        delivered
    }

    /// Events dropped so far because an observer's queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn observer_count(&self, session_id: &str) -> usize {
        self.channel(session_id).map_or(0, |c| c.observers.lock().len())
    }

    /// Binds `device_id` to `session_id`, returning the session the device was
    /// previously bound to, if that was a different one.
    pub fn bind_device(&self, session_id: &str, device_id: &str) -> Option<String> {
        let previous = self
            .bindings
            .lock()
            .insert(device_id.to_string(), session_id.to_string())
            .filter(|prev| prev != session_id);

        if let Some(prev) = &previous {
            if let Some(channel) = self.channel(prev) {
                let mut bound = channel.device_id.lock();
                if bound.as_deref() == Some(device_id) {
                    *bound = None;
                }
            }
            self.drop_if_idle(prev);
        }

        let replaced = self.with_channel(session_id, |channel| {
            channel.device_id.lock().replace(device_id.to_string())
        });
        if let Some(other) = replaced.filter(|d| d != device_id) {
            let mut bindings = self.bindings.lock();
            if bindings.get(&other).map(String::as_str) == Some(session_id) {
                bindings.remove(&other);
            }
        }
        previous
    }

    /// Clears the session's device binding, returning the device that was bound.
    pub fn unbind_device(&self, session_id: &str) -> Option<String> {
        let channel = self.channel(session_id)?;
        let device_id = channel.device_id.lock().take()?;
        {
            let mut bindings = self.bindings.lock();
            if bindings.get(&device_id).map(String::as_str) == Some(session_id) {
                bindings.remove(&device_id);
            }
        }
        self.drop_if_idle(session_id);
        Some(device_id)
    }

    pub fn device_for(&self, session_id: &str) -> Option<String> {
        self.channel(session_id).and_then(|c| c.device_id.lock().clone())
    }

    pub fn session_for_device(&self, device_id: &str) -> Option<String> {
        self.bindings.lock().get(device_id).cloned()
    }

    /// Events for every observer regardless of session membership.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<ObserverEvent> {
        self.updates.subscribe()
    }

    pub fn broadcast_update(&self, event: ObserverEvent) {
        // Err only means nobody is listening.
        let _ = self.updates.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::protocol::RawSample;
    use crate::log::discard_logger;
    use tokio::sync::mpsc;

    fn batch(first: f64) -> ObserverEvent {
        ObserverEvent::RealTimeEcg {
            session_id: "s1".into(),
            device_id: "dev-1".into(),
            data: (0..3)
                .map(|i| RawSample {
                    timestamp: first + i as f64,
                    voltage: 0.0,
                    leads_off: false,
                    quality_score: None,
                })
                .collect(),
        }
    }

    fn first_timestamp(event: &ObserverEvent) -> f64 {
        match event {
            ObserverEvent::RealTimeEcg { data, .. } => data[0].timestamp,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn publish_without_members_is_noop() {
        let router = SessionRouter::new(discard_logger());
        assert_eq!(router.publish("s1", batch(0.0)), 0);
    }

    #[test]
    fn each_observer_sees_ingestion_order() {
        let router = SessionRouter::new(discard_logger());
        let (tx_a, mut rx_a) = mpsc::channel(OBSERVER_QUEUE_LEN);
        let (tx_b, mut rx_b) = mpsc::channel(OBSERVER_QUEUE_LEN);
        router.join("s1", Uuid::new_v4(), tx_a);
        router.join("s1", Uuid::new_v4(), tx_b);

        for i in 0..10 {
            assert_eq!(router.publish("s1", batch(i as f64 * 10.0)), 2);
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let mut seen = Vec::new();
            while let Ok(event) = rx.try_recv() {
                seen.push(first_timestamp(&event));
            }
            assert_eq!(seen, (0..10).map(|i| i as f64 * 10.0).collect::<Vec<_>>());
        }
    }

    #[test]
    fn late_joiner_gets_no_history() {
        let router = SessionRouter::new(discard_logger());
        let (tx_a, _rx_a) = mpsc::channel(OBSERVER_QUEUE_LEN);
        router.join("s1", Uuid::new_v4(), tx_a);
        router.publish("s1", batch(0.0));

        let (tx_b, mut rx_b) = mpsc::channel(OBSERVER_QUEUE_LEN);
        router.join("s1", Uuid::new_v4(), tx_b);
        assert!(rx_b.try_recv().is_err());
        router.publish("s1", batch(5.0));
        assert_eq!(first_timestamp(&rx_b.try_recv().unwrap()), 5.0);
    }

    #[test]
    fn closed_observer_does_not_block_others() {
        let router = SessionRouter::new(discard_logger());
        let (tx_dead, rx_dead) = mpsc::channel(OBSERVER_QUEUE_LEN);
        let (tx_live, mut rx_live) = mpsc::channel(OBSERVER_QUEUE_LEN);
        router.join("s1", Uuid::new_v4(), tx_dead);
        router.join("s1", Uuid::new_v4(), tx_live);
        drop(rx_dead);

        assert_eq!(router.publish("s1", batch(0.0)), 1);
        assert_eq!(router.observer_count("s1"), 1);
        assert!(rx_live.try_recv().is_ok());
    }

    #[test]
    fn full_observer_misses_events_without_holding_up_others() {
        let router = SessionRouter::new(discard_logger());
        let (tx_stuck, mut rx_stuck) = mpsc::channel(2);
        let (tx_live, mut rx_live) = mpsc::channel(OBSERVER_QUEUE_LEN);
        router.join("s1", Uuid::new_v4(), tx_stuck);
        router.join("s1", Uuid::new_v4(), tx_live);

        let delivered: Vec<usize> = (0..5).map(|i| router.publish("s1", batch(i as f64))).collect();
        assert_eq!(delivered, vec![2, 2, 1, 1, 1]);
        assert_eq!(router.dropped_events(), 3);
        // the stuck observer stays a member and keeps only what fit
        assert_eq!(router.observer_count("s1"), 2);

        let mut stuck = Vec::new();
        while let Ok(event) = rx_stuck.try_recv() {
            stuck.push(first_timestamp(&event));
        }
        assert_eq!(stuck, vec![0.0, 1.0]);

        let mut live = Vec::new();
        while let Ok(event) = rx_live.try_recv() {
            live.push(first_timestamp(&event));
        }
        assert_eq!(live, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn leave_is_idempotent() {
        let router = SessionRouter::new(discard_logger());
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(OBSERVER_QUEUE_LEN);
        router.join("s1", id, tx);
        router.leave("s1", id);
        router.leave("s1", id);
        router.leave("never-joined", id);
        assert_eq!(router.observer_count("s1"), 0);
    }

    #[test]
    fn binding_a_device_supersedes_its_previous_session() {
        let router = SessionRouter::new(discard_logger());
        assert_eq!(router.bind_device("s1", "dev-1"), None);
        assert_eq!(router.bind_device("s1", "dev-1"), None);
        assert_eq!(router.bind_device("s2", "dev-1"), Some("s1".to_string()));

        assert_eq!(router.device_for("s1"), None);
        assert_eq!(router.device_for("s2").as_deref(), Some("dev-1"));
        assert_eq!(router.session_for_device("dev-1").as_deref(), Some("s2"));

        assert_eq!(router.unbind_device("s2").as_deref(), Some("dev-1"));
        assert_eq!(router.session_for_device("dev-1"), None);
    }
}
