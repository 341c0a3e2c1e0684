use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::TranscodeError;
use crate::types::TrackKey;

/// Single-shot promise store pairing arrived remote tracks with pending
/// `Transcode` requests, keyed by `(stream_id, track_id, rtp_stream_id)`.
///
/// A newly arrived track either completes a pending watcher or is
/// parked; a new watcher either claims a parked arrival or registers
/// itself. Every completed watcher consumes exactly one arrival.
/// Timeouts are the caller's responsibility; dropping an unresolved
/// [`Watch`] deregisters it.
pub struct Rendezvous<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    waiting: HashMap<TrackKey, oneshot::Sender<T>>,
    parked: Vec<(TrackKey, T)>,
}

impl<T> Rendezvous<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Rendezvous {
            inner: Mutex::new(Inner {
                waiting: HashMap::new(),
                parked: Vec::new(),
            }),
        })
    }

    /// Registers a newly arrived track. Completes a pending watcher if
    /// one exists, otherwise parks the arrival.
    pub fn register_arrival(&self, key: TrackKey, value: T) {
        let mut inner = self.inner.lock().expect("rendezvous lock poisoned");
        if let Some(sender) = inner.waiting.remove(&key) {
            match sender.send(value) {
                Ok(()) => {
                    debug!(?key, "arrival matched a pending watcher");
                    return;
                }
                // The watcher was cancelled between registration and
                // arrival; keep the track available.
                Err(value) => inner.parked.push((key, value)),
            }
        } else {
            inner.parked.push((key, value));
        }
    }

    /// Returns a future resolving to the track for `key`: immediately if
    /// the arrival is already parked, otherwise once it arrives.
    pub fn watch(self: &Arc<Self>, key: TrackKey) -> Watch<T> {
        let mut inner = self.inner.lock().expect("rendezvous lock poisoned");
        if let Some(index) = inner.parked.iter().position(|(k, _)| *k == key) {
            let (_, value) = inner.parked.remove(index);
            return Watch {
                state: WatchState::Ready(Some(value)),
            };
        }

        let (tx, rx) = oneshot::channel();
        inner.waiting.insert(key.clone(), tx);
        Watch {
            state: WatchState::Pending {
                rx,
                _guard: WatchGuard {
                    key,
                    store: Arc::downgrade(self),
                },
            },
        }
    }

    /// Drops parked arrivals matching the predicate. Used when a session
    /// goes away before its tracks are claimed.
    pub fn remove_parked(&self, mut predicate: impl FnMut(&T) -> bool) {
        let mut inner = self.inner.lock().expect("rendezvous lock poisoned");
        inner.parked.retain(|(_, v)| !predicate(v));
    }

    fn cancel(&self, key: &TrackKey) {
        let mut inner = self.inner.lock().expect("rendezvous lock poisoned");
        inner.waiting.remove(key);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().waiting.len()
    }

    #[cfg(test)]
    fn parked_len(&self) -> usize {
        self.inner.lock().unwrap().parked.len()
    }
}

/// A claim on one track arrival.
pub struct Watch<T> {
    state: WatchState<T>,
}

enum WatchState<T> {
    Ready(Option<T>),
    Pending {
        rx: oneshot::Receiver<T>,
        _guard: WatchGuard<T>,
    },
}

struct WatchGuard<T> {
    key: TrackKey,
    store: Weak<Rendezvous<T>>,
}

impl<T> Drop for WatchGuard<T> {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.cancel(&self.key);
        }
    }
}

impl<T> Watch<T> {
    /// Waits for the arrival. Fails with `Cancelled` when the session
    /// owning the store goes away first.
    pub async fn wait(self) -> Result<T, TranscodeError> {
        match self.state {
            WatchState::Ready(mut value) => value.take().ok_or(TranscodeError::Cancelled),
            WatchState::Pending { rx, _guard } => rx.await.map_err(|_| TranscodeError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::track_key;

    fn key(n: &str) -> TrackKey {
        track_key("stream", n, "")
    }

    #[tokio::test]
    async fn test_arrival_before_watch() {
        let r = Rendezvous::new();
        r.register_arrival(key("a"), 7u32);
        assert_eq!(r.parked_len(), 1);
        let value = r.watch(key("a")).wait().await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(r.parked_len(), 0);
    }

    #[tokio::test]
    async fn test_watch_before_arrival() {
        let r = Rendezvous::new();
        let watch = r.watch(key("a"));
        assert_eq!(r.pending_len(), 1);
        r.register_arrival(key("a"), 9u32);
        let value = watch.wait().await.unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn test_single_shot_consumption() {
        let r = Rendezvous::new();
        r.register_arrival(key("a"), 1u32);
        let first = r.watch(key("a")).wait().await;
        assert!(first.is_ok());

        // The entry was consumed; a second watcher must wait for a new
        // arrival rather than observe the same one.
        let second = r.watch(key("a"));
        r.register_arrival(key("a"), 2u32);
        assert_eq!(second.wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dropped_watch_deregisters() {
        let r = Rendezvous::new();
        {
            let _watch = r.watch(key("a"));
            assert_eq!(r.pending_len(), 1);
        }
        assert_eq!(r.pending_len(), 0);

        // The arrival lands parked instead of being lost.
        r.register_arrival(key("a"), 3u32);
        assert_eq!(r.parked_len(), 1);
    }

    #[tokio::test]
    async fn test_remove_parked() {
        let r = Rendezvous::new();
        r.register_arrival(key("a"), 1u32);
        r.register_arrival(key("b"), 2u32);
        r.remove_parked(|v| *v == 1);
        assert_eq!(r.parked_len(), 1);
        assert_eq!(r.watch(key("b")).wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_match() {
        let r = Rendezvous::new();
        r.register_arrival(key("a"), 1u32);
        let other = r.watch(key("b"));
        r.register_arrival(key("b"), 2u32);
        assert_eq!(other.wait().await.unwrap(), 2);
        assert_eq!(r.watch(key("a")).wait().await.unwrap(), 1);
    }
}
