//! Event broadcaster — fans queued events out to subscribed connections.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use ward_core::Event;

use crate::encoder::{EncodingMode, ReplyEncoder};

struct Subscriber {
    id: u64,
    encoder: ReplyEncoder,
    tx: mpsc::Sender<Bytes>,
}

/// Live event subscriptions.
///
/// Each subscriber owns a bounded channel drained by its connection task.
/// A full or closed channel drops the subscriber on the spot.
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber whose frames are encoded with `encoder`.
    pub fn subscribe(&self, encoder: ReplyEncoder) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = id, mode = ?encoder.mode(), "event subscriber added");
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .push(Subscriber { id, encoder, tx });
        rx
    }

    pub fn count(&self) -> usize {
        self.subscribers.lock().expect("subscribers lock").len()
    }

    /// Deliver `events` to every subscriber. Each event is encoded once
    /// per encoding mode. Returns the number of frames queued.
    pub fn fan_out(&self, events: &[Event]) -> usize {
        let mut subscribers = self.subscribers.lock().expect("subscribers lock");
        if events.is_empty() {
            subscribers.retain(|s| !s.tx.is_closed());
            return 0;
        }
        let mut delivered = 0;
        for event in events {
            let value = match serde_json::to_value(event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let mut frames: HashMap<EncodingMode, Option<Bytes>> = HashMap::new();
            subscribers.retain(|s| {
                let frame = frames
                    .entry(s.encoder.mode().clone())
                    .or_insert_with(|| s.encoder.encode(&value));
                let Some(frame) = frame else {
                    return true;
                };
                match s.tx.try_send(frame.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        info!(subscriber = s.id, "event subscriber too slow, removed");
                        false
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(subscriber = s.id, "event subscriber gone, removed");
                        false
                    }
                }
            });
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use ward_codec::{Codec, Keyring, decode_plain};
    use ward_core::Ledger;

    fn codec() -> Arc<Codec> {
        Arc::new(Codec::new(
            "n1",
            Arc::new(Keyring::with_secret("prod", "s")),
            Arc::new(Ledger::new()),
        ))
    }

    #[tokio::test]
    async fn events_reach_every_mode() {
        let codec = codec();
        let b = Broadcaster::new(8);
        let mut plain = b.subscribe(ReplyEncoder::plain(codec.clone()));
        let mut sealed = b.subscribe(ReplyEncoder::sealed(codec.clone(), "prod"));

        let n = b.fan_out(&[Event::new("join", json!({"node": "n2"}))]);
        assert_eq!(n, 2);

        let frame = plain.recv().await.unwrap();
        let value = decode_plain(&frame).into_value().unwrap();
        assert_eq!(value["kind"], "join");

        let frame = sealed.recv().await.unwrap();
        let value = codec.decrypt(&frame, "local").into_value().unwrap();
        assert_eq!(value["data"]["node"], "n2");
    }

    #[tokio::test]
    async fn closed_subscriber_removed_on_next_drain() {
        let b = Broadcaster::new(8);
        let rx = b.subscribe(ReplyEncoder::plain(codec()));
        assert_eq!(b.count(), 1);
        drop(rx);
        b.fan_out(&[]);
        assert_eq!(b.count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_removed() {
        let b = Broadcaster::new(2);
        let _rx = b.subscribe(ReplyEncoder::plain(codec()));
        let events: Vec<Event> = (0..3).map(|i| Event::new("tick", json!(i))).collect();
        assert_eq!(b.fan_out(&events), 2);
        assert_eq!(b.count(), 0);
    }
}
