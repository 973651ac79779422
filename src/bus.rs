//! Progress Bus: ordered, per-subscription event delivery with bounded
//! buffers and a never-block producer (spec §4.6).

use crate::sync_ext::MutexExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BusEvent {
    BatchStarted(serde_json::Value),
    BatchProgress(serde_json::Value),
    FileProcessed(serde_json::Value),
    BatchCompleted(serde_json::Value),
    BatchCancelled(serde_json::Value),
    BatchError(serde_json::Value),
}

impl BusEvent {
    /// Exactly one of `batch_completed`/`batch_cancelled`/`batch_error` is
    /// terminal per job (spec §4.6); terminal events are never dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BusEvent::BatchCompleted(_) | BusEvent::BatchCancelled(_) | BusEvent::BatchError(_)
        )
    }
}

/// Envelope delivered to a subscriber; carries the `events_lost` flag the
/// spec requires when the bounded buffer dropped an earlier event.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    #[serde(flatten)]
    pub event: BusEvent,
    pub events_lost: bool,
}

const DEFAULT_CAPACITY: usize = 256;

struct SubscriberState {
    buffer: VecDeque<BusEvent>,
    events_lost: bool,
    capacity: usize,
}

impl SubscriberState {
    fn new(capacity: usize) -> Self {
        SubscriberState {
            buffer: VecDeque::with_capacity(capacity),
            events_lost: false,
            capacity,
        }
    }

    /// Never blocks the producer. Drops the oldest non-terminal event on
    /// overflow, flagging `events_lost` (spec §4.6 "Backpressure policy").
    fn push(&mut self, event: BusEvent) {
        if self.buffer.len() >= self.capacity {
            let drop_index = self.buffer.iter().position(|e| !e.is_terminal());
            match drop_index {
                Some(idx) => {
                    self.buffer.remove(idx);
                    self.events_lost = true;
                }
                None => {
                    // Every buffered event is terminal (should not happen in
                    // practice, since a job only ever emits one); drop the
                    // new event instead of violating "terminal never dropped".
                    if !event.is_terminal() {
                        self.events_lost = true;
                        return;
                    }
                }
            }
        }
        self.buffer.push_back(event);
    }

    fn drain(&mut self) -> Vec<Delivery> {
        let lost = self.events_lost;
        self.events_lost = false;
        self.buffer
            .drain(..)
            .enumerate()
            .map(|(i, event)| Delivery {
                event,
                events_lost: lost && i == 0,
            })
            .collect()
    }
}

pub struct Subscription {
    pub id: Uuid,
    pub job_id: Uuid,
    bus: Arc<ProgressBusInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.job_id, self.id);
    }
}

impl Subscription {
    /// Pull everything buffered for this subscriber since the last poll, in
    /// publication order (spec §4.6 "Ordering").
    pub fn drain(&self) -> Vec<Delivery> {
        self.bus.drain(self.job_id, self.id)
    }
}

struct ProgressBusInner {
    rooms: Mutex<HashMap<Uuid, HashMap<Uuid, SubscriberState>>>,
    default_capacity: usize,
}

impl ProgressBusInner {
    fn unsubscribe(&self, job_id: Uuid, sub_id: Uuid) {
        let mut rooms = self.rooms.lock_unpoisoned();
        if let Some(room) = rooms.get_mut(&job_id) {
            room.remove(&sub_id);
            if room.is_empty() {
                rooms.remove(&job_id);
            }
        }
    }

    fn drain(&self, job_id: Uuid, sub_id: Uuid) -> Vec<Delivery> {
        let mut rooms = self.rooms.lock_unpoisoned();
        rooms
            .get_mut(&job_id)
            .and_then(|room| room.get_mut(&sub_id))
            .map(|state| state.drain())
            .unwrap_or_default()
    }
}

/// Pub/sub of job events to subscriber rooms keyed by `job_id` (spec
/// §3 "Subscription Room", §4.6). `publish` is non-blocking by
/// construction: it only ever touches in-memory `VecDeque`s under a short
/// critical section, never a codec call or I/O.
pub struct ProgressBus {
    inner: Arc<ProgressBusInner>,
    delivered_counter: AtomicU64,
}

impl Default for ProgressBus {
    fn default() -> Self {
        ProgressBus::new(DEFAULT_CAPACITY)
    }
}

impl ProgressBus {
    pub fn new(default_capacity: usize) -> Self {
        ProgressBus {
            inner: Arc::new(ProgressBusInner {
                rooms: Mutex::new(HashMap::new()),
                default_capacity,
            }),
            delivered_counter: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        let sub_id = Uuid::new_v4();
        let mut rooms = self.inner.rooms.lock_unpoisoned();
        rooms
            .entry(job_id)
            .or_default()
            .insert(sub_id, SubscriberState::new(self.inner.default_capacity));
        Subscription {
            id: sub_id,
            job_id,
            bus: self.inner.clone(),
        }
    }

    pub fn publish(&self, job_id: Uuid, event: BusEvent) {
        self.delivered_counter.fetch_add(1, Ordering::Relaxed);
        let mut rooms = self.inner.rooms.lock_unpoisoned();
        if let Some(room) = rooms.get_mut(&job_id) {
            for state in room.values_mut() {
                state.push(event.clone());
            }
        }
    }

    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.inner
            .rooms
            .lock_unpoisoned()
            .get(&job_id)
            .map(|r| r.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(n: u32) -> BusEvent {
        BusEvent::BatchProgress(serde_json::json!({ "n": n }))
    }

    #[test]
    fn events_are_delivered_in_publication_order() {
        let bus = ProgressBus::new(16);
        let job_id = Uuid::new_v4();
        let sub = bus.subscribe(job_id);
        for i in 0..5 {
            bus.publish(job_id, ev(i));
        }
        let drained = sub.drain();
        let nums: Vec<u32> = drained
            .iter()
            .map(|d| match &d.event {
                BusEvent::BatchProgress(v) => v["n"].as_u64().unwrap() as u32,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(nums, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn overflow_drops_oldest_non_terminal_and_sets_events_lost() {
        let bus = ProgressBus::new(2);
        let job_id = Uuid::new_v4();
        let sub = bus.subscribe(job_id);
        bus.publish(job_id, ev(0));
        bus.publish(job_id, ev(1));
        bus.publish(job_id, ev(2)); // buffer full -> drop ev(0)
        let drained = sub.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].events_lost);
        let nums: Vec<u32> = drained
            .iter()
            .map(|d| match &d.event {
                BusEvent::BatchProgress(v) => v["n"].as_u64().unwrap() as u32,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(nums, vec![1, 2]);
    }

    #[test]
    fn terminal_event_is_never_dropped() {
        let bus = ProgressBus::new(1);
        let job_id = Uuid::new_v4();
        let sub = bus.subscribe(job_id);
        bus.publish(job_id, ev(0));
        bus.publish(
            job_id,
            BusEvent::BatchCompleted(serde_json::json!({"ok": true})),
        );
        let drained = sub.drain();
        assert!(drained.iter().any(|d| d.event.is_terminal()));
    }

    #[test]
    fn unsubscribe_removes_empty_room() {
        let bus = ProgressBus::new(4);
        let job_id = Uuid::new_v4();
        {
            let _sub = bus.subscribe(job_id);
            assert_eq!(bus.subscriber_count(job_id), 1);
        }
        assert_eq!(bus.subscriber_count(job_id), 0);
    }
}
