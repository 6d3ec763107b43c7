//! Progress bus: broadcast of per-job progress and status events.
//!
//! Each subscriber declares either "all jobs" or an explicit job-id set and
//! owns a bounded outbound queue. Emission locks the subscriber table only
//! long enough to collect handles and never holds any lock across a send,
//! so a slow consumer cannot stall workers or its peers.

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

use crate::jobs::JobStatus;

/// Maximum buffered events per subscriber.
pub const QUEUE_CAPACITY: usize = 256;

/// Slots of the queue reserved for status_change events.
pub const STATUS_RESERVE: usize = 32;

/// Buffered progress events may occupy at most this many slots.
pub const PROGRESS_CAPACITY: usize = QUEUE_CAPACITY - STATUS_RESERVE;

/// A subscriber that stays exhausted longer than this is disconnected.
pub const EXHAUSTED_DISCONNECT: Duration = Duration::from_secs(30);

/// Maximum concurrent subscribers.
pub const MAX_SUBSCRIBERS: usize = 1000;

/// Error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The subscriber cap was reached.
    #[error("subscriber limit of {0} reached")]
    SubscriberLimit(usize),
}

/// Payload of a progress event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressPayload {
    pub progress: f32,
    pub frame: u64,
    pub fps: f32,
    pub time: f64,
    pub speed: f32,
}

/// Payload of a status change event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusPayload {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// An event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    Progress {
        job_id: String,
        data: ProgressPayload,
    },
    StatusChange {
        job_id: String,
        data: StatusPayload,
    },
    Ping {
        server_ts: i64,
    },
}

impl BusEvent {
    fn job_id(&self) -> Option<&str> {
        match self {
            BusEvent::Progress { job_id, .. } => Some(job_id),
            BusEvent::StatusChange { job_id, .. } => Some(job_id),
            BusEvent::Ping { .. } => None,
        }
    }

    fn is_progress(&self) -> bool {
        matches!(self, BusEvent::Progress { .. })
    }
}

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionFilter {
    /// Every job.
    All,
    /// Only the listed jobs.
    Jobs(HashSet<String>),
}

impl SubscriptionFilter {
    fn matches(&self, job_id: &str) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Jobs(set) => set.contains(job_id),
        }
    }

    /// The explicit set, when the filter is not "all".
    fn explicit(&self) -> Option<&HashSet<String>> {
        match self {
            SubscriptionFilter::All => None,
            SubscriptionFilter::Jobs(set) => Some(set),
        }
    }
}

struct SubQueue {
    events: VecDeque<BusEvent>,
    /// Set when a push first had to drop, cleared on any successful pop.
    exhausted_since: Option<Instant>,
}

struct SubscriberShared {
    filter: Mutex<SubscriptionFilter>,
    queue: Mutex<SubQueue>,
    notify: Notify,
    dropped_events: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberShared {
    fn progress_len(queue: &SubQueue) -> usize {
        queue.events.iter().filter(|e| e.is_progress()).count()
    }

    /// Push a progress event under the drop policy.
    fn push_progress(&self, event: BusEvent) {
        let filter = self.filter.lock().expect("filter lock poisoned").clone();
        let mut queue = self.queue.lock().expect("queue lock poisoned");

        if Self::progress_len(&queue) >= PROGRESS_CAPACITY {
            // Oldest progress events for jobs outside the explicit
            // subscription set go first.
            let victim = filter.explicit().and_then(|set| {
                queue.events.iter().position(|e| {
                    e.is_progress()
                        && e.job_id().map(|id| !set.contains(id)).unwrap_or(false)
                })
            });
            if let Some(idx) = victim {
                queue.events.remove(idx);
            }
        }

        if Self::progress_len(&queue) >= PROGRESS_CAPACITY {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            let since = *queue.exhausted_since.get_or_insert_with(Instant::now);
            if since.elapsed() > EXHAUSTED_DISCONNECT {
                self.closed.store(true, Ordering::Release);
                self.notify.notify_waiters();
            }
            return;
        }

        queue.events.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    /// Push a status event. Status changes are never dropped.
    fn push_status(&self, event: BusEvent) {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        queue.events.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<BusEvent> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        let event = queue.events.pop_front();
        if event.is_some() {
            queue.exhausted_since = None;
        }
        event
    }
}

/// Handle owned by one connected consumer.
///
/// Dropping the handle unregisters the subscriber.
pub struct Subscription {
    id: u64,
    shared: Arc<SubscriberShared>,
    bus: Arc<ProgressBus>,
}

impl Subscription {
    /// Receive the next event, waiting until one is available.
    ///
    /// Returns `None` once the bus has disconnected this subscriber and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<BusEvent> {
        loop {
            if let Some(event) = self.shared.pop() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Replace the subscription filter.
    pub fn set_filter(&self, filter: SubscriptionFilter) {
        *self.shared.filter.lock().expect("filter lock poisoned") = filter;
    }

    /// Add job ids to an explicit subscription set.
    pub fn subscribe_jobs(&self, job_ids: &[String]) {
        let mut filter = self.shared.filter.lock().expect("filter lock poisoned");
        match &mut *filter {
            SubscriptionFilter::All => {}
            SubscriptionFilter::Jobs(set) => {
                set.extend(job_ids.iter().cloned());
            }
        }
    }

    /// Remove job ids from an explicit subscription set.
    pub fn unsubscribe_jobs(&self, job_ids: &[String]) {
        let mut filter = self.shared.filter.lock().expect("filter lock poisoned");
        if let SubscriptionFilter::Jobs(set) = &mut *filter {
            for id in job_ids {
                set.remove(id);
            }
        }
    }

    /// Events dropped for this subscriber so far.
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped_events.load(Ordering::Relaxed)
    }

    /// Whether the bus has disconnected this subscriber.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(self.id);
    }
}

/// The broadcast hub.
pub struct ProgressBus {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberShared>>>,
    next_id: AtomicU64,
    max_subscribers: usize,
}

impl ProgressBus {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(MAX_SUBSCRIBERS)
    }

    pub fn with_capacity(max_subscribers: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_subscribers,
        })
    }

    /// Register a new subscriber with the given filter.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: SubscriptionFilter,
    ) -> Result<Subscription, BusError> {
        let shared = Arc::new(SubscriberShared {
            filter: Mutex::new(filter),
            queue: Mutex::new(SubQueue {
                events: VecDeque::new(),
                exhausted_since: None,
            }),
            notify: Notify::new(),
            dropped_events: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self.subscribers.lock().expect("table lock poisoned");
            if table.len() >= self.max_subscribers {
                return Err(BusError::SubscriberLimit(self.max_subscribers));
            }
            table.insert(id, shared.clone());
        }

        Ok(Subscription {
            id,
            shared,
            bus: self.clone(),
        })
    }

    fn unregister(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("table lock poisoned")
            .remove(&id);
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("table lock poisoned").len()
    }

    /// Handles matching a job id, collected without holding the table lock
    /// during delivery.
    fn matching(&self, job_id: &str) -> Vec<Arc<SubscriberShared>> {
        let table = self.subscribers.lock().expect("table lock poisoned");
        table
            .values()
            .filter(|s| {
                !s.closed.load(Ordering::Acquire)
                    && s.filter
                        .lock()
                        .expect("filter lock poisoned")
                        .matches(job_id)
            })
            .cloned()
            .collect()
    }

    /// Broadcast a progress event for a job.
    pub fn publish_progress(&self, job_id: &str, payload: ProgressPayload) {
        let event = BusEvent::Progress {
            job_id: job_id.to_string(),
            data: payload,
        };
        for subscriber in self.matching(job_id) {
            subscriber.push_progress(event.clone());
        }
    }

    /// Broadcast a status change for a job. Never dropped.
    pub fn publish_status(&self, job_id: &str, status: JobStatus, error_message: Option<String>) {
        let event = BusEvent::StatusChange {
            job_id: job_id.to_string(),
            data: StatusPayload {
                status,
                error_message,
            },
        };
        for subscriber in self.matching(job_id) {
            subscriber.push_status(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_bus() -> (Arc<ProgressBus>, Subscription) {
        let bus = ProgressBus::new();
        let sub = bus.subscribe(SubscriptionFilter::All).unwrap();
        (bus, sub)
    }

    fn progress(p: f32) -> ProgressPayload {
        ProgressPayload {
            progress: p,
            frame: (p * 24.0) as u64,
            fps: 24.0,
            time: p as f64,
            speed: 1.0,
        }
    }

    #[tokio::test]
    async fn test_subscribe_all_receives_everything() {
        let (bus, sub) = all_bus();

        bus.publish_progress("job-1", progress(10.0));
        bus.publish_progress("job-2", progress(20.0));

        match sub.recv().await.unwrap() {
            BusEvent::Progress { job_id, data } => {
                assert_eq!(job_id, "job-1");
                assert_eq!(data.progress, 10.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match sub.recv().await.unwrap() {
            BusEvent::Progress { job_id, .. } => assert_eq!(job_id, "job-2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_explicit_filter_excludes_other_jobs() {
        let bus = ProgressBus::new();
        let sub = bus
            .subscribe(SubscriptionFilter::Jobs(HashSet::from([
                "job-1".to_string()
            ])))
            .unwrap();

        bus.publish_progress("job-2", progress(50.0));
        bus.publish_progress("job-1", progress(10.0));

        // Only the subscribed job arrives.
        match sub.recv().await.unwrap() {
            BusEvent::Progress { job_id, .. } => assert_eq!(job_id, "job-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_runtime_subscription_changes() {
        let bus = ProgressBus::new();
        let sub = bus
            .subscribe(SubscriptionFilter::Jobs(HashSet::new()))
            .unwrap();

        bus.publish_progress("job-1", progress(1.0));
        sub.subscribe_jobs(&["job-1".to_string()]);
        bus.publish_progress("job-1", progress(2.0));
        sub.unsubscribe_jobs(&["job-1".to_string()]);
        bus.publish_progress("job-1", progress(3.0));

        match sub.recv().await.unwrap() {
            BusEvent::Progress { data, .. } => assert_eq!(data.progress, 2.0),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_order_preserved_per_job() {
        let (bus, sub) = all_bus();

        for i in 0..10 {
            bus.publish_progress("job-1", progress(i as f32));
        }
        bus.publish_status("job-1", JobStatus::Ready, None);

        let mut last = -1.0f32;
        for _ in 0..10 {
            match sub.recv().await.unwrap() {
                BusEvent::Progress { data, .. } => {
                    assert!(data.progress > last);
                    last = data.progress;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        // Terminal status arrives after all progress events.
        assert!(matches!(
            sub.recv().await.unwrap(),
            BusEvent::StatusChange { .. }
        ));
    }

    #[tokio::test]
    async fn test_progress_overflow_drops_and_counts() {
        let (bus, sub) = all_bus();

        for i in 0..(PROGRESS_CAPACITY + 50) {
            bus.publish_progress("job-1", progress(i as f32));
        }

        assert_eq!(sub.dropped_events(), 50);

        // The buffered prefix is intact and in order.
        let mut received = 0;
        while let Some(event) = sub.shared.pop() {
            if let BusEvent::Progress { data, .. } = event {
                assert_eq!(data.progress, received as f32);
                received += 1;
            }
        }
        assert_eq!(received, PROGRESS_CAPACITY);
    }

    #[tokio::test]
    async fn test_status_never_dropped_under_overflow() {
        let (bus, sub) = all_bus();

        for i in 0..(PROGRESS_CAPACITY + 10) {
            bus.publish_progress("job-1", progress(i as f32));
        }
        bus.publish_status("job-1", JobStatus::Error, Some("boom".to_string()));

        let mut saw_status = false;
        while let Some(event) = sub.shared.pop() {
            if let BusEvent::StatusChange { data, .. } = event {
                assert_eq!(data.status, JobStatus::Error);
                saw_status = true;
            }
        }
        assert!(saw_status);
    }

    #[tokio::test]
    async fn test_overflow_prefers_dropping_unsubscribed_jobs() {
        let bus = ProgressBus::new();
        let sub = bus
            .subscribe(SubscriptionFilter::Jobs(HashSet::from([
                "keep".to_string()
            ])))
            .unwrap();

        // Fill with events for the subscribed job, then widen the filter and
        // push one more for an unsubscribed job. The explicit set only
        // contains "keep", so overflow must evict the stranger.
        for i in 0..PROGRESS_CAPACITY - 1 {
            bus.publish_progress("keep", progress(i as f32));
        }
        sub.subscribe_jobs(&["other".to_string()]);
        bus.publish_progress("other", progress(999.0));
        sub.unsubscribe_jobs(&["other".to_string()]);

        // Queue is now at capacity with one "other" event buffered.
        bus.publish_progress("keep", progress(1000.0));

        let mut kept = 0;
        let mut others = 0;
        while let Some(event) = sub.shared.pop() {
            if let BusEvent::Progress { job_id, .. } = event {
                if job_id == "keep" {
                    kept += 1;
                } else {
                    others += 1;
                }
            }
        }
        assert_eq!(others, 0, "the unsubscribed job's event should be evicted");
        assert_eq!(kept, PROGRESS_CAPACITY);
        assert_eq!(sub.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_limit() {
        let bus = ProgressBus::with_capacity(2);
        let _a = bus.subscribe(SubscriptionFilter::All).unwrap();
        let _b = bus.subscribe(SubscriptionFilter::All).unwrap();

        let refused = bus.subscribe(SubscriptionFilter::All);
        assert!(matches!(refused, Err(BusError::SubscriberLimit(2))));
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let bus = ProgressBus::new();
        {
            let _sub = bus.subscribe(SubscriptionFilter::All).unwrap();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_not_disconnected_immediately() {
        let (bus, sub) = all_bus();

        // Saturate the queue; the subscriber is over capacity but within the
        // 30 s grace window, so it stays connected.
        for i in 0..(PROGRESS_CAPACITY + 100) {
            bus.publish_progress("job-1", progress(i as f32));
        }
        assert!(!sub.is_closed());
        assert!(sub.dropped_events() > 0);

        // Status changes still get through.
        bus.publish_status("job-1", JobStatus::Ready, None);
        let mut saw_status = false;
        while let Some(event) = sub.shared.pop() {
            if matches!(event, BusEvent::StatusChange { .. }) {
                saw_status = true;
            }
        }
        assert!(saw_status);
    }

    #[test]
    fn test_event_wire_format() {
        let event = BusEvent::Progress {
            job_id: "abc".to_string(),
            data: progress(42.0),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["job_id"], "abc");
        assert_eq!(json["data"]["progress"], 42.0);

        let event = BusEvent::StatusChange {
            job_id: "abc".to_string(),
            data: StatusPayload {
                status: JobStatus::Cancelled,
                error_message: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_change");
        assert_eq!(json["data"]["status"], "cancelled");
        assert!(json["data"].get("error_message").is_none());

        let event = BusEvent::Ping { server_ts: 123 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["server_ts"], 123);
    }
}
