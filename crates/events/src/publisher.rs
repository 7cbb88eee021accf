//! Per-job progress fan-out.
//!
//! [`ProgressPublisher`] keeps one feed per job: a bounded history of
//! published [`ProgressEvent`]s and the set of live subscribers. Each
//! subscriber owns an unbounded channel, so publishing never waits on a
//! slow consumer, and a closed consumer is dropped without touching the
//! others.
//!
//! Subscribing and publishing take the same lock, so a replay followed by
//! live delivery has no gap and no duplicate.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use forge_core::progress::ProgressEvent;
use forge_core::types::{JobId, Sequence};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Events retained per job for resumable subscriptions.
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

pub type SubscriberId = u64;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Slot {
    sender: mpsc::UnboundedSender<ProgressEvent>,
    /// Last sequence handed to this subscriber.
    cursor: Sequence,
}

#[derive(Default)]
struct Feed {
    history: VecDeque<ProgressEvent>,
    last_sequence: Sequence,
    terminal: bool,
    subscribers: HashMap<SubscriberId, Slot>,
}

struct Shared {
    feeds: Mutex<HashMap<JobId, Feed>>,
    next_id: AtomicU64,
    history_capacity: usize,
}

impl Shared {
    fn unsubscribe(&self, job_id: JobId, id: SubscriberId) -> bool {
        let mut feeds = self.feeds.lock();
        feeds
            .get_mut(&job_id)
            .is_some_and(|feed| feed.subscribers.remove(&id).is_some())
    }
}

// ---------------------------------------------------------------------------
// ProgressPublisher
// ---------------------------------------------------------------------------

/// Fan-out hub for job progress events.
///
/// Cheap to clone; clones share the same feeds.
#[derive(Clone)]
pub struct ProgressPublisher {
    shared: Arc<Shared>,
}

impl ProgressPublisher {
    /// Create a publisher retaining up to `history_capacity` events per job.
    pub fn new(history_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                feeds: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                history_capacity,
            }),
        }
    }

    /// Publish an event to every current subscriber of its job.
    ///
    /// Returns the number of subscribers the event was handed to. Events
    /// whose sequence is not newer than the last one published for the job
    /// are ignored, as is anything after the job's terminal event. After a
    /// terminal event all subscriptions of the job are closed.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let job_id = event.job_id;
        let sequence = event.sequence;
        let terminal = event.is_terminal();

        let mut feeds = self.shared.feeds.lock();
        let feed = feeds.entry(job_id).or_default();

        if feed.terminal || sequence <= feed.last_sequence {
            tracing::debug!(
                %job_id,
                sequence,
                last_sequence = feed.last_sequence,
                "Ignoring stale progress event",
            );
            return 0;
        }

        feed.last_sequence = sequence;
        feed.history.push_back(event.clone());
        while feed.history.len() > self.shared.history_capacity.max(1) {
            feed.history.pop_front();
        }

        let mut delivered = 0;
        feed.subscribers.retain(|id, slot| {
            if sequence <= slot.cursor {
                return true;
            }
            match slot.sender.send(event.clone()) {
                Ok(()) => {
                    slot.cursor = sequence;
                    delivered += 1;
                    true
                }
                Err(_) => {
                    tracing::debug!(%job_id, subscriber_id = id, "Subscriber gone, dropping");
                    false
                }
            }
        });

        if terminal {
            feed.terminal = true;
            let closed = feed.subscribers.len();
            // Dropping the senders closes each channel once its buffered
            // events, including the terminal one, have been read.
            feed.subscribers.clear();
            tracing::debug!(%job_id, sequence, closed, "Terminal event published, feed closed");
        }

        delivered
    }

    /// Open a live feed for `job_id`.
    ///
    /// With `after = None` no history is replayed, except that a job which
    /// already finished yields its terminal event once. With
    /// `after = Some(n)` every retained event with `sequence > n` is queued
    /// before any live event.
    pub fn subscribe(&self, job_id: JobId, after: Option<Sequence>) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut feeds = self.shared.feeds.lock();
        let feed = feeds.entry(job_id).or_default();

        let mut replay_truncated = false;
        let last_seen = after.map(|n| n.min(feed.last_sequence));

        match last_seen {
            Some(seen) => {
                let oldest = feed.history.front().map(|e| e.sequence);
                replay_truncated = match oldest {
                    Some(first) => first > seen + 1,
                    None => feed.last_sequence > seen,
                };
                for event in feed.history.iter().filter(|e| e.sequence > seen) {
                    let _ = sender.send(event.clone());
                }
            }
            None if feed.terminal => {
                if let Some(event) = feed.history.back() {
                    let _ = sender.send(event.clone());
                }
            }
            None => {}
        }

        let registered = !feed.terminal;
        if registered {
            feed.subscribers.insert(
                id,
                Slot {
                    sender,
                    cursor: feed.last_sequence,
                },
            );
        }
        let subscribers = feed.subscribers.len();
        drop(feeds);

        tracing::debug!(
            %job_id,
            subscriber_id = id,
            after = ?after,
            replay_truncated,
            registered,
            subscribers,
            "Subscriber attached",
        );

        Subscription {
            job_id,
            id,
            receiver,
            last_seen,
            replay_truncated,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, job_id: JobId, id: SubscriberId) -> bool {
        self.shared.unsubscribe(job_id, id)
    }

    /// Sequence of the last event published for `job_id`, if any.
    pub fn last_sequence(&self, job_id: JobId) -> Option<Sequence> {
        self.shared
            .feeds
            .lock()
            .get(&job_id)
            .map(|feed| feed.last_sequence)
            .filter(|seq| *seq > 0)
    }

    /// Number of live subscribers for `job_id`.
    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.shared
            .feeds
            .lock()
            .get(&job_id)
            .map_or(0, |feed| feed.subscribers.len())
    }
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live feed of one job's progress events.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    job_id: JobId,
    id: SubscriberId,
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
    last_seen: Option<Sequence>,
    replay_truncated: bool,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Sequence of the last event returned by [`recv`](Self::recv), or the
    /// resume point the subscription was opened with.
    pub fn last_sequence_seen(&self) -> Option<Sequence> {
        self.last_seen
    }

    /// `true` when the requested resume point is older than the retained
    /// history. The caller should catch up from a status snapshot.
    pub fn replay_truncated(&self) -> bool {
        self.replay_truncated
    }

    /// Receive the next event, skipping anything already seen.
    ///
    /// Returns `None` once the feed is closed: after the terminal event, or
    /// when the publisher dropped this subscriber.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            let event = self.receiver.recv().await?;
            if self.last_seen.is_some_and(|seen| event.sequence <= seen) {
                continue;
            }
            self.last_seen = Some(event.sequence);
            return Some(event);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(self.job_id, self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use forge_core::job::JobStatus;
    use forge_core::progress::EventKind;
    use forge_core::types::new_job_id;

    use super::*;

    fn event(job_id: JobId, sequence: Sequence, kind: EventKind) -> ProgressEvent {
        let status = match kind {
            EventKind::Progress => JobStatus::Processing,
            EventKind::Completed => JobStatus::Completed,
            EventKind::Failed => JobStatus::Failed,
        };
        ProgressEvent {
            kind,
            job_id,
            sequence,
            status,
            stage: format!("stage-{sequence}"),
            autonomous_stage: None,
            message: String::new(),
            iteration: 0,
            result_payload: (kind == EventKind::Completed).then(|| serde_json::json!({"ok": 1})),
            error: (kind == EventKind::Failed).then(|| "boom".to_string()),
            timestamp: chrono::Utc::now(),
        }
    }

    fn progress(job_id: JobId, sequence: Sequence) -> ProgressEvent {
        event(job_id, sequence, EventKind::Progress)
    }

    async fn drain(sub: &mut Subscription) -> Vec<Sequence> {
        let mut seen = Vec::new();
        while let Some(e) = sub.recv().await {
            seen.push(e.sequence);
        }
        seen
    }

    #[tokio::test]
    async fn live_subscriber_receives_in_order() {
        let publisher = ProgressPublisher::default();
        let job = new_job_id();
        let mut sub = publisher.subscribe(job, None);

        publisher.publish(progress(job, 1));
        publisher.publish(progress(job, 2));
        publisher.publish(event(job, 3, EventKind::Completed));

        assert_eq!(drain(&mut sub).await, vec![1, 2, 3]);
        assert_eq!(sub.last_sequence_seen(), Some(3));
    }

    #[tokio::test]
    async fn no_history_without_resume_point() {
        let publisher = ProgressPublisher::default();
        let job = new_job_id();
        publisher.publish(progress(job, 1));

        let mut sub = publisher.subscribe(job, None);
        publisher.publish(event(job, 2, EventKind::Failed));

        assert_eq!(drain(&mut sub).await, vec![2]);
    }

    #[tokio::test]
    async fn resume_after_sequence_has_no_gap_or_duplicate() {
        let publisher = ProgressPublisher::default();
        let job = new_job_id();

        let mut first = publisher.subscribe(job, None);
        publisher.publish(progress(job, 1));
        publisher.publish(progress(job, 2));
        assert_eq!(first.recv().await.unwrap().sequence, 1);
        assert_eq!(first.recv().await.unwrap().sequence, 2);
        let resume = first.last_sequence_seen();
        drop(first);

        publisher.publish(progress(job, 3));
        let mut second = publisher.subscribe(job, resume);
        assert!(!second.replay_truncated());
        publisher.publish(progress(job, 4));
        publisher.publish(event(job, 5, EventKind::Completed));

        assert_eq!(drain(&mut second).await, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn terminal_job_yields_terminal_event_once() {
        let publisher = ProgressPublisher::default();
        let job = new_job_id();
        publisher.publish(progress(job, 1));
        publisher.publish(event(job, 2, EventKind::Completed));

        let mut sub = publisher.subscribe(job, None);
        let e = sub.recv().await.unwrap();
        assert_eq!(e.kind, EventKind::Completed);
        assert!(sub.recv().await.is_none());
        assert_eq!(publisher.subscriber_count(job), 0);
    }

    #[tokio::test]
    async fn replay_reports_truncation() {
        let publisher = ProgressPublisher::new(2);
        let job = new_job_id();
        for seq in 1..=5 {
            publisher.publish(progress(job, seq));
        }

        let mut sub = publisher.subscribe(job, Some(1));
        assert!(sub.replay_truncated());
        publisher.publish(event(job, 6, EventKind::Completed));
        assert_eq!(drain(&mut sub).await, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn closed_subscriber_does_not_affect_others() {
        let publisher = ProgressPublisher::default();
        let job = new_job_id();
        let mut alive = publisher.subscribe(job, None);
        let mut dead = publisher.subscribe(job, None);
        // Transport gone but the subscription not yet dropped.
        dead.receiver.close();

        assert_eq!(publisher.publish(progress(job, 1)), 1);
        assert_eq!(publisher.subscriber_count(job), 1);
        assert_eq!(alive.recv().await.unwrap().sequence, 1);
        assert!(!publisher.unsubscribe(job, dead.id()));
    }

    #[tokio::test]
    async fn stale_and_post_terminal_events_are_ignored() {
        let publisher = ProgressPublisher::default();
        let job = new_job_id();
        let mut sub = publisher.subscribe(job, None);

        assert_eq!(publisher.publish(progress(job, 2)), 1);
        assert_eq!(publisher.publish(progress(job, 2)), 0);
        assert_eq!(publisher.publish(progress(job, 1)), 0);
        assert_eq!(publisher.publish(event(job, 3, EventKind::Failed)), 1);
        assert_eq!(publisher.publish(progress(job, 4)), 0);

        assert_eq!(drain(&mut sub).await, vec![2, 3]);
        assert_eq!(publisher.last_sequence(job), Some(3));
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let publisher = ProgressPublisher::default();
        let job = new_job_id();
        let sub = publisher.subscribe(job, None);
        assert_eq!(publisher.subscriber_count(job), 1);
        drop(sub);
        assert_eq!(publisher.subscriber_count(job), 0);
    }

    #[tokio::test]
    async fn fan_out_to_many_subscribers() {
        let publisher = ProgressPublisher::default();
        let job = new_job_id();
        let mut subs: Vec<_> = (0..8).map(|_| publisher.subscribe(job, None)).collect();

        assert_eq!(publisher.publish(progress(job, 1)), 8);
        assert_eq!(publisher.publish(event(job, 2, EventKind::Completed)), 8);

        for sub in &mut subs {
            assert_eq!(drain(sub).await, vec![1, 2]);
        }
    }

    #[test]
    fn last_sequence_is_none_for_unknown_job() {
        let publisher = ProgressPublisher::default();
        assert_eq!(publisher.last_sequence(new_job_id()), None);
    }
}
