//! Delayed delivery.
//!
//! A periodic sweep over the persistent queue: housekeeping first, then up
//! to [`SWEEP_BATCH`] due messages are delivered to targets that have come
//! back online. Targets still offline are skipped without charging an
//! attempt; targets the registry no longer knows fail towards the message's
//! attempt budget.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use crossbeam_channel as chan;
use localtime::LocalTime;

use crate::mesh::Outbound;
use crate::queue::Queue;
use crate::registry;
use crate::NodeId;

/// Default sweep interval.
pub const TICK_INTERVAL: time::Duration = time::Duration::from_secs(30);
/// Messages examined per sweep.
pub const SWEEP_BATCH: usize = 50;
/// Prefix on store-and-forward deliveries, so recipients can tell delayed
/// traffic from live traffic.
pub const DELAYED_PREFIX: &str = "📬 [Delayed] ";

/// Outcome counters of one sweep, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sweep {
    pub cleaned: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// The delayed-delivery scheduler.
pub struct Scheduler {
    queue: Queue,
    registry: registry::Shared,
    outbound: Arc<dyn Outbound>,
    /// Sweep re-entrancy guard: a tick that fires while the previous sweep
    /// is still delivering is skipped.
    sweeping: AtomicBool,
}

impl Scheduler {
    pub fn new(queue: Queue, registry: registry::Shared, outbound: Arc<dyn Outbound>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            registry,
            outbound,
            sweeping: AtomicBool::new(false),
        })
    }

    /// Run one sweep. Returns `None` if a sweep was already in progress.
    pub fn sweep(&self, now: LocalTime) -> Option<Sweep> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!(target: "scheduler", "Previous sweep still running; skipping tick");
            return None;
        }
        let report = self.sweep_inner(now);
        self.sweeping.store(false, Ordering::SeqCst);

        Some(report)
    }

    fn sweep_inner(&self, now: LocalTime) -> Sweep {
        let mut report = Sweep::default();

        match self.queue.cleanup(now) {
            Ok(cleaned) => report.cleaned = cleaned,
            Err(e) => log::error!(target: "scheduler", "Queue cleanup failed: {e}"),
        }
        let due = match self.queue.next_batch(SWEEP_BATCH, now) {
            Ok(due) => due,
            Err(e) => {
                log::error!(target: "scheduler", "Failed to fetch due messages: {e}");
                return report;
            }
        };
        for message in due {
            // Snapshot the target before any I/O; the registry lock is not
            // held while sending.
            let Some(target) = self.registry.node(message.to_node) else {
                report.failed += 1;
                self.fail(&message.id, message.from_node, "Target node no longer known", now);
                continue;
            };
            if !self.registry.is_online(message.to_node, now) {
                // No attempt charged for a target that is simply still away.
                report.skipped += 1;
                continue;
            }
            match self.queue.mark_processing(&message.id) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    log::error!(target: "scheduler", "Failed to claim {}: {e}", message.id);
                    continue;
                }
            }
            let text = format!("{DELAYED_PREFIX}{}", message.message);
            match self.outbound.send_text(&text, message.to_node) {
                Ok(()) => {
                    report.delivered += 1;
                    if let Err(e) = self.queue.mark_delivered(&message.id) {
                        log::error!(target: "scheduler", "Failed to mark {} delivered: {e}", message.id);
                    }
                    log::info!(
                        target: "scheduler",
                        "Delivered queued message {} to {}",
                        message.id,
                        target.name()
                    );
                    self.notify(
                        message.from_node,
                        &format!("✅ Your queued message was delivered to {}", target.name()),
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    self.fail(&message.id, message.from_node, &e.to_string(), now);
                }
            }
        }
        if report != Sweep::default() {
            log::debug!(
                target: "scheduler",
                "Sweep: {} delivered, {} skipped, {} failed, {} cleaned",
                report.delivered,
                report.skipped,
                report.failed,
                report.cleaned
            );
        }
        report
    }

    /// Record a failure; tell the sender when it was final.
    fn fail(&self, id: &crate::queue::MessageId, sender: NodeId, error: &str, now: LocalTime) {
        match self.queue.mark_failed(id, error, now) {
            Ok(true) => {
                log::debug!(target: "scheduler", "Delivery of {id} failed, will retry: {error}");
            }
            Ok(false) => {
                log::warn!(target: "scheduler", "Delivery of {id} failed permanently: {error}");
                self.notify(
                    sender,
                    "❌ Your queued message could not be delivered and was dropped",
                );
            }
            Err(e) => {
                log::error!(target: "scheduler", "Failed to record failure of {id}: {e}");
            }
        }
    }

    fn notify(&self, to: NodeId, text: &str) {
        self.outbound.send_text(text, to).ok();
    }
}

/// The sweep loop.
pub fn run(scheduler: Arc<Scheduler>, interval: time::Duration, shutdown: chan::Receiver<()>) {
    let ticker = chan::tick(interval);
    log::debug!(target: "scheduler", "Delayed delivery sweeping every {}s..", interval.as_secs());
    loop {
        chan::select! {
            recv(ticker) -> _ => {
                scheduler.sweep(LocalTime::now());
            }
            recv(shutdown) -> _ => break,
        }
    }
    log::debug!(target: "scheduler", "Delayed delivery stopped");
}

#[cfg(test)]
mod test {
    use super::*;
    use localtime::LocalDuration;

    use crate::mesh::proto;
    use crate::mesh::test::MemorySink;
    use crate::queue::{Enqueue, Enqueued, Status};

    fn node_info(num: NodeId, long: &str) -> proto::NodeInfo {
        proto::NodeInfo {
            num,
            user: Some(proto::User {
                id: format!("!{num:08x}"),
                long_name: long.to_owned(),
                short_name: String::new(),
            }),
            position: None,
            last_heard: 0,
        }
    }

    struct Fixture {
        scheduler: Arc<Scheduler>,
        queue: Queue,
        registry: registry::Shared,
        sink: Arc<MemorySink>,
        now: LocalTime,
    }

    fn fixture() -> Fixture {
        let queue = Queue::memory().unwrap();
        let registry = registry::Shared::new();
        let sink = MemorySink::new();
        let scheduler = Scheduler::new(queue.clone(), registry.clone(), sink.clone());

        Fixture {
            scheduler,
            queue,
            registry,
            sink,
            now: LocalTime::from_millis(1_700_000_000_000),
        }
    }

    fn enqueue(f: &Fixture, to: NodeId, text: &str) -> crate::queue::MessageId {
        match f
            .queue
            .enqueue(200, to, text, Enqueue::default(), f.now)
            .unwrap()
        {
            Enqueued::Queued(id) => id,
            Enqueued::Duplicate => panic!("unexpected duplicate"),
        }
    }

    #[test]
    fn test_offline_target_is_skipped_uncharged() {
        let f = fixture();
        f.registry
            .add_or_update_local(&node_info(102, "Bob"), f.now - LocalDuration::from_mins(10));
        let id = enqueue(&f, 102, "hello");

        let report = f.scheduler.sweep(f.now).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.delivered, 0);

        let m = f.queue.get(&id).unwrap().unwrap();
        assert_eq!(m.status, Status::Pending);
        assert_eq!(m.attempts, 0);
        assert!(f.sink.sent().is_empty());
    }

    #[test]
    fn test_delivery_when_target_comes_online() {
        let f = fixture();
        f.registry
            .add_or_update_local(&node_info(102, "Bob"), f.now - LocalDuration::from_mins(10));
        let id = enqueue(&f, 102, "hello");

        f.scheduler.sweep(f.now).unwrap();

        // Bob is heard again, forty seconds later.
        let later = f.now + LocalDuration::from_secs(40);
        f.registry.observe(102, later);

        let report = f.scheduler.sweep(later).unwrap();
        assert_eq!(report.delivered, 1);

        let delivered = f.sink.sent_to(102);
        assert_eq!(delivered, vec![format!("{DELAYED_PREFIX}hello")]);

        let confirmations = f.sink.sent_to(200);
        assert_eq!(
            confirmations,
            vec!["✅ Your queued message was delivered to Bob".to_owned()]
        );
        assert_eq!(f.queue.get(&id).unwrap().unwrap().status, Status::Delivered);
    }

    #[test]
    fn test_unknown_target_charges_failure() {
        let f = fixture();
        let id = enqueue(&f, 999, "to nobody");

        let report = f.scheduler.sweep(f.now).unwrap();
        assert_eq!(report.failed, 1);

        let m = f.queue.get(&id).unwrap().unwrap();
        assert_eq!(m.status, Status::Pending);
        assert_eq!(m.last_error.as_deref(), Some("Target node no longer known"));
        // Backed off: not due immediately.
        assert!(m.scheduled_for > f.now);
    }

    #[test]
    fn test_send_failure_retries_then_notifies() {
        let f = fixture();
        f.registry.observe(102, f.now);
        let id = match f
            .queue
            .enqueue(
                200,
                102,
                "fragile",
                Enqueue {
                    max_attempts: 1,
                    ..Enqueue::default()
                },
                f.now,
            )
            .unwrap()
        {
            Enqueued::Queued(id) => id,
            Enqueued::Duplicate => unreachable!(),
        };

        f.sink.set_failing(true);
        let report = f.scheduler.sweep(f.now).unwrap();
        f.sink.set_failing(false);

        assert_eq!(report.failed, 1);
        assert_eq!(f.queue.get(&id).unwrap().unwrap().status, Status::Failed);

        // The permanent-failure notice went out after the sink recovered...
        // it could not: the sink was failing. The notice is best-effort.
        assert!(f.sink.sent().is_empty());
    }

    #[test]
    fn test_expired_messages_are_not_dispatched() {
        let f = fixture();
        f.registry.observe(102, f.now);
        match f
            .queue
            .enqueue(
                200,
                102,
                "short fuse",
                Enqueue {
                    ttl: 1,
                    ..Enqueue::default()
                },
                f.now,
            )
            .unwrap()
        {
            Enqueued::Queued(_) => {}
            Enqueued::Duplicate => unreachable!(),
        }

        let later = f.now + LocalDuration::from_secs(2);
        let report = f.scheduler.sweep(later).unwrap();

        assert_eq!(report.delivered, 0);
        assert!(f.sink.sent().is_empty());
        assert_eq!(f.queue.stats().unwrap().expired, 1);
    }

    #[test]
    fn test_reentrancy_guard() {
        let f = fixture();
        f.scheduler.sweeping.store(true, Ordering::SeqCst);
        assert_eq!(f.scheduler.sweep(f.now), None);

        f.scheduler.sweeping.store(false, Ordering::SeqCst);
        assert!(f.scheduler.sweep(f.now).is_some());
    }

    #[test]
    fn test_priority_order_in_delivery() {
        let f = fixture();
        f.registry.observe(102, f.now);
        f.queue
            .enqueue(200, 102, "routine", Enqueue::default(), f.now)
            .unwrap();
        f.queue
            .enqueue(
                200,
                102,
                "emergency",
                Enqueue {
                    priority: crate::queue::Priority::Urgent,
                    ..Enqueue::default()
                },
                f.now,
            )
            .unwrap();

        f.scheduler.sweep(f.now).unwrap();
        let sent = f.sink.sent_to(102);
        assert_eq!(sent[0], format!("{DELAYED_PREFIX}emergency"));
        assert_eq!(sent[1], format!("{DELAYED_PREFIX}routine"));
    }
}
