//! Background worker draining a [`MailQueue`].
//!
//! Lifecycle: `Stopped -> Starting -> Running -> StopRequested -> Stopped`.
//! The loop checks for a stop request between items and sleeps for the poll
//! interval when the queue is empty; a stop request wakes it early. An
//! in-flight delivery is never interrupted.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

use crate::errors::{DispatchError, DispatchResult};
use crate::observability::{DispatchMetrics, Timer};
use crate::queue::MailQueue;
use crate::sender::EmailSender;
use crate::types::EmailBox;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No loop is active.
    Stopped,
    /// `run()` accepted; the loop is being spawned.
    Starting,
    /// The loop is active.
    Running,
    /// The loop will exit at its next iteration boundary.
    StopRequested,
}

/// Something that can deliver a dequeued email.
#[async_trait]
pub trait QueueDelivery: Send + Sync + 'static {
    /// Delivers one email.
    async fn deliver(&self, email: EmailBox) -> DispatchResult<String>;

    /// Metrics to record queue outcomes into.
    fn metrics(&self) -> Option<&DispatchMetrics> {
        None
    }
}

#[async_trait]
impl QueueDelivery for EmailSender {
    async fn deliver(&self, email: EmailBox) -> DispatchResult<String> {
        self.send_box(email).await
    }

    fn metrics(&self) -> Option<&DispatchMetrics> {
        Some(EmailSender::metrics(self))
    }
}

struct Shared {
    state: watch::Sender<WorkerState>,
    wake: Notify,
}

/// Owns the background loop for one queue.
///
/// Dropping the manager requests a stop.
pub struct MailQueueManager<D: QueueDelivery = EmailSender> {
    queue: MailQueue,
    delivery: Arc<D>,
    poll_interval: Duration,
    shared: Arc<Shared>,
}

impl MailQueueManager<EmailSender> {
    /// Creates a manager delivering through `sender`, polling at the
    /// configured sleep interval.
    pub fn for_sender(queue: MailQueue, sender: EmailSender) -> Self {
        let poll_interval = sender.settings().poll_interval();
        Self::new(queue, sender, poll_interval)
    }
}

impl<D: QueueDelivery> MailQueueManager<D> {
    /// Creates a stopped manager.
    pub fn new(queue: MailQueue, delivery: D, poll_interval: Duration) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            queue,
            delivery: Arc::new(delivery),
            poll_interval,
            shared: Arc::new(Shared {
                state,
                wake: Notify::new(),
            }),
        }
    }

    /// Returns the queue handle.
    pub fn queue(&self) -> &MailQueue {
        &self.queue
    }

    /// Enqueues an email and wakes a sleeping worker.
    pub fn enqueue(&self, email: EmailBox) {
        self.queue.enqueue(email);
        self.shared.wake.notify_one();
    }

    /// Starts the background loop.
    ///
    /// Returns `false` (after logging a warning) if a loop is already active
    /// or no tokio runtime is available.
    pub fn run(&self) -> bool {
        let accepted = self.shared.state.send_if_modified(|state| {
            if *state == WorkerState::Stopped {
                *state = WorkerState::Starting;
                true
            } else {
                false
            }
        });
        if !accepted {
            tracing::warn!(state = ?self.state(), "Mail queue worker is already running");
            return false;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(error) => {
                self.shared.state.send_replace(WorkerState::Stopped);
                tracing::error!(error = %error, "Mail queue worker needs a tokio runtime");
                return false;
            }
        };

        handle.spawn(worker_loop(
            Arc::clone(&self.shared),
            self.queue.clone(),
            Arc::clone(&self.delivery),
            self.poll_interval,
        ));

        self.shared.state.send_if_modified(|state| {
            if *state == WorkerState::Starting {
                *state = WorkerState::Running;
                true
            } else {
                false
            }
        });
        tracing::info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "Mail queue worker started");
        true
    }

    /// Requests a stop; the loop exits at its next iteration boundary.
    pub fn stop(&self) {
        let requested = self.shared.state.send_if_modified(|state| match *state {
            WorkerState::Starting | WorkerState::Running => {
                *state = WorkerState::StopRequested;
                true
            }
            WorkerState::StopRequested | WorkerState::Stopped => false,
        });
        if requested {
            self.shared.wake.notify_one();
            tracing::info!("Mail queue worker stop requested");
        }
    }

    /// Returns true while the loop is starting or running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), WorkerState::Starting | WorkerState::Running)
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    /// Number of pending emails.
    pub fn count(&self) -> usize {
        self.queue.count()
    }

    /// Resolves once the loop has exited.
    pub async fn wait_stopped(&self) {
        let mut receiver = self.shared.state.subscribe();
        let _ = receiver.wait_for(|state| *state == WorkerState::Stopped).await;
    }
}

impl<D: QueueDelivery> Drop for MailQueueManager<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn worker_loop<D: QueueDelivery>(
    shared: Arc<Shared>,
    queue: MailQueue,
    delivery: Arc<D>,
    poll_interval: Duration,
) {
    loop {
        if *shared.state.borrow() == WorkerState::StopRequested {
            break;
        }

        let Some(email) = queue.try_dequeue() else {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        };

        let subject = email.subject.clone();
        let recipient = email.first_recipient().unwrap_or_default().to_string();
        tracing::info!(subject = %subject, recipient = %recipient, "Start sending queued email");

        let timer = Timer::start("queued_delivery");
        let outcome = AssertUnwindSafe(delivery.deliver(email)).catch_unwind().await;
        let elapsed_ms = timer.stop().as_millis() as u64;

        match outcome {
            Ok(Ok(token)) => {
                tracing::info!(subject = %subject, recipient = %recipient, elapsed_ms, token = %token, "Finished sending queued email");
                if let Some(metrics) = delivery.metrics() {
                    metrics.record_queue_item(true);
                }
            }
            Ok(Err(error)) => {
                tracing::error!(subject = %subject, recipient = %recipient, elapsed_ms, error = %error, "Queued email dropped after failed delivery");
                if let Some(metrics) = delivery.metrics() {
                    metrics.record_queue_item(false);
                }
            }
            Err(panic) => {
                let fault = DispatchError::WorkerFault(panic_message(panic.as_ref()));
                tracing::error!(subject = %subject, elapsed_ms, error = %fault, "Mail queue worker terminated");
                if let Some(metrics) = delivery.metrics() {
                    metrics.record_queue_item(false);
                }
                break;
            }
        }
    }

    shared.state.send_replace(WorkerState::Stopped);
    tracing::info!(pending = queue.len(), "Mail queue worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "delivery panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<String>>,
        delay: Duration,
    }

    #[async_trait]
    impl QueueDelivery for Recorder {
        async fn deliver(&self, email: EmailBox) -> DispatchResult<String> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if email.subject == "panic" {
                panic!("boom");
            }
            self.delivered.lock().unwrap().push(email.subject.clone());
            if email.subject.starts_with("fail") {
                Err(DispatchError::configuration("no usable account"))
            } else {
                Ok("250 ok".to_string())
            }
        }
    }

    fn email(subject: &str) -> EmailBox {
        EmailBox::new(subject, "body").to("r@x.com")
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_drains_in_order_and_run_is_idempotent() {
        let queue = MailQueue::new();
        for subject in ["a", "b", "c"] {
            queue.enqueue(email(subject));
        }

        let manager = MailQueueManager::new(queue, Recorder::default(), Duration::from_millis(20));
        assert!(manager.run());
        assert!(!manager.run());
        assert!(manager.is_running());

        wait_until(|| manager.count() == 0).await;
        wait_until(|| manager.delivery.delivered.lock().unwrap().len() == 3).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*manager.delivery.delivered.lock().unwrap(), ["a", "b", "c"]);

        manager.stop();
        timeout(Duration::from_secs(1), manager.wait_stopped()).await.unwrap();
        assert_eq!(manager.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_wakes_sleeping_worker() {
        let manager = MailQueueManager::new(MailQueue::new(), Recorder::default(), Duration::from_secs(30));
        assert!(manager.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let requested = Instant::now();
        manager.stop();
        manager.stop();
        timeout(Duration::from_secs(2), manager.wait_stopped()).await.unwrap();
        assert!(requested.elapsed() < Duration::from_secs(2));
        assert!(!manager.is_running());

        assert!(manager.run());
        manager.stop();
        timeout(Duration::from_secs(2), manager.wait_stopped()).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_wakes_worker() {
        let manager = MailQueueManager::new(MailQueue::new(), Recorder::default(), Duration::from_secs(30));
        manager.run();
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.enqueue(email("late"));
        wait_until(|| manager.delivery.delivered.lock().unwrap().len() == 1).await;
        manager.stop();
    }

    #[tokio::test]
    async fn test_in_flight_send_completes_before_stop() {
        let recorder = Recorder {
            delay: Duration::from_millis(100),
            ..Recorder::default()
        };
        let queue = MailQueue::new();
        queue.enqueue(email("slow"));
        queue.enqueue(email("never"));

        let manager = MailQueueManager::new(queue, recorder, Duration::from_millis(10));
        manager.run();
        wait_until(|| manager.count() == 1).await;

        manager.stop();
        timeout(Duration::from_secs(2), manager.wait_stopped()).await.unwrap();
        assert_eq!(*manager.delivery.delivered.lock().unwrap(), ["slow"]);
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_dropped() {
        let queue = MailQueue::new();
        queue.enqueue(email("fail-1"));
        queue.enqueue(email("ok"));

        let manager = MailQueueManager::new(queue, Recorder::default(), Duration::from_millis(10));
        manager.run();
        wait_until(|| manager.delivery.delivered.lock().unwrap().len() == 2).await;
        assert_eq!(manager.count(), 0);
        assert!(manager.is_running());
        manager.stop();
    }

    #[tokio::test]
    async fn test_panic_is_a_worker_fault() {
        let queue = MailQueue::new();
        queue.enqueue(email("panic"));
        queue.enqueue(email("after"));

        let manager = MailQueueManager::new(queue, Recorder::default(), Duration::from_millis(10));
        manager.run();
        timeout(Duration::from_secs(2), manager.wait_stopped()).await.unwrap();

        assert_eq!(manager.state(), WorkerState::Stopped);
        assert_eq!(manager.count(), 1);
        assert!(manager.delivery.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_run_without_runtime() {
        let manager = MailQueueManager::new(MailQueue::new(), Recorder::default(), Duration::from_millis(10));
        assert!(!manager.run());
        assert_eq!(manager.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "delivery panicked");
    }
}
