use std::sync::Arc;
use std::time::{Duration, Instant};

use integrations_mail_dispatch::mocks::{test_account, ScriptedMailTransport};
use integrations_mail_dispatch::{
    EmailBox, EmailSender, MailQueue, MailQueueManager, MailSettings, SmtpErrorKind, WorkerState,
};
use tokio::time::timeout;

fn settings(poll: Duration) -> MailSettings {
    MailSettings::builder()
        .account(test_account("primary").default_account(true))
        .account(test_account("backup"))
        .sleep_interval(poll)
        .build()
        .unwrap()
}

fn manager(transport: &ScriptedMailTransport, poll: Duration) -> (MailQueue, MailQueueManager) {
    let queue = MailQueue::new();
    let sender = EmailSender::with_transport(settings(poll), Arc::new(transport.clone()));
    let manager = MailQueueManager::for_sender(queue.clone(), sender);
    (queue, manager)
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

fn subjects(transport: &ScriptedMailTransport) -> Vec<String> {
    transport.attempts().into_iter().map(|a| a.message.subject).collect()
}

#[tokio::test]
async fn queued_emails_are_delivered_in_order() {
    let transport = ScriptedMailTransport::new();
    let (queue, manager) = manager(&transport, Duration::from_millis(20));

    for subject in ["first", "second", "third"] {
        queue.enqueue(EmailBox::new(subject, "body").to("rcpt@x.com"));
    }
    assert!(manager.run());
    assert!(!manager.run());

    wait_until(|| transport.attempts().len() == 3).await;
    assert_eq!(subjects(&transport), ["first", "second", "third"]);
    assert!(manager.queue().is_empty());

    manager.stop();
    timeout(Duration::from_secs(1), manager.wait_stopped()).await.unwrap();
    assert_eq!(manager.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn failed_email_is_dropped_and_worker_continues() {
    let transport = ScriptedMailTransport::new()
        .fail_host("smtp.primary.test", SmtpErrorKind::ConnectionRefused)
        .fail_host("smtp.backup.test", SmtpErrorKind::ConnectionRefused);
    let (queue, manager) = manager(&transport, Duration::from_millis(20));

    queue.enqueue(EmailBox::new("doomed", "body").to("rcpt@x.com"));
    queue.enqueue(EmailBox::new("invalid", "body").to("not-an-address"));
    manager.run();

    wait_until(|| transport.attempts().len() == 2 && manager.count() == 0).await;
    assert_eq!(transport.attempted_hosts(), ["smtp.primary.test", "smtp.backup.test"]);
    assert!(manager.is_running());

    manager.stop();
    timeout(Duration::from_secs(1), manager.wait_stopped()).await.unwrap();
}

#[tokio::test]
async fn stop_interrupts_long_poll_interval() {
    let transport = ScriptedMailTransport::new();
    let (_queue, manager) = manager(&transport, Duration::from_secs(60));

    manager.run();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let requested = Instant::now();
    manager.stop();
    timeout(Duration::from_secs(2), manager.wait_stopped()).await.unwrap();
    assert!(requested.elapsed() < Duration::from_secs(2));
    assert!(!manager.is_running());
}

#[tokio::test]
async fn emails_enqueued_while_running_are_picked_up() {
    let transport = ScriptedMailTransport::new();
    let (_queue, manager) = manager(&transport, Duration::from_secs(60));

    manager.run();
    tokio::time::sleep(Duration::from_millis(30)).await;
    manager.enqueue(EmailBox::new("late", "body").to("rcpt@x.com"));

    wait_until(|| transport.attempts().len() == 1).await;
    assert_eq!(subjects(&transport), ["late"]);
    manager.stop();
}

#[tokio::test]
async fn in_flight_delivery_finishes_after_stop() {
    let transport = ScriptedMailTransport::new().with_delay(Duration::from_millis(150));
    let (queue, manager) = manager(&transport, Duration::from_millis(10));

    queue.enqueue(EmailBox::new("slow", "body").to("rcpt@x.com"));
    queue.enqueue(EmailBox::new("left", "body").to("rcpt@x.com"));
    manager.run();
    wait_until(|| manager.count() == 1).await;

    manager.stop();
    assert_eq!(manager.state(), WorkerState::StopRequested);
    timeout(Duration::from_secs(2), manager.wait_stopped()).await.unwrap();

    assert_eq!(subjects(&transport), ["slow"]);
    assert_eq!(manager.count(), 1);

    assert!(manager.run());
    wait_until(|| manager.count() == 0).await;
    wait_until(|| transport.attempts().len() == 2).await;
    manager.stop();
}

#[tokio::test]
async fn queue_outcomes_are_counted() {
    let transport = ScriptedMailTransport::new();
    let queue = MailQueue::new();
    let sender = EmailSender::with_transport(settings(Duration::from_millis(10)), Arc::new(transport.clone()));
    let manager = MailQueueManager::for_sender(queue.clone(), sender.clone());

    queue.enqueue(EmailBox::new("ok", "body").to("rcpt@x.com"));
    queue.enqueue(EmailBox::new("bad", "body"));
    manager.run();

    wait_until(|| {
        let snapshot = sender.metrics().snapshot();
        snapshot.queue_processed + snapshot.queue_failed == 2
    })
    .await;
    let snapshot = sender.metrics().snapshot();
    assert_eq!(snapshot.queue_processed, 1);
    assert_eq!(snapshot.queue_failed, 1);
    manager.stop();
}
