//! Queued Dispatch Example
//!
//! This example demonstrates how to:
//! - Load mail settings from a JSON file (or build them in code)
//! - Start the background queue worker
//! - Enqueue emails, including an attachment, and stop the worker
//!
//! Usage:
//!   cargo run --example queue_dispatch [settings.json]
//!
//! Without a settings file the messages are rendered and discarded by a
//! null transport, so no SMTP server is needed. Set `RUST_LOG=debug` for
//! per-attempt logs.

use std::sync::Arc;
use std::time::Duration;

use integrations_mail_dispatch::{
    DispatchError, EmailBox, EmailSender, MailAccount, MailQueue, MailQueueManager, MailSettings,
    MemoryAttachment, NullMailTransport,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), DispatchError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let sender = match std::env::args().nth(1) {
        Some(path) => {
            println!("Loading settings from {}", path);
            EmailSender::new(MailSettings::from_json_file(path)?)
        }
        None => {
            println!("No settings file given; using the null transport");
            let settings = MailSettings::builder()
                .account(
                    MailAccount::new("primary", "smtp.example.com", "noreply@example.com")
                        .display_name("Example Notifications")
                        .default_account(true),
                )
                .account(MailAccount::new("backup", "smtp.backup.example.com", "noreply@backup.example.com"))
                .sleep_interval(Duration::from_millis(200))
                .build()?;
            EmailSender::with_transport(settings, Arc::new(NullMailTransport::new()))
        }
    };

    let queue = MailQueue::new();
    let manager = MailQueueManager::for_sender(queue.clone(), sender.clone());
    manager.run();

    manager.enqueue(EmailBox::new("Welcome", "<h1>Welcome aboard</h1>").to("new.user@example.com").html(true));
    manager.enqueue(
        EmailBox::new("Monthly report", "The report is attached.")
            .to("ops@example.com")
            .cc("audit@example.com")
            .attach(MemoryAttachment::new("report.csv", b"region,total\nnorth,42\n".to_vec())),
    );

    while manager.count() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Let the last delivery finish before stopping.
    tokio::time::sleep(Duration::from_millis(200)).await;

    manager.stop();
    manager.wait_stopped().await;

    let metrics = sender.metrics().snapshot();
    println!("Queue processed: {}", metrics.queue_processed);
    println!("Queue failed: {}", metrics.queue_failed);
    println!("Metrics: {}", metrics.to_json());

    Ok(())
}
