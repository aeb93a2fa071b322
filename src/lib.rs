//! # Mail Dispatch Integration Library
//!
//! Multi-account outbound email with:
//! - Ordered failover across configured sender accounts
//! - Per-attempt sender identity swap and aggregated failures
//! - A background delivery queue with start/stop lifecycle
//! - An async SMTP transport (STARTTLS, implicit TLS, PLAIN/LOGIN/CRAM-MD5)
//! - MIME rendering with RFC 2231 attachment names
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_mail_dispatch::{EmailBox, EmailSender, MailAccount, MailQueue, MailQueueManager, MailSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = MailSettings::builder()
//!         .account(
//!             MailAccount::new("primary", "smtp.example.com", "noreply@example.com")
//!                 .port(587)
//!                 .credentials("noreply@example.com", "password")
//!                 .default_account(true),
//!         )
//!         .account(
//!             MailAccount::new("backup", "smtp.backup.example.com", "noreply@backup.example.com")
//!                 .port(465)
//!                 .use_tls(true),
//!         )
//!         .build()?;
//!
//!     let sender = EmailSender::new(settings);
//!
//!     // Direct send with failover
//!     let token = sender.send("user@example.com", "Hello", "<p>Hi!</p>", true).await?;
//!     println!("Accepted: {}", token);
//!
//!     // Queued send
//!     let queue = MailQueue::new();
//!     let manager = MailQueueManager::for_sender(queue.clone(), sender);
//!     manager.run();
//!     queue.enqueue(EmailBox::new("Report", "Attached").to("ops@example.com"));
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;
pub mod attachment;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;
pub mod session;

// Authentication
pub mod auth;

// MIME encoding
pub mod mime;

// Delivery engine
pub mod delivery;
pub mod registry;
pub mod failover;
pub mod sender;

// Queue
pub mod queue;
pub mod worker;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use attachment::{Attachment, FileAttachment, MemoryAttachment};
pub use config::{MailAccount, MailSettings, MailSettingsBuilder, TlsMode, TlsSettings};
pub use delivery::{MailTransport, NullMailTransport, SmtpMailTransport};
pub use errors::{
    AccountFailure, AggregateError, DispatchError, DispatchResult, ErrorStage, SmtpError, SmtpErrorKind, SmtpResult,
};
pub use failover::FailoverPolicy;
pub use observability::{DispatchMetrics, MetricsSnapshot};
pub use queue::MailQueue;
pub use registry::AccountRegistry;
pub use sender::{build_message, BlockingEmailSender, EmailSender, ExplicitAccount, SendOptions};
pub use session::SessionParams;
pub use types::{Address, AlternateView, EmailBox, LinkedResource, MailMessage, Priority};
pub use worker::{MailQueueManager, QueueDelivery, WorkerState};
