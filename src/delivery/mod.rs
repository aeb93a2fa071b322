//! Single-attempt delivery: one message through one SMTP server.
//!
//! [`MailTransport`] is the seam the failover engine is composed over.
//! [`SmtpMailTransport`] renders the message and runs a real session;
//! [`NullMailTransport`] accepts everything without touching the network.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::SmtpResult;
use crate::mime::MimeEncoder;
use crate::session::{self, Envelope, SessionParams};
use crate::transport::TcpTransport;
use crate::types::MailMessage;

/// Delivers one message over one connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Sends `message` to the server described by `params` and returns the
    /// server's final reply.
    async fn send(&self, message: &MailMessage, params: &SessionParams) -> SmtpResult<String>;
}

/// SMTP-backed transport; opens a fresh connection per call.
#[derive(Debug, Clone, Default)]
pub struct SmtpMailTransport;

impl SmtpMailTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, message: &MailMessage, params: &SessionParams) -> SmtpResult<String> {
        let envelope = Envelope::from_message(message)?;

        let domain = match envelope.from.domain() {
            "" => params.client_id.clone(),
            domain => domain.to_string(),
        };
        let content = MimeEncoder::new(domain).encode(message)?;

        tracing::debug!(
            host = %params.host,
            port = params.port,
            tls = ?params.tls_mode,
            recipients = envelope.recipients.len(),
            bytes = content.len(),
            "Opening SMTP session"
        );

        let mut transport =
            TcpTransport::connect(&params.host, params.port, params.tls_mode, &params.options).await?;
        session::deliver(&mut transport, params, &envelope, &content).await
    }
}

/// Transport that discards messages and reports success.
#[derive(Debug, Default)]
pub struct NullMailTransport {
    sent: AtomicU64,
}

impl NullMailTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages accepted so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MailTransport for NullMailTransport {
    async fn send(&self, message: &MailMessage, params: &SessionParams) -> SmtpResult<String> {
        // Render anyway so encoding problems surface in dry runs.
        let envelope = Envelope::from_message(message)?;
        let content = MimeEncoder::new(params.client_id.clone()).encode(message)?;

        let id = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            host = %params.host,
            recipients = envelope.recipients.len(),
            bytes = content.len(),
            "Message discarded by null transport"
        );

        Ok(format!("250 2.0.0 Ok: discarded as NULL{}", id))
    }
}
