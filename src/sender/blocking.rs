use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use super::{EmailSender, ExplicitAccount, SendOptions};
use crate::config::{MailAccount, MailSettings};
use crate::delivery::MailTransport;
use crate::errors::{DispatchError, DispatchResult};
use crate::types::{EmailBox, MailMessage};

/// Synchronous facade over [`EmailSender`].
///
/// Each call drives the async engine on a private current-thread runtime.
/// Calling it from inside an async runtime panics; use [`EmailSender`] there.
#[derive(Debug)]
pub struct BlockingEmailSender {
    inner: EmailSender,
    runtime: Runtime,
}

impl BlockingEmailSender {
    /// Creates a blocking sender that delivers over SMTP.
    pub fn new(settings: MailSettings) -> DispatchResult<Self> {
        Self::from_async(EmailSender::new(settings))
    }

    /// Creates a blocking sender over a custom transport.
    pub fn with_transport(settings: MailSettings, transport: Arc<dyn MailTransport>) -> DispatchResult<Self> {
        Self::from_async(EmailSender::with_transport(settings, transport))
    }

    /// Wraps an existing async sender.
    pub fn from_async(inner: EmailSender) -> DispatchResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DispatchError::configuration(format!("cannot start runtime: {}", e)))?;
        Ok(Self { inner, runtime })
    }

    /// Returns the async sender.
    pub fn inner(&self) -> &EmailSender {
        &self.inner
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// See [`EmailSender::send`].
    pub fn send(&self, to: &str, subject: &str, body: &str, is_html: bool) -> DispatchResult<String> {
        self.block_on(self.inner.send(to, subject, body, is_html))
    }

    /// See [`EmailSender::send_from`].
    pub fn send_from(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        is_html: bool,
    ) -> DispatchResult<String> {
        self.block_on(self.inner.send_from(from, to, subject, body, is_html))
    }

    /// See [`EmailSender::send_box`].
    pub fn send_box(&self, email: EmailBox) -> DispatchResult<String> {
        self.block_on(self.inner.send_box(email))
    }

    /// See [`EmailSender::send_message`].
    pub fn send_message(&self, message: MailMessage, normalize: bool) -> DispatchResult<String> {
        self.block_on(self.inner.send_message(message, normalize))
    }

    /// See [`EmailSender::send_with_failover`].
    pub fn send_with_failover(&self, message: MailMessage) -> DispatchResult<String> {
        self.block_on(self.inner.send_with_failover(message))
    }

    /// See [`EmailSender::send_explicit`].
    pub fn send_explicit(
        &self,
        message: MailMessage,
        account: &ExplicitAccount,
        options: SendOptions,
    ) -> DispatchResult<String> {
        self.block_on(self.inner.send_explicit(message, account, options))
    }

    /// See [`EmailSender::send_to_restricted_accounts`].
    pub fn send_to_restricted_accounts(
        &self,
        message: MailMessage,
        candidates: &[&MailAccount],
        normalize: bool,
    ) -> DispatchResult<String> {
        self.block_on(self.inner.send_to_restricted_accounts(message, candidates, normalize))
    }

    /// See [`EmailSender::send_routed`].
    pub fn send_routed(&self, message: MailMessage, normalize: bool) -> DispatchResult<String> {
        self.block_on(self.inner.send_routed(message, normalize))
    }

    /// See [`EmailSender::normalize`].
    pub fn normalize(&self, message: &mut MailMessage) {
        self.inner.normalize(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::NullMailTransport;

    fn sender(transport: Arc<NullMailTransport>) -> BlockingEmailSender {
        let settings = MailSettings::builder()
            .account(MailAccount::new("a", "smtp.a.test", "a@test.com"))
            .account(MailAccount::new("b", "smtp.b.test", "b@test.com"))
            .build()
            .unwrap();
        BlockingEmailSender::with_transport(settings, transport).unwrap()
    }

    #[test]
    fn test_blocking_send() {
        let transport = Arc::new(NullMailTransport::new());
        let sender = sender(Arc::clone(&transport));

        let token = sender.send("r@x.com", "Hello", "<b>hi</b>", true).unwrap();
        assert!(token.starts_with("250"));
        assert_eq!(transport.sent(), 1);
        assert_eq!(sender.inner().metrics().snapshot().sends_succeeded, 1);
    }

    #[test]
    fn test_blocking_restricted_accounts() {
        let transport = Arc::new(NullMailTransport::new());
        let sender = sender(Arc::clone(&transport));

        let b = sender.inner().registry().find_by_code("b").unwrap().clone();
        let message = crate::sender::build_message(EmailBox::new("s", "b").to("r@x.com")).unwrap();
        sender.send_to_restricted_accounts(message, &[&b], true).unwrap();
        assert_eq!(transport.sent(), 1);
    }

    #[test]
    fn test_blocking_address_error() {
        let sender = sender(Arc::new(NullMailTransport::new()));
        let err = sender.send("bad address", "s", "b", false).unwrap_err();
        assert!(matches!(err, DispatchError::Address { .. }));
    }
}
