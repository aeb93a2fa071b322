//! The delivery engine: turns logical emails into transport messages and
//! sends them through the configured accounts.

mod blocking;

pub use blocking::BlockingEmailSender;

use secrecy::SecretString;
use std::fmt;
use std::sync::Arc;

use crate::attachment::materialize;
use crate::config::{MailAccount, MailSettings};
use crate::delivery::{MailTransport, SmtpMailTransport};
use crate::errors::{DispatchError, DispatchResult, SmtpError, SmtpErrorKind};
use crate::failover::FailoverPolicy;
use crate::mime::check_message;
use crate::observability::DispatchMetrics;
use crate::registry::AccountRegistry;
use crate::session::SessionParams;
use crate::types::{parse_address_list, Address, EmailBox, MailMessage};

/// Caller-supplied connection for a one-off send.
#[derive(Debug, Clone)]
pub struct ExplicitAccount {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    pub port: u16,
    /// Authentication user name; empty skips AUTH.
    pub user_name: String,
    /// Authentication password.
    pub password: SecretString,
    /// Connect with implicit TLS.
    pub use_tls: bool,
}

impl ExplicitAccount {
    /// Creates an unauthenticated STARTTLS connection description.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user_name: String::new(),
            password: SecretString::new(String::new()),
            use_tls: false,
        }
    }

    /// Sets the credentials.
    pub fn credentials(mut self, user_name: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self.password = SecretString::new(password.into());
        self
    }

    /// Sets implicit TLS.
    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }
}

/// Options for [`EmailSender::send_explicit`].
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Normalize the message before sending.
    pub normalize: bool,
    /// Fall back to configured-account failover if the explicit attempt fails.
    pub fallback: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            normalize: true,
            fallback: false,
        }
    }
}

/// Multi-account email sender.
///
/// Cloning is cheap; clones share settings, transport and metrics.
#[derive(Clone)]
pub struct EmailSender {
    settings: Arc<MailSettings>,
    registry: Arc<AccountRegistry>,
    transport: Arc<dyn MailTransport>,
    metrics: Arc<DispatchMetrics>,
}

impl fmt::Debug for EmailSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailSender")
            .field("accounts", &self.registry.records().len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl EmailSender {
    /// Creates a sender that delivers over SMTP.
    pub fn new(settings: MailSettings) -> Self {
        Self::with_transport(settings, Arc::new(SmtpMailTransport::new()))
    }

    /// Creates a sender over a custom transport.
    pub fn with_transport(settings: MailSettings, transport: Arc<dyn MailTransport>) -> Self {
        let registry = AccountRegistry::new(settings.data.clone());
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            transport,
            metrics: Arc::new(DispatchMetrics::new()),
        }
    }

    /// Returns the settings.
    pub fn settings(&self) -> &MailSettings {
        &self.settings
    }

    /// Returns the account registry.
    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    /// Returns the metrics.
    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    fn failover(&self) -> FailoverPolicy<'_> {
        FailoverPolicy::new(self.transport.as_ref(), &self.settings, &self.metrics)
    }

    /// Sends a message to `to` (a delimited address list).
    pub async fn send(&self, to: &str, subject: &str, body: &str, is_html: bool) -> DispatchResult<String> {
        self.send_box(EmailBox::new(subject, body).to(to).html(is_html)).await
    }

    /// Sends a message with an explicit sender for normalization.
    ///
    /// Failover still replaces the sender with each account's identity.
    pub async fn send_from(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        is_html: bool,
    ) -> DispatchResult<String> {
        let mut message = build_message(EmailBox::new(subject, body).to(to).html(is_html))?;
        let sender = Address::parse(from).map_err(|e| DispatchError::address(from, e))?;
        message.set_sender(sender);
        self.send_message(message, true).await
    }

    /// Sends a logical email.
    pub async fn send_box(&self, email: EmailBox) -> DispatchResult<String> {
        let message = build_message(email)?;
        self.send_message(message, true).await
    }

    /// Sends a transport message through every enabled account in order.
    pub async fn send_message(&self, mut message: MailMessage, normalize: bool) -> DispatchResult<String> {
        if normalize {
            self.normalize(&mut message);
        }
        self.send_with_failover(message).await
    }

    /// Runs failover over every enabled account without normalizing.
    pub async fn send_with_failover(&self, message: MailMessage) -> DispatchResult<String> {
        ensure_sendable(&message)?;
        let accounts = self.registry.find_all_enabled();
        self.failover().deliver(message, &accounts).await
    }

    /// Sends once through a caller-supplied server.
    ///
    /// With `options.fallback` a failure is logged, the sender is cleared and
    /// configured-account failover runs once.
    pub async fn send_explicit(
        &self,
        mut message: MailMessage,
        account: &ExplicitAccount,
        options: SendOptions,
    ) -> DispatchResult<String> {
        if options.normalize {
            self.normalize(&mut message);
        }
        ensure_sendable(&message)?;
        if message.from.is_none() {
            return Err(DispatchError::Message(SmtpError::message_error(
                SmtpErrorKind::InvalidFromAddress,
                "Message has no sender",
            )));
        }

        let params = SessionParams::new(
            &account.host,
            account.port,
            account.use_tls,
            &account.user_name,
            &account.password,
            &self.settings,
        );

        self.metrics.record_account_attempt(1);
        match self.transport.send(&message, &params).await {
            Ok(token) => {
                tracing::info!(host = %params.host, "Message delivered through explicit account");
                self.metrics.record_send_success();
                Ok(token)
            }
            Err(error) => {
                self.metrics.record_account_failure();
                if !options.fallback {
                    self.metrics.record_send_failure();
                    return Err(error.into());
                }

                tracing::warn!(
                    host = %params.host,
                    error = %error,
                    "Explicit account failed; falling back to configured accounts"
                );
                message.clear_sender();
                self.send_with_failover(message).await
            }
        }
    }

    /// Runs failover over `candidates` only; an empty list means every
    /// enabled account.
    pub async fn send_to_restricted_accounts(
        &self,
        mut message: MailMessage,
        candidates: &[&MailAccount],
        normalize: bool,
    ) -> DispatchResult<String> {
        if candidates.is_empty() {
            return self.send_message(message, normalize).await;
        }

        if normalize {
            self.normalize(&mut message);
        }
        ensure_sendable(&message)?;
        self.failover().deliver(message, candidates).await
    }

    /// Sends through the accounts serving the first primary recipient's
    /// domain, or every enabled account when none does.
    pub async fn send_routed(&self, message: MailMessage, normalize: bool) -> DispatchResult<String> {
        let candidates = match message.to.first() {
            Some(recipient) => self.registry.find_for_recipient(recipient),
            None => Vec::new(),
        };

        tracing::debug!(
            recipient = message.to.first().map(Address::email).unwrap_or(""),
            candidates = candidates.len(),
            "Routing by recipient domain"
        );
        self.send_to_restricted_accounts(message, &candidates, normalize).await
    }

    /// Fills in what a transport needs but a caller may omit.
    ///
    /// An unset sender gets the default account identity; unset encodings
    /// become UTF-8. Running it twice changes nothing.
    pub fn normalize(&self, message: &mut MailMessage) {
        if message.from.is_none() {
            match self.registry.find_default().map(|account| (account, account.sender())) {
                Ok((_, Ok(sender))) => message.set_sender(sender),
                Ok((account, Err(error))) => tracing::warn!(
                    account = %account.code,
                    error = %error,
                    "Default account has an unusable sender address"
                ),
                Err(error) => tracing::debug!(error = %error, "No default account for normalization"),
            }
        }

        message.headers_encoding.get_or_insert(encoding_rs::UTF_8);
        message.subject_encoding.get_or_insert(encoding_rs::UTF_8);
        message.body_encoding.get_or_insert(encoding_rs::UTF_8);
    }
}

fn ensure_recipients(message: &MailMessage) -> DispatchResult<()> {
    if message.has_recipients() {
        Ok(())
    } else {
        Err(DispatchError::no_recipients())
    }
}

/// Rejects mistakes that would fail identically on every account.
fn ensure_sendable(message: &MailMessage) -> DispatchResult<()> {
    ensure_recipients(message)?;
    check_message(message).map_err(DispatchError::Message)
}

fn parse_entries(entries: &[String]) -> DispatchResult<Vec<Address>> {
    let mut addresses = Vec::new();
    for entry in entries {
        let parsed = parse_address_list(entry).map_err(|e| DispatchError::address(entry, e))?;
        addresses.extend(parsed);
    }
    Ok(addresses)
}

/// Converts a logical email into a transport message.
///
/// Addresses are parsed (any malformed entry fails the whole message) and
/// attachment streams are read fully.
pub fn build_message(email: EmailBox) -> DispatchResult<MailMessage> {
    let EmailBox {
        subject,
        body,
        is_body_html,
        to,
        cc,
        bcc,
        attachments,
        priority,
    } = email;

    let mut message = MailMessage {
        to: parse_entries(&to)?,
        cc: parse_entries(&cc)?,
        bcc: parse_entries(&bcc)?,
        subject,
        body,
        is_body_html,
        priority,
        ..MailMessage::default()
    };
    ensure_recipients(&message)?;

    for mut attachment in attachments {
        message.attachments.push(materialize(attachment.as_mut())?);
    }

    Ok(message)
}
