//! Ordered multi-account failover over a [`MailTransport`].
//!
//! Accounts are tried in the order given. Before each attempt the message
//! sender is swapped for the account identity; the first success wins and
//! every failure is kept, in order, for the aggregate error.

use crate::config::{MailAccount, MailSettings};
use crate::delivery::MailTransport;
use crate::errors::{AccountFailure, AggregateError, DispatchError, DispatchResult, SmtpResult};
use crate::observability::DispatchMetrics;
use crate::session::SessionParams;
use crate::types::MailMessage;

/// Failover executor borrowed from an [`EmailSender`](crate::EmailSender).
pub struct FailoverPolicy<'a> {
    transport: &'a dyn MailTransport,
    settings: &'a MailSettings,
    metrics: &'a DispatchMetrics,
}

impl<'a> FailoverPolicy<'a> {
    /// Creates a policy.
    pub fn new(
        transport: &'a dyn MailTransport,
        settings: &'a MailSettings,
        metrics: &'a DispatchMetrics,
    ) -> Self {
        Self {
            transport,
            settings,
            metrics,
        }
    }

    /// Delivers `message` through the first account that accepts it.
    ///
    /// An empty account list is a configuration error and performs no I/O.
    pub async fn deliver(
        &self,
        mut message: MailMessage,
        accounts: &[&MailAccount],
    ) -> DispatchResult<String> {
        if accounts.is_empty() {
            return Err(DispatchError::configuration("no usable account"));
        }

        let mut failures = Vec::with_capacity(accounts.len());

        for (index, account) in accounts.iter().enumerate() {
            let attempt = index + 1;
            self.metrics.record_account_attempt(attempt);

            if account.is_placeholder() {
                tracing::warn!(
                    account = %account.code,
                    host = %account.host,
                    "Sending through the placeholder account; configure real mail accounts"
                );
            }

            match self.attempt(&mut message, account).await {
                Ok(token) => {
                    tracing::info!(
                        account = %account.code,
                        host = %account.host,
                        attempt,
                        "Message delivered"
                    );
                    self.metrics.record_send_success();
                    return Ok(token);
                }
                Err(error) => {
                    tracing::warn!(
                        account = %account.code,
                        host = %account.host,
                        attempt,
                        remaining = accounts.len() - attempt,
                        stage = ?error.kind().stage(),
                        transient = error.is_retryable(),
                        error = %error,
                        "Delivery attempt failed"
                    );
                    self.metrics.record_account_failure();
                    failures.push(AccountFailure {
                        account: account.code.clone(),
                        host: account.host.clone(),
                        error,
                    });
                }
            }
        }

        self.metrics.record_send_failure();
        let aggregate = AggregateError::new(failures);
        tracing::error!(attempted = aggregate.attempted(), "Delivery failed on every account");
        Err(aggregate.into())
    }

    async fn attempt(&self, message: &mut MailMessage, account: &MailAccount) -> SmtpResult<String> {
        message.set_sender(account.sender()?);
        let params = SessionParams::for_account(account, self.settings);
        self.transport.send(message, &params).await
    }
}
