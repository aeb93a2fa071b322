//! One SMTP session: greeting, TLS negotiation, AUTH and a single mail
//! transaction, closed with QUIT on every path.

use secrecy::SecretString;

use crate::auth::{self, Authenticator, Credentials};
use crate::config::{MailAccount, MailSettings, TlsMode};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::mime::MimeEncoder;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, TransactionState};
use crate::transport::{SmtpTransport, TransportOptions};
use crate::types::{Address, MailMessage};

/// Connection parameters for one account.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    pub port: u16,
    /// TLS mode for the connection.
    pub tls_mode: TlsMode,
    /// Credentials; `None` skips AUTH.
    pub credentials: Option<Credentials>,
    /// EHLO identifier.
    pub client_id: String,
    /// Timeouts and trust settings.
    pub options: TransportOptions,
}

impl SessionParams {
    /// Builds parameters from raw connection values and the global settings.
    ///
    /// The global TLS mode wins over `use_tls`. No credentials are attached
    /// when ambient credentials are configured or the user name is empty.
    pub fn new(
        host: &str,
        port: u16,
        use_tls: bool,
        user_name: &str,
        password: &SecretString,
        settings: &MailSettings,
    ) -> Self {
        let credentials = if settings.use_default_credentials || user_name.trim().is_empty() {
            None
        } else {
            Some(Credentials::new(
                settings.scoped_user_name(user_name.trim()),
                password.clone(),
            ))
        };

        Self {
            host: host.trim().to_string(),
            port,
            tls_mode: settings.tls_mode_for(use_tls),
            credentials,
            client_id: settings.client_id().to_string(),
            options: TransportOptions {
                connect_timeout: settings.connect_timeout,
                command_timeout: settings.command_timeout,
                ca_cert_path: settings.tls.ca_cert_path.clone(),
            },
        }
    }

    /// Builds parameters for a configured account.
    pub fn for_account(account: &MailAccount, settings: &MailSettings) -> Self {
        Self::new(
            &account.host,
            account.port,
            account.use_tls,
            &account.user_name,
            &account.password,
            settings,
        )
    }

    /// `host:port` label for logs and errors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Envelope sender and recipients.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// MAIL FROM address.
    pub from: Address,
    /// RCPT TO addresses (To, Cc and Bcc).
    pub recipients: Vec<Address>,
}

impl Envelope {
    /// Derives the envelope from a message.
    pub fn from_message(message: &MailMessage) -> SmtpResult<Self> {
        let from = message.from.clone().ok_or_else(|| {
            SmtpError::message_error(SmtpErrorKind::InvalidFromAddress, "Message has no sender")
        })?;

        let recipients: Vec<Address> = message.all_recipients().cloned().collect();
        if recipients.is_empty() {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidRecipientAddress,
                "Message has no recipients",
            ));
        }

        Ok(Self { from, recipients })
    }
}

/// Runs a full session and returns the server's final reply as a token.
///
/// QUIT is sent whether or not the transaction succeeded.
pub async fn deliver<T: SmtpTransport + ?Sized>(
    transport: &mut T,
    params: &SessionParams,
    envelope: &Envelope,
    content: &[u8],
) -> SmtpResult<String> {
    let mut session = Session {
        transport,
        params,
        state: TransactionState::Connected,
    };

    let result = session.run(envelope, content).await;
    if let Err(error) = &result {
        tracing::debug!(host = %params.host, state = ?session.state, error = %error, "Session aborted");
    }
    let _ = session.transport.close().await;
    result
}

struct Session<'a, T: SmtpTransport + ?Sized> {
    transport: &'a mut T,
    params: &'a SessionParams,
    state: TransactionState,
}

impl<'a, T: SmtpTransport + ?Sized> Session<'a, T> {
    async fn run(&mut self, envelope: &Envelope, content: &[u8]) -> SmtpResult<String> {
        let mut capabilities = self.greet().await?;

        if !self.transport.is_tls()
            && matches!(self.params.tls_mode, TlsMode::StartTls | TlsMode::StartTlsRequired)
        {
            if capabilities.starttls {
                self.transport
                    .send_command(&SmtpCommand::StartTls)
                    .await?
                    .into_success()?;
                self.transport.upgrade_tls(&self.params.host).await?;
                capabilities = self.greet().await?;
            } else if self.params.tls_mode == TlsMode::StartTlsRequired {
                return Err(SmtpError::new(
                    SmtpErrorKind::StarttlsNotSupported,
                    format!("{} does not support STARTTLS", self.params.host),
                ));
            }
        }

        if let Some(credentials) = self.params.credentials.as_ref() {
            let method = Authenticator::select_best_method(
                &capabilities.auth_methods(),
                self.transport.is_tls(),
                self.params.tls_mode == TlsMode::None,
            )?;
            auth::authenticate(&mut *self.transport, method, credentials).await?;
            self.state = TransactionState::Authenticated;
            tracing::debug!(host = %self.params.host, method = %method, "Authenticated");
        }

        if let Some(max) = capabilities.size {
            if content.len() > max {
                return Err(SmtpError::message_error(
                    SmtpErrorKind::MessageTooLarge,
                    format!("Message of {} bytes exceeds server limit of {}", content.len(), max),
                ));
            }
        }

        self.transaction(envelope, content, &capabilities).await
    }

    /// EHLO, falling back to HELO.
    async fn greet(&mut self) -> SmtpResult<EsmtpCapabilities> {
        let client_id = self.params.client_id.clone();
        let response = self
            .transport
            .send_command(&SmtpCommand::Ehlo(client_id.clone()))
            .await?;

        let capabilities = if response.is_success() {
            EsmtpCapabilities::from_ehlo_response(&response)
        } else {
            self.transport
                .send_command(&SmtpCommand::Helo(client_id))
                .await?
                .into_success()?;
            EsmtpCapabilities::default()
        };

        self.state = TransactionState::Greeted;
        Ok(capabilities)
    }

    async fn transaction(
        &mut self,
        envelope: &Envelope,
        content: &[u8],
        capabilities: &EsmtpCapabilities,
    ) -> SmtpResult<String> {
        let mail_from = SmtpCommand::MailFrom {
            address: envelope.from.to_smtp(),
            size: capabilities.size.map(|_| content.len()),
            body_8bit: capabilities.eight_bit_mime,
        };
        self.transport.send_command(&mail_from).await?.into_success()?;
        self.state = TransactionState::InTransaction;

        for recipient in &envelope.recipients {
            let rcpt_to = SmtpCommand::RcptTo {
                address: recipient.to_smtp(),
            };
            let response = self.transport.send_command(&rcpt_to).await?;
            if !response.is_success() {
                let _ = self.transport.send_command(&SmtpCommand::Rset).await;
                let error = response.to_error();
                return Err(SmtpError::new(
                    error.kind(),
                    format!("Recipient {} rejected: {}", recipient.email(), response.full_message()),
                )
                .with_smtp_code(response.code));
            }
        }
        self.state = TransactionState::RecipientsAdded;

        let response = self.transport.send_command(&SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            return Err(response.to_error());
        }
        self.state = TransactionState::SendingData;

        self.transport
            .send_data(&MimeEncoder::prepare_data_content(content))
            .await?;

        let response = self.transport.read_response().await?.into_success()?;
        self.state = TransactionState::Complete;

        tracing::debug!(host = %self.params.host, state = ?self.state, reply = %response, "Message accepted");
        Ok(response.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockTransport;
    use crate::protocol::SmtpResponse;
    use secrecy::ExposeSecret;

    fn params(tls_mode: TlsMode, credentials: Option<Credentials>) -> SessionParams {
        SessionParams {
            host: "smtp.test".to_string(),
            port: 587,
            tls_mode,
            credentials,
            client_id: "client.test".to_string(),
            options: TransportOptions::default(),
        }
    }

    fn envelope() -> Envelope {
        Envelope {
            from: Address::new("sender@test.com").unwrap(),
            recipients: vec![
                Address::new("a@test.com").unwrap(),
                Address::new("b@test.com").unwrap(),
            ],
        }
    }

    fn ehlo(lines: &[&str]) -> SmtpResponse {
        let mut all = vec!["smtp.test"];
        all.extend_from_slice(lines);
        SmtpResponse::multiline(250, all)
    }

    #[tokio::test]
    async fn test_plain_session_without_auth() {
        let mut transport = MockTransport::new();
        transport.queue_response(ehlo(&["SIZE 1000", "8BITMIME"]));
        transport.queue_response(SmtpResponse::new(250, "sender ok"));
        transport.queue_response(SmtpResponse::new(250, "rcpt ok"));
        transport.queue_response(SmtpResponse::new(250, "rcpt ok"));
        transport.queue_response(SmtpResponse::new(354, "go ahead"));
        transport.queue_response(SmtpResponse::new(250, "2.0.0 Ok: queued as ABC"));

        let token = deliver(&mut transport, &params(TlsMode::None, None), &envelope(), b"Subject: x\r\n\r\nbody")
            .await
            .unwrap();
        assert_eq!(token, "250 2.0.0 Ok: queued as ABC");

        let commands = transport.sent_commands();
        assert_eq!(commands[0], "EHLO client.test");
        assert_eq!(commands[1], "MAIL FROM:<sender@test.com> SIZE=18 BODY=8BITMIME");
        assert_eq!(commands[2], "RCPT TO:<a@test.com>");
        assert_eq!(commands[3], "RCPT TO:<b@test.com>");
        assert_eq!(commands[4], "DATA");
        assert_eq!(commands.last().map(String::as_str), Some("QUIT"));
        assert!(transport.received_data()[0].ends_with(b"\r\n.\r\n"));
    }

    #[tokio::test]
    async fn test_starttls_then_auth() {
        let mut transport = MockTransport::new();
        transport.queue_response(ehlo(&["STARTTLS"]));
        transport.queue_response(SmtpResponse::new(220, "ready for tls"));
        transport.queue_response(ehlo(&["AUTH PLAIN LOGIN"]));
        transport.queue_response(SmtpResponse::new(235, "ok"));
        transport.queue_response(SmtpResponse::new(250, "ok"));
        transport.queue_response(SmtpResponse::new(250, "ok"));
        transport.queue_response(SmtpResponse::new(250, "ok"));
        transport.queue_response(SmtpResponse::new(354, "go"));
        transport.queue_response(SmtpResponse::new(250, "queued"));

        let credentials = Credentials::new("user", SecretString::new("pw".to_string()));
        let token = deliver(
            &mut transport,
            &params(TlsMode::StartTls, Some(credentials)),
            &envelope(),
            b"body",
        )
        .await
        .unwrap();

        assert_eq!(token, "250 queued");
        assert_eq!(transport.tls_upgrades(), 1);
        let commands = transport.sent_commands();
        assert_eq!(commands[1], "STARTTLS");
        assert_eq!(commands[2], "EHLO client.test");
        assert_eq!(commands[3], "AUTH PLAIN ****");
    }

    #[tokio::test]
    async fn test_starttls_required_but_missing() {
        let mut transport = MockTransport::new();
        transport.queue_response(ehlo(&["8BITMIME"]));

        let err = deliver(&mut transport, &params(TlsMode::StartTlsRequired, None), &envelope(), b"body")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::StarttlsNotSupported);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_recipient_resets() {
        let mut transport = MockTransport::new();
        transport.queue_response(ehlo(&[]));
        transport.queue_response(SmtpResponse::new(250, "ok"));
        transport.queue_response(SmtpResponse::new(250, "ok"));
        transport.queue_response(SmtpResponse::new(550, "5.1.1 No such user"));
        transport.queue_response(SmtpResponse::new(250, "reset"));

        let err = deliver(&mut transport, &params(TlsMode::None, None), &envelope(), b"body")
            .await
            .unwrap_err();
        assert_eq!(err.smtp_code(), Some(550));
        assert!(err.message().contains("b@test.com"));

        let commands = transport.sent_commands();
        assert!(commands.contains(&"RSET".to_string()));
        assert!(!commands.contains(&"DATA".to_string()));
    }

    #[tokio::test]
    async fn test_helo_fallback() {
        let mut transport = MockTransport::new();
        transport.queue_response(SmtpResponse::new(502, "not implemented"));
        transport.queue_response(SmtpResponse::new(250, "hello"));
        transport.queue_response(SmtpResponse::new(250, "ok"));
        transport.queue_response(SmtpResponse::new(250, "ok"));
        transport.queue_response(SmtpResponse::new(250, "ok"));
        transport.queue_response(SmtpResponse::new(354, "go"));
        transport.queue_response(SmtpResponse::new(250, "done"));

        deliver(&mut transport, &params(TlsMode::None, None), &envelope(), b"x")
            .await
            .unwrap();
        let commands = transport.sent_commands();
        assert_eq!(commands[1], "HELO client.test");
        assert_eq!(commands[2], "MAIL FROM:<sender@test.com>");
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let mut transport = MockTransport::new();
        transport.queue_response(ehlo(&["SIZE 4"]));

        let err = deliver(&mut transport, &params(TlsMode::None, None), &envelope(), b"too long")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::MessageTooLarge);
    }

    #[test]
    fn test_params_follow_account_and_settings() {
        let account = MailAccount::new("a", " smtp.one.test ", "a@one.test")
            .port(465)
            .use_tls(true)
            .credentials("alice", "secret");

        let settings = MailSettings::builder().domain("CORP").build().unwrap();
        let params = SessionParams::for_account(&account, &settings);
        assert_eq!(params.host, "smtp.one.test");
        assert_eq!(params.address(), "smtp.one.test:465");
        assert_eq!(params.tls_mode, TlsMode::Implicit);
        let credentials = params.credentials.unwrap();
        assert_eq!(credentials.username, "CORP\\alice");
        assert_eq!(credentials.password.expose_secret(), "secret");

        let settings = MailSettings::builder()
            .secure_socket_option(TlsMode::None)
            .use_default_credentials(true)
            .build()
            .unwrap();
        let params = SessionParams::for_account(&account, &settings);
        assert_eq!(params.tls_mode, TlsMode::None);
        assert!(params.credentials.is_none());
    }

    #[test]
    fn test_params_skip_auth_without_user_name() {
        let account = MailAccount::new("a", "smtp.one.test", "a@one.test");
        let params = SessionParams::for_account(&account, &MailSettings::default());
        assert_eq!(params.tls_mode, TlsMode::StartTls);
        assert!(params.credentials.is_none());
        assert_eq!(params.client_id, "localhost");
    }

    #[test]
    fn test_envelope_requires_sender_and_recipients() {
        let mut message = MailMessage::new();
        message.to.push(Address::new("a@test.com").unwrap());
        let err = Envelope::from_message(&message).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidFromAddress);

        let mut message = MailMessage::new();
        message.set_sender(Address::new("s@test.com").unwrap());
        let err = Envelope::from_message(&message).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);
    }
}
