//! Mock implementations for testing.
//!
//! - [`MockTransport`]: a scripted SMTP connection for session-level tests
//! - [`ScriptedMailTransport`]: a scripted per-host [`MailTransport`] that
//!   records every attempt, for failover and queue tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::MailAccount;
use crate::delivery::MailTransport;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};
use crate::session::SessionParams;
use crate::transport::SmtpTransport;
use crate::types::MailMessage;

/// Mock SMTP transport.
///
/// Replies are served from a queue; once it is empty every command gets
/// `250 OK`.
#[derive(Debug)]
pub struct MockTransport {
    commands: Arc<Mutex<Vec<SmtpCommand>>>,
    responses: Arc<Mutex<VecDeque<SmtpResponse>>>,
    default_response: SmtpResponse,
    data_received: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_next: Arc<Mutex<Option<SmtpError>>>,
    tls_enabled: bool,
    tls_upgrades: usize,
    closed: bool,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            default_response: SmtpResponse::new(codes::OK, "OK"),
            data_received: Arc::new(Mutex::new(Vec::new())),
            fail_next: Arc::new(Mutex::new(None)),
            tls_enabled: false,
            tls_upgrades: 0,
            closed: false,
        }
    }

    /// Queues a response.
    pub fn queue_response(&self, response: SmtpResponse) -> &Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }

    /// Queues an OK response.
    pub fn queue_ok(&self) -> &Self {
        self.queue_response(SmtpResponse::new(codes::OK, "OK"))
    }

    /// Queues an error response.
    pub fn queue_error(&self, code: u16, message: &str) -> &Self {
        self.queue_response(SmtpResponse::new(code, message))
    }

    /// Sets the next call to fail.
    pub fn fail_next_with(&self, error: SmtpError) -> &Self {
        *self.fail_next.lock().unwrap() = Some(error);
        self
    }

    /// Starts the mock as an already-encrypted connection.
    pub fn set_tls_enabled(&mut self, enabled: bool) {
        self.tls_enabled = enabled;
    }

    /// Returns recorded commands.
    pub fn recorded_commands(&self) -> Vec<SmtpCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Returns recorded command lines as they would be logged.
    pub fn sent_commands(&self) -> Vec<String> {
        self.recorded_commands().iter().map(ToString::to_string).collect()
    }

    /// Returns received data.
    pub fn received_data(&self) -> Vec<Vec<u8>> {
        self.data_received.lock().unwrap().clone()
    }

    /// Number of TLS upgrades performed.
    pub fn tls_upgrades(&self) -> usize {
        self.tls_upgrades
    }

    /// Returns true once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn take_failure(&self) -> SmtpResult<()> {
        match self.fail_next.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_response(&self) -> SmtpResponse {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        self.take_failure()?;
        self.commands.lock().unwrap().push(command.clone());
        Ok(self.next_response())
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        self.take_failure()?;
        self.data_received.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        self.take_failure()?;
        Ok(self.next_response())
    }

    async fn upgrade_tls(&mut self, _host: &str) -> SmtpResult<()> {
        self.take_failure()?;
        self.tls_enabled = true;
        self.tls_upgrades += 1;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> SmtpResult<()> {
        if !self.closed {
            self.commands.lock().unwrap().push(SmtpCommand::Quit);
            self.closed = true;
        }
        Ok(())
    }
}

/// One recorded [`ScriptedMailTransport`] attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Host the attempt targeted.
    pub host: String,
    /// Port the attempt targeted.
    pub port: u16,
    /// The message as handed to the transport.
    pub message: MailMessage,
    /// The session parameters.
    pub params: SessionParams,
}

/// Outcome scripted for a host.
#[derive(Debug, Clone)]
enum Script {
    Accept,
    Reject(SmtpErrorKind, String),
}

/// Mail transport with per-host scripted outcomes.
///
/// Unscripted hosts accept. Every call is recorded.
#[derive(Debug, Clone, Default)]
pub struct ScriptedMailTransport {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    attempts: Arc<Mutex<Vec<Attempt>>>,
    delay: Option<Duration>,
}

impl ScriptedMailTransport {
    /// Creates a transport that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send to `host` fail with `kind`.
    pub fn fail_host(self, host: &str, kind: SmtpErrorKind) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(host.to_string(), Script::Reject(kind, format!("scripted failure for {}", host)));
        self
    }

    /// Makes every send to `host` succeed.
    pub fn accept_host(self, host: &str) -> Self {
        self.scripts.lock().unwrap().insert(host.to_string(), Script::Accept);
        self
    }

    /// Adds a fixed delay to every send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns every recorded attempt.
    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    /// Returns the hosts attempted, in order.
    pub fn attempted_hosts(&self) -> Vec<String> {
        self.attempts().into_iter().map(|a| a.host).collect()
    }
}

#[async_trait]
impl MailTransport for ScriptedMailTransport {
    async fn send(&self, message: &MailMessage, params: &SessionParams) -> SmtpResult<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let sequence = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(Attempt {
                host: params.host.clone(),
                port: params.port,
                message: message.clone(),
                params: params.clone(),
            });
            attempts.len()
        };

        let script = self.scripts.lock().unwrap().get(&params.host).cloned();
        match script.unwrap_or(Script::Accept) {
            Script::Accept => Ok(format!("250 2.0.0 Ok: queued as MOCK{}", sequence)),
            Script::Reject(kind, message) => Err(SmtpError::new(kind, message)),
        }
    }
}

/// Creates an account at `smtp.<code>.test` sending as `<code>@test.com`.
pub fn test_account(code: &str) -> MailAccount {
    MailAccount::new(code, format!("smtp.{}.test", code), format!("{}@test.com", code))
}

/// Creates an EHLO response with standard capabilities.
pub fn ehlo_response() -> SmtpResponse {
    SmtpResponse::multiline(
        codes::OK,
        [
            "smtp.example.com Hello",
            "SIZE 10485760",
            "AUTH PLAIN LOGIN CRAM-MD5",
            "STARTTLS",
            "8BITMIME",
            "ENHANCEDSTATUSCODES",
        ],
    )
}

/// Creates a DATA ready response.
pub fn data_ready_response() -> SmtpResponse {
    SmtpResponse::new(codes::START_MAIL_INPUT, "Start mail input")
}
