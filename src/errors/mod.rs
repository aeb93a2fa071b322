//! Error types for mail dispatch.
//!
//! Two layers:
//! - [`SmtpError`]: a single SMTP attempt failed (connect, TLS, auth, rejection)
//! - [`DispatchError`]: what a send request reports to its caller, including
//!   the [`AggregateError`] produced when every candidate account failed

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for single SMTP attempts.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// What went wrong during a single SMTP attempt.
///
/// Kinds are grouped by the stage of the session that produced them, which
/// is what [`SmtpErrorKind::stage`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    /// Host name did not resolve.
    DnsResolution,
    /// Nothing is listening on the server address.
    ConnectionRefused,
    /// The peer closed or reset the connection mid-session.
    ConnectionReset,
    /// TCP connect, TLS handshake or greeting took too long.
    ConnectTimeout,

    /// TLS negotiation failed.
    TlsHandshakeFailed,
    /// CA material could not be loaded, or the server certificate is bad.
    CertificateInvalid,
    /// STARTTLS was required but not advertised.
    StarttlsNotSupported,

    /// The server rejected the credentials.
    CredentialsInvalid,
    /// No advertised mechanism is usable on this connection.
    AuthMethodNotSupported,
    /// The server wants AUTH before accepting mail (530).
    AuthenticationRequired,

    /// A reply line could not be parsed.
    InvalidResponse,
    /// A reply code other than the one the command expects.
    UnexpectedResponse,
    /// The server is closing the channel (421).
    ServerShutdown,
    /// No reply within the command timeout.
    ReadTimeout,
    /// A write did not complete within the command timeout.
    WriteTimeout,

    /// The sender address was refused or malformed.
    InvalidFromAddress,
    /// A recipient address was refused or malformed.
    InvalidRecipientAddress,
    /// The rendered message exceeds the advertised SIZE.
    MessageTooLarge,
    /// A header could not be rendered.
    InvalidHeader,

    /// Session parameters are unusable.
    ConfigurationInvalid,
}

/// Session stage an [`SmtpErrorKind`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    /// Reaching the server.
    Connect,
    /// Setting up encryption.
    Tls,
    /// Logging in.
    Auth,
    /// Exchanging commands.
    Protocol,
    /// Validating or rendering the message.
    Message,
    /// Before any I/O.
    Configuration,
}

impl SmtpErrorKind {
    /// Returns true if the same attempt could succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset | Self::ConnectTimeout | Self::ReadTimeout | Self::WriteTimeout | Self::ServerShutdown
        )
    }

    /// Stage of the session this kind is raised in.
    pub fn stage(&self) -> ErrorStage {
        use SmtpErrorKind::*;
        match self {
            DnsResolution | ConnectionRefused | ConnectionReset | ConnectTimeout => ErrorStage::Connect,
            TlsHandshakeFailed | CertificateInvalid | StarttlsNotSupported => ErrorStage::Tls,
            CredentialsInvalid | AuthMethodNotSupported | AuthenticationRequired => ErrorStage::Auth,
            InvalidResponse | UnexpectedResponse | ServerShutdown | ReadTimeout | WriteTimeout => {
                ErrorStage::Protocol
            }
            InvalidFromAddress | InvalidRecipientAddress | MessageTooLarge | InvalidHeader => ErrorStage::Message,
            ConfigurationInvalid => ErrorStage::Configuration,
        }
    }

    fn label(&self) -> &'static str {
        use SmtpErrorKind::*;
        match self {
            DnsResolution => "host lookup failed",
            ConnectionRefused => "connection refused",
            ConnectionReset => "connection lost",
            ConnectTimeout => "connect timed out",
            TlsHandshakeFailed => "TLS handshake failed",
            CertificateInvalid => "certificate rejected",
            StarttlsNotSupported => "STARTTLS unavailable",
            CredentialsInvalid => "credentials rejected",
            AuthMethodNotSupported => "no usable AUTH mechanism",
            AuthenticationRequired => "authentication required",
            InvalidResponse => "malformed reply",
            UnexpectedResponse => "unexpected reply",
            ServerShutdown => "server closing channel",
            ReadTimeout => "reply timed out",
            WriteTimeout => "write timed out",
            InvalidFromAddress => "sender refused",
            InvalidRecipientAddress => "recipient refused",
            MessageTooLarge => "message too large",
            InvalidHeader => "bad header",
            ConfigurationInvalid => "invalid session configuration",
        }
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Enhanced SMTP status code (RFC 3463).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !(2..=5).contains(&class) {
            return None;
        }
        Some(Self { class, subject, detail })
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Failure of a single SMTP attempt.
#[derive(Error, Debug)]
pub struct SmtpError {
    kind: SmtpErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new SMTP error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns true if this error is transient.
    pub fn is_retryable(&self) -> bool {
        if let Some(code) = self.smtp_code {
            return matches!(code, 421 | 450 | 451 | 452);
        }
        self.kind.is_retryable()
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionRefused, message)
    }

    /// Creates a timeout error.
    pub fn timeout(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::CredentialsInvalid, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Creates a message error.
    pub fn message_error(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// Creates an error from an SMTP reply code.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => SmtpErrorKind::ServerShutdown,
            500..=503 => SmtpErrorKind::InvalidResponse,
            530 => SmtpErrorKind::AuthenticationRequired,
            535 => SmtpErrorKind::CredentialsInvalid,
            550 => SmtpErrorKind::InvalidRecipientAddress,
            552 => SmtpErrorKind::MessageTooLarge,
            553 => SmtpErrorKind::InvalidFromAddress,
            _ => SmtpErrorKind::UnexpectedResponse,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

/// One failed account attempt inside a failover run.
#[derive(Debug)]
pub struct AccountFailure {
    /// Code of the account that was tried.
    pub account: String,
    /// Host the attempt connected to.
    pub host: String,
    /// What went wrong.
    pub error: SmtpError,
}

impl fmt::Display for AccountFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}@{}] {}", self.account, self.host, self.error)
    }
}

/// Every candidate account failed.
///
/// Failures are kept in attempt order.
#[derive(Error, Debug)]
pub struct AggregateError {
    failures: Vec<AccountFailure>,
}

impl AggregateError {
    /// Creates an aggregate from failures collected in attempt order.
    pub fn new(failures: Vec<AccountFailure>) -> Self {
        Self { failures }
    }

    /// Number of accounts attempted.
    pub fn attempted(&self) -> usize {
        self.failures.len()
    }

    /// Per-account failures in attempt order.
    pub fn failures(&self) -> &[AccountFailure] {
        &self.failures
    }

    /// Consumes the aggregate, returning the failures.
    pub fn into_failures(self) -> Vec<AccountFailure> {
        self.failures
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery failed on all {} account(s)", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

/// Error returned by dispatch operations.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No usable account is configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A sender or recipient address could not be used.
    #[error("address error: {message}")]
    Address {
        /// What was wrong.
        message: String,
        /// Parser error, if any.
        #[source]
        source: Option<SmtpError>,
    },

    /// The message itself can never be sent; no account was tried.
    #[error("invalid message: {0}")]
    Message(#[source] SmtpError),

    /// An attachment stream could not be read.
    #[error("attachment '{name}' could not be read: {source}")]
    Attachment {
        /// Attachment display name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A single explicit attempt failed.
    #[error(transparent)]
    Transport(#[from] SmtpError),

    /// Every candidate account failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// The queue worker hit an unexpected fault.
    #[error("queue worker fault: {0}")]
    WorkerFault(String),
}

impl DispatchError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Wraps an address parse failure.
    pub fn address(input: &str, source: SmtpError) -> Self {
        Self::Address {
            message: format!("'{}' is not a valid address", input),
            source: Some(source),
        }
    }

    /// Creates an address error without a parser cause.
    pub fn no_recipients() -> Self {
        Self::Address {
            message: "message has no recipients".to_string(),
            source: None,
        }
    }

    /// Returns the aggregate if every account failed.
    pub fn as_aggregate(&self) -> Option<&AggregateError> {
        match self {
            Self::Aggregate(aggregate) => Some(aggregate),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_retryable() {
        assert!(SmtpErrorKind::ConnectTimeout.is_retryable());
        assert!(SmtpErrorKind::ServerShutdown.is_retryable());
        assert!(!SmtpErrorKind::CredentialsInvalid.is_retryable());
        assert!(!SmtpErrorKind::InvalidFromAddress.is_retryable());
    }

    #[test]
    fn test_error_kind_stage() {
        assert_eq!(SmtpErrorKind::DnsResolution.stage(), ErrorStage::Connect);
        assert_eq!(SmtpErrorKind::StarttlsNotSupported.stage(), ErrorStage::Tls);
        assert_eq!(SmtpErrorKind::AuthenticationRequired.stage(), ErrorStage::Auth);
        assert_eq!(SmtpErrorKind::ReadTimeout.stage(), ErrorStage::Protocol);
        assert_eq!(SmtpErrorKind::MessageTooLarge.stage(), ErrorStage::Message);
        assert_eq!(SmtpErrorKind::ConnectionRefused.to_string(), "connection refused");
    }

    #[test]
    fn test_enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code.class, 5);
        assert_eq!(code.subject, 1);
        assert_eq!(code.detail, 1);
        assert!(code.is_permanent());

        assert!(EnhancedStatusCode::parse("smtp.example.com").is_none());
        assert!(EnhancedStatusCode::parse("1.2.3.4").is_none());
    }

    #[test]
    fn test_smtp_error_from_response() {
        let err = SmtpError::from_smtp_response(535, "Authentication failed");
        assert_eq!(err.kind(), SmtpErrorKind::CredentialsInvalid);
        assert_eq!(err.smtp_code(), Some(535));
        assert!(!err.is_retryable());

        let err = SmtpError::from_smtp_response(421, "Service unavailable");
        assert_eq!(err.kind(), SmtpErrorKind::ServerShutdown);
        assert!(err.is_retryable());

        let err = SmtpError::from_smtp_response(554, "Rejected");
        assert_eq!(err.kind(), SmtpErrorKind::UnexpectedResponse);
    }

    #[test]
    fn test_aggregate_display_lists_attempts_in_order() {
        let aggregate = AggregateError::new(vec![
            AccountFailure {
                account: "primary".into(),
                host: "smtp1.example.com".into(),
                error: SmtpError::connection("refused"),
            },
            AccountFailure {
                account: "backup".into(),
                host: "smtp2.example.com".into(),
                error: SmtpError::from_smtp_response(535, "bad credentials"),
            },
        ]);

        assert_eq!(aggregate.attempted(), 2);
        let text = aggregate.to_string();
        let first = text.find("primary").unwrap();
        let second = text.find("backup").unwrap();
        assert!(first < second);
        assert!(text.starts_with("delivery failed on all 2 account(s)"));
    }

    #[test]
    fn test_dispatch_error_from_smtp() {
        let err: DispatchError = SmtpError::tls("handshake").into();
        assert!(matches!(err, DispatchError::Transport(_)));
        assert!(err.as_aggregate().is_none());
    }
}
