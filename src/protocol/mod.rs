//! SMTP protocol types.
//!
//! Commands, replies and EHLO capabilities for the subset of RFC 5321 the
//! dispatcher speaks.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, SmtpError, SmtpResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Sender address in angle brackets.
        address: String,
        /// SIZE parameter, sent when the server advertises SIZE.
        size: Option<usize>,
        /// BODY=8BITMIME parameter.
        body_8bit: bool,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address in angle brackets.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// No operation.
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending (without CRLF).
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth { mechanism, initial_response: Some(response) } => {
                format!("AUTH {} {}", mechanism, response)
            }
            SmtpCommand::Auth { mechanism, initial_response: None } => format!("AUTH {}", mechanism),
            SmtpCommand::MailFrom { address, size, body_8bit } => {
                let mut cmd = format!("MAIL FROM:{}", address);
                if let Some(s) = size {
                    cmd.push_str(&format!(" SIZE={}", s));
                }
                if *body_8bit {
                    cmd.push_str(" BODY=8BITMIME");
                }
                cmd
            }
            SmtpCommand::RcptTo { address } => format!("RCPT TO:{}", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns true if the command line carries credentials.
    pub fn is_sensitive(&self) -> bool {
        matches!(self, SmtpCommand::Auth { initial_response: Some(_), .. })
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::Auth { mechanism, initial_response: Some(_) } => {
                write!(f, "AUTH {} ****", mechanism)
            }
            other => write!(f, "{}", other.to_smtp_string()),
        }
    }
}

/// SMTP reply from the server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code from the first line, if present.
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Reply text, one entry per line.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
        }
    }

    /// Creates a multi-line reply.
    pub fn multiline(code: u16, lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a reply from raw lines (without CRLF).
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        let first = lines.first().ok_or_else(|| SmtpError::protocol("Empty response"))?;
        let code = Self::parse_code(first)?;

        let mut message = Vec::with_capacity(lines.len());
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            if Self::parse_code(line)? != code {
                return Err(SmtpError::protocol("Inconsistent status codes in multiline response"));
            }

            let text = line.get(4..).unwrap_or("");
            if i == 0 {
                if let Some((esc, rest)) = text.split_once(' ').and_then(|(head, rest)| {
                    EnhancedStatusCode::parse(head).map(|esc| (esc, rest))
                }) {
                    enhanced_code = Some(esc);
                    message.push(rest.trim().to_string());
                    continue;
                }
            }
            message.push(text.to_string());
        }

        Ok(Self { code, enhanced_code, message })
    }

    fn parse_code(line: &str) -> SmtpResult<u16> {
        line.get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .filter(|c| (200..600).contains(c))
            .ok_or_else(|| SmtpError::protocol(format!("Invalid status line: {}", line)))
    }

    /// Returns true if this is a success reply (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(String::as_str).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Formats the reply as a delivery token (`250 2.0.0 Ok: queued as X`).
    pub fn token(&self) -> String {
        match &self.enhanced_code {
            Some(esc) => format!("{} {} {}", self.code, esc, self.first_message()),
            None => format!("{} {}", self.code, self.first_message()),
        }
    }

    /// Converts to an error.
    pub fn to_error(&self) -> SmtpError {
        let mut err = SmtpError::from_smtp_response(self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }

    /// Returns `self` for a success reply, the mapped error otherwise.
    pub fn into_success(self) -> SmtpResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// 8BITMIME supported.
    pub eight_bit_mime: bool,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply; the first line is the greeting.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_ascii_uppercase();
            let (keyword, params) = line.split_once([' ', '=']).unwrap_or((line.as_str(), ""));

            match keyword {
                "SIZE" => caps.size = params.trim().parse().ok().filter(|s| *s > 0),
                "AUTH" => caps
                    .auth_mechanisms
                    .extend(params.split_whitespace().filter_map(AuthMethod::from_capability)),
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                _ => {}
            }
        }

        caps
    }

    /// Returns the advertised mechanisms as a list.
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        self.auth_mechanisms.iter().copied().collect()
    }
}

/// Progress of one SMTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Greeting received.
    Connected,
    /// EHLO/HELO accepted.
    Greeted,
    /// Authenticated.
    Authenticated,
    /// MAIL FROM accepted.
    InTransaction,
    /// At least one RCPT TO accepted.
    RecipientsAdded,
    /// DATA accepted, content being sent.
    SendingData,
    /// Message accepted.
    Complete,
}

/// Reply codes the session checks for.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_formatting() {
        assert_eq!(SmtpCommand::Ehlo("localhost".into()).to_smtp_string(), "EHLO localhost");
        assert_eq!(
            SmtpCommand::MailFrom {
                address: "<test@example.com>".into(),
                size: Some(1024),
                body_8bit: true,
            }
            .to_smtp_string(),
            "MAIL FROM:<test@example.com> SIZE=1024 BODY=8BITMIME"
        );
    }

    #[test]
    fn test_auth_command_is_redacted_in_display() {
        let cmd = SmtpCommand::Auth {
            mechanism: "PLAIN".into(),
            initial_response: Some("AHVzZXIAcGFzcw==".into()),
        };
        assert!(cmd.is_sensitive());
        assert_eq!(cmd.to_string(), "AUTH PLAIN ****");
        assert!(cmd.to_smtp_string().ends_with("AHVzZXIAcGFzcw=="));
    }

    #[test]
    fn test_response_parse() {
        let response = SmtpResponse::parse(&["250 OK".to_string()]).unwrap();
        assert_eq!(response.code, 250);
        assert!(response.is_success());
        assert_eq!(response.first_message(), "OK");

        let lines = vec![
            "250-smtp.example.com Hello".to_string(),
            "250-SIZE 10485760".to_string(),
            "250 STARTTLS".to_string(),
        ];
        let response = SmtpResponse::parse(&lines).unwrap();
        assert_eq!(response.message.len(), 3);

        assert!(SmtpResponse::parse(&[]).is_err());
        assert!(SmtpResponse::parse(&["25".to_string()]).is_err());
        assert!(SmtpResponse::parse(&["250-a".to_string(), "550 b".to_string()]).is_err());
    }

    #[test]
    fn test_response_token() {
        let response = SmtpResponse::parse(&["250 2.0.0 Ok: queued as 4F2A".to_string()]).unwrap();
        assert_eq!(response.enhanced_code.as_ref().unwrap().to_string(), "2.0.0");
        assert_eq!(response.first_message(), "Ok: queued as 4F2A");
        assert_eq!(response.token(), "250 2.0.0 Ok: queued as 4F2A");

        let plain = SmtpResponse::new(250, "Accepted");
        assert_eq!(plain.token(), "250 Accepted");
    }

    #[test]
    fn test_response_into_success() {
        let err = SmtpResponse::parse(&["550 5.1.1 User unknown".to_string()])
            .unwrap()
            .into_success()
            .unwrap_err();
        assert_eq!(err.smtp_code(), Some(550));
        assert_eq!(err.enhanced_code().unwrap().to_string(), "5.1.1");
    }

    #[test]
    fn test_capabilities_parse() {
        let response = SmtpResponse::multiline(
            250,
            [
                "smtp.example.com",
                "SIZE 10485760",
                "AUTH PLAIN LOGIN CRAM-MD5",
                "AUTH=LOGIN",
                "STARTTLS",
                "8BITMIME",
                "ENHANCEDSTATUSCODES",
            ],
        );

        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert_eq!(caps.size, Some(10485760));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Plain));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::CramMd5));
        assert!(caps.starttls);
        assert!(caps.eight_bit_mime);
    }

    #[test]
    fn test_greeting_line_is_not_a_capability() {
        let response = SmtpResponse::multiline(250, ["STARTTLS.example.com"]);
        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert!(!caps.starttls);
    }
}
