//! Authentication mechanisms for SMTP.
//!
//! Supports:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)
//! - CRAM-MD5 (RFC 2195)
//!
//! PLAIN and LOGIN send the password in the clear and are only chosen over
//! TLS, unless the session was explicitly configured without TLS.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};
use crate::transport::SmtpTransport;

/// Authentication methods supported by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses from an EHLO AUTH keyword.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            _ => None,
        }
    }

    /// Returns true if this method exposes the password without TLS.
    pub fn requires_tls(&self) -> bool {
        matches!(self, AuthMethod::Plain | AuthMethod::Login)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// User name and password for one account.
#[derive(Clone)]
pub struct Credentials {
    /// User name, already scoped with a domain if one is configured.
    pub username: String,
    /// Password (protected).
    pub password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// SASL response builders.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(username: &str, password: &SecretString) -> String {
        BASE64.encode(format!("\0{}\0{}", username, password.expose_secret()))
    }

    /// Generates LOGIN username response.
    pub fn login_username(username: &str) -> String {
        BASE64.encode(username)
    }

    /// Generates LOGIN password response.
    pub fn login_password(password: &SecretString) -> String {
        BASE64.encode(password.expose_secret())
    }

    /// Generates CRAM-MD5 response.
    pub fn cram_md5_response(
        challenge: &str,
        username: &str,
        password: &SecretString,
    ) -> SmtpResult<String> {
        let challenge_bytes = BASE64
            .decode(challenge.trim())
            .map_err(|e| SmtpError::authentication(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(password.expose_secret().as_bytes())
            .map_err(|e| SmtpError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(BASE64.encode(format!("{} {}", username, hex_digest)))
    }

    /// Selects the best method among the advertised ones.
    pub fn select_best_method(
        available: &[AuthMethod],
        tls_enabled: bool,
        allow_plaintext: bool,
    ) -> SmtpResult<AuthMethod> {
        available
            .iter()
            .filter(|m| !m.requires_tls() || tls_enabled || allow_plaintext)
            .max_by_key(|m| m.priority())
            .copied()
            .ok_or_else(|| {
                SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    if available.is_empty() {
                        "Server does not advertise AUTH".to_string()
                    } else {
                        format!("No usable authentication method among {:?} without TLS", available)
                    },
                )
            })
    }
}

fn expect_code(response: SmtpResponse, code: u16) -> SmtpResult<SmtpResponse> {
    if response.code == code {
        Ok(response)
    } else {
        Err(response.to_error())
    }
}

/// Runs the AUTH exchange for `method`.
pub async fn authenticate<T: SmtpTransport + ?Sized>(
    transport: &mut T,
    method: AuthMethod,
    credentials: &Credentials,
) -> SmtpResult<()> {
    let Credentials { username, password } = credentials;

    match method {
        AuthMethod::Plain => {
            let command = SmtpCommand::Auth {
                mechanism: method.mechanism_name().to_string(),
                initial_response: Some(Authenticator::plain_initial_response(username, password)),
            };
            expect_code(transport.send_command(&command).await?, codes::AUTH_SUCCESS)?;
        }
        AuthMethod::Login => {
            let command = SmtpCommand::Auth {
                mechanism: method.mechanism_name().to_string(),
                initial_response: None,
            };
            expect_code(transport.send_command(&command).await?, codes::AUTH_CONTINUE)?;

            let line = format!("{}\r\n", Authenticator::login_username(username));
            transport.send_data(line.as_bytes()).await?;
            expect_code(transport.read_response().await?, codes::AUTH_CONTINUE)?;

            let line = format!("{}\r\n", Authenticator::login_password(password));
            transport.send_data(line.as_bytes()).await?;
            expect_code(transport.read_response().await?, codes::AUTH_SUCCESS)?;
        }
        AuthMethod::CramMd5 => {
            let command = SmtpCommand::Auth {
                mechanism: method.mechanism_name().to_string(),
                initial_response: None,
            };
            let challenge = expect_code(transport.send_command(&command).await?, codes::AUTH_CONTINUE)?;

            let reply = Authenticator::cram_md5_response(challenge.first_message(), username, password)?;
            transport.send_data(format!("{}\r\n", reply).as_bytes()).await?;
            expect_code(transport.read_response().await?, codes::AUTH_SUCCESS)?;
        }
    }

    Ok(())
}
