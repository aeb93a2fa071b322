//! Configuration types for mail dispatch.
//!
//! Provides:
//! - Process-wide dispatch settings ([`MailSettings`])
//! - Sender account records ([`MailAccount`])
//! - TLS mode selection and extra trust roots
//! - JSON loading and a builder for programmatic setup

use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{DispatchError, DispatchResult, SmtpResult};
use crate::types::Address;

/// Default SMTP port for account records.
pub const DEFAULT_PORT: u16 = 25;

/// Default queue polling interval in milliseconds.
pub const DEFAULT_SLEEP_INTERVAL_MS: u64 = 3000;

/// Default timeout for connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Host of the placeholder account created when no account is configured.
pub const PLACEHOLDER_HOST: &str = "smtp.example.com";

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS (insecure, not recommended).
    None,
    /// Opportunistic STARTTLS (default).
    #[default]
    StartTls,
    /// Required STARTTLS (fail if not supported).
    StartTlsRequired,
    /// Implicit TLS (port 465).
    Implicit,
}

impl TlsMode {
    /// Maps an account's `use_tls` flag to a mode.
    pub fn from_use_tls(use_tls: bool) -> Self {
        if use_tls {
            TlsMode::Implicit
        } else {
            TlsMode::StartTls
        }
    }
}

/// Extra TLS trust configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSettings {
    /// PEM file with additional trusted CA certificates.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

/// One configured sender account.
#[derive(Debug, Clone, Deserialize)]
pub struct MailAccount {
    /// Unique account code.
    pub code: String,
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connect with implicit TLS instead of opportunistic STARTTLS.
    #[serde(default)]
    pub use_tls: bool,
    /// Authentication user name.
    #[serde(default)]
    pub user_name: String,
    /// Authentication password.
    #[serde(default = "empty_secret")]
    pub password: SecretString,
    /// Sender address used for messages sent through this account.
    pub from_address: String,
    /// Sender display name.
    #[serde(default)]
    pub from_display_name: Option<String>,
    /// Whether the account takes part in delivery.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether the account is preferred over the others.
    #[serde(default)]
    pub is_default: bool,
    /// Recipient domains this account serves, separated by `,` or `;`.
    #[serde(default)]
    pub email_suffix: Option<String>,
}

fn default_port() -> u16 { DEFAULT_PORT }
fn default_true() -> bool { true }
fn empty_secret() -> SecretString { SecretString::new(String::new()) }

impl MailAccount {
    /// Creates an enabled, non-default account on the default port.
    pub fn new(
        code: impl Into<String>,
        host: impl Into<String>,
        from_address: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            use_tls: false,
            user_name: String::new(),
            password: empty_secret(),
            from_address: from_address.into(),
            from_display_name: None,
            enabled: true,
            is_default: false,
            email_suffix: None,
        }
    }

    /// The stand-in account used until real accounts are configured.
    pub fn placeholder() -> Self {
        Self {
            code: "default".to_string(),
            host: PLACEHOLDER_HOST.to_string(),
            port: 465,
            use_tls: true,
            user_name: "your_account@example.com".to_string(),
            password: SecretString::new("your_password".to_string()),
            from_address: "your_account@example.com".to_string(),
            from_display_name: Some("your_name".to_string()),
            enabled: true,
            is_default: true,
            email_suffix: None,
        }
    }

    /// Sets the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets implicit TLS.
    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Sets the credentials.
    pub fn credentials(mut self, user_name: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self.password = SecretString::new(password.into());
        self
    }

    /// Sets the sender display name.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.from_display_name = Some(name.into());
        self
    }

    /// Enables or disables the account.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Marks the account as default.
    pub fn default_account(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    /// Sets the recipient domain filter.
    pub fn email_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.email_suffix = Some(suffix.into());
        self
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true for the placeholder account.
    pub fn is_placeholder(&self) -> bool {
        self.host == PLACEHOLDER_HOST
    }

    /// Builds the sender address for this account.
    pub fn sender(&self) -> SmtpResult<Address> {
        match self.from_display_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => Address::with_name(name, self.from_address.trim()),
            None => Address::new(self.from_address.trim()),
        }
    }

    /// Returns true if this account serves the given recipient domain.
    pub fn serves_domain(&self, domain: &str) -> bool {
        self.email_suffix
            .as_deref()
            .map(|suffixes| {
                suffixes
                    .split([',', ';'])
                    .map(|s| s.trim().trim_start_matches('@'))
                    .filter(|s| !s.is_empty())
                    .any(|s| s.eq_ignore_ascii_case(domain))
            })
            .unwrap_or(false)
    }
}

/// Process-wide dispatch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MailSettings {
    /// Account records, in configuration order.
    #[serde(default)]
    pub data: Vec<MailAccount>,
    /// Queue polling interval in milliseconds.
    #[serde(default = "default_sleep_interval")]
    pub sleep_interval: u64,
    /// Global TLS mode overriding every account's `use_tls`.
    #[serde(default)]
    pub secure_socket_option: Option<TlsMode>,
    /// Skip AUTH and rely on ambient credentials.
    #[serde(default)]
    pub use_default_credentials: bool,
    /// Domain used to scope account user names.
    #[serde(default)]
    pub domain: Option<String>,
    /// Connect timeout (TCP, TLS and greeting).
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Client identifier for EHLO.
    #[serde(default)]
    pub client_id: Option<String>,
    /// TLS trust settings.
    #[serde(default)]
    pub tls: TlsSettings,
}

fn default_sleep_interval() -> u64 { DEFAULT_SLEEP_INTERVAL_MS }
fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_command_timeout() -> Duration { DEFAULT_COMMAND_TIMEOUT }

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            sleep_interval: DEFAULT_SLEEP_INTERVAL_MS,
            secure_socket_option: None,
            use_default_credentials: false,
            domain: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            client_id: None,
            tls: TlsSettings::default(),
        }
    }
}

impl MailSettings {
    /// Creates a new settings builder.
    pub fn builder() -> MailSettingsBuilder {
        MailSettingsBuilder::default()
    }

    /// Parses settings from JSON.
    pub fn from_json_str(json: &str) -> DispatchResult<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| DispatchError::configuration(format!("invalid mail settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads settings from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> DispatchResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Validates the settings.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.sleep_interval == 0 {
            return Err(DispatchError::configuration("sleep_interval must be positive"));
        }

        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(DispatchError::configuration("timeouts must be non-zero"));
        }

        for (i, account) in self.data.iter().enumerate() {
            if account.code.trim().is_empty() {
                return Err(DispatchError::configuration(format!("account #{} has no code", i)));
            }
            if account.host.trim().is_empty() {
                return Err(DispatchError::configuration(format!(
                    "account '{}' has no host",
                    account.code
                )));
            }
            if account.port == 0 {
                return Err(DispatchError::configuration(format!(
                    "account '{}' has port 0",
                    account.code
                )));
            }
            if self.data[..i].iter().any(|other| other.code == account.code) {
                return Err(DispatchError::configuration(format!(
                    "duplicate account code '{}'",
                    account.code
                )));
            }
        }

        Ok(())
    }

    /// Returns the polling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval)
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }

    /// Resolves the TLS mode for a connection; the global override wins over
    /// the account's `use_tls`.
    pub fn tls_mode_for(&self, use_tls: bool) -> TlsMode {
        self.secure_socket_option
            .unwrap_or_else(|| TlsMode::from_use_tls(use_tls))
    }

    /// Scopes a user name with the configured domain (`DOMAIN\user`).
    pub fn scoped_user_name(&self, user_name: &str) -> String {
        match self.domain.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(domain) if !user_name.contains('\\') => format!("{}\\{}", domain, user_name),
            _ => user_name.to_string(),
        }
    }
}

/// Builder for dispatch settings.
#[derive(Debug, Default)]
pub struct MailSettingsBuilder {
    settings: MailSettings,
}

impl MailSettingsBuilder {
    /// Adds an account record.
    pub fn account(mut self, account: MailAccount) -> Self {
        self.settings.data.push(account);
        self
    }

    /// Adds several account records.
    pub fn accounts(mut self, accounts: impl IntoIterator<Item = MailAccount>) -> Self {
        self.settings.data.extend(accounts);
        self
    }

    /// Sets the queue polling interval.
    pub fn sleep_interval(mut self, interval: Duration) -> Self {
        self.settings.sleep_interval = interval.as_millis() as u64;
        self
    }

    /// Forces a TLS mode for every account.
    pub fn secure_socket_option(mut self, mode: TlsMode) -> Self {
        self.settings.secure_socket_option = Some(mode);
        self
    }

    /// Skips AUTH for every account.
    pub fn use_default_credentials(mut self, enabled: bool) -> Self {
        self.settings.use_default_credentials = enabled;
        self
    }

    /// Sets the credential domain.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.settings.domain = Some(domain.into());
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.connect_timeout = timeout;
        self
    }

    /// Sets command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.settings.command_timeout = timeout;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.settings.client_id = Some(id.into());
        self
    }

    /// Adds a PEM file of trusted CA certificates.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.tls.ca_cert_path = Some(path.into());
        self
    }

    /// Builds the settings.
    pub fn build(self) -> DispatchResult<MailSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_settings_defaults() {
        let settings = MailSettings::builder().build().unwrap();
        assert_eq!(settings.sleep_interval, DEFAULT_SLEEP_INTERVAL_MS);
        assert_eq!(settings.poll_interval(), Duration::from_millis(3000));
        assert_eq!(settings.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(settings.secure_socket_option.is_none());
        assert!(!settings.use_default_credentials);
        assert_eq!(settings.client_id(), "localhost");
    }

    #[test]
    fn test_settings_from_json() {
        let json = r#"{
            "sleep_interval": 500,
            "secure_socket_option": "start_tls_required",
            "domain": "CORP",
            "connect_timeout": "5s",
            "data": [
                {
                    "code": "primary",
                    "host": "smtp.example.com",
                    "port": 587,
                    "user_name": "mailer",
                    "password": "secret",
                    "from_address": "noreply@example.com",
                    "from_display_name": "Example",
                    "is_default": true
                },
                {
                    "code": "backup",
                    "host": "smtp2.example.com",
                    "from_address": "noreply@example.com",
                    "enabled": false
                }
            ]
        }"#;

        let settings = MailSettings::from_json_str(json).unwrap();
        assert_eq!(settings.sleep_interval, 500);
        assert_eq!(settings.secure_socket_option, Some(TlsMode::StartTlsRequired));
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.command_timeout, DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(settings.data.len(), 2);

        let primary = &settings.data[0];
        assert_eq!(primary.port, 587);
        assert_eq!(primary.password.expose_secret(), "secret");
        assert!(primary.enabled);

        let backup = &settings.data[1];
        assert_eq!(backup.port, DEFAULT_PORT);
        assert!(!backup.enabled);
        assert!(!backup.use_tls);
    }

    #[test]
    fn test_settings_validation() {
        let duplicate = MailSettings::builder()
            .account(MailAccount::new("a", "smtp.example.com", "a@example.com"))
            .account(MailAccount::new("a", "smtp2.example.com", "a@example.com"))
            .build();
        assert!(matches!(duplicate, Err(DispatchError::Configuration(_))));

        let no_host = MailSettings::builder()
            .account(MailAccount::new("a", " ", "a@example.com"))
            .build();
        assert!(no_host.is_err());

        assert!(MailSettings::from_json_str("{ not json").is_err());
    }

    #[test]
    fn test_tls_mode_override() {
        let settings = MailSettings::default();
        assert_eq!(settings.tls_mode_for(true), TlsMode::Implicit);
        assert_eq!(settings.tls_mode_for(false), TlsMode::StartTls);

        let forced = MailSettings::builder()
            .secure_socket_option(TlsMode::None)
            .build()
            .unwrap();
        assert_eq!(forced.tls_mode_for(true), TlsMode::None);
    }

    #[test]
    fn test_scoped_user_name() {
        let settings = MailSettings::builder().domain("CORP").build().unwrap();
        assert_eq!(settings.scoped_user_name("mailer"), "CORP\\mailer");
        assert_eq!(settings.scoped_user_name("OTHER\\mailer"), "OTHER\\mailer");

        let unscoped = MailSettings::default();
        assert_eq!(unscoped.scoped_user_name("mailer"), "mailer");
    }

    #[test]
    fn test_serves_domain() {
        let account = MailAccount::new("a", "smtp.example.com", "a@example.com")
            .email_suffix("example.com; @Example.ORG ,");
        assert!(account.serves_domain("example.com"));
        assert!(account.serves_domain("example.org"));
        assert!(!account.serves_domain("example.net"));
    }

    #[test]
    fn test_placeholder_account() {
        let account = MailAccount::placeholder();
        assert!(account.is_placeholder());
        assert!(account.is_default);
        assert_eq!(account.sender().unwrap().email(), "your_account@example.com");
    }
}
