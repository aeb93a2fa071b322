//! Core types for mail dispatch.
//!
//! This module provides:
//! - Address types with validation and delimited-list parsing
//! - [`EmailBox`], the transport-agnostic message callers submit
//! - [`MailMessage`], the normalized message handed to a transport

use encoding_rs::Encoding;
use std::fmt;

use crate::attachment::Attachment;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and email.
    ///
    /// Display names may not contain control characters; a CR or LF would
    /// otherwise end the header line it is written into.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        let name = name.into();
        if name.chars().any(char::is_control) {
            return Err(Self::invalid("Display name cannot contain control characters"));
        }
        Ok(Self {
            name: if name.is_empty() { None } else { Some(name) },
            email,
        })
    }

    /// Parses an address from a string (e.g., "John Doe <john@example.com>").
    pub fn parse(s: &str) -> SmtpResult<Self> {
        let s = s.trim();

        if let Some(start) = s.find('<') {
            return match s[start..].find('>') {
                Some(end) if s[start + end + 1..].trim().is_empty() => {
                    let name = s[..start].trim().trim_matches('"').trim();
                    let email = s[start + 1..start + end].trim();
                    Self::with_name(name, email)
                }
                _ => Err(Self::invalid(format!("Unbalanced angle brackets in '{}'", s))),
            };
        }

        Self::new(s)
    }

    fn invalid(message: impl Into<String>) -> SmtpError {
        SmtpError::message_error(SmtpErrorKind::InvalidRecipientAddress, message)
    }

    /// Validates an email address according to RFC 5321/5322 length and shape rules.
    fn validate_email(email: &str) -> SmtpResult<()> {
        if email.is_empty() {
            return Err(Self::invalid("Email address cannot be empty"));
        }

        if email.len() > 254 {
            return Err(Self::invalid("Email address too long (max 254 characters)"));
        }

        let (local, domain) = match email.split_once('@') {
            Some((local, domain)) if !domain.contains('@') => (local, domain),
            _ => return Err(Self::invalid("Email address must contain exactly one @")),
        };

        if local.is_empty() || local.len() > 64 {
            return Err(Self::invalid("Local part must be 1-64 characters"));
        }

        if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
            return Err(Self::invalid("Domain must be a non-empty host name"));
        }

        if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(Self::invalid(
                "Email address cannot contain whitespace or control characters",
            ));
        }

        Ok(())
    }

    /// Returns the email part only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the domain part of the address.
    pub fn domain(&self) -> &str {
        self.email.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
    }

    /// Formats the address for SMTP MAIL FROM/RCPT TO commands.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

impl TryFrom<&str> for Address {
    type Error = SmtpError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

/// Parses a `,` or `;` delimited address list.
///
/// Segments are trimmed and empty segments are skipped. A single malformed
/// entry fails the whole list.
pub fn parse_address_list(input: &str) -> SmtpResult<Vec<Address>> {
    input
        .split([',', ';'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(Address::parse)
        .collect()
}

/// Message priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// No priority headers are written.
    #[default]
    Normal,
    /// Urgent delivery.
    High,
    /// Non-urgent delivery.
    Low,
}

/// A logical email submitted for delivery.
///
/// Address fields hold raw strings; each entry may itself be a delimited list.
#[derive(Debug)]
pub struct EmailBox {
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
    /// Whether the body is HTML.
    pub is_body_html: bool,
    /// Primary recipients.
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients.
    pub bcc: Vec<String>,
    /// Attachments, in order.
    pub attachments: Vec<Box<dyn Attachment>>,
    /// Priority.
    pub priority: Priority,
}

impl EmailBox {
    /// Creates an HTML message with no recipients.
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            is_body_html: true,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            attachments: Vec::new(),
            priority: Priority::Normal,
        }
    }

    /// Adds primary recipients.
    pub fn to(mut self, recipients: impl Into<String>) -> Self {
        self.to.push(recipients.into());
        self
    }

    /// Adds carbon-copy recipients.
    pub fn cc(mut self, recipients: impl Into<String>) -> Self {
        self.cc.push(recipients.into());
        self
    }

    /// Adds blind carbon-copy recipients.
    pub fn bcc(mut self, recipients: impl Into<String>) -> Self {
        self.bcc.push(recipients.into());
        self
    }

    /// Sets whether the body is HTML.
    pub fn html(mut self, is_html: bool) -> Self {
        self.is_body_html = is_html;
        self
    }

    /// Adds an attachment.
    pub fn attach(mut self, attachment: impl Attachment + 'static) -> Self {
        self.attachments.push(Box::new(attachment));
        self
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns the first primary recipient as written.
    pub fn first_recipient(&self) -> Option<&str> {
        self.to
            .iter()
            .flat_map(|entry| entry.split([',', ';']))
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

/// Embedded resource referenced from an alternate view (`cid:` URL).
#[derive(Debug, Clone)]
pub struct LinkedResource {
    /// Content ID, without angle brackets.
    pub content_id: String,
    /// MIME content type.
    pub content_type: String,
    /// Binary content.
    pub data: Vec<u8>,
}

impl LinkedResource {
    /// Creates a linked resource.
    pub fn new(content_id: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            content_id: content_id.into(),
            content_type: content_type.into(),
            data,
        }
    }
}

/// Alternative rendering of the body.
#[derive(Debug, Clone)]
pub struct AlternateView {
    /// MIME type of the view (e.g., `text/html`).
    pub content_type: String,
    /// View content.
    pub body: String,
    /// Resources the view embeds.
    pub linked_resources: Vec<LinkedResource>,
}

impl AlternateView {
    /// Creates a view without linked resources.
    pub fn new(content_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
            linked_resources: Vec::new(),
        }
    }

    /// Adds a linked resource.
    pub fn with_resource(mut self, resource: LinkedResource) -> Self {
        self.linked_resources.push(resource);
        self
    }
}

/// An attachment whose bytes have been read.
#[derive(Debug, Clone)]
pub struct MailAttachment {
    /// Display name.
    pub name: String,
    /// MIME content type.
    pub content_type: String,
    /// Binary content.
    pub data: Vec<u8>,
}

/// Message as handed to a transport.
#[derive(Debug, Clone, Default)]
pub struct MailMessage {
    /// Sender; assigned by normalization or per account attempt.
    pub from: Option<Address>,
    /// Reply-To addresses.
    pub reply_to: Vec<Address>,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// Carbon-copy recipients.
    pub cc: Vec<Address>,
    /// Blind carbon-copy recipients (never written as a header).
    pub bcc: Vec<Address>,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
    /// Whether the body is HTML.
    pub is_body_html: bool,
    /// Priority.
    pub priority: Priority,
    /// Charset for header display names.
    pub headers_encoding: Option<&'static Encoding>,
    /// Charset for the subject.
    pub subject_encoding: Option<&'static Encoding>,
    /// Charset for text bodies.
    pub body_encoding: Option<&'static Encoding>,
    /// Alternative renderings.
    pub alternate_views: Vec<AlternateView>,
    /// Materialized attachments.
    pub attachments: Vec<MailAttachment>,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
}

impl MailMessage {
    /// Creates an empty plain-text message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every envelope recipient (To, Cc, Bcc).
    pub fn all_recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Returns true if the message has at least one recipient.
    pub fn has_recipients(&self) -> bool {
        self.all_recipients().next().is_some()
    }

    /// Replaces the sender identity (From and Reply-To).
    pub fn set_sender(&mut self, sender: Address) {
        self.reply_to = vec![sender.clone()];
        self.from = Some(sender);
    }

    /// Clears the sender identity.
    pub fn clear_sender(&mut self) {
        self.from = None;
        self.reply_to.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_address_parse() {
        let addr = Address::parse("John Doe <john@example.com>").unwrap();
        assert_eq!(addr.name(), Some("John Doe"));
        assert_eq!(addr.email(), "john@example.com");
        assert_eq!(addr.domain(), "example.com");

        let addr = Address::parse("  \"Support\" <support@example.com> ").unwrap();
        assert_eq!(addr.name(), Some("Support"));

        let addr = Address::parse("<bare@example.com>").unwrap();
        assert_eq!(addr.name(), None);
    }

    #[rstest]
    #[case("")]
    #[case("no-at-sign")]
    #[case("two@@example.com")]
    #[case("a@b@example.com")]
    #[case("spaced name@example.com")]
    #[case("@example.com")]
    #[case("user@")]
    #[case("Name <user@example.com")]
    fn test_address_rejects_malformed(#[case] input: &str) {
        assert!(Address::parse(input).is_err());
    }

    #[rstest]
    #[case("Evil\r\nBcc: victim@x.com <a@x.com>")]
    #[case("\"Tab\tName\" <a@x.com>")]
    #[case("Nul\0 <a@x.com>")]
    fn test_address_rejects_control_characters_in_name(#[case] input: &str) {
        let err = Address::parse(input).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);
        assert!(Address::with_name("Line\nBreak", "a@x.com").is_err());
    }

    #[test]
    fn test_address_list_skips_empty_segments() {
        let list = parse_address_list("a@x.com, , b@x.com ;c@x.com").unwrap();
        let emails: Vec<&str> = list.iter().map(Address::email).collect();
        assert_eq!(emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
    }

    #[test]
    fn test_address_list_fails_on_malformed_entry() {
        let result = parse_address_list("a@x.com; not-an-address; c@x.com");
        assert!(result.is_err());
        assert!(parse_address_list(" ; , ").unwrap().is_empty());
    }

    #[test]
    fn test_email_box_first_recipient() {
        let email = EmailBox::new("Hi", "Body").to(" ; first@example.com, second@example.com");
        assert_eq!(email.first_recipient(), Some("first@example.com"));
        assert!(email.is_body_html);
        assert_eq!(EmailBox::new("a", "b").first_recipient(), None);
    }

    #[test]
    fn test_set_sender_replaces_reply_to() {
        let mut message = MailMessage::new();
        message.set_sender(Address::new("one@example.com").unwrap());
        message.set_sender(Address::new("two@example.com").unwrap());
        assert_eq!(message.from.as_ref().unwrap().email(), "two@example.com");
        assert_eq!(message.reply_to.len(), 1);
        assert_eq!(message.reply_to[0].email(), "two@example.com");

        message.clear_sender();
        assert!(message.from.is_none());
        assert!(message.reply_to.is_empty());
    }
}
