//! MIME rendering for outgoing messages.
//!
//! Produces RFC 5322 messages with:
//! - RFC 2047 encoded words for non-ASCII header text
//! - RFC 2231 parameter continuation for attachment file names
//! - `multipart/alternative`, `multipart/related` and `multipart/mixed` nesting
//! - Quoted-printable text bodies and Base64 binary parts
//!
//! Part layout, innermost first: the body text part; alternate views turn it
//! into `multipart/alternative`, where a view with linked resources becomes a
//! `multipart/related`; attachments wrap everything in `multipart/mixed`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use encoding_rs::{Encoding, UTF_8};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use uuid::Uuid;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::types::{Address, AlternateView, LinkedResource, MailAttachment, MailMessage, Priority};

/// Maximum line length used when folding.
const MAX_LINE: usize = 76;

/// Maximum length of one RFC 2047 encoded word.
const MAX_ENCODED_WORD: usize = 75;

/// Characters that must be percent-encoded in an RFC 2231 value.
const ATTR_CHAR: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'*')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'{')
    .add(b'}');

/// Transfer encoding types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    /// Quoted-printable encoding.
    #[default]
    QuotedPrintable,
    /// Base64 encoding.
    Base64,
}

impl TransferEncoding {
    /// Returns the header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Base64 => "base64",
        }
    }
}

#[derive(Debug)]
struct PartHeader {
    name: &'static str,
    value: String,
    prefolded: bool,
}

impl PartHeader {
    fn new(name: &'static str, value: impl Into<String>) -> Self {
        Self { name, value: value.into(), prefolded: false }
    }

    fn prefolded(name: &'static str, value: impl Into<String>) -> Self {
        Self { name, value: value.into(), prefolded: true }
    }
}

#[derive(Debug)]
enum MimePart {
    Leaf {
        headers: Vec<PartHeader>,
        body: Vec<u8>,
    },
    Multipart {
        subtype: &'static str,
        type_param: Option<String>,
        parts: Vec<MimePart>,
    },
}

/// MIME encoder for outgoing messages.
pub struct MimeEncoder {
    date: DateTime<Utc>,
    domain: String,
}

impl MimeEncoder {
    /// Creates a new encoder; `domain` is used for Message-IDs.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            date: Utc::now(),
            domain: domain.into(),
        }
    }

    /// Encodes a message to RFC 5322 format.
    pub fn encode(&self, message: &MailMessage) -> SmtpResult<Vec<u8>> {
        check_message(message)?;
        let from = message.from.as_ref().ok_or_else(|| {
            SmtpError::message_error(SmtpErrorKind::InvalidFromAddress, "Message has no sender")
        })?;
        let header_charset = message.headers_encoding.unwrap_or(UTF_8);
        let subject_charset = message.subject_encoding.unwrap_or(UTF_8);

        let mut output = Vec::new();

        self.write_header(&mut output, "Date", &self.format_date())?;
        self.write_header(&mut output, "From", &format_address(from, header_charset))?;

        if !message.reply_to.is_empty() {
            self.write_header(&mut output, "Reply-To", &format_address_list(&message.reply_to, header_charset))?;
        }
        if !message.to.is_empty() {
            self.write_header(&mut output, "To", &format_address_list(&message.to, header_charset))?;
        }
        if !message.cc.is_empty() {
            self.write_header(&mut output, "Cc", &format_address_list(&message.cc, header_charset))?;
        }

        // Note: BCC is not included in headers

        self.write_header(&mut output, "Subject", &encode_header(&message.subject, subject_charset))?;
        self.write_header(&mut output, "Message-ID", &format!("<{}>", self.generate_message_id()))?;

        for (name, value) in priority_headers(message.priority) {
            self.write_header(&mut output, name, value)?;
        }

        for (name, value) in &message.headers {
            self.write_header(&mut output, name, &encode_header(value, header_charset))?;
        }

        self.write_header(&mut output, "MIME-Version", "1.0")?;

        let root = self.build_tree(message);
        self.render(&root, &mut output)?;

        Ok(output)
    }

    fn build_tree(&self, message: &MailMessage) -> MimePart {
        let body_charset = message.body_encoding.unwrap_or(UTF_8);
        let body_type = if message.is_body_html { "text/html" } else { "text/plain" };
        let mut root = text_part(body_type, &message.body, body_charset);

        if !message.alternate_views.is_empty() {
            let mut parts = vec![root];
            parts.extend(
                message
                    .alternate_views
                    .iter()
                    .map(|view| view_part(view, body_charset)),
            );
            root = MimePart::Multipart {
                subtype: "alternative",
                type_param: None,
                parts,
            };
        }

        if !message.attachments.is_empty() {
            let mut parts = vec![root];
            parts.extend(message.attachments.iter().map(attachment_part));
            root = MimePart::Multipart {
                subtype: "mixed",
                type_param: None,
                parts,
            };
        }

        root
    }

    fn render(&self, part: &MimePart, output: &mut Vec<u8>) -> SmtpResult<()> {
        match part {
            MimePart::Leaf { headers, body } => {
                for header in headers {
                    if header.prefolded {
                        output.extend_from_slice(format!("{}: {}\r\n", header.name, header.value).as_bytes());
                    } else {
                        self.write_header(output, header.name, &header.value)?;
                    }
                }
                output.extend_from_slice(b"\r\n");
                output.extend_from_slice(body);
                if !body.ends_with(b"\r\n") {
                    output.extend_from_slice(b"\r\n");
                }
            }
            MimePart::Multipart { subtype, type_param, parts } => {
                let boundary = self.generate_boundary();
                let mut content_type = format!("multipart/{}; boundary=\"{}\"", subtype, boundary);
                if let Some(t) = type_param {
                    content_type.push_str(&format!("; type=\"{}\"", t));
                }
                self.write_header(output, "Content-Type", &content_type)?;
                output.extend_from_slice(b"\r\n");

                for child in parts {
                    output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
                    self.render(child, output)?;
                }
                output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
            }
        }
        Ok(())
    }

    /// Writes a header line.
    fn write_header(&self, output: &mut Vec<u8>, name: &str, value: &str) -> SmtpResult<()> {
        check_header_name(name)?;

        let header = format!("{}: {}", name, value);
        output.extend_from_slice(fold_header(&header).as_bytes());
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Generates a unique message ID.
    pub fn generate_message_id(&self) -> String {
        format!("{}.{}@{}", Uuid::new_v4().simple(), self.date.timestamp(), self.domain)
    }

    /// Generates a unique boundary.
    fn generate_boundary(&self) -> String {
        format!("----=_Part_{}", Uuid::new_v4().simple())
    }

    fn format_date(&self) -> String {
        self.date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
    }

    /// Prepares the DATA content with dot-stuffing.
    pub fn prepare_data_content(encoded_email: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(encoded_email.len() + 100);
        let mut at_line_start = true;

        for &byte in encoded_email {
            if at_line_start && byte == b'.' {
                output.push(b'.');
            }

            output.push(byte);
            at_line_start = byte == b'\n';
        }

        if !output.ends_with(b"\r\n") {
            if output.ends_with(b"\n") {
                output.pop();
            }
            output.extend_from_slice(b"\r\n");
        }

        // End with <CRLF>.<CRLF>
        output.extend_from_slice(b".\r\n");

        output
    }
}

impl Default for MimeEncoder {
    fn default() -> Self {
        Self::new("localhost")
    }
}

/// Checks the caller-controlled parts of a message that end up in headers.
///
/// Extra headers, alternate view types and linked resource types and IDs
/// are rejected when they could break out of their header line. The result
/// does not depend on the sender or the server, so one check covers every
/// delivery attempt.
pub fn check_message(message: &MailMessage) -> SmtpResult<()> {
    for (name, value) in &message.headers {
        check_header_name(name)?;
        if value.contains(['\r', '\n']) {
            return Err(invalid_header(format!("Header {} contains a line break", name)));
        }
    }

    for view in &message.alternate_views {
        check_content_type(&view.content_type)?;
        for resource in &view.linked_resources {
            check_content_type(&resource.content_type)?;
            if resource.content_id.is_empty()
                || resource
                    .content_id
                    .chars()
                    .any(|c| c.is_control() || c.is_whitespace() || c == '<' || c == '>')
            {
                return Err(invalid_header(format!("Invalid Content-ID: {:?}", resource.content_id)));
            }
        }
    }

    Ok(())
}

fn check_header_name(name: &str) -> SmtpResult<()> {
    if name.is_empty() || name.chars().any(|c| c.is_control() || c == ':' || c == ' ') {
        return Err(invalid_header(format!("Invalid header name: {:?}", name)));
    }
    Ok(())
}

fn check_content_type(content_type: &str) -> SmtpResult<()> {
    if content_type.contains(char::is_control) {
        return Err(invalid_header(format!("Invalid content type: {:?}", content_type)));
    }
    content_type
        .parse::<::mime::Mime>()
        .map(|_| ())
        .map_err(|e| invalid_header(format!("Invalid content type {:?}: {}", content_type, e)))
}

fn invalid_header(message: String) -> SmtpError {
    SmtpError::message_error(SmtpErrorKind::InvalidHeader, message)
}

fn priority_headers(priority: Priority) -> &'static [(&'static str, &'static str)] {
    match priority {
        Priority::Normal => &[],
        Priority::High => &[
            ("Priority", "urgent"),
            ("Importance", "high"),
            ("X-Priority", "2 (High)"),
        ],
        Priority::Low => &[
            ("Priority", "non-urgent"),
            ("Importance", "low"),
            ("X-Priority", "4 (Low)"),
        ],
    }
}

fn charset_label(encoding: &'static Encoding) -> &'static str {
    encoding.output_encoding().name()
}

fn encode_text(text: &str, encoding: &'static Encoding) -> Vec<u8> {
    let (bytes, _, _) = encoding.output_encoding().encode(text);
    bytes.into_owned()
}

fn base64_lines(data: &[u8]) -> Vec<u8> {
    let encoded = BASE64.encode(data);
    let mut output = Vec::with_capacity(encoded.len() + encoded.len() / MAX_LINE * 2 + 2);
    for chunk in encoded.as_bytes().chunks(MAX_LINE) {
        output.extend_from_slice(chunk);
        output.extend_from_slice(b"\r\n");
    }
    output
}

fn text_part(mime_type: &str, text: &str, encoding: &'static Encoding) -> MimePart {
    MimePart::Leaf {
        headers: vec![
            PartHeader::new("Content-Type", format!("{}; charset={}", mime_type, charset_label(encoding))),
            PartHeader::new("Content-Transfer-Encoding", TransferEncoding::QuotedPrintable.header_value()),
        ],
        body: quoted_printable::encode(encode_text(text, encoding)),
    }
}

fn view_part(view: &AlternateView, encoding: &'static Encoding) -> MimePart {
    let text = text_part(&view.content_type, &view.body, encoding);
    if view.linked_resources.is_empty() {
        return text;
    }

    let mut parts = vec![text];
    parts.extend(view.linked_resources.iter().map(resource_part));
    MimePart::Multipart {
        subtype: "related",
        type_param: Some(view.content_type.clone()),
        parts,
    }
}

fn resource_part(resource: &LinkedResource) -> MimePart {
    MimePart::Leaf {
        headers: vec![
            PartHeader::new("Content-Type", resource.content_type.clone()),
            PartHeader::new("Content-Transfer-Encoding", TransferEncoding::Base64.header_value()),
            PartHeader::new("Content-ID", format!("<{}>", resource.content_id)),
            PartHeader::new("Content-Disposition", "inline"),
        ],
        body: base64_lines(&resource.data),
    }
}

fn attachment_part(attachment: &MailAttachment) -> MimePart {
    let name = if is_plain_parameter(&attachment.name) {
        attachment.name.clone()
    } else {
        encode_header(&attachment.name, UTF_8)
    };

    let filename = encode_parameter("filename", &attachment.name);
    let disposition = if filename.contains("\r\n") || filename.len() > MAX_LINE - 34 {
        PartHeader::prefolded("Content-Disposition", format!("attachment;\r\n {}", filename))
    } else {
        PartHeader::new("Content-Disposition", format!("attachment; {}", filename))
    };

    MimePart::Leaf {
        headers: vec![
            PartHeader::new("Content-Type", format!("{}; name=\"{}\"", attachment.content_type, name)),
            PartHeader::new("Content-Transfer-Encoding", TransferEncoding::Base64.header_value()),
            disposition,
        ],
        body: base64_lines(&attachment.data),
    }
}

fn is_plain_parameter(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\')
}

fn format_address(address: &Address, charset: &'static Encoding) -> String {
    match address.name() {
        Some(name) if !name.is_ascii() || name.contains(char::is_control) => {
            format!("{} <{}>", encode_header(name, charset), address.email())
        }
        Some(name) if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') => {
            format!("\"{}\" <{}>", name.replace('\\', "\\\\").replace('"', "\\\""), address.email())
        }
        Some(name) => format!("{} <{}>", name, address.email()),
        None => address.email().to_string(),
    }
}

fn format_address_list(addresses: &[Address], charset: &'static Encoding) -> String {
    addresses
        .iter()
        .map(|a| format_address(a, charset))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Folds a header line at whitespace so lines stay near 76 characters.
fn fold_header(header: &str) -> String {
    if header.len() <= 78 {
        return header.to_string();
    }

    let mut result = String::new();
    let mut current_line = String::new();

    for word in header.split(' ') {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= MAX_LINE {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            result.push_str(&current_line);
            result.push_str("\r\n ");
            current_line = word.to_string();
        }
    }

    result.push_str(&current_line);
    result
}

/// Encodes header text as RFC 2047 encoded words when it is not plain ASCII.
///
/// Long values are split into several words on character boundaries.
pub fn encode_header(value: &str, encoding: &'static Encoding) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return value.to_string();
    }

    let charset = charset_label(encoding);
    let overhead = charset.len() + "=??B??=".len();
    let max_bytes = (MAX_ENCODED_WORD - overhead) / 4 * 3;

    let mut words = Vec::new();
    let mut chunk: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4];

    for c in value.chars() {
        let bytes = encode_text(c.encode_utf8(&mut buf), encoding);
        if !chunk.is_empty() && chunk.len() + bytes.len() > max_bytes {
            words.push(format!("=?{}?B?{}?=", charset, BASE64.encode(&chunk)));
            chunk.clear();
        }
        chunk.extend_from_slice(&bytes);
    }
    if !chunk.is_empty() {
        words.push(format!("=?{}?B?{}?=", charset, BASE64.encode(&chunk)));
    }

    words.join(" ")
}

/// Decodes RFC 2047 encoded words in a header value.
///
/// Whitespace between adjacent encoded words is dropped; other text is kept
/// with single-space separation.
pub fn decode_header(value: &str) -> String {
    let mut result = String::new();
    let mut previous_encoded = false;

    for token in value.split_whitespace() {
        match decode_word(token) {
            Some(decoded) => {
                if !result.is_empty() && !previous_encoded {
                    result.push(' ');
                }
                result.push_str(&decoded);
                previous_encoded = true;
            }
            None => {
                if !result.is_empty() {
                    result.push(' ');
                }
                result.push_str(token);
                previous_encoded = false;
            }
        }
    }

    result
}

fn decode_word(token: &str) -> Option<String> {
    let inner = token.strip_prefix("=?")?.strip_suffix("?=")?;
    let mut pieces = inner.splitn(3, '?');
    let charset = pieces.next()?;
    let scheme = pieces.next()?;
    let text = pieces.next()?;

    let bytes = match scheme {
        "B" | "b" => BASE64.decode(text).ok()?,
        "Q" | "q" => decode_q(text)?,
        _ => return None,
    };

    let encoding = Encoding::for_label(charset.as_bytes())?;
    Some(encoding.decode_without_bom_handling(&bytes).0.into_owned())
}

fn decode_q(text: &str) -> Option<Vec<u8>> {
    let mut bytes = Vec::with_capacity(text.len());
    let mut input = text.bytes();
    while let Some(b) = input.next() {
        match b {
            b'_' => bytes.push(b' '),
            b'=' => {
                let hex = [input.next()?, input.next()?];
                let hex = std::str::from_utf8(&hex).ok()?;
                bytes.push(u8::from_str_radix(hex, 16).ok()?);
            }
            other => bytes.push(other),
        }
    }
    Some(bytes)
}

/// Encodes a header parameter, using RFC 2231 continuation when needed.
///
/// Plain short ASCII values are written as `name="value"`. Anything else is
/// written as UTF-8 percent-encoded segments (`name*0*=utf-8''...`) joined by
/// `;` and a folding line break; segments never split a character.
pub fn encode_parameter(param: &str, value: &str) -> String {
    if is_plain_parameter(value) && param.len() + value.len() + 3 <= MAX_LINE - 34 {
        return format!("{}=\"{}\"", param, value);
    }

    const PREFIX: &str = "utf-8''";
    // Room for " name*NN*=" and the trailing ';'.
    let budget = MAX_LINE.saturating_sub(param.len() + 6).max(16);

    let mut segments: Vec<String> = Vec::new();
    let mut current = String::from(PREFIX);
    let mut atoms_in_segment = 0;
    let mut buf = [0u8; 4];

    for c in value.chars() {
        let atom = utf8_percent_encode(c.encode_utf8(&mut buf), ATTR_CHAR).to_string();
        if atoms_in_segment > 0 && current.len() + atom.len() > budget {
            segments.push(std::mem::take(&mut current));
            atoms_in_segment = 0;
        }
        current.push_str(&atom);
        atoms_in_segment += 1;
    }
    segments.push(current);

    if segments.len() == 1 {
        return format!("{}*={}", param, segments[0]);
    }

    segments
        .iter()
        .enumerate()
        .map(|(i, segment)| format!("{}*{}*={}", param, i, segment))
        .collect::<Vec<_>>()
        .join(";\r\n ")
}

/// Extracts and decodes a parameter from a header value.
///
/// Understands quoted values, RFC 2231 extended and continued values, and
/// RFC 2047 encoded words inside quoted values.
pub fn decode_parameter(header_value: &str, param: &str) -> Option<String> {
    let unfolded = header_value.replace("\r\n", "");
    let wanted = param.to_ascii_lowercase();

    let mut plain: Option<String> = None;
    let mut segments: Vec<(u32, bool, String)> = Vec::new();

    for raw in split_parameters(&unfolded).into_iter().skip(1) {
        let Some((key, value)) = raw.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = unquote(value.trim());

        let Some(rest) = key.strip_prefix(wanted.as_str()) else {
            continue;
        };
        if rest.is_empty() {
            plain = Some(value);
            continue;
        }
        let Some(rest) = rest.strip_prefix('*') else {
            continue;
        };

        if rest.is_empty() {
            segments.push((0, true, value));
            continue;
        }
        let (index, extended) = match rest.strip_suffix('*') {
            Some(index) => (index, true),
            None => (rest, false),
        };
        if let Ok(index) = index.parse::<u32>() {
            segments.push((index, extended, value));
        }
    }

    if segments.is_empty() {
        return plain.map(|p| if p.contains("=?") { decode_header(&p) } else { p });
    }

    segments.sort_by_key(|(index, _, _)| *index);

    let mut charset = "utf-8".to_string();
    let mut bytes = Vec::new();
    for (position, (_, extended, value)) in segments.iter().enumerate() {
        if *extended {
            let mut data = value.as_str();
            if position == 0 {
                let mut pieces = value.splitn(3, '\'');
                if let (Some(cs), Some(_lang), Some(rest)) = (pieces.next(), pieces.next(), pieces.next()) {
                    if !cs.is_empty() {
                        charset = cs.to_string();
                    }
                    data = rest;
                }
            }
            bytes.extend(percent_decode_str(data));
        } else {
            bytes.extend_from_slice(value.as_bytes());
        }
    }

    let encoding = Encoding::for_label(charset.as_bytes()).unwrap_or(UTF_8);
    Some(encoding.decode_without_bom_handling(&bytes).0.into_owned())
}

fn split_parameters(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ';' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => {
            let mut result = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        result.push(next);
                    }
                } else {
                    result.push(c);
                }
            }
            result
        }
        None => value.to_string(),
    }
}
