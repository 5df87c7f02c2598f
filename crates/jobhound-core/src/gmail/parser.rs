use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};

use crate::gmail::types::{Message, MessagePart};
use crate::messages::AttachmentRef;
use crate::sync::RawMessage;

/// Nesting deeper than this is ignored.
const MAX_MIME_DEPTH: usize = 50;
const HTML_TEXT_WIDTH: usize = 80;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub subject: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentRef>,
}

impl ParsedMessage {
    /// Plain body if present, otherwise the HTML body rendered as text.
    pub fn body_text(&self) -> Option<String> {
        if let Some(plain) = self.body_plain.as_ref().filter(|b| !b.trim().is_empty()) {
            return Some(plain.clone());
        }
        self.body_html.as_deref().map(html_to_text)
    }
}

pub fn parse_message(message: &Message) -> ParsedMessage {
    let mut parsed = ParsedMessage::default();
    let Some(payload) = message.payload.as_ref() else {
        return parsed;
    };

    if let Some((email, name)) = header(payload, "From").and_then(|v| parse_address(&v)) {
        parsed.from_email = Some(email);
        parsed.from_name = name;
    }
    parsed.subject = header(payload, "Subject");
    walk_parts(payload, &mut parsed, 0);
    parsed
}

/// Converts a full Gmail message into the provider-neutral form. Falls back
/// to `fallback_received_at` when `internalDate` is missing or malformed.
pub fn to_raw_message(message: &Message, fallback_received_at: DateTime<Utc>) -> RawMessage {
    let parsed = parse_message(message);
    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or(fallback_received_at);

    RawMessage {
        remote_id: message.id.clone(),
        body_text: parsed.body_text(),
        from_email: parsed.from_email,
        from_name: parsed.from_name,
        subject: parsed.subject,
        received_at,
        attachments: parsed.attachments,
    }
}

pub fn decode_base64(data: &str) -> Option<Vec<u8>> {
    let trimmed = data.trim();
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE.decode(trimmed))
        .or_else(|_| STANDARD.decode(trimmed))
        .ok()
}

fn html_to_text(html: &str) -> String {
    html2text::from_read(&mut Cursor::new(html.as_bytes()), HTML_TEXT_WIDTH)
}

fn header(part: &MessagePart, name: &str) -> Option<String> {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.trim().to_string())
}

/// `"Name" <addr>`, `Name <addr>`, `<addr>` or a bare address.
fn parse_address(value: &str) -> Option<(String, Option<String>)> {
    let value = value.trim();
    if let (Some(open), Some(close)) = (value.find('<'), value.rfind('>')) {
        let email = value.get(open + 1..close)?.trim();
        if email.is_empty() {
            return None;
        }
        let name = value[..open].trim().trim_matches('"').replace("\\\"", "\"");
        return Some((email.to_string(), (!name.is_empty()).then_some(name)));
    }
    (!value.is_empty()).then(|| (value.to_string(), None))
}

fn walk_parts(part: &MessagePart, parsed: &mut ParsedMessage, depth: usize) {
    if depth > MAX_MIME_DEPTH {
        return;
    }

    let mime = part.mime_type.as_deref().unwrap_or_default();
    let filename = part.filename.as_deref().filter(|f| !f.is_empty());
    if let Some(body) = part.body.as_ref() {
        if let Some(attachment_id) = &body.attachment_id {
            parsed.attachments.push(AttachmentRef {
                attachment_id: attachment_id.clone(),
                filename: filename.map(str::to_string),
                mime_type: part.mime_type.clone(),
                size: body.size,
            });
        } else if let Some(data) = body.data.as_deref() {
            let decoded =
                decode_base64(data).map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
            if mime.eq_ignore_ascii_case("text/plain") && parsed.body_plain.is_none() {
                parsed.body_plain = decoded;
            } else if mime.eq_ignore_ascii_case("text/html") && parsed.body_html.is_none() {
                parsed.body_html = decoded;
            }
        }
    }

    for child in &part.parts {
        walk_parts(child, parsed, depth + 1);
    }
}
