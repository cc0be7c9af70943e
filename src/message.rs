use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, Message};

use crate::model::Envelope;

/// Header and text fields pulled out of a raw RFC 822 message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMessage {
    pub envelope: Envelope,
    pub body_text: Option<String>,
    /// Plain-text headers as (name, value), in message order.
    pub headers: Vec<(String, String)>,
}

/// Parses a raw message. Unparseable input still yields an empty envelope so a
/// malformed message never blocks the rest of its batch.
pub fn parse(raw: &[u8]) -> ParsedMessage {
    let Some(parsed) = Message::parse(raw) else {
        log::debug!("Failed to parse message of {} bytes", raw.len());
        return ParsedMessage::default();
    };

    let envelope = Envelope {
        subject: parsed.subject().unwrap_or_default().to_string(),
        from: addresses(parsed.from()),
        to: addresses(parsed.to()),
        date: parsed
            .date()
            .and_then(|date| DateTime::<Utc>::from_timestamp(date.to_timestamp(), 0)),
        message_id: parsed.message_id().map(|id| id.to_string()),
    };

    let headers = parsed
        .headers()
        .iter()
        .filter_map(|header| {
            let value = header.value().as_text_ref()?;
            Some((header.name().to_string(), value.to_string()))
        })
        .collect();

    ParsedMessage {
        envelope,
        body_text: parsed.body_text(0).map(|text| text.to_string()),
        headers,
    }
}

fn addresses(header: &HeaderValue) -> Vec<String> {
    let render = |addr: &mail_parser::Addr| -> Option<String> {
        let address = addr.address.as_deref().filter(|a| !a.is_empty())?;
        Some(match addr.name.as_deref() {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, address),
            _ => address.to_string(),
        })
    };

    match header {
        HeaderValue::Address(addr) => render(addr).into_iter().collect(),
        HeaderValue::AddressList(list) => list.iter().filter_map(render).collect(),
        HeaderValue::Group(group) => group.addresses.iter().filter_map(render).collect(),
        HeaderValue::GroupList(groups) => groups
            .iter()
            .flat_map(|group| group.addresses.iter())
            .filter_map(render)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_envelope_fields() {
        let raw = b"From: Alice Example <alice@example.com>\r\n\
To: bob@example.com, Carol <carol@example.com>\r\n\
Subject: Quarterly report\r\n\
Date: Tue, 1 Jul 2003 10:52:37 +0200\r\n\
Message-ID: <report-1@example.com>\r\n\
X-Spam-Flag: NO\r\n\
\r\n\
Numbers attached.\r\n";

        let parsed = parse(raw);
        assert_eq!(parsed.envelope.subject, "Quarterly report");
        assert_eq!(parsed.envelope.from, vec!["Alice Example <alice@example.com>"]);
        assert_eq!(
            parsed.envelope.to,
            vec!["bob@example.com", "Carol <carol@example.com>"]
        );
        assert_eq!(
            parsed.envelope.message_id.as_deref(),
            Some("report-1@example.com")
        );
        assert_eq!(
            parsed.envelope.date.map(|d| d.timestamp()),
            Some(1_057_049_557)
        );
        assert!(parsed
            .body_text
            .as_deref()
            .is_some_and(|body| body.contains("Numbers attached.")));
        assert!(parsed
            .headers
            .iter()
            .any(|(name, value)| name == "X-Spam-Flag" && value == "NO"));
    }

    #[test]
    fn missing_headers_leave_defaults() {
        let parsed = parse(b"\r\njust a body\r\n");
        assert!(parsed.envelope.subject.is_empty());
        assert!(parsed.envelope.from.is_empty());
        assert!(parsed.envelope.date.is_none());
    }
}
