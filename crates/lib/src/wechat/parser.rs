//! Push payload parser.
//!
//! WeChat pushes a small XML document whose root (normally `<xml>`) holds one child element
//! per field, in no guaranteed order, with values as plain text or CDATA:
//!
//! ```text
//! <xml>
//!   <ToUserName><![CDATA[gh_123]]></ToUserName>
//!   <FromUserName><![CDATA[oUser]]></FromUserName>
//!   <CreateTime>1348831860</CreateTime>
//!   <MsgType><![CDATA[text]]></MsgType>
//!   <Content><![CDATA[hello]]></Content>
//!   <MsgId>1234567890123456</MsgId>
//! </xml>
//! ```

use crate::channels::{InboundEvent, TRANSPORT_TYPE};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPayload {
    #[error("malformed payload: body is not UTF-8")]
    NotUtf8,
    #[error("malformed payload: {0}")]
    NotWellFormed(String),
    #[error("malformed payload: missing or empty {0}")]
    MissingField(&'static str),
}

fn not_well_formed(reason: impl std::fmt::Display) -> MalformedPayload {
    MalformedPayload::NotWellFormed(reason.to_string())
}

/// Parse a raw push body into an [`InboundEvent`].
///
/// The message id is read from `MsgId`, falling back to `message_id`. `FromUserName`,
/// `ToUserName` and `Content` are required as well; `MsgType` and `CreateTime` are optional.
pub fn parse(raw: &[u8]) -> Result<InboundEvent, MalformedPayload> {
    let text = std::str::from_utf8(raw).map_err(|_| MalformedPayload::NotUtf8)?;
    let mut fields = read_fields(text)?;

    let message_id = take_required(&mut fields, "MsgId")
        .or_else(|_| take_required(&mut fields, "message_id"))
        .map_err(|_| MalformedPayload::MissingField("MsgId"))?;
    let from_addr = take_required(&mut fields, "FromUserName")?;
    let to_addr = take_required(&mut fields, "ToUserName")?;
    let content = take_required(&mut fields, "Content")?;
    let msg_type = fields
        .remove("MsgType")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let created_at = fields
        .get("CreateTime")
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    Ok(InboundEvent {
        message_id,
        from_addr,
        to_addr,
        content,
        transport_type: TRANSPORT_TYPE.to_string(),
        msg_type,
        created_at,
    })
}

fn take_required(
    fields: &mut HashMap<String, String>,
    name: &'static str,
) -> Result<String, MalformedPayload> {
    match fields.remove(name) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(MalformedPayload::MissingField(name)),
    }
}

/// Collect the text of each direct child of the root element, keyed by tag name.
fn read_fields(text: &str) -> Result<HashMap<String, String>, MalformedPayload> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut fields = HashMap::new();
    let mut depth = 0usize;
    let mut seen_root = false;
    let mut current: Option<String> = None;

    loop {
        match reader.read_event().map_err(not_well_formed)? {
            Event::Start(e) => {
                if depth == 0 {
                    if seen_root {
                        return Err(not_well_formed("more than one root element"));
                    }
                    seen_root = true;
                }
                depth += 1;
                if depth == 2 {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    fields.insert(name.clone(), String::new());
                    current = Some(name);
                }
            }
            Event::Empty(e) => {
                if depth == 0 {
                    if seen_root {
                        return Err(not_well_formed("more than one root element"));
                    }
                    seen_root = true;
                } else if depth == 1 {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    fields.insert(name, String::new());
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    current = None;
                }
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| not_well_formed("unmatched closing tag"))?;
            }
            Event::Text(t) => {
                if depth == 0 {
                    return Err(not_well_formed("text outside the root element"));
                }
                if depth == 2 {
                    let value = t.unescape().map_err(not_well_formed)?;
                    append(&mut fields, current.as_deref(), &value);
                }
            }
            Event::CData(c) => {
                if depth == 0 {
                    return Err(not_well_formed("CDATA outside the root element"));
                }
                if depth == 2 {
                    let value = std::str::from_utf8(&c).map_err(not_well_formed)?;
                    append(&mut fields, current.as_deref(), value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(not_well_formed("no root element"));
    }
    if depth != 0 {
        return Err(not_well_formed("document ended inside an element"));
    }
    Ok(fields)
}

fn append(fields: &mut HashMap<String, String>, current: Option<&str>, value: &str) {
    if let Some(slot) = current.and_then(|name| fields.get_mut(name)) {
        slot.push_str(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(fields: &[(&str, &str)]) -> String {
        let mut out = String::from("<xml>");
        for (tag, value) in fields {
            out.push_str(&format!("<{tag}><![CDATA[{value}]]></{tag}>"));
        }
        out.push_str("</xml>");
        out
    }

    #[test]
    fn parses_fields_regardless_of_order() {
        let forward = document(&[
            ("MsgId", "42"),
            ("FromUserName", "a"),
            ("ToUserName", "b"),
            ("Content", "hello"),
        ]);
        let reversed = document(&[
            ("Content", "hello"),
            ("ToUserName", "b"),
            ("FromUserName", "a"),
            ("MsgId", "42"),
        ]);
        for doc in [forward, reversed] {
            let event = parse(doc.as_bytes()).unwrap();
            assert_eq!(event.message_id, "42");
            assert_eq!(event.from_addr, "a");
            assert_eq!(event.to_addr, "b");
            assert_eq!(event.content, "hello");
            assert_eq!(event.transport_type, "wechat");
        }
    }

    #[test]
    fn parses_wechat_text_message_with_whitespace() {
        let doc = r#"
            <xml>
              <ToUserName><![CDATA[gh_123]]></ToUserName>
              <FromUserName><![CDATA[oUser]]></FromUserName>
              <CreateTime>1348831860</CreateTime>
              <MsgType><![CDATA[text]]></MsgType>
              <Content><![CDATA[this is a test]]></Content>
              <MsgId>1234567890123456</MsgId>
            </xml>
        "#;
        let event = parse(doc.as_bytes()).unwrap();
        assert_eq!(event.message_id, "1234567890123456");
        assert_eq!(event.from_addr, "oUser");
        assert_eq!(event.to_addr, "gh_123");
        assert_eq!(event.content, "this is a test");
        assert_eq!(event.msg_type.as_deref(), Some("text"));
        assert_eq!(
            event.created_at,
            DateTime::<Utc>::from_timestamp(1348831860, 0)
        );
    }

    #[test]
    fn accepts_plain_text_values_and_message_id_tag() {
        let doc = "<xml><message_id>7</message_id><FromUserName>a</FromUserName>\
                   <ToUserName>b</ToUserName><Content>fish &amp; chips</Content></xml>";
        let event = parse(doc.as_bytes()).unwrap();
        assert_eq!(event.message_id, "7");
        assert_eq!(event.content, "fish & chips");
        assert_eq!(event.msg_type, None);
        assert_eq!(event.created_at, None);
    }

    #[test]
    fn missing_content_is_malformed() {
        let doc = document(&[("MsgId", "42"), ("FromUserName", "a"), ("ToUserName", "b")]);
        assert_eq!(
            parse(doc.as_bytes()),
            Err(MalformedPayload::MissingField("Content"))
        );
    }

    #[test]
    fn empty_field_is_malformed() {
        let doc = "<xml><MsgId>42</MsgId><FromUserName/><ToUserName>b</ToUserName>\
                   <Content>hi</Content></xml>";
        assert_eq!(
            parse(doc.as_bytes()),
            Err(MalformedPayload::MissingField("FromUserName"))
        );
    }

    #[test]
    fn missing_message_id_is_malformed() {
        let doc = document(&[("FromUserName", "a"), ("ToUserName", "b"), ("Content", "hi")]);
        assert_eq!(
            parse(doc.as_bytes()),
            Err(MalformedPayload::MissingField("MsgId"))
        );
    }

    #[test]
    fn rejects_documents_that_are_not_well_formed() {
        for doc in [
            "",
            "not xml at all",
            "<xml><MsgId>42</MsgId>",
            "<xml><MsgId>42</Content></xml>",
            "<xml></xml><xml></xml>",
        ] {
            assert!(
                matches!(parse(doc.as_bytes()), Err(MalformedPayload::NotWellFormed(_))),
                "expected NotWellFormed for {:?}",
                doc
            );
        }
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert_eq!(parse(&[0x3c, 0xff, 0xfe]), Err(MalformedPayload::NotUtf8));
    }
}
