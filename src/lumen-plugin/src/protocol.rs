//! Wire types for the launcher/plugin line protocol.
//!
//! Every message is a single line of JSON. Events flow from the launcher to a
//! plugin and are tagged by an `event` field; responses flow back and are
//! tagged by a `kind` field.

use serde::{Deserialize, Serialize};

/// Message sent from the launcher to a plugin process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Event {
    /// The user typed a query routed to this plugin.
    Query { value: String },
    /// Request a fill suggestion for the current best selection.
    Complete,
    /// The user chose the selection with this response-local id.
    Submit { id: u32 },
    /// Request a graceful exit.
    Quit,
}

impl Event {
    /// Short name of the event, matching its `event` discriminant.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Query { .. } => "query",
            Event::Complete => "complete",
            Event::Submit { .. } => "submit",
            Event::Quit => "quit",
        }
    }

    /// Whether the plugin answers this event with exactly one line.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Event::Query { .. } | Event::Complete)
    }
}

/// Message sent from a plugin process back to the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Response {
    /// Results for the most recent query.
    Queried { selections: Vec<Selection> },
    /// Text to place in the search field.
    Fill { text: String },
    /// The plugin asks the launcher to close.
    Close,
}

/// One candidate result offered by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Plugin-assigned id, unique within one `queried` response.
    pub id: u32,
    pub name: String,
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Outcome of classifying one incoming line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Response(Response),
    /// Valid JSON object whose `kind` is missing or not one we know.
    Unrecognized(Option<String>),
    /// Not JSON, or a known `kind` with a payload of the wrong shape.
    Malformed(String),
}

const KNOWN_KINDS: [&str; 3] = ["queried", "fill", "close"];

/// Serializes an event into one protocol line, without the terminator.
pub fn encode(event: &Event) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Serializes a response into one protocol line, without the terminator.
pub fn encode_response(response: &Response) -> Result<String, serde_json::Error> {
    serde_json::to_string(response)
}

/// Classifies a line received from a plugin. Never fails.
pub fn classify(line: &str) -> Decoded {
    let value: serde_json::Value = match serde_json::from_str(line.trim_end()) {
        Ok(value) => value,
        Err(err) => return Decoded::Malformed(err.to_string()),
    };

    let kind = value.get("kind").and_then(|k| k.as_str());
    match kind {
        Some(kind) if KNOWN_KINDS.contains(&kind) => {}
        other => return Decoded::Unrecognized(other.map(str::to_owned)),
    }

    match serde_json::from_value(value) {
        Ok(response) => Decoded::Response(response),
        Err(err) => Decoded::Malformed(err.to_string()),
    }
}

/// Decodes a line received from a plugin, collapsing every failure to `None`.
pub fn decode(line: &str) -> Option<Response> {
    match classify(line) {
        Decoded::Response(response) => Some(response),
        Decoded::Unrecognized(kind) => {
            tracing::debug!(kind = ?kind, "ignoring plugin line with unrecognized kind");
            None
        }
        Decoded::Malformed(reason) => {
            tracing::debug!(%reason, "ignoring malformed plugin line");
            None
        }
    }
}

/// Parses an event line. Used on the plugin side of the protocol.
pub fn decode_event(line: &str) -> Option<Event> {
    serde_json::from_str(line.trim_end()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_encode_with_event_tag() {
        assert_eq!(
            encode(&Event::Query {
                value: "calc:1+1".into()
            })
            .unwrap(),
            r#"{"event":"query","value":"calc:1+1"}"#
        );
        assert_eq!(encode(&Event::Complete).unwrap(), r#"{"event":"complete"}"#);
        assert_eq!(
            encode(&Event::Submit { id: 3 }).unwrap(),
            r#"{"event":"submit","id":3}"#
        );
        assert_eq!(encode(&Event::Quit).unwrap(), r#"{"event":"quit"}"#);
    }

    #[test]
    fn decodes_queried() {
        let line = r#"{"kind":"queried","selections":[{"id":0,"name":"2","description":null}]}"#;
        assert_eq!(
            decode(line),
            Some(Response::Queried {
                selections: vec![Selection {
                    id: 0,
                    name: "2".into(),
                    description: None,
                    icon: None,
                    content_type: None,
                }]
            })
        );
    }

    #[test]
    fn decodes_optional_selection_fields() {
        let line = r#"{"kind":"queried","selections":[{"id":4,"name":"docs","description":"folder","icon":"folder","content_type":"inode/directory"}]}"#;
        let Some(Response::Queried { selections }) = decode(line) else {
            panic!("expected queried response");
        };
        assert_eq!(selections[0].icon.as_deref(), Some("folder"));
        assert_eq!(selections[0].content_type.as_deref(), Some("inode/directory"));
        assert_eq!(selections[0].description.as_deref(), Some("folder"));
    }

    #[test]
    fn decodes_fill_and_close() {
        assert_eq!(
            decode(r#"{"kind":"fill","text":"/home/"}"#),
            Some(Response::Fill {
                text: "/home/".into()
            })
        );
        assert_eq!(decode("{\"kind\":\"close\"}\n"), Some(Response::Close));
    }

    #[test]
    fn empty_selection_list_is_a_response() {
        assert_eq!(
            decode(r#"{"kind":"queried","selections":[]}"#),
            Some(Response::Queried { selections: vec![] })
        );
    }

    #[test]
    fn unknown_or_missing_kind_is_unrecognized() {
        assert_eq!(
            classify(r#"{"kind":"explode"}"#),
            Decoded::Unrecognized(Some("explode".into()))
        );
        assert_eq!(classify(r#"{"text":"x"}"#), Decoded::Unrecognized(None));
        assert_eq!(decode(r#"{"kind":"explode"}"#), None);
    }

    #[test]
    fn malformed_lines_decode_to_none() {
        assert!(matches!(classify("not json"), Decoded::Malformed(_)));
        assert!(matches!(
            classify(r#"{"kind":"fill"}"#),
            Decoded::Malformed(_)
        ));
        assert_eq!(decode(""), None);
        assert_eq!(decode("[1,2,3]"), None);
    }

    #[test]
    fn plugin_side_parses_events() {
        assert_eq!(
            decode_event(r#"{"event":"submit","id":1}"#),
            Some(Event::Submit { id: 1 })
        );
        assert_eq!(decode_event(r#"{"event":"quit"}"#), Some(Event::Quit));
        assert_eq!(decode_event("garbage"), None);
        assert!(Event::Complete.expects_reply());
        assert!(!Event::Quit.expects_reply());
    }
}
