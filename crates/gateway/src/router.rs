//! Per-client dispatch of inbound commands to browser operations.
//!
//! The open `type` string from the wire becomes a closed tagged union at this
//! boundary; an unknown tag is a recoverable protocol error, not a parse
//! failure. Every handler catches its own failures and answers with an error
//! envelope - propagation is reserved for the fabric's retry plumbing.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use periscope_browser::NavTimeouts;

use crate::config::FabricConfig;
use crate::connection::ClientSink;
use crate::fabric::{with_retry, with_timeout, RetryPolicy};
use crate::session::SessionManager;

/// Commands a client may send. Tags mirror the wire `type` field.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Navigate {
        url: String,
    },
    Click {
        x: f64,
        y: f64,
    },
    Scroll {
        #[serde(rename = "deltaY")]
        delta_y: f64,
    },
    Hover {
        x: f64,
        y: f64,
    },
    #[serde(rename = "type")]
    Type {
        text: String,
    },
    Evaluate {
        code: String,
    },
    RequestScreenshotAndHtml,
    SetViewport {
        width: u32,
        height: u32,
    },
    Heartbeat,
}

impl ClientCommand {
    /// The `type` tag used in this command's reply envelope.
    fn reply_kind(&self) -> &'static str {
        match self {
            ClientCommand::Navigate { .. } => "navigation",
            ClientCommand::Click { .. } => "click",
            ClientCommand::Scroll { .. } => "scroll",
            ClientCommand::Hover { .. } => "hover",
            ClientCommand::Type { .. } => "type",
            ClientCommand::Evaluate { .. } => "evaluate",
            ClientCommand::RequestScreenshotAndHtml => "screenshot_and_html",
            ClientCommand::SetViewport { .. } => "viewport_updated",
            ClientCommand::Heartbeat => "heartbeat",
        }
    }
}

const KNOWN_TYPES: &[&str] = &[
    "navigate",
    "click",
    "scroll",
    "hover",
    "type",
    "evaluate",
    "request_screenshot_and_html",
    "set_viewport",
    "heartbeat",
];

/// Decoded inbound message, including the recoverable failure shapes.
#[derive(Debug)]
pub enum Inbound {
    Command(ClientCommand),
    /// Well-formed JSON with a tag this server does not understand.
    Unknown { orig: String },
    /// Bad JSON, a missing tag, or a malformed payload for a known tag.
    Invalid { reason: String },
}

/// Two-step parse: pull the tag out first so unknown tags and malformed
/// payloads get distinct, recoverable answers.
pub fn parse_message(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return Inbound::Invalid {
                reason: format!("invalid JSON: {e}"),
            }
        }
    };

    let Some(tag) = value.get("type").and_then(Value::as_str) else {
        return Inbound::Invalid {
            reason: "missing message type".into(),
        };
    };
    let tag = tag.to_string();

    if !KNOWN_TYPES.contains(&tag.as_str()) {
        return Inbound::Unknown {
            orig: tag.to_string(),
        };
    }

    match serde_json::from_value::<ClientCommand>(value) {
        Ok(command) => Inbound::Command(command),
        Err(e) => Inbound::Invalid {
            reason: format!("malformed {tag} payload: {e}"),
        },
    }
}

/// Remove every `<svg>...</svg>` block (nesting-aware) from an HTML string.
pub fn strip_svg(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;

    while let Some(rel) = lower[pos..].find("<svg") {
        let start = pos + rel;
        out.push_str(&html[pos..start]);

        let mut depth = 1usize;
        let mut cursor = start + 4;
        let end = loop {
            let open = lower[cursor..].find("<svg").map(|i| cursor + i);
            let close = lower[cursor..].find("</svg").map(|i| cursor + i);
            match (open, close) {
                (Some(o), Some(c)) if o < c => {
                    depth += 1;
                    cursor = o + 4;
                }
                (_, Some(c)) => {
                    depth -= 1;
                    let tag_end = lower[c..]
                        .find('>')
                        .map(|i| c + i + 1)
                        .unwrap_or(lower.len());
                    cursor = tag_end;
                    if depth == 0 {
                        break tag_end;
                    }
                }
                // Unbalanced markup: drop the remainder.
                _ => break lower.len(),
            }
        };
        pos = end;
    }

    out.push_str(&html[pos..]);
    out
}

/// Per-client command dispatcher.
pub struct MessageRouter {
    sessions: Arc<SessionManager>,
    fabric: FabricConfig,
}

impl MessageRouter {
    pub fn new(sessions: Arc<SessionManager>, fabric: FabricConfig) -> Arc<Self> {
        Arc::new(Self { sessions, fabric })
    }

    /// Decode, dispatch, and answer one inbound message.
    pub async fn dispatch(&self, client_id: &str, text: &str, sink: &Arc<dyn ClientSink>) {
        let reply = self.handle(client_id, text).await;
        sink.send_json(&reply);
    }

    /// Same as [`dispatch`] but returning the reply, for callers that manage
    /// the channel themselves.
    pub async fn handle(&self, client_id: &str, text: &str) -> Value {
        match parse_message(text) {
            Inbound::Command(command) => self.handle_command(client_id, command).await,
            Inbound::Unknown { orig } => {
                tracing::debug!(%client_id, tag = %orig, "unknown message type");
                json!({
                    "type": orig,
                    "status": "error",
                    "message": format!("Unknown message type: {orig}"),
                })
            }
            Inbound::Invalid { reason } => {
                tracing::debug!(%client_id, %reason, "invalid message");
                json!({
                    "type": "error",
                    "status": "error",
                    "error": reason,
                    "recoverable": true,
                })
            }
        }
    }

    async fn handle_command(&self, client_id: &str, command: ClientCommand) -> Value {
        // Heartbeats answer even while the session is recovering.
        if command == ClientCommand::Heartbeat {
            return json!({
                "type": "heartbeat",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
        }

        let kind = command.reply_kind();
        let Some(session) = self.sessions.get(client_id).await else {
            return json!({
                "type": kind,
                "status": "error",
                "error": "session unavailable",
                "recoverable": true,
            });
        };

        match command {
            ClientCommand::Navigate { url } => {
                let policy = RetryPolicy {
                    retries: self.fabric.nav_retries,
                    backoff: self.fabric.nav_backoff,
                    timeout: self.fabric.nav_primary_timeout + self.fabric.nav_fallback_timeout,
                };
                let timeouts = NavTimeouts {
                    primary: self.fabric.nav_primary_timeout,
                    fallback: self.fabric.nav_fallback_timeout,
                };
                let page = session.page.clone();
                let target = url.clone();
                let result = with_retry(
                    move || {
                        let page = page.clone();
                        let url = target.clone();
                        async move { page.navigate(&url, timeouts).await }
                    },
                    &policy,
                    "navigate",
                )
                .await;

                match result {
                    Ok(final_url) => json!({
                        "type": "navigation",
                        "status": "success",
                        "url": final_url,
                    }),
                    Err(e) => {
                        // Leave the page somewhere sane for the next command.
                        let reset = session.page.navigate(
                            "about:blank",
                            NavTimeouts {
                                primary: Duration::from_secs(5),
                                fallback: Duration::from_secs(5),
                            },
                        );
                        if let Err(reset_err) =
                            with_timeout(reset, Duration::from_secs(12), "nav reset").await
                        {
                            tracing::debug!(%client_id, error = %reset_err, "about:blank reset failed");
                        }
                        json!({
                            "type": "navigation",
                            "status": "error",
                            "error": e.to_string(),
                            "recoverable": true,
                        })
                    }
                }
            }

            ClientCommand::Click { x, y } => {
                let policy = RetryPolicy {
                    retries: 2,
                    backoff: self.fabric.op_backoff,
                    timeout: Duration::from_secs(5),
                };
                let page = session.page.clone();
                let result = with_retry(
                    move || {
                        let page = page.clone();
                        async move { page.click(x, y).await }
                    },
                    &policy,
                    "click",
                )
                .await;
                command_reply("click", result.map(|_| json!({ "x": x, "y": y })))
            }

            ClientCommand::Scroll { delta_y } => {
                let result = with_timeout(
                    session.page.scroll_by(delta_y),
                    self.fabric.op_timeout,
                    "scroll",
                )
                .await;
                command_reply("scroll", result.map(|_| json!({ "deltaY": delta_y })))
            }

            ClientCommand::Hover { x, y } => {
                // A single attempt: retrying a hover makes the pointer jitter.
                let policy = RetryPolicy {
                    retries: 1,
                    backoff: self.fabric.op_backoff,
                    timeout: self.fabric.op_timeout,
                };
                let page = session.page.clone();
                let result = with_retry(
                    move || {
                        let page = page.clone();
                        async move { page.hover(x, y).await }
                    },
                    &policy,
                    "hover",
                )
                .await;
                command_reply("hover", result.map(|_| json!({ "x": x, "y": y })))
            }

            ClientCommand::Type { text } => {
                // Typing time scales with length (50 ms per char), so the
                // deadline does too.
                let deadline =
                    self.fabric.op_timeout + Duration::from_millis(60) * text.len() as u32;
                let result =
                    with_timeout(session.page.type_text(&text), deadline, "type").await;
                command_reply("type", result.map(|_| json!({})))
            }

            ClientCommand::Evaluate { code } => {
                let result = with_timeout(
                    session.page.eval(&code),
                    self.fabric.op_timeout,
                    "evaluate",
                )
                .await;
                match result {
                    Ok(outcome) if outcome.success => json!({
                        "type": "evaluate",
                        "status": "success",
                        "result": outcome.result.unwrap_or(Value::Null),
                    }),
                    Ok(outcome) => json!({
                        "type": "evaluate",
                        "status": "error",
                        "error": outcome.error.unwrap_or_else(|| "evaluation failed".into()),
                        "recoverable": true,
                    }),
                    Err(e) => error_reply("evaluate", &e.to_string()),
                }
            }

            ClientCommand::RequestScreenshotAndHtml => {
                let (screenshot, html) = tokio::join!(
                    with_timeout(
                        session.page.screenshot_jpeg(),
                        self.fabric.op_timeout,
                        "screenshot",
                    ),
                    with_timeout(session.page.content(), self.fabric.op_timeout, "content"),
                );
                match (screenshot, html) {
                    (Ok(screenshot), Ok(html)) => json!({
                        "type": "screenshot_and_html",
                        "screenshot": screenshot,
                        "html": strip_svg(&html),
                    }),
                    (Err(e), _) | (_, Err(e)) => {
                        error_reply("screenshot_and_html", &e.to_string())
                    }
                }
            }

            ClientCommand::SetViewport { width, height } => {
                match self.sessions.update_viewport(client_id, width, height).await {
                    Ok(()) => json!({
                        "type": "viewport_updated",
                        "width": width,
                        "height": height,
                    }),
                    Err(e) => error_reply("viewport_updated", &e.to_string()),
                }
            }

            ClientCommand::Heartbeat => unreachable!("handled above"),
        }
    }
}

fn command_reply(kind: &str, result: Result<Value, crate::fabric::FabricError>) -> Value {
    match result {
        Ok(extra) => {
            let mut reply = json!({ "type": kind, "status": "success" });
            if let (Some(obj), Some(extra)) = (reply.as_object_mut(), extra.as_object()) {
                for (k, v) in extra {
                    obj.insert(k.clone(), v.clone());
                }
            }
            reply
        }
        Err(e) => error_reply(kind, &e.to_string()),
    }
}

fn error_reply(kind: &str, error: &str) -> Value {
    json!({
        "type": kind,
        "status": "error",
        "error": error,
        "recoverable": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_parse() {
        match parse_message(r#"{"type":"navigate","url":"example.com"}"#) {
            Inbound::Command(ClientCommand::Navigate { url }) => assert_eq!(url, "example.com"),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_message(r#"{"type":"scroll","deltaY":120.5}"#) {
            Inbound::Command(ClientCommand::Scroll { delta_y }) => assert_eq!(delta_y, 120.5),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_message(r#"{"type":"type","text":"hello"}"#) {
            Inbound::Command(ClientCommand::Type { text }) => assert_eq!(text, "hello"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            parse_message(r#"{"type":"heartbeat"}"#),
            Inbound::Command(ClientCommand::Heartbeat)
        ));
    }

    #[test]
    fn unknown_tag_is_not_a_parse_failure() {
        match parse_message(r#"{"type":"teleport"}"#) {
            Inbound::Unknown { orig } => assert_eq!(orig, "teleport"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_for_known_tag_is_invalid() {
        match parse_message(r#"{"type":"click","x":"left"}"#) {
            Inbound::Invalid { reason } => assert!(reason.contains("click")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bad_json_is_invalid() {
        assert!(matches!(
            parse_message("{nope"),
            Inbound::Invalid { .. }
        ));
        assert!(matches!(
            parse_message(r#"{"url":"example.com"}"#),
            Inbound::Invalid { .. }
        ));
    }

    #[test]
    fn strip_svg_removes_single_block() {
        let html = "<div>before<svg width=\"1\"><path d=\"M0\"/></svg>after</div>";
        assert_eq!(strip_svg(html), "<div>beforeafter</div>");
    }

    #[test]
    fn strip_svg_handles_nested_and_multiple_blocks() {
        let html = "a<svg><svg></svg></svg>b<SVG></SVG>c";
        assert_eq!(strip_svg(html), "abc");
    }

    #[test]
    fn strip_svg_leaves_plain_html_alone() {
        let html = "<p>no vector art here</p>";
        assert_eq!(strip_svg(html), html);
    }

    #[test]
    fn strip_svg_drops_unbalanced_remainder() {
        let html = "keep<svg><path/>";
        assert_eq!(strip_svg(html), "keep");
    }

    #[test]
    fn reply_kinds_match_wire_vocabulary() {
        assert_eq!(
            ClientCommand::Navigate { url: String::new() }.reply_kind(),
            "navigation"
        );
        assert_eq!(
            ClientCommand::RequestScreenshotAndHtml.reply_kind(),
            "screenshot_and_html"
        );
        assert_eq!(
            ClientCommand::SetViewport {
                width: 1,
                height: 1
            }
            .reply_kind(),
            "viewport_updated"
        );
    }

    #[test]
    fn error_reply_is_recoverable() {
        let reply = error_reply("click", "boom");
        assert_eq!(reply["type"], "click");
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["recoverable"], true);
    }
}
