//! Turns raw child output into sequenced stream events

use crate::hub::EventHub;
use crate::types::{EventKind, EventPayload, StreamEvent};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct RouterState {
    next_sequence: u64,
    last_publish: Instant,
    finished: bool,
}

/// Per-session event publisher
pub struct OutputStreamRouter {
    session_id: String,
    hub: EventHub<StreamEvent>,
    state: Mutex<RouterState>,
}

impl OutputStreamRouter {
    pub fn new(session_id: impl Into<String>, hub: EventHub<StreamEvent>) -> Self {
        Self {
            session_id: session_id.into(),
            hub,
            state: Mutex::new(RouterState {
                next_sequence: 1,
                last_publish: Instant::now(),
                finished: false,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Publish a non-terminal event. Returns its sequence, or `None` after `finish`.
    pub fn publish(&self, kind: EventKind, payload: EventPayload) -> Option<u64> {
        if kind.is_terminal() {
            return self.finish(kind, payload);
        }
        let mut state = self.state.lock();
        if state.finished {
            tracing::debug!("Dropping {:?} event for finished session {}", kind, self.session_id);
            return None;
        }
        Some(self.emit(&mut state, kind, payload))
    }

    /// Publish the single terminal event of the session
    pub fn finish(&self, kind: EventKind, payload: EventPayload) -> Option<u64> {
        let mut state = self.state.lock();
        if state.finished {
            tracing::warn!("Session {} already finished, dropping {:?}", self.session_id, kind);
            return None;
        }
        state.finished = true;
        Some(self.emit(&mut state, kind, payload))
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Route one line of child output
    pub fn route_line(&self, line: &str) -> Option<u64> {
        let (kind, payload) = parse_line(line)?;
        self.publish(kind, payload)
    }

    fn emit(&self, state: &mut RouterState, kind: EventKind, content: EventPayload) -> u64 {
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.last_publish = Instant::now();
        self.hub.publish(StreamEvent {
            kind,
            content,
            sequence,
            session_id: self.session_id.clone(),
        });
        sequence
    }

    /// Publish `Keepalive` whenever the session has been quiet for `interval`
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let state = router.state.lock();
                    if state.finished {
                        break;
                    }
                    state.last_publish + interval
                };
                tokio::time::sleep_until(deadline).await;

                let mut state = router.state.lock();
                if state.finished {
                    break;
                }
                if Instant::now() >= state.last_publish + interval {
                    router.emit(&mut state, EventKind::Keepalive, EventPayload::None);
                }
            }
        })
    }
}

/// Classify one output line into an event kind and payload.
///
/// Blank lines yield nothing. A JSON object carrying a string `type` is a
/// stream-json record and becomes a projected `Message` (see
/// [`project_record`]); everything else is raw text.
pub fn parse_line(line: &str) -> Option<(EventKind, EventPayload)> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with('{') {
        if let Ok(record @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
            if record.get("type").and_then(Value::as_str).is_some() {
                let projected = project_record(record)?;
                return Some((EventKind::Message, EventPayload::Structured(projected)));
            }
        }
    }

    Some((EventKind::Message, EventPayload::Text(trimmed.to_string())))
}

/// Readable view of one stream-json record.
///
/// The result is `{record_type, text?, ..., record}` with the untouched record
/// under `record`. Assistant turns that only call tools yield `None`. The
/// agent's own `system/init` stays a `Message`: the session `Init` is published
/// by the supervisor.
pub fn project_record(record: Value) -> Option<Value> {
    let record_type = record.get("type").and_then(Value::as_str)?.to_string();
    let subtype = record.get("subtype").and_then(Value::as_str);

    let projected = match (record_type.as_str(), subtype) {
        ("system", Some("init")) => {
            let agent_session = record.get("session_id").and_then(Value::as_str).unwrap_or("");
            json!({
                "record_type": "init",
                "text": format!("Agent session {} started", short_id(agent_session)),
                "agent_session_id": agent_session,
                "record": record,
            })
        }
        ("assistant", _) => {
            let text = assistant_text(&record)?;
            json!({ "record_type": "assistant", "text": text, "record": record })
        }
        ("result", _) => {
            let is_error = record.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            match subtype {
                Some("success") if !is_error => {
                    let duration_ms = record.get("duration_ms").and_then(Value::as_f64).unwrap_or(0.0);
                    let cost = record.get("total_cost_usd").and_then(Value::as_f64).unwrap_or(0.0);
                    let turns = record.get("num_turns").and_then(Value::as_u64).unwrap_or(0);
                    json!({
                        "record_type": "result",
                        "outcome": "success",
                        "text": format!(
                            "Completed in {:.2}s | Cost: ${:.4} | Turns: {}",
                            duration_ms / 1000.0,
                            cost,
                            turns
                        ),
                        "duration_ms": duration_ms,
                        "cost_usd": cost,
                        "turns": turns,
                        "record": record,
                    })
                }
                other => {
                    let subtype = other.unwrap_or("unknown").to_string();
                    json!({
                        "record_type": "result",
                        "outcome": "error",
                        "error": subtype,
                        "text": result_error_message(&subtype),
                        "record": record,
                    })
                }
            }
        }
        ("error", _) => {
            let text = ["message", "content", "error"]
                .iter()
                .find_map(|key| record.get(*key).and_then(Value::as_str))
                .unwrap_or("The agent reported an error")
                .to_string();
            json!({ "record_type": "error", "text": text, "record": record })
        }
        _ => json!({ "record_type": record_type, "record": record }),
    };
    Some(projected)
}

/// Text blocks of an assistant turn; tool calls are left out
fn assistant_text(record: &Value) -> Option<String> {
    let blocks = record.pointer("/message/content")?.as_array()?;
    let parts: Vec<&str> = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn result_error_message(subtype: &str) -> String {
    let message = match subtype {
        "error_during_execution" => {
            "The agent hit an issue while finishing up. Generated files should still be valid."
        }
        "error_max_turns" => "The agent ran out of turns before finishing the request.",
        "timeout" => "The agent timed out. Try breaking the request into smaller tasks.",
        "resource_limit" => "The agent exceeded its resource limits. Try a smaller input or a simpler query.",
        "permission_denied" => "Permission denied. Check file permissions and access rights.",
        "network_error" => "Network problem while reaching the model. Check the connection and try again.",
        "invalid_input" => "Invalid input. Check the query and the input files.",
        "tool_error" => "A tool run by the agent failed. Check the input files and permissions.",
        other => return format!("The agent reported an error: {}", other),
    };
    message.to_string()
}

fn short_id(id: &str) -> &str {
    if id.is_empty() {
        return "unknown";
    }
    let start = id
        .char_indices()
        .rev()
        .nth(7)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &id[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("   "), None);
        assert_eq!(
            parse_line("plain output\r"),
            Some((EventKind::Message, EventPayload::Text("plain output".into())))
        );
        // Not a record: no string type, scalars, arrays, broken JSON
        for raw in [r#"{"text":"hi"}"#, "[1,2]", "42", r#"{"type":"#] {
            assert_eq!(
                parse_line(raw),
                Some((EventKind::Message, EventPayload::Text(raw.into())))
            );
        }
    }

    fn projected(line: &str) -> Value {
        match parse_line(line) {
            Some((EventKind::Message, EventPayload::Structured(value))) => value,
            other => panic!("expected a structured message, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_init_is_a_message() {
        let line = r#"{"type":"system","subtype":"init","session_id":"0123456789abcdef"}"#;
        let value = projected(line);
        assert_eq!(value["record_type"], "init");
        assert_eq!(value["text"], "Agent session 89abcdef started");
        assert_eq!(value["record"], serde_json::from_str::<Value>(line).unwrap());
    }

    #[test]
    fn test_assistant_text_without_tool_calls() {
        let value = projected(
            r#"{"type":"assistant","message":{"content":[
                {"type":"text","text":"  Reading main.py "},
                {"type":"tool_use","name":"Read","input":{"path":"main.py"}},
                {"type":"text","text":"Writing main.rs"}]}}"#,
        );
        assert_eq!(value["record_type"], "assistant");
        assert_eq!(value["text"], "Reading main.py\nWriting main.rs");
        assert_eq!(value["record"]["message"]["content"][1]["name"], "Read");

        let tools_only = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash"}]}}"#;
        assert_eq!(parse_line(tools_only), None);
    }

    #[test]
    fn test_result_success_summary() {
        let value = projected(
            r#"{"type":"result","subtype":"success","duration_ms":12340,"total_cost_usd":0.01234,"num_turns":7}"#,
        );
        assert_eq!(value["outcome"], "success");
        assert_eq!(value["text"], "Completed in 12.34s | Cost: $0.0123 | Turns: 7");
        assert_eq!(value["turns"], 7);
        assert_eq!(value["record"]["num_turns"], 7);
    }

    #[test]
    fn test_result_error_subtypes() {
        for (subtype, needle) in [
            ("error_during_execution", "should still be valid"),
            ("error_max_turns", "ran out of turns"),
            ("timeout", "timed out"),
            ("resource_limit", "resource limits"),
            ("permission_denied", "Permission denied"),
            ("network_error", "Network problem"),
            ("invalid_input", "Invalid input"),
            ("tool_error", "tool run by the agent failed"),
            ("brand_new_failure", "reported an error: brand_new_failure"),
        ] {
            let line = json!({ "type": "result", "subtype": subtype, "is_error": true }).to_string();
            let value = projected(&line);
            assert_eq!(value["outcome"], "error");
            assert_eq!(value["error"], subtype);
            assert!(
                value["text"].as_str().unwrap().contains(needle),
                "{}: {}",
                subtype,
                value["text"]
            );
        }

        let flagged = projected(r#"{"type":"result","subtype":"success","is_error":true}"#);
        assert_eq!(flagged["outcome"], "error");
    }

    #[test]
    fn test_other_records_pass_through() {
        let value = projected(r#"{"type":"error","message":"rate limited"}"#);
        assert_eq!(value["record_type"], "error");
        assert_eq!(value["text"], "rate limited");

        let value = projected(r#"{"type":"user","message":{"content":[]}}"#);
        assert_eq!(value["record_type"], "user");
        assert!(value.get("text").is_none());
        assert_eq!(value["record"]["type"], "user");
    }

    #[tokio::test]
    async fn test_sequences_start_at_one_and_increase() {
        let hub = EventHub::new(16);
        let mut sub = hub.subscribe();
        let router = OutputStreamRouter::new("s1", hub);

        assert_eq!(router.route_line("a"), Some(1));
        assert_eq!(router.route_line(""), None);
        assert_eq!(router.route_line("b"), Some(2));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.session_id, "s1");
        assert_eq!(sub.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_single_terminal_event() {
        let hub = EventHub::new(16);
        let mut sub = hub.subscribe();
        let router = OutputStreamRouter::new("s1", hub);

        router.route_line("working");
        assert_eq!(router.finish(EventKind::Complete, json!({"exit_code": 0}).into()), Some(2));
        assert_eq!(router.finish(EventKind::Error, EventPayload::None), None);
        assert_eq!(router.route_line("late"), None);
        assert!(router.is_finished());

        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Message);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Complete);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_keepalive_fills_quiet_periods() {
        let hub = EventHub::new(64);
        let mut sub = hub.subscribe();
        let router = Arc::new(OutputStreamRouter::new("s1", hub));

        let keepalive = router.spawn_keepalive(Duration::from_millis(40));
        tokio::time::sleep(Duration::from_millis(150)).await;
        router.finish(EventKind::Complete, EventPayload::None);
        tokio::time::timeout(Duration::from_secs(1), keepalive)
            .await
            .unwrap()
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        let keepalives = events.iter().filter(|e| e.kind == EventKind::Keepalive).count();
        assert!(keepalives >= 2, "got {} keepalives", keepalives);
        assert_eq!(events.last().unwrap().kind, EventKind::Complete);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=events.len() as u64).collect::<Vec<_>>());
    }
}
