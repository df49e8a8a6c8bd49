//! Session event stream parsing (§4.F): a newline-delimited JSON log an agent
//! subprocess writes as it runs. The parser is deliberately fault-tolerant — a
//! malformed line never aborts ingestion, it just counts against
//! [`ParsedEvents::parse_error_count`].

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RunStart { ts: i64, step_title: Option<String> },
    StepStart { ts: i64, title: String, step: i64 },
    RunEnd { ts: i64, success: bool },
    ToolStart { ts: i64, tool_name: String, call_id: String },
    ToolEnd { ts: i64, tool_name: String, call_id: String },
    Anomaly { ts: i64 },
}

impl Event {
    pub fn ts(&self) -> i64 {
        match self {
            Event::RunStart { ts, .. }
            | Event::StepStart { ts, .. }
            | Event::RunEnd { ts, .. }
            | Event::ToolStart { ts, .. }
            | Event::ToolEnd { ts, .. }
            | Event::Anomaly { ts } => *ts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEvents {
    pub events: Vec<Event>,
    pub parse_error_count: i64,
}

fn parse_line(line: &str) -> Option<Event> {
    let value: Value = serde_json::from_str(line).ok()?;
    let ts = value.get("ts")?.as_i64()?;
    let kind = value.get("type")?.as_str()?;
    match kind {
        "run-start" => Some(Event::RunStart {
            ts,
            step_title: value.get("stepTitle").and_then(|v| v.as_str()).map(str::to_string),
        }),
        "step-start" => Some(Event::StepStart {
            ts,
            title: value.get("title")?.as_str()?.to_string(),
            step: value.get("step")?.as_i64()?,
        }),
        "run-end" => Some(Event::RunEnd {
            ts,
            success: value.get("success")?.as_bool()?,
        }),
        "tool-start" => Some(Event::ToolStart {
            ts,
            tool_name: value.get("toolName")?.as_str()?.to_string(),
            call_id: value.get("callId")?.as_str()?.to_string(),
        }),
        "tool-end" => Some(Event::ToolEnd {
            ts,
            tool_name: value.get("toolName")?.as_str()?.to_string(),
            call_id: value.get("callId")?.as_str()?.to_string(),
        }),
        "anomaly" => Some(Event::Anomaly { ts }),
        _ => None,
    }
}

/// Parse a session's `events.jsonl` content. Lines that fail to parse as JSON, or
/// that parse but lack a numeric `ts` / required fields for a *known* type, count
/// against `parse_error_count`. Lines with an unrecognized `type` are silently
/// skipped — they are not errors, just events this version doesn't understand yet.
pub fn parse_events(jsonl: &str) -> ParsedEvents {
    let mut out = ParsedEvents::default();
    for line in jsonl.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            out.parse_error_count += 1;
            continue;
        };
        let Some(kind) = value.get("type").and_then(|v| v.as_str()) else {
            out.parse_error_count += 1;
            continue;
        };
        let known = matches!(
            kind,
            "run-start" | "step-start" | "run-end" | "tool-start" | "tool-end" | "anomaly"
        );
        if !known {
            continue;
        }
        match parse_line(line) {
            Some(event) => out.events.push(event),
            None => out.parse_error_count += 1,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_event_types() {
        let jsonl = r#"
            {"type":"run-start","ts":0}
            {"type":"step-start","ts":10,"title":"plan","step":1}
            {"type":"tool-start","ts":20,"toolName":"bash","callId":"c1"}
            {"type":"tool-end","ts":30,"toolName":"bash","callId":"c1"}
            {"type":"anomaly","ts":35}
            {"type":"run-end","ts":40,"success":true}
        "#;
        let parsed = parse_events(jsonl);
        assert_eq!(parsed.events.len(), 6);
        assert_eq!(parsed.parse_error_count, 0);
    }

    #[test]
    fn unparseable_line_increments_error_count_but_does_not_abort() {
        let jsonl = "not json at all\n{\"type\":\"run-start\",\"ts\":0}";
        let parsed = parse_events(jsonl);
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.parse_error_count, 1);
    }

    #[test]
    fn missing_ts_on_a_known_type_is_a_parse_error() {
        let jsonl = "{\"type\":\"run-start\"}";
        let parsed = parse_events(jsonl);
        assert!(parsed.events.is_empty());
        assert_eq!(parsed.parse_error_count, 1);
    }

    #[test]
    fn unknown_type_is_skipped_without_counting_as_an_error() {
        let jsonl = "{\"type\":\"future-event\",\"ts\":0}";
        let parsed = parse_events(jsonl);
        assert!(parsed.events.is_empty());
        assert_eq!(parsed.parse_error_count, 0);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let jsonl = "\n\n{\"type\":\"anomaly\",\"ts\":5}\n\n";
        let parsed = parse_events(jsonl);
        assert_eq!(parsed.events.len(), 1);
    }
}
