use super::*;
use crate::error::LlmError;
use futures::StreamExt;
use serde_json::json;

const SEND_HI: &str = r#"{"toolCalls":[{"name":"send_message","arguments":{"message":"hi"}}]}"#;

fn parser(tracked: &[(&str, &str)]) -> ToolCallParser {
    let tracked: Vec<_> = tracked
        .iter()
        .map(|(tool, arg)| TrackedArgument::new(*tool, *arg))
        .collect();
    ToolCallParser::new(&tracked).unwrap()
}

fn feed_chunks(parser: &mut ToolCallParser, chunks: &[&str]) -> Vec<ParserEvent> {
    let mut events = Vec::new();
    for chunk in chunks {
        events.extend(parser.feed(chunk));
    }
    events.extend(parser.finalize());
    events
}

fn feed_chars(parser: &mut ToolCallParser, input: &str) -> Vec<ParserEvent> {
    let chars: Vec<String> = input.chars().map(String::from).collect();
    let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
    feed_chunks(parser, &refs)
}

fn completed(events: &[ParserEvent]) -> Vec<ParsedToolCall> {
    events
        .iter()
        .filter_map(|e| match e {
            ParserEvent::Completed(call) => Some(call.clone()),
            _ => None,
        })
        .collect()
}

fn deltas(events: &[ParserEvent]) -> Vec<ToolCallDelta> {
    events
        .iter()
        .filter_map(|e| match e {
            ParserEvent::Delta(delta) => Some(delta.clone()),
            _ => None,
        })
        .collect()
}

fn concat_new_text(events: &[ParserEvent], index: usize) -> String {
    deltas(events)
        .into_iter()
        .filter(|d| d.index == index)
        .map(|d| d.new_text)
        .collect()
}

#[test]
fn test_single_chunk_yields_one_call() {
    let events = feed_chunks(&mut parser(&[]), &[SEND_HI]);
    let calls = completed(&events);

    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].index, 0);
    assert_eq!(calls[0].call.name, "send_message");
    assert_eq!(calls[0].call.str_arg("message"), Some("hi"));
    assert_eq!(
        serde_json::to_value(&calls[0].call).unwrap(),
        json!({"name": "send_message", "arguments": {"message": "hi"}})
    );
    assert_eq!(calls[0].raw, r#"{"name":"send_message","arguments":{"message":"hi"}}"#);
}

#[test]
fn test_char_by_char_matches_single_chunk() {
    let whole = completed(&feed_chunks(&mut parser(&[]), &[SEND_HI]));
    let split = completed(&feed_chars(&mut parser(&[]), SEND_HI));
    assert_eq!(whole, split);
}

#[test]
fn test_deltas_reconstruct_tracked_value() {
    for events in [
        feed_chunks(&mut parser(&[("send_message", "message")]), &[SEND_HI]),
        feed_chars(&mut parser(&[("send_message", "message")]), SEND_HI),
    ] {
        assert_eq!(concat_new_text(&events, 0), "hi");

        let done_at = events
            .iter()
            .position(|e| matches!(e, ParserEvent::Completed(c) if c.index == 0))
            .unwrap();
        assert!(events[done_at..]
            .iter()
            .all(|e| !matches!(e, ParserEvent::Delta(d) if d.index == 0)));
    }
}

#[test]
fn test_delta_reports_value_so_far() {
    let mut p = parser(&[("send_*", "mess*")]);
    let mut events = p.feed(r#"{"toolCalls":[{"name":"send_message","arguments":{"message":"hel"#);
    events.extend(p.feed(r#"lo"}}]}"#));

    let deltas = deltas(&events);
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas[0].value, "hel");
    assert_eq!(deltas[0].new_text, "hel");
    assert_eq!(deltas[1].value, "hello");
    assert_eq!(deltas[1].new_text, "lo");
    assert_eq!(deltas[1].tool_name, "send_message");
    assert_eq!(deltas[1].argument_key, "message");
}

#[test]
fn test_untracked_pairs_emit_no_deltas() {
    let events = feed_chunks(&mut parser(&[("other_tool", "message")]), &[SEND_HI]);
    assert!(deltas(&events).is_empty());
    assert_eq!(completed(&events).len(), 1);
}

#[test]
fn test_multiple_calls_get_stable_indices() {
    let input = r#"{"toolCalls":[
        {"name":"set_expression","arguments":{"expression":"smile"}},
        {"name":"send_message","arguments":{"message":"a"}},
        {"name":"send_message","arguments":{"message":"b"}}
    ]}"#;
    let events = feed_chars(&mut parser(&[("send_message", "message")]), input);

    let calls = completed(&events);
    assert_eq!(
        calls.iter().map(|c| c.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(concat_new_text(&events, 1), "a");
    assert_eq!(concat_new_text(&events, 2), "b");
    assert!(deltas(&events).iter().all(|d| d.index != 0));
}

#[test]
fn test_call_is_reported_when_its_brace_closes() {
    let mut p = parser(&[]);
    let events = p.feed(r#"{"toolCalls":[{"name":"a","arguments":{}}"#);
    assert_eq!(completed(&events).len(), 1);

    let events = p.feed(r#",{"name":"b","arguments":{"x":1}"#);
    assert!(completed(&events).is_empty());

    let events = p.feed("}");
    let calls = completed(&events);
    assert_eq!(calls[0].call.name, "b");
    assert_eq!(calls[0].index, 1);
    assert_eq!(p.completed(), 2);
}

#[test]
fn test_nested_braces_in_untracked_arguments() {
    let input = r#"{"toolCalls":[{"name":"edit_canvas","arguments":{"canvas":"{ not } json }","shape":{"a":{"b":[{}]}},"message":"x"}},{"name":"send_message","arguments":{"message":"y"}}]}"#;
    let events = feed_chars(&mut parser(&[("*", "message")]), input);
    let calls = completed(&events);

    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].call.name, "edit_canvas");
    assert_eq!(calls[0].call.arguments["shape"], json!({"a": {"b": [{}]}}));
    assert_eq!(calls[1].call.name, "send_message");
    assert_eq!(concat_new_text(&events, 0), "x");
    assert_eq!(concat_new_text(&events, 1), "y");
}

#[test]
fn test_escapes_split_across_chunks() {
    let input = r#"{"toolCalls":[{"name":"send_message","arguments":{"message":"say \"hi\"\n\u00e9\ud83d\ude00"}}]}"#;
    let expected = "say \"hi\"\n\u{e9}\u{1F600}";

    let events = feed_chars(&mut parser(&[("send_message", "message")]), input);
    assert_eq!(concat_new_text(&events, 0), expected);
    assert_eq!(completed(&events)[0].call.str_arg("message"), Some(expected));

    let last = deltas(&events).pop().unwrap();
    assert_eq!(last.value, expected);
}

#[test]
fn test_entity_key_is_always_accumulated() {
    let input = r#"{"toolCalls":[{"name":"send_message","arguments":{"entityKey":"agent:4","message":"yo"}}]}"#;
    let events = feed_chars(&mut parser(&[("send_message", "message")]), input);

    let deltas = deltas(&events);
    assert!(!deltas.is_empty());
    assert!(deltas
        .iter()
        .all(|d| d.entity_key.as_deref() == Some("agent:4")));
    assert!(deltas.iter().all(|d| d.argument_key == "message"));
}

#[test]
fn test_alternative_shapes_are_normalized() {
    let input = r#"{"tool_calls":[
        {"function":{"name":"send_message","arguments":"{\"message\":\"a\"}"}},
        {"tool":"set_expression","params":{"expression":"grin"}},
        {"function":"update_memory","args":{"slot":1}}
    ]}"#;
    let calls = completed(&feed_chunks(&mut parser(&[]), &[input]));

    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].call.name, "send_message");
    assert_eq!(calls[0].call.str_arg("message"), Some("a"));
    assert_eq!(calls[1].call.name, "set_expression");
    assert_eq!(calls[1].call.str_arg("expression"), Some("grin"));
    assert_eq!(calls[2].call.name, "update_memory");
    assert_eq!(calls[2].call.i64_arg("slot"), Some(1));
}

#[test]
fn test_root_array_is_armed() {
    let input = r#"[{"name":"send_message","arguments":{"message":"hi"}}]"#;
    let events = feed_chars(&mut parser(&[("send_message", "message")]), input);
    assert_eq!(completed(&events).len(), 1);
    assert_eq!(concat_new_text(&events, 0), "hi");
}

#[test]
fn test_objects_outside_the_call_array_are_ignored() {
    let input = r#"{"meta":{"name":"not_a_call"},"toolCalls":[{"name":"a"}],"after":{"name":"b"}}"#;
    let calls = completed(&feed_chunks(&mut parser(&[]), &[input]));
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].call.name, "a");
    assert!(calls[0].call.arguments.is_empty());
}

#[test]
fn test_finalize_recovers_truncated_call() {
    let complete = completed(&feed_chunks(&mut parser(&[]), &[SEND_HI]));
    let truncated = &SEND_HI[..SEND_HI.len() - 3];

    for events in [
        feed_chunks(&mut parser(&[]), &[truncated]),
        feed_chars(&mut parser(&[]), truncated),
    ] {
        let recovered = completed(&events);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].index, complete[0].index);
        assert_eq!(recovered[0].call, complete[0].call);
    }
}

#[test]
fn test_finalize_drops_unsalvageable_fragment() {
    let mut p = parser(&[]);
    assert!(p.feed(r#"{"toolCalls":[{"arguments":{"message":"#).is_empty());
    // No name anywhere: nothing to report
    assert!(p.finalize().is_empty());
    assert!(p.finalize().is_empty());
}

#[test]
fn test_finalize_without_open_call_is_empty() {
    let mut p = parser(&[]);
    assert_eq!(completed(&p.feed(SEND_HI)).len(), 1);
    assert!(p.finalize().is_empty());
}

#[test]
fn test_any_glob_pattern_compiles() {
    // Metacharacters are escaped, so any pattern compiles
    assert!(ToolCallParser::new(&[TrackedArgument::new("(", "[")]).is_ok());
}

#[tokio::test]
async fn test_stream_adapter_yields_events_then_finalizes() {
    let chunks = futures::stream::iter(vec![
        Ok(r#"{"toolCalls":[{"name":"send_message","arguments":{"message":"h"#.to_string()),
        Ok(r#"i"}},{"name":"set_expression","arguments":{"expression":"sm"#.to_string()),
    ]);
    let events: Vec<_> = parse_tool_call_stream(chunks, parser(&[("send_message", "message")]))
        .collect()
        .await;
    let events: Vec<ParserEvent> = events.into_iter().map(Result::unwrap).collect();

    assert_eq!(concat_new_text(&events, 0), "hi");
    let calls = completed(&events);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].call.str_arg("expression"), Some("sm"));
}

#[tokio::test]
async fn test_stream_adapter_passes_errors_through() {
    let chunks = futures::stream::iter(vec![
        Ok(SEND_HI[..20].to_string()),
        Err(LlmError::Api {
            status: 503,
            message: "overloaded".to_string(),
        }),
        Ok(SEND_HI[20..].to_string()),
    ]);
    let events: Vec<_> = parse_tool_call_stream(chunks, parser(&[])).collect().await;

    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Err(LlmError::Api { status: 503, .. })));
}
