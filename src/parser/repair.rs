//! Best-effort repair of truncated or sloppy JSON emitted by a model.

const LITERALS: [&str; 3] = ["true", "false", "null"];

/// Repair `input` into parseable JSON.
///
/// Markdown fences and any noise before the first `{` or `[` are stripped,
/// `//` and `/* */` comments and trailing commas are dropped, closers that do
/// not match the open bracket are discarded, and whatever is still open at
/// the end (a string, a key without a value, brackets) is closed. Returns
/// `None` when the result still does not parse.
pub fn repair_json(input: &str) -> Option<String> {
    let body = strip_fences(input);
    let start = body.find(['{', '['])?;
    let body = &body[start..];
    let bytes = body.as_bytes();

    let mut out = String::with_capacity(body.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut string_start = 0;
    let mut last_string = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
                out.push('"');
                last_string = Some((string_start, out.len()));
                i += 1;
                continue;
            }
            // Copy the whole UTF-8 sequence
            let width = utf8_width(b);
            out.push_str(&body[i..i + width]);
            i += width;
            continue;
        }

        match b {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = body[i..].find('\n').map_or(bytes.len(), |n| i + n);
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = body[i + 2..].find("*/").map_or(bytes.len(), |n| i + 2 + n + 2);
                continue;
            }
            b'"' => {
                in_string = true;
                string_start = out.len();
                out.push('"');
            }
            b'{' => {
                stack.push('}');
                out.push('{');
            }
            b'[' => {
                stack.push(']');
                out.push('[');
            }
            b'}' | b']' => {
                let closer = b as char;
                if stack.last() == Some(&closer) {
                    drop_trailing_comma(&mut out);
                    stack.pop();
                    out.push(closer);
                    if stack.is_empty() {
                        break;
                    }
                }
            }
            _ => {
                let width = utf8_width(b);
                out.push_str(&body[i..i + width]);
                i += width;
                continue;
            }
        }
        i += 1;
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
        last_string = Some((string_start, out.len()));
    }

    if !stack.is_empty() {
        close_dangling_value(&mut out, &stack, last_string);
        while let Some(closer) = stack.pop() {
            drop_trailing_comma(&mut out);
            out.push(closer);
        }
    }

    serde_json::from_str::<serde_json::Value>(&out).ok()?;
    Some(out)
}

fn strip_fences(input: &str) -> &str {
    let mut body = input.trim();
    if body.starts_with("```") {
        body = body.find('\n').map_or("", |n| &body[n + 1..]);
    }
    if let Some(stripped) = body.trim_end().strip_suffix("```") {
        body = stripped;
    }
    body
}

fn utf8_width(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

fn drop_trailing_comma(out: &mut String) {
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    if out.ends_with(',') {
        out.pop();
    }
}

/// Give the innermost open container a well-formed last member.
fn close_dangling_value(out: &mut String, stack: &[char], last_string: Option<(usize, usize)>) {
    drop_trailing_comma(out);

    if out.ends_with(':') {
        out.push_str("null");
        return;
    }

    // A string that ends the text inside an object is a key when it follows
    // `{` or `,`
    if let Some((start, end)) = last_string {
        if end == out.len() && stack.last() == Some(&'}') {
            let before = out[..start].trim_end();
            if before.ends_with('{') || before.ends_with(',') {
                out.push_str(":null");
            }
        }
        if end == out.len() {
            return;
        }
    }

    let word_len = out
        .bytes()
        .rev()
        .take_while(u8::is_ascii_alphabetic)
        .count();
    if word_len > 0 {
        let word = &out[out.len() - word_len..];
        if let Some(literal) = LITERALS.iter().find(|l| l.starts_with(word)) {
            let rest = &literal[word.len()..];
            out.push_str(rest);
        }
        return;
    }

    if out.ends_with(['-', '+', '.']) {
        out.push('0');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn repaired(input: &str) -> Value {
        let text = repair_json(input).unwrap_or_else(|| panic!("no repair for {input:?}"));
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_valid_json_passes_through() {
        let input = r#"{"name":"send_message","arguments":{"message":"hi"}}"#;
        assert_eq!(repair_json(input).as_deref(), Some(input));
    }

    #[test]
    fn test_closes_truncated_object() {
        assert_eq!(
            repaired(r#"{"name":"send_message","arguments":{"message":"hi"#),
            json!({"name": "send_message", "arguments": {"message": "hi"}})
        );
        assert_eq!(
            repaired(r#"{"name":"a","arguments":{"list":[1,2"#),
            json!({"name": "a", "arguments": {"list": [1, 2]}})
        );
    }

    #[test]
    fn test_strips_fences_noise_and_comments() {
        let input = "```json\nSure! {\"a\": 1, // first\n \"b\": /* two */ 2,}\n```";
        assert_eq!(repaired(input), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_drops_trailing_commas_and_excess_closers() {
        assert_eq!(repaired(r#"{"a":[1,2,],}"#), json!({"a": [1, 2]}));
        assert_eq!(repaired(r#"{"a":[1]]}"#), json!({"a": [1]}));
        assert_eq!(repaired(r#"{"a":1}}} trailing"#), json!({"a": 1}));
    }

    #[test]
    fn test_completes_dangling_members() {
        assert_eq!(repaired(r#"{"a":"#), json!({"a": null}));
        assert_eq!(repaired(r#"{"a":1,"b"#), json!({"a": 1, "b": null}));
        assert_eq!(repaired(r#"{"a":tr"#), json!({"a": true}));
        assert_eq!(repaired(r#"{"a":nu"#), json!({"a": null}));
        assert_eq!(repaired(r#"{"a":1."#), json!({"a": 1.0}));
        assert_eq!(repaired(r#"{"a":1,"#), json!({"a": 1}));
    }

    #[test]
    fn test_lone_trailing_backslash_is_dropped() {
        assert_eq!(repaired(r#"{"a":"x\"#), json!({"a": "x"}));
    }

    #[test]
    fn test_keeps_multibyte_text() {
        assert_eq!(repaired("{\"a\":\"h\u{e9}llo \u{1F600}"), json!({"a": "h\u{e9}llo \u{1F600}"}));
    }

    #[test]
    fn test_unsalvageable_input_is_none() {
        assert_eq!(repair_json("no json here"), None);
        assert_eq!(repair_json(r#"{"a": bogus"#), None);
    }
}
