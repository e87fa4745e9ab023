//! Incremental decoding of JSON string content.

const REPLACEMENT: char = '\u{FFFD}';

/// Decodes the raw content of one JSON string as it arrives.
///
/// Escape sequences split across pushes are held back until complete, so
/// the decoded value never contains half an escape.
#[derive(Debug, Default, Clone)]
pub(crate) struct Unescaper {
    pending: String,
    value: String,
}

impl Unescaper {
    /// Append raw string content; returns the newly decoded text.
    pub fn push(&mut self, raw: &str) -> String {
        self.pending.push_str(raw);
        let before = self.value.len();
        let consumed = decode_into(&self.pending, &mut self.value, false);
        self.pending.drain(..consumed);
        self.value[before..].to_string()
    }

    /// Decode whatever is still pending, replacing broken escapes.
    pub fn finish(&mut self) -> String {
        let before = self.value.len();
        let pending = std::mem::take(&mut self.pending);
        decode_into(&pending, &mut self.value, true);
        self.value[before..].to_string()
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Decode a complete JSON string body (without the surrounding quotes).
pub(crate) fn decode_json_string(raw: &str) -> String {
    if !raw.contains('\\') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    decode_into(raw, &mut out, true);
    out
}

fn hex4(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 4 || !bytes[..4].iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let digits = std::str::from_utf8(&bytes[..4]).ok()?;
    u32::from_str_radix(digits, 16).ok()
}

/// Decode `raw` into `out`, returning the number of bytes consumed.
///
/// Unless `final_pass` is set, an escape cut off by the end of `raw` is left
/// unconsumed for the next call.
fn decode_into(raw: &str, out: &mut String, final_pass: bool) -> usize {
    let bytes = raw.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match raw[i..].find('\\') {
            None => {
                out.push_str(&raw[i..]);
                return bytes.len();
            }
            Some(offset) => {
                out.push_str(&raw[i..i + offset]);
                i += offset;
            }
        }

        // bytes[i] is a backslash
        let Some(&kind) = bytes.get(i + 1) else {
            if final_pass {
                return bytes.len();
            }
            return i;
        };

        let simple = match kind {
            b'"' => Some('"'),
            b'\\' => Some('\\'),
            b'/' => Some('/'),
            b'b' => Some('\u{8}'),
            b'f' => Some('\u{c}'),
            b'n' => Some('\n'),
            b'r' => Some('\r'),
            b't' => Some('\t'),
            _ => None,
        };
        if let Some(c) = simple {
            out.push(c);
            i += 2;
            continue;
        }

        if kind != b'u' {
            // Unknown escape: keep the escaped character itself
            let c = raw[i + 1..].chars().next().unwrap_or(REPLACEMENT);
            out.push(c);
            i += 1 + c.len_utf8();
            continue;
        }

        let rest = &bytes[i + 2..];
        if rest.len() < 4 && rest.iter().all(u8::is_ascii_hexdigit) && !final_pass {
            return i;
        }
        let Some(code) = hex4(rest) else {
            out.push(REPLACEMENT);
            i += 2;
            continue;
        };

        if (0xD800..0xDC00).contains(&code) {
            let tail = &bytes[i + 6..];
            let low_prefix = b"\\u";
            let could_complete = tail.len() < 6
                && tail.iter().take(2).zip(low_prefix.iter()).all(|(a, b)| a == b)
                && tail.iter().skip(2).all(u8::is_ascii_hexdigit);
            if could_complete && !final_pass {
                return i;
            }
            let low = if tail.starts_with(low_prefix) {
                hex4(&tail[2..]).filter(|low| (0xDC00..0xE000).contains(low))
            } else {
                None
            };
            match low {
                Some(low) => {
                    let combined = 0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
                    out.push(char::from_u32(combined).unwrap_or(REPLACEMENT));
                    i += 12;
                }
                None => {
                    out.push(REPLACEMENT);
                    i += 6;
                }
            }
            continue;
        }

        out.push(char::from_u32(code).unwrap_or(REPLACEMENT));
        i += 6;
    }

    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_simple_escapes() {
        assert_eq!(decode_json_string(r#"a\"b\\c\/d\ne\tf"#), "a\"b\\c/d\ne\tf");
        assert_eq!(decode_json_string("plain"), "plain");
    }

    #[test]
    fn test_decodes_unicode_and_surrogates() {
        assert_eq!(decode_json_string(r"\u00e9"), "\u{e9}");
        assert_eq!(decode_json_string(r"\ud83d\ude00"), "\u{1F600}");
        assert_eq!(decode_json_string(r"\ud83dx"), "\u{FFFD}x");
    }

    #[test]
    fn test_holds_back_split_escapes() {
        let mut dec = Unescaper::default();
        assert_eq!(dec.push("ab\\"), "ab");
        assert_eq!(dec.push("n"), "\n");
        assert_eq!(dec.push("\\u00"), "");
        assert_eq!(dec.push("e9!"), "é!");
        assert_eq!(dec.push("\\ud83d"), "");
        assert_eq!(dec.push("\\ude00"), "😀");
        assert_eq!(dec.value(), "ab\né!😀");
    }

    #[test]
    fn test_finish_flushes_broken_escape() {
        let mut dec = Unescaper::default();
        assert_eq!(dec.push("x\\u12"), "x");
        assert_eq!(dec.finish(), "\u{FFFD}12");
    }
}
