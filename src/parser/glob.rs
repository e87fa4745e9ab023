use regex::Regex;

/// Compile a `*` glob into an anchored regex.
///
/// Every regex metacharacter in the pattern is matched literally; only `*`
/// is special and matches any run of characters, including none.
pub fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?s)^{}$", body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern_matches_exactly() {
        let re = compile_glob("send_message").unwrap();
        assert!(re.is_match("send_message"));
        assert!(!re.is_match("send_message_now"));
        assert!(!re.is_match("xsend_message"));
    }

    #[test]
    fn test_star_matches_any_run() {
        let re = compile_glob("send_*").unwrap();
        assert!(re.is_match("send_"));
        assert!(re.is_match("send_message"));
        assert!(!re.is_match("resend_message"));

        let any = compile_glob("*").unwrap();
        assert!(any.is_match(""));
        assert!(any.is_match("anything at all"));
    }

    #[test]
    fn test_metacharacters_are_literal() {
        let re = compile_glob("a.b+(c)?[d]|e$^").unwrap();
        assert!(re.is_match("a.b+(c)?[d]|e$^"));
        assert!(!re.is_match("axb+(c)?[d]|e$^"));
        assert!(!re.is_match("abbc"));

        let dotted = compile_glob("tool.*").unwrap();
        assert!(dotted.is_match("tool.run"));
        assert!(!dotted.is_match("toolXrun"));
    }
}
