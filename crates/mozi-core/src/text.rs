//! Text utilities shared across the host: chunking for length-limited
//! transports, secret redaction for log output, base64 helpers.

use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

/// Split `text` into chunks of at most `limit` bytes, preferring to break
/// at a newline, then at a space. The whitespace character used as a break
/// point is dropped; everything else is preserved verbatim.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    assert!(limit > 0, "chunk limit must be positive");
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while remaining.len() > limit {
        // Pick a split point that lands on a char boundary within the limit.
        let mut window_end = limit;
        while !remaining.is_char_boundary(window_end) {
            window_end -= 1;
        }
        let window = &remaining[..window_end];

        match window.rfind('\n').or_else(|| window.rfind(' ')) {
            // Break at the whitespace and consume it.
            Some(pos) if pos > 0 => {
                chunks.push(remaining[..pos].to_string());
                remaining = &remaining[pos + 1..];
            }
            // No usable break point — hard split at the boundary.
            _ => {
                chunks.push(window.to_string());
                remaining = &remaining[window_end..];
            }
        }
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

fn telegram_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"bot\d+:[A-Za-z0-9_-]+").expect("static regex"))
}

fn api_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"sk-[A-Za-z0-9_-]{16,}").expect("static regex"))
}

/// Replace embedded secrets with redaction markers before logging.
///
/// Covers Telegram bot tokens (`bot<digits>:<base64ish>`) and `sk-` style
/// API keys. Applied to prompt previews and every error string that could
/// carry a vendor response.
pub fn redact_secrets(text: &str) -> String {
    let pass1 = telegram_token_re().replace_all(text, "bot<redacted>");
    api_key_re().replace_all(&pass1, "sk-<redacted>").into_owned()
}

pub fn to_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn from_base64(s: &str) -> Result<Vec<u8>, String> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| format!("invalid base64: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello"]);
    }

    #[test]
    fn chunks_respect_limit() {
        let text = "word ".repeat(1000);
        for chunk in chunk_text(&text, 80) {
            assert!(chunk.len() <= 80, "chunk too large: {}", chunk.len());
        }
    }

    #[test]
    fn concatenation_preserves_content_modulo_breaks() {
        let text = "alpha beta gamma\ndelta epsilon zeta eta theta";
        let chunks = chunk_text(text, 12);
        let rejoined: String = chunks.concat();
        // Every non-whitespace char survives, in order.
        let stripped: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let rejoined_stripped: String = rejoined.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(stripped, rejoined_stripped);
    }

    #[test]
    fn long_single_token_force_splits() {
        let text = "x".repeat(500);
        let chunks = chunk_text(&text, 64);
        assert!(chunks.len() >= 8);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "日本語のテキスト ".repeat(40);
        for chunk in chunk_text(&text, 50) {
            assert!(chunk.len() <= 50);
            // Would panic on a non-boundary slice above; re-validate UTF-8 anyway.
            assert!(std::str::from_utf8(chunk.as_bytes()).is_ok());
        }
    }

    #[test]
    fn telegram_token_is_redacted() {
        let input = "request to https://api.telegram.org/bot123456:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw/sendMessage failed";
        let out = redact_secrets(input);
        assert!(out.contains("bot<redacted>"));
        assert!(!out.contains("AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw"));
    }

    #[test]
    fn api_key_is_redacted() {
        let out = redact_secrets("auth sk-abcdefghijklmnop1234 rejected");
        assert!(out.contains("sk-<redacted>"));
        assert!(!out.contains("sk-abcdefghijklmnop1234"));
    }

    #[test]
    fn short_sk_prefix_is_left_alone() {
        // Fewer than 16 trailing chars is not a key shape.
        let out = redact_secrets("skim sk-short milk");
        assert_eq!(out, "skim sk-short milk");
    }
}
