//! `HEARTBEAT.md` handling.
//!
//! Each agent's workspace may contain a `HEARTBEAT.md` with standing
//! instructions. An agent only receives heartbeat turns when the file has
//! meaningful content, and the file itself carries an on/off switch as a
//! `@heartbeat enabled=on|off` directive line.

use std::path::Path;

pub const HEARTBEAT_FILE: &str = "HEARTBEAT.md";

/// Default prompt for synthesized heartbeat messages.
pub const DEFAULT_HEARTBEAT_PROMPT: &str =
    "Read HEARTBEAT.md if it exists and carry out any instructions that are currently due. \
     If nothing needs attention, reply with a single word: ok.";

/// Sender id stamped on synthesized heartbeat messages.
pub const HEARTBEAT_SENDER: &str = "heartbeat";

/// Extract the content that actually warrants waking the agent.
///
/// Strips HTML comments, the `@heartbeat` directive line, unchecked empty
/// checkboxes, markdown headings, and blank lines. What remains is the
/// meaningful body; an empty result means "skip this agent".
pub fn meaningful_content(text: &str) -> String {
    let without_comments = strip_html_comments(text);
    without_comments
        .lines()
        .map(str::trim_end)
        .filter(|line| {
            let t = line.trim_start();
            if t.is_empty() {
                return false;
            }
            if t.starts_with("@heartbeat") {
                return false;
            }
            if t.starts_with('#') {
                return false;
            }
            // `- [ ]` with no task text.
            if matches!(t.strip_prefix("- [ ]"), Some(rest) if rest.trim().is_empty()) {
                return false;
            }
            true
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_html_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => {
                // Unterminated comment swallows the remainder.
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Read the `@heartbeat enabled=on|off` directive, if present.
pub fn read_directive(text: &str) -> Option<bool> {
    for line in text.lines() {
        let t = line.trim();
        let Some(rest) = t.strip_prefix("@heartbeat") else {
            continue;
        };
        for token in rest.split_whitespace() {
            match token {
                "enabled=on" => return Some(true),
                "enabled=off" => return Some(false),
                _ => {}
            }
        }
    }
    None
}

/// Rewrite (or append) the directive line, preserving everything else.
pub fn set_directive(text: &str, enabled: bool) -> String {
    let directive = format!("@heartbeat enabled={}", if enabled { "on" } else { "off" });
    let mut replaced = false;
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("@heartbeat") && !replaced {
                replaced = true;
                directive.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        if !lines.is_empty() && !lines.last().map(|l| l.is_empty()).unwrap_or(true) {
            lines.push(String::new());
        }
        lines.push(directive);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Load an agent's heartbeat file, if any.
pub fn read_heartbeat_file(workspace: &Path) -> Option<String> {
    std::fs::read_to_string(workspace.join(HEARTBEAT_FILE)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_checkboxes_and_headings_are_not_meaningful() {
        let text = "# Heartbeat\n\n<!-- todo template -->\n- [ ]\n- [ ] \n@heartbeat enabled=on\n";
        assert!(meaningful_content(text).is_empty());
    }

    #[test]
    fn real_tasks_are_meaningful() {
        let text = "# Heartbeat\n- [ ] water the plants\n";
        assert_eq!(meaningful_content(text), "- [ ] water the plants");
    }

    #[test]
    fn multiline_comment_is_stripped() {
        let text = "before\n<!-- spans\nmultiple\nlines -->\nafter";
        let meaningful = meaningful_content(text);
        assert!(meaningful.contains("before"));
        assert!(meaningful.contains("after"));
        assert!(!meaningful.contains("multiple"));
    }

    #[test]
    fn directive_roundtrip() {
        assert_eq!(read_directive("@heartbeat enabled=on"), Some(true));
        assert_eq!(read_directive("  @heartbeat enabled=off extra"), Some(false));
        assert_eq!(read_directive("no directive"), None);

        let updated = set_directive("# Heartbeat\n@heartbeat enabled=on\nbody", false);
        assert_eq!(read_directive(&updated), Some(false));
        assert!(updated.contains("body"));
    }

    #[test]
    fn set_directive_appends_when_missing() {
        let updated = set_directive("# Heartbeat\ntask", true);
        assert_eq!(read_directive(&updated), Some(true));
        assert!(updated.starts_with("# Heartbeat\ntask"));
    }
}
