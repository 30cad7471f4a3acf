//! Config path grammar.
//!
//! Paths address nodes inside the JSON document: dotted segments and
//! bracketed segments, where a purely numeric bracket segment is an array
//! index. Backslash escapes the next character, so `a\.b` is the single
//! key `a.b`.
//!
//! Examples: `agents.defaults.model`, `models.openai.models[0].id`,
//! `channels.telegram.groups[-1001234]`.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => f.write_str(k),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Render segments back to a human-readable dotted path for error messages.
pub fn format_path(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        match seg {
            PathSegment::Key(k) => {
                if i > 0 {
                    out.push('.');
                }
                out.push_str(k);
            }
            PathSegment::Index(idx) => {
                out.push('[');
                out.push_str(&idx.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// Parse a path expression into segments.
pub fn parse_path(input: &str) -> Result<Vec<PathSegment>, String> {
    if input.is_empty() {
        return Err("empty config path".to_string());
    }

    let mut segments = Vec::new();
    let mut buf = String::new();
    let mut buf_used = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| format!("dangling escape at end of path '{input}'"))?;
                buf.push(escaped);
                buf_used = true;
            }
            '.' => {
                if !buf_used {
                    // A dot directly after a bracket segment just separates.
                    if segments.is_empty() {
                        return Err(format!("empty segment in path '{input}'"));
                    }
                } else {
                    segments.push(PathSegment::Key(std::mem::take(&mut buf)));
                    buf_used = false;
                }
                // A trailing dot or `..` produces an empty next segment.
                match chars.peek() {
                    None => return Err(format!("trailing dot in path '{input}'")),
                    Some('.') => return Err(format!("empty segment in path '{input}'")),
                    _ => {}
                }
            }
            '[' => {
                if buf_used {
                    segments.push(PathSegment::Key(std::mem::take(&mut buf)));
                    buf_used = false;
                }
                let mut inner = String::new();
                let mut closed = false;
                while let Some(ic) = chars.next() {
                    match ic {
                        '\\' => {
                            let escaped = chars.next().ok_or_else(|| {
                                format!("dangling escape in bracket of path '{input}'")
                            })?;
                            inner.push(escaped);
                        }
                        ']' => {
                            closed = true;
                            break;
                        }
                        other => inner.push(other),
                    }
                }
                if !closed {
                    return Err(format!("unterminated bracket in path '{input}'"));
                }
                if inner.is_empty() {
                    return Err(format!("empty bracket segment in path '{input}'"));
                }
                if inner.chars().all(|c| c.is_ascii_digit()) {
                    let idx: usize = inner
                        .parse()
                        .map_err(|_| format!("array index out of range in path '{input}'"))?;
                    segments.push(PathSegment::Index(idx));
                } else {
                    segments.push(PathSegment::Key(inner));
                }
            }
            other => {
                buf.push(other);
                buf_used = true;
            }
        }
    }

    if buf_used {
        segments.push(PathSegment::Key(buf));
    }
    if segments.is_empty() {
        return Err(format!("no segments in path '{input}'"));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_dotted_path() {
        let segs = parse_path("agents.defaults.model").unwrap();
        assert_eq!(
            segs,
            vec![
                PathSegment::Key("agents".into()),
                PathSegment::Key("defaults".into()),
                PathSegment::Key("model".into()),
            ]
        );
    }

    #[test]
    fn numeric_bracket_is_index() {
        let segs = parse_path("models.openai.models[0].id").unwrap();
        assert_eq!(segs[2], PathSegment::Key("models".into()));
        assert_eq!(segs[3], PathSegment::Index(0));
        assert_eq!(segs[4], PathSegment::Key("id".into()));
    }

    #[test]
    fn non_numeric_bracket_is_key() {
        let segs = parse_path("channels.telegram.groups[-1001234]").unwrap();
        assert_eq!(segs[2], PathSegment::Key("groups".into()));
        assert_eq!(segs[3], PathSegment::Key("-1001234".into()));
    }

    #[test]
    fn backslash_escapes_dot() {
        let segs = parse_path(r"a\.b.c").unwrap();
        assert_eq!(
            segs,
            vec![PathSegment::Key("a.b".into()), PathSegment::Key("c".into())]
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_path("").is_err());
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a.").is_err());
        assert!(parse_path("a[1").is_err());
        assert!(parse_path("a[]").is_err());
        assert!(parse_path("a\\").is_err());
    }

    #[test]
    fn format_roundtrips_display_shape() {
        let segs = parse_path("models.openai.models[2].headers").unwrap();
        assert_eq!(format_path(&segs), "models.openai.models[2].headers");
    }
}
