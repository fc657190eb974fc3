//! Plain-text helpers for chat notifications

use chrono::{DateTime, Utc};
use pulldown_cmark::{Event, Parser, TagEnd};

/// Default preview length for long bodies, in characters
pub const PREVIEW_CHARS: usize = 200;

/// Strip markdown syntax, keeping the readable text.
pub fn strip_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for event in Parser::new(text) {
        match event {
            Event::Text(t) | Event::Code(t) => out.push_str(&t),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::CodeBlock) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::Rule => out.push('\n'),
            _ => {}
        }
    }

    collapse_blank_lines(out.trim())
}

fn collapse_blank_lines(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !result.is_empty() {
            result.push('\n');
        }
        result.push_str(line);
    }
    result
}

/// Truncate to at most `max_chars` characters, appending `...` when cut.
/// Char-based so multi-byte text is never split mid-codepoint.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

/// Markdown-stripped preview of a long body
pub fn simple_preview(text: &str) -> String {
    truncate_preview(&strip_markdown(text), PREVIEW_CHARS)
}

pub fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

/// Coarse human-readable distance between two instants ("3 days", "2 months")
pub fn relative_duration(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    let secs = (to - from).num_seconds().max(0);
    let (value, unit) = match secs {
        s if s < 60 => return "a few seconds".to_string(),
        s if s < 3600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3600, "hour"),
        s if s < 30 * 86_400 => (s / 86_400, "day"),
        s if s < 365 * 86_400 => (s / (30 * 86_400), "month"),
        s => (s / (365 * 86_400), "year"),
    };
    if value == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", value, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_strip_markdown() {
        let md = "# Title\n\nSome **bold** and [a link](https://x.dev) with `code`.\n\n- one\n- two";
        let plain = strip_markdown(md);
        assert!(plain.starts_with("Title\n"));
        assert!(plain.contains("Some bold and a link with code."));
        assert!(!plain.contains("**"));
        assert!(!plain.contains("https://x.dev"));
        assert!(plain.contains("one\ntwo"));
    }

    #[test]
    fn test_strip_markdown_plain_text_unchanged() {
        assert_eq!(strip_markdown("just text"), "just text");
    }

    #[test]
    fn test_truncate_preview() {
        assert_eq!(truncate_preview("short", 10), "short");
        assert_eq!(truncate_preview("abcdef", 3), "abc...");
        // Multi-byte characters are counted as characters, not bytes
        assert_eq!(truncate_preview("你好世界", 2), "你好...");
    }

    #[test]
    fn test_simple_preview_caps_length() {
        let long = "word ".repeat(100);
        let preview = simple_preview(&long);
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("fix: thing\n\nlonger body"), "fix: thing");
        assert_eq!(first_line(""), "");
    }

    #[test]
    fn test_relative_duration() {
        let now = Utc::now();
        assert_eq!(relative_duration(now - Duration::seconds(5), now), "a few seconds");
        assert_eq!(relative_duration(now - Duration::hours(1), now), "1 hour");
        assert_eq!(relative_duration(now - Duration::days(3), now), "3 days");
        assert_eq!(relative_duration(now - Duration::days(400), now), "1 year");
    }
}
