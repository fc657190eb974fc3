//! Chat command parsing and the pure tool commands
//!
//! Supported forms (with the default `/` prefix):
//! - `/hitokoto`
//! - `/bili.status [room]`
//! - `/github.test`
//! - `/health`
//! - `/tool.ip <ip>`
//! - `/tool.base64 [-d] <text>`
//! - `/tool.md5 <text>`
//!
//! A `@botname` suffix on the command name is accepted and ignored.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};
use std::net::IpAddr;
use thiserror::Error;

/// Largest text accepted by the encoding tools
pub const MAX_TOOL_INPUT: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Hitokoto,
    BiliStatus { room: Option<String> },
    GithubTest,
    Health,
    ToolIp(IpAddr),
    ToolBase64 { decode: bool, text: String },
    ToolMd5(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("please provide {0}")]
    MissingArgument(&'static str),

    #[error("text must not exceed {limit} bytes")]
    TooLong { limit: usize },

    #[error("{0} is not a valid IP address")]
    InvalidIp(String),

    #[error("input is not valid base64")]
    InvalidBase64,
}

/// Parse a chat message as a command.
///
/// Returns `None` when the message is not one of ours, so ordinary chat and
/// other bots' commands pass through untouched.
pub fn parse(prefix: &str, content: &str) -> Option<Result<Command, CommandError>> {
    let rest = content.trim().strip_prefix(prefix)?;
    let (head, args) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

    let command = match name.as_str() {
        "hitokoto" => Ok(Command::Hitokoto),
        "github.test" => Ok(Command::GithubTest),
        "health" => Ok(Command::Health),
        "bili.status" => Ok(Command::BiliStatus {
            room: args.split_whitespace().next().map(str::to_string),
        }),
        "tool.ip" => parse_ip(args),
        "tool.base64" => parse_base64(args),
        "tool.md5" => required_text(args).map(|t| Command::ToolMd5(t.to_string())),
        _ => return None,
    };
    Some(command)
}

fn parse_ip(args: &str) -> Result<Command, CommandError> {
    let raw = args
        .split_whitespace()
        .next()
        .ok_or(CommandError::MissingArgument("an IP address"))?;
    raw.parse::<IpAddr>()
        .map(Command::ToolIp)
        .map_err(|_| CommandError::InvalidIp(raw.to_string()))
}

fn parse_base64(args: &str) -> Result<Command, CommandError> {
    let (decode, text) = match args.split_once(char::is_whitespace) {
        Some((flag, text)) if flag == "-d" || flag == "--decode" => (true, text.trim()),
        _ if args == "-d" || args == "--decode" => (true, ""),
        _ => (false, args),
    };
    let text = required_text(text)?;
    Ok(Command::ToolBase64 {
        decode,
        text: text.to_string(),
    })
}

fn required_text(text: &str) -> Result<&str, CommandError> {
    if text.is_empty() {
        return Err(CommandError::MissingArgument("some text"));
    }
    if text.len() > MAX_TOOL_INPUT {
        return Err(CommandError::TooLong {
            limit: MAX_TOOL_INPUT,
        });
    }
    Ok(text)
}

pub fn base64_encode(text: &str) -> String {
    BASE64.encode(text.as_bytes())
}

/// Decode base64, replacing invalid UTF-8 in the result
pub fn base64_decode(text: &str) -> Result<String, CommandError> {
    let bytes = BASE64
        .decode(text.trim())
        .map_err(|_| CommandError::InvalidBase64)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn md5_hex(text: &str) -> String {
    hex::encode(Md5::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_commands_pass_through() {
        assert!(parse("/", "hello there").is_none());
        assert!(parse("/", "/unknown thing").is_none());
        assert!(parse("!", "/hitokoto").is_none());
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("/", "/hitokoto"), Some(Ok(Command::Hitokoto)));
        assert_eq!(parse("/", "  /HEALTH  "), Some(Ok(Command::Health)));
        assert_eq!(parse("/", "/github.test@imx"), Some(Ok(Command::GithubTest)));
        assert_eq!(
            parse("/", "/bili.status 1234"),
            Some(Ok(Command::BiliStatus {
                room: Some("1234".into())
            }))
        );
        assert_eq!(
            parse("!", "!bili.status"),
            Some(Ok(Command::BiliStatus { room: None }))
        );
    }

    #[test]
    fn test_tool_ip() {
        assert_eq!(
            parse("/", "/tool.ip 8.8.8.8"),
            Some(Ok(Command::ToolIp("8.8.8.8".parse().unwrap())))
        );
        assert_eq!(
            parse("/", "/tool.ip example.com"),
            Some(Err(CommandError::InvalidIp("example.com".into())))
        );
        assert_eq!(
            parse("/", "/tool.ip"),
            Some(Err(CommandError::MissingArgument("an IP address")))
        );
    }

    #[test]
    fn test_tool_base64() {
        assert_eq!(
            parse("/", "/tool.base64 hello world"),
            Some(Ok(Command::ToolBase64 {
                decode: false,
                text: "hello world".into()
            }))
        );
        assert_eq!(
            parse("/", "/tool.base64 -d aGVsbG8="),
            Some(Ok(Command::ToolBase64 {
                decode: true,
                text: "aGVsbG8=".into()
            }))
        );
        assert_eq!(
            parse("/", "/tool.base64 -d"),
            Some(Err(CommandError::MissingArgument("some text")))
        );
    }

    #[test]
    fn test_tool_input_limit() {
        let huge = format!("/tool.md5 {}", "a".repeat(MAX_TOOL_INPUT + 1));
        assert_eq!(
            parse("/", &huge),
            Some(Err(CommandError::TooLong {
                limit: MAX_TOOL_INPUT
            }))
        );
    }

    #[test]
    fn test_base64_helpers() {
        assert_eq!(base64_encode("hello"), "aGVsbG8=");
        assert_eq!(base64_decode("aGVsbG8=").unwrap(), "hello");
        assert_eq!(base64_decode("%%%"), Err(CommandError::InvalidBase64));
    }

    #[test]
    fn test_md5() {
        assert_eq!(md5_hex("hello"), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
