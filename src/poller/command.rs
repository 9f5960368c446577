//! Command lines embedded in issue bodies and comments.
//!
//! A command line starts with the configured prefix token, for example
//! `/thopter --template=default fix the login bug`. Tokens of the form
//! `--key=value`, or a bare `--flag` meaning `true`, are flags until the first
//! token that is not one; everything after that is free text.

use std::collections::BTreeMap;

use data_model::ParsedCommand;
use tracing::warn;

pub const ACK_MARKER_PREFIX: &str = "<!-- trigger-ack:";
const ACK_MARKER_SUFFIX: &str = " -->";

pub fn parse_command_line(line: &str, prefix: &str) -> Option<ParsedCommand> {
    let line = line.trim();
    let mut tokens = line.split_whitespace().peekable();
    if tokens.next() != Some(prefix) {
        return None;
    }

    let mut flags = BTreeMap::new();
    while let Some(token) = tokens.peek() {
        let Some(flag) = token.strip_prefix("--") else {
            break;
        };
        tokens.next();
        if flag.is_empty() {
            // `--` ends the flags
            break;
        }
        match flag.split_once('=') {
            Some((key, value)) => flags.insert(key.to_string(), value.to_string()),
            None => flags.insert(flag.to_string(), "true".to_string()),
        };
    }

    Some(ParsedCommand {
        line: line.to_string(),
        flags,
        text: tokens.collect::<Vec<_>>().join(" "),
    })
}

pub fn scan_commands(text: &str, prefix: &str) -> Vec<ParsedCommand> {
    text.lines()
        .filter_map(|line| parse_command_line(line, prefix))
        .collect()
}

/// The first command in `text`. Any further command lines are logged and
/// ignored.
pub fn find_command(text: &str, prefix: &str, instance_key: &str) -> Option<ParsedCommand> {
    let mut commands = scan_commands(text, prefix).into_iter();
    let first = commands.next()?;
    for ignored in commands {
        warn!(
            instance_key,
            line = ignored.line.as_str(),
            "ignoring additional command line in the same text block"
        );
    }
    Some(first)
}

pub fn ack_marker(instance_key: &str) -> String {
    format!("{}{}{}", ACK_MARKER_PREFIX, instance_key, ACK_MARKER_SUFFIX)
}

pub fn has_ack_marker(text: &str) -> bool {
    text.contains(ACK_MARKER_PREFIX)
}

/// Instance keys acknowledged anywhere in `text`.
pub fn acked_keys(text: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(ACK_MARKER_PREFIX) {
        rest = &rest[start + ACK_MARKER_PREFIX.len()..];
        let Some(end) = rest.find(ACK_MARKER_SUFFIX) else {
            break;
        };
        keys.push(rest[..end].trim().to_string());
        rest = &rest[end + ACK_MARKER_SUFFIX.len()..];
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags_and_text() {
        let command =
            parse_command_line("  /thopter --template=default --dry-run fix the --weird bug", "/thopter")
                .unwrap();
        assert_eq!(command.flag("template"), Some("default"));
        assert_eq!(command.flag("dry-run"), Some("true"));
        assert_eq!(command.text, "fix the --weird bug");
        assert_eq!(
            command.line,
            "/thopter --template=default --dry-run fix the --weird bug"
        );
    }

    #[test]
    fn test_prefix_must_be_the_first_token() {
        assert!(parse_command_line("please /thopter fix", "/thopter").is_none());
        assert!(parse_command_line("/thopters fix", "/thopter").is_none());
        assert!(parse_command_line("", "/thopter").is_none());

        let bare = parse_command_line("/thopter", "/thopter").unwrap();
        assert!(bare.flags.is_empty());
        assert_eq!(bare.text, "");
    }

    #[test]
    fn test_double_dash_ends_flags() {
        let command = parse_command_line("/cmd --repo=acme/api -- --not-a-flag", "/cmd").unwrap();
        assert_eq!(command.flag("repo"), Some("acme/api"));
        assert_eq!(command.text, "--not-a-flag");
    }

    #[test]
    fn test_first_command_wins() {
        let body = "Some context\n/cmd first\nmore\n/cmd second\n";
        let command = find_command(body, "/cmd", "acme/widgets#1:body").unwrap();
        assert_eq!(command.text, "first");
        assert_eq!(scan_commands(body, "/cmd").len(), 2);
        assert!(find_command("no commands here", "/cmd", "k").is_none());
    }

    #[test]
    fn test_ack_markers() {
        let key = "acme/widgets#42:comment:7";
        let marker = ack_marker(key);
        assert_eq!(marker, "<!-- trigger-ack:acme/widgets#42:comment:7 -->");

        let comment = format!("{}\nqueued request abc\n{}", marker, ack_marker("acme/widgets#42:body"));
        assert!(has_ack_marker(&comment));
        assert_eq!(
            acked_keys(&comment),
            vec![key.to_string(), "acme/widgets#42:body".to_string()]
        );
        assert!(acked_keys("<!-- trigger-ack:unterminated").is_empty());
    }
}
