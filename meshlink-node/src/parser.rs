//! Command grammar for text heard on the mesh.
//!
//! First match wins; keywords are case-insensitive; trailing whitespace is
//! ignored. Anything that doesn't parse as a command is an [`Command::Echo`],
//! including a bare `@name` with no message text: a truncated relay must not
//! be forwarded half-formed.
/// A parsed user command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `@target text`: relay `text` to the node or station matching `target`.
    Relay { target: String, text: String },
    /// `status`: station health summary.
    Status,
    /// `nodes`: list known nodes.
    ListNodes,
    /// `instructions` or `help`: usage text.
    Instructions,
    /// Everything else.
    Echo,
}

impl Command {
    /// Parse a raw text payload. Total: every input maps to a command.
    pub fn parse(input: &str) -> Self {
        let input = input.trim_end();

        if let Some(rest) = input.strip_prefix('@') {
            if let Some(relay) = parse_relay(rest) {
                return relay;
            }
        }
        match input.to_lowercase().as_str() {
            "nodes" => Self::ListNodes,
            "status" => Self::Status,
            "instructions" | "help" => Self::Instructions,
            _ => Self::Echo,
        }
    }
}

/// Parse the remainder of an `@` command: a word-character target, whitespace,
/// then non-empty text.
fn parse_relay(rest: &str) -> Option<Command> {
    let target_len = rest
        .find(|c: char| !c.is_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
    if target_len == 0 {
        return None;
    }
    let (target, tail) = rest.split_at(target_len);

    // The target token must be terminated by whitespace, not punctuation.
    if !tail.starts_with(char::is_whitespace) {
        return None;
    }
    let text = tail.trim_start();
    if text.is_empty() {
        return None;
    }
    Some(Command::Relay {
        target: target.to_lowercase(),
        text: text.to_owned(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_relay() {
        assert_eq!(
            Command::parse("@bob Hello Bob"),
            Command::Relay {
                target: "bob".to_owned(),
                text: "Hello Bob".to_owned(),
            }
        );
    }

    #[test]
    fn test_relay_target_is_lowercased() {
        assert_eq!(
            Command::parse("@Alice hi there"),
            Command::Relay {
                target: "alice".to_owned(),
                text: "hi there".to_owned(),
            }
        );
    }

    #[test]
    fn test_relay_numeric_target() {
        assert_eq!(
            Command::parse("@102 are you up?"),
            Command::Relay {
                target: "102".to_owned(),
                text: "are you up?".to_owned(),
            }
        );
    }

    #[test]
    fn test_bare_at_token_is_echo() {
        // A truncated relay must not be forwarded.
        assert_eq!(Command::parse("@bob"), Command::Echo);
        assert_eq!(Command::parse("@bob   "), Command::Echo);
        assert_eq!(Command::parse("@"), Command::Echo);
    }

    #[test]
    fn test_punctuated_target_is_echo() {
        // `@bob-2 hi` does not match the relay grammar: the target token
        // ends at the dash, which is not whitespace.
        assert_eq!(Command::parse("@bob-2 hi"), Command::Echo);
        assert_eq!(Command::parse("@bob: hi"), Command::Echo);
    }

    #[test]
    fn test_keywords() {
        assert_eq!(Command::parse("nodes"), Command::ListNodes);
        assert_eq!(Command::parse("status"), Command::Status);
        assert_eq!(Command::parse("instructions"), Command::Instructions);
        assert_eq!(Command::parse("help"), Command::Instructions);
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert_eq!(Command::parse("NODES"), Command::ListNodes);
        assert_eq!(Command::parse("Status"), Command::Status);
        assert_eq!(Command::parse("HELP"), Command::Instructions);
    }

    #[test]
    fn test_trailing_whitespace() {
        assert_eq!(Command::parse("nodes  \n"), Command::ListNodes);
        assert_eq!(
            Command::parse("@bob hi \n"),
            Command::Relay {
                target: "bob".to_owned(),
                text: "hi".to_owned(),
            }
        );
    }

    #[test]
    fn test_everything_else_is_echo() {
        assert_eq!(Command::parse("hello everyone"), Command::Echo);
        assert_eq!(Command::parse(""), Command::Echo);
        assert_eq!(Command::parse("nodes please"), Command::Echo);
        assert_eq!(Command::parse("statusy"), Command::Echo);
    }

    #[test]
    fn test_relay_text_keeps_inner_whitespace() {
        assert_eq!(
            Command::parse("@bob one  two   three"),
            Command::Relay {
                target: "bob".to_owned(),
                text: "one  two   three".to_owned(),
            }
        );
    }
}
