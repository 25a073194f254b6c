//! Maps chat command lines to bot commands.

pub const NEW_ISSUE_COMMAND: &str = "new";
pub const REGISTER_COMMAND: &str = "register";
pub const UNREGISTER_COMMAND: &str = "unregister";
pub const HELP_COMMAND: &str = "help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// `new "<repo>" "<title>" "<body>"`; `arguments` is the unparsed blob.
    NewIssue { arguments: String },
    Register { token: Option<String> },
    Unregister,
    Help,
    Unknown { command: String },
}

/// Classifies a command line. The first word is matched case-sensitively; a
/// leading bot mention must already be stripped by the transport.
pub fn parse_bot_command(text: &str) -> BotCommand {
    let trimmed = text.trim_start();
    let (command, rest) = match trimmed.find(char::is_whitespace) {
        Some(split) => (&trimmed[..split], &trimmed[split..]),
        None => (trimmed, ""),
    };
    match command {
        NEW_ISSUE_COMMAND => BotCommand::NewIssue {
            arguments: rest.trim().to_string(),
        },
        REGISTER_COMMAND => BotCommand::Register {
            token: rest
                .split_whitespace()
                .next()
                .map(str::to_string),
        },
        UNREGISTER_COMMAND => BotCommand::Unregister,
        HELP_COMMAND => BotCommand::Help,
        other => BotCommand::Unknown {
            command: other.to_string(),
        },
    }
}

pub fn render_help_text() -> String {
    [
        "Available commands:",
        "• `new \"repo\" \"issue title\" \"issue body\"`: file an issue (`repo` is `name` or `owner/name`)",
        "• `register <token>`: link your GitHub token to your chat account",
        "• `unregister`: remove your linked token",
        "• `help`: show this message",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::{parse_bot_command, render_help_text, BotCommand};

    #[test]
    fn unit_new_command_keeps_argument_blob_intact() {
        assert_eq!(
            parse_bot_command("new \"repo\"   \"title\" \"multi\nline\"\n"),
            BotCommand::NewIssue {
                arguments: "\"repo\"   \"title\" \"multi\nline\"".to_string()
            }
        );
        assert_eq!(
            parse_bot_command("new"),
            BotCommand::NewIssue {
                arguments: String::new()
            }
        );
    }

    #[test]
    fn unit_register_command_extracts_first_token_word() {
        assert_eq!(
            parse_bot_command("  register   ghp_abc  trailing"),
            BotCommand::Register {
                token: Some("ghp_abc".to_string())
            }
        );
        assert_eq!(
            parse_bot_command("register"),
            BotCommand::Register { token: None }
        );
    }

    #[test]
    fn functional_commands_are_case_sensitive() {
        assert_eq!(parse_bot_command("unregister"), BotCommand::Unregister);
        assert_eq!(parse_bot_command("help"), BotCommand::Help);
        assert_eq!(
            parse_bot_command("Help"),
            BotCommand::Unknown {
                command: "Help".to_string()
            }
        );
        assert_eq!(
            parse_bot_command(""),
            BotCommand::Unknown {
                command: String::new()
            }
        );
    }

    #[test]
    fn unit_help_text_lists_every_command() {
        let help = render_help_text();
        for command in ["new", "register", "unregister", "help"] {
            assert!(help.contains(&format!("`{command}")));
        }
    }
}
