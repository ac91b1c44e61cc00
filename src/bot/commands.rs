//! Parsing of incoming chat text

/// Help text listing the available commands
pub const HELP_TEXT: &str = "Available commands:
/start - Show this help message
/upload - Upload existing video
/status - Check bot status
/end - Stop current operation
/clear_cache - Clear all downloaded files

Send a link to download and upload it.";

/// An operator request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `/start` or `/help`
    Start,
    /// `/status`
    Status,
    /// `/upload`
    Upload,
    /// `/end`
    End,
    /// `/clear_cache`
    ClearCache,
    /// Plain text: a link to fetch and upload
    Fetch(String),
    /// A slash command the bot does not know
    Unknown(String),
}

impl Command {
    /// Parse message text; blank text yields `None`
    ///
    /// Commands may carry a `@botname` suffix as sent in group chats.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let Some(rest) = text.strip_prefix('/') else {
            return Some(Command::Fetch(text.to_string()));
        };

        let word = rest.split_whitespace().next().unwrap_or_default();
        let name = word.split('@').next().unwrap_or_default().to_ascii_lowercase();
        Some(match name.as_str() {
            "start" | "help" => Command::Start,
            "status" => Command::Status,
            "upload" => Command::Upload,
            "end" | "stop" => Command::End,
            "clear_cache" => Command::ClearCache,
            _ => Command::Unknown(name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands_are_recognised() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/status"), Some(Command::Status));
        assert_eq!(Command::parse("/upload"), Some(Command::Upload));
        assert_eq!(Command::parse("/end"), Some(Command::End));
        assert_eq!(Command::parse("/clear_cache"), Some(Command::ClearCache));
    }

    #[test]
    fn bot_name_suffix_and_case_are_ignored() {
        assert_eq!(Command::parse("/Status@relay_bot"), Some(Command::Status));
        assert_eq!(Command::parse("  /end now "), Some(Command::End));
    }

    #[test]
    fn plain_text_is_a_fetch_request() {
        assert_eq!(
            Command::parse(" https://youtu.be/abc \n"),
            Some(Command::Fetch("https://youtu.be/abc".into()))
        );
    }

    #[test]
    fn unknown_and_blank_input() {
        assert_eq!(Command::parse("/dance"), Some(Command::Unknown("dance".into())));
        assert_eq!(Command::parse("   "), None);
    }
}
