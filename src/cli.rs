use crate::app::RunMode;
use clap::Parser;
use std::path::PathBuf;

/// Command-line interface for the financial chat client.
#[derive(Debug, Parser)]
#[command(author, version, about = "Terminal chat over a financial-analysis service", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./finchat.toml if present).
    #[arg(long, value_name = "FILE")]
    pub config_path: Option<PathBuf>,
    /// Session key to load from the store; overrides config and FINCHAT_SESSION_KEY.
    #[arg(long, value_name = "KEY")]
    pub session: Option<String>,
    /// Financial data JSON file; overrides config and FINCHAT_DATA_PATH.
    #[arg(long, value_name = "FILE")]
    pub data: Option<PathBuf>,
    /// Ask a single question without starting the TUI, then exit.
    #[arg(long, value_name = "QUESTION", conflicts_with_all = ["reset", "stats"])]
    pub ask: Option<String>,
    /// Forget the current conversation and session id.
    #[arg(long, conflicts_with = "stats")]
    pub reset: bool,
    /// Print cumulative token usage and cost, then exit.
    #[arg(long)]
    pub stats: bool,
}

impl Cli {
    pub fn mode(&self) -> RunMode {
        if let Some(question) = &self.ask {
            RunMode::Ask(question.clone())
        } else if self.reset {
            RunMode::Reset
        } else if self.stats {
            RunMode::Stats
        } else {
            RunMode::Interactive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_interactive() {
        let cli = Cli::parse_from(["finchat"]);
        assert_eq!(cli.mode(), RunMode::Interactive);
    }

    #[test]
    fn ask_takes_the_question() {
        let cli = Cli::parse_from(["finchat", "--session", "alice", "--ask", "Which month had the highest income?"]);
        assert_eq!(
            cli.mode(),
            RunMode::Ask("Which month had the highest income?".to_string())
        );
        assert_eq!(cli.session.as_deref(), Some("alice"));
    }

    #[test]
    fn ask_conflicts_with_reset() {
        assert!(Cli::try_parse_from(["finchat", "--ask", "q", "--reset"]).is_err());
    }
}
