use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(about = "Resilient gateway to multiple AI model backends")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

/// Identity used for quota accounting.
#[derive(Args, Clone)]
pub struct CallerArgs {
    /// Caller id recorded in the usage ledger
    #[arg(long, default_value = "local")]
    pub caller: String,

    /// Quota tier (defaults to quotas.default_tier)
    #[arg(long)]
    pub tier: Option<String>,
}

#[derive(Args)]
pub struct ChatArgs {
    /// Prompt text
    #[arg(required = true)]
    pub prompt: Vec<String>,

    /// Provider to route to
    #[arg(short, long)]
    pub provider: Option<String>,

    /// Model to use
    #[arg(short, long)]
    pub model: Option<String>,

    /// Optional system prompt
    #[arg(short, long)]
    pub system: Option<String>,

    #[arg(short, long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Request extended reasoning with an optional token budget
    #[arg(long, num_args = 0..=1, default_missing_value = "0")]
    pub reasoning: Option<u32>,

    /// Wait for the full answer instead of streaming
    #[arg(long)]
    pub no_stream: bool,

    #[command(flatten)]
    pub caller: CallerArgs,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a prompt and stream the answer
    Chat(ChatArgs),

    /// Retry a prompt on the next-ranked model for its topic
    Again {
        /// Prompt text
        #[arg(required = true)]
        prompt: Vec<String>,

        /// Topic used to pick the ranking tag (defaults to the prompt)
        #[arg(long)]
        topic: Option<String>,

        /// Model that produced the previous answer
        #[arg(long)]
        current: Option<String>,

        /// Only show which model would be used
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        caller: CallerArgs,
    },

    /// List registered providers and ranked models
    Models {
        /// Show the ranking for one tag (e.g. chat, code, image-generation)
        #[arg(short, long)]
        tag: Option<String>,

        /// Minimum rating for ranked models
        #[arg(long)]
        min_rating: Option<f64>,
    },

    /// Show quota status and usage for a caller
    Quota {
        #[command(flatten)]
        caller: CallerArgs,

        /// Limit to one action (capability name)
        #[arg(short, long)]
        action: Option<String>,
    },

    /// Probe every provider and report circuit state
    Health {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Store a provider API key in the OS keyring
    SetKey { provider: String, key: String },
    /// Remove a provider API key from the OS keyring
    RemoveKey { provider: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat() {
        let cli = Cli::try_parse_from([
            "modelgate", "chat", "--provider", "anthropic", "--reasoning", "--tier", "pro", "hello", "there",
        ])
        .unwrap();

        match cli.command {
            Commands::Chat(args) => {
                assert_eq!(args.prompt, vec!["hello", "there"]);
                assert_eq!(args.provider.as_deref(), Some("anthropic"));
                assert_eq!(args.reasoning, Some(0));
                assert_eq!(args.caller.caller, "local");
                assert_eq!(args.caller.tier.as_deref(), Some("pro"));
            }
            _ => panic!("expected chat command"),
        }
    }

    #[test]
    fn test_parse_config_set_key() {
        let cli = Cli::try_parse_from(["modelgate", "--debug", "config", "set-key", "openai", "sk-123"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::SetKey { .. }
            }
        ));
    }
}
