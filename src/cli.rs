use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "orchestrator")]
#[command(about = "Route AI completions across providers with fallback, rate limiting and cost tracking")]
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

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Send a prompt and print the reply
    Complete {
        prompt: String,

        /// Print the reply as it streams in
        #[arg(short, long)]
        stream: bool,

        /// Use case whose model chain handles the request (chat, coding, ...)
        #[arg(short, long)]
        use_case: Option<String>,

        /// Pin a model, either `provider:model` or a bare model id
        #[arg(short, long)]
        model: Option<String>,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        #[arg(short, long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// Health-check every enabled provider
    Health,

    /// Show the cost summary
    Costs {
        /// Also list the most recent records
        #[arg(short, long, default_value_t = 0)]
        recent: usize,
    },

    /// List models of enabled providers
    Models,

    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },

    /// Run periodic health checks until interrupted, even when disabled in config
    Monitor {
        /// Seconds between checks; defaults to the configured interval
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete() {
        let cli = Cli::try_parse_from([
            "orchestrator",
            "complete",
            "hello",
            "--stream",
            "--use-case",
            "coding",
            "--max-tokens",
            "64",
            "--debug",
        ])
        .unwrap();

        assert!(cli.debug);
        match cli.command {
            Commands::Complete {
                prompt,
                stream,
                use_case,
                max_tokens,
                model,
                ..
            } => {
                assert_eq!(prompt, "hello");
                assert!(stream);
                assert_eq!(use_case.as_deref(), Some("coding"));
                assert_eq!(max_tokens, Some(64));
                assert!(model.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_global_config() {
        let cli = Cli::try_parse_from(["orchestrator", "costs", "--recent", "5", "-c", "/tmp/o.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/o.toml")));
        assert!(matches!(cli.command, Commands::Costs { recent: 5 }));
    }

    #[test]
    fn test_command_is_required() {
        assert!(Cli::try_parse_from(["orchestrator"]).is_err());
    }
}
