//! Global command-line options shared by every command.

use clap::{Args, ValueEnum};

use crate::config::{LogConfig, ToolConfig};
use crate::diagnostic::DiagnosticReport;
use crate::error::ToolResult;

/// Rendering of command output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    /// Renders `report` in this format.
    ///
    /// # Errors
    ///
    /// Fails when the JSON rendering fails.
    pub fn render(self, report: &DiagnosticReport) -> ToolResult<String> {
        match self {
            Self::Text => Ok(report.to_string()),
            Self::Json => report.to_json(),
        }
    }
}

/// Options to flatten into a command-line parser.
#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Timeout of a single diagnostic request, in milliseconds
    #[arg(long, env = "DYNCONF_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    pub request_timeout_ms: u64,

    /// Timeout of a diagnostic connection, in milliseconds
    #[arg(long, env = "DYNCONF_CONNECTION_TIMEOUT_MS", default_value_t = 10_000)]
    pub connection_timeout_ms: u64,

    /// Upper bound of concurrent remote calls
    #[arg(long, env = "DYNCONF_MAX_CONCURRENCY", default_value_t = 32)]
    pub max_concurrency: usize,

    /// Owner recorded in configuration locks
    #[arg(long, env = "DYNCONF_LOCK_OWNER")]
    pub lock_owner: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, env = "DYNCONF_JSON_LOGS")]
    pub json_logs: bool,

    /// Output format of reports
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
}

impl GlobalArgs {
    #[must_use]
    pub fn to_config(&self) -> ToolConfig {
        let defaults = ToolConfig::default();
        let filter = match self.verbose {
            0 => defaults.log.filter.clone(),
            1 => "debug".to_owned(),
            _ => "trace".to_owned(),
        };
        ToolConfig {
            request_timeout_ms: self.request_timeout_ms,
            connection_timeout_ms: self.connection_timeout_ms,
            max_concurrency: self.max_concurrency,
            lock_owner: self.lock_owner.clone().unwrap_or_else(|| defaults.lock_owner.clone()),
            log: LogConfig {
                filter,
                json: self.json_logs,
            },
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        global: GlobalArgs,
    }

    fn parse(args: &[&str]) -> GlobalArgs {
        TestCli::try_parse_from(std::iter::once("dynconf").chain(args.iter().copied()))
            .unwrap()
            .global
    }

    #[test]
    fn defaults_match_tool_config() {
        let config = parse(&[]).to_config();
        assert_eq!(config, ToolConfig::default());
    }

    #[test]
    fn flags_override_the_config() {
        let args = parse(&["-vv", "--json-logs", "--max-concurrency", "4", "--output", "json"]);
        assert_eq!(args.output, OutputFormat::Json);
        let config = args.to_config();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.log.filter, "trace");
        assert!(config.log.json);
    }
}
