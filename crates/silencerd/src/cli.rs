//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use silencer::{SilenceFilter, SilenceStatus, SortField, SortOrder};

/// silencerd - silence engine for Alertmanager-compatible pipelines.
#[derive(Parser, Debug, Clone)]
#[command(name = "silencerd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Database URL.
    #[arg(
        long,
        env = "SILENCER_DATABASE_URL",
        default_value = "sqlite://silences.db?mode=rwc"
    )]
    pub database_url: String,

    /// Path to a JSON config file.
    #[arg(short, long, env = "SILENCER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Load silences and run the expiry worker until interrupted.
    Run,

    /// Check whether an alert with the given labels is silenced.
    Check {
        /// Alert label (KEY=VALUE); repeat for each label.
        #[arg(short, long = "label", value_name = "KEY=VALUE", value_parser = parse_label, required = true)]
        labels: Vec<(String, String)>,
    },

    /// List stored silences as JSON.
    List(ListArgs),
}

/// Arguments for the list command.
#[derive(Parser, Debug, Clone)]
pub struct ListArgs {
    /// Only silences with this status (pending, active, expired); repeatable.
    #[arg(short, long)]
    pub status: Vec<SilenceStatus>,

    /// Only silences created by this author.
    #[arg(long)]
    pub creator: Option<String>,

    /// Only silences with a matcher on this label name.
    #[arg(long)]
    pub matcher: Option<String>,

    /// Page size.
    #[arg(short, long)]
    pub limit: Option<u32>,

    /// Rows to skip.
    #[arg(long, default_value_t = 0)]
    pub offset: u32,

    /// Sort column.
    #[arg(long, value_enum, default_value_t = SortArg::CreatedAt)]
    pub sort: SortArg,

    /// Sort oldest first.
    #[arg(long)]
    pub asc: bool,
}

/// Sort columns for `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SortArg {
    /// Creation time.
    CreatedAt,
    /// Window start.
    StartsAt,
    /// Window end.
    EndsAt,
}

impl From<SortArg> for SortField {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::CreatedAt => Self::CreatedAt,
            SortArg::StartsAt => Self::StartsAt,
            SortArg::EndsAt => Self::EndsAt,
        }
    }
}

impl ListArgs {
    /// Builds the store filter for these arguments.
    #[must_use]
    pub fn to_filter(&self) -> SilenceFilter {
        let order = if self.asc {
            SortOrder::Asc
        } else {
            SortOrder::Desc
        };
        SilenceFilter {
            statuses: self.status.clone(),
            created_by: self.creator.clone(),
            matcher_name: self.matcher.clone(),
            limit: self.limit,
            offset: self.offset,
            sort_by: self.sort.into(),
            order,
            ..SilenceFilter::default()
        }
    }
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(format!("label name is empty in '{raw}'"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}
