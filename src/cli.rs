//! CLI argument parsing for the resources-worker binary.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::types::{ImportMode, ResourceType};

#[derive(Parser)]
#[command(name = "resources-worker", about = "Resources domain worker: cross-service queries and CSV imports")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Import a local CSV file and print the result
    Import {
        file: PathBuf,
        /// User the import is attributed to
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value = "create")]
        mode: ImportMode,
        /// Record failing rows and keep going
        #[arg(long)]
        skip_errors: bool,
    },
    /// Dry-run a CSV file without writing anything
    Validate {
        file: PathBuf,
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value = "create")]
        mode: ImportMode,
    },
    /// Undo a completed import job
    Rollback {
        job_id: Uuid,
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Send a query to a running worker over the bus
    Query {
        #[command(subcommand)]
        query: QueryCommand,
    },
}

#[derive(Subcommand)]
pub enum QueryCommand {
    ById {
        id: String,
    },
    ByIds {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Candidates {
        #[arg(long = "type")]
        resource_type: ResourceType,
        #[arg(long)]
        exclude: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    Availability {
        id: String,
        /// RFC 3339 start of the window
        #[arg(long)]
        start: DateTime<Utc>,
        /// RFC 3339 end of the window (exclusive)
        #[arg(long)]
        end: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_migrate_command_parses() {
        let cli = Cli::parse_from(["resources-worker", "migrate"]);
        assert!(matches!(cli.command, Some(Command::Migrate)));
    }

    #[test]
    fn test_cli_no_command_defaults_to_none() {
        let cli = Cli::parse_from(["resources-worker"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_serve_command_parses() {
        let cli = Cli::parse_from(["resources-worker", "serve"]);
        assert!(matches!(cli.command, Some(Command::Serve)));
    }

    #[test]
    fn test_cli_import_command_parses_mode_and_flags() {
        let user = Uuid::new_v4();
        let cli = Cli::parse_from([
            "resources-worker",
            "import",
            "rooms.csv",
            "--user",
            &user.to_string(),
            "--mode",
            "upsert",
            "--skip-errors",
        ]);
        match cli.command {
            Some(Command::Import { file, user: parsed, mode, skip_errors }) => {
                assert_eq!(file, PathBuf::from("rooms.csv"));
                assert_eq!(parsed, user);
                assert_eq!(mode, ImportMode::Upsert);
                assert!(skip_errors);
            }
            _ => panic!("expected import command"),
        }
    }

    #[test]
    fn test_cli_import_defaults_to_create_mode() {
        let cli = Cli::parse_from(["resources-worker", "validate", "a.csv", "--user", &Uuid::nil().to_string()]);
        assert!(matches!(cli.command, Some(Command::Validate { mode: ImportMode::Create, .. })));
    }

    #[test]
    fn test_cli_rejects_bad_user_id() {
        assert!(Cli::try_parse_from(["resources-worker", "rollback", &Uuid::nil().to_string(), "--user", "bob"]).is_err());
    }

    #[test]
    fn test_cli_query_availability_parses_dates() {
        let cli = Cli::parse_from([
            "resources-worker",
            "query",
            "availability",
            "r-1",
            "--start",
            "2026-03-01T08:00:00Z",
            "--end",
            "2026-03-01T10:00:00Z",
        ]);
        match cli.command {
            Some(Command::Query { query: QueryCommand::Availability { id, start, end } }) => {
                assert_eq!(id, "r-1");
                assert_eq!((end - start).num_hours(), 2);
            }
            _ => panic!("expected availability query"),
        }
    }

    #[test]
    fn test_cli_query_candidates_parses_type() {
        let cli = Cli::parse_from(["resources-worker", "query", "candidates", "--type", "meeting-room"]);
        assert!(matches!(
            cli.command,
            Some(Command::Query {
                query: QueryCommand::Candidates { resource_type: ResourceType::MeetingRoom, .. }
            })
        ));
    }
}
