pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::availability::AvailabilityTarget;

#[derive(Debug, Parser)]
#[command(
    name = "provisio",
    about = "Provisio operator CLI",
    long_about = "Operate the Provisio allocation engine: migrations, demo catalog, config inspection, readiness and capacity lookups.",
    after_help = "Examples:\n  provisio migrate\n  provisio doctor --json\n  provisio availability --phase-id phase-atlas-build --resource-type vm"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load and verify the demo catalog (idempotent)")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, notifier readiness, DB connectivity and schema state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Report capacity for a resource or a resource type within a phase")]
    Availability {
        #[arg(long, help = "Resource id whose ledger counter to report")]
        resource_id: Option<String>,
        #[arg(long, help = "Phase that declares the resource type")]
        phase_id: Option<String>,
        #[arg(long, help = "Free-text resource type, matched case-insensitively")]
        resource_type: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Availability { resource_id, phase_id, resource_type } => {
            match AvailabilityTarget::from_args(resource_id, phase_id, resource_type) {
                Ok(target) => commands::availability::run(target),
                Err(message) => commands::CommandResult::failure(
                    "availability",
                    "invalid_arguments",
                    message,
                    2,
                ),
            }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
