//! Djombi auth CLI: sign in, inspect the session and manage organizations.

mod app;

use std::path::PathBuf;

use auth_engine::TokenClass;
use clap::{Parser, Subcommand};

/// Djombi dashboard auth command-line interface.
#[derive(Parser)]
#[command(name = "djombi-auth")]
#[command(about = "Sign in to Djombi and manage the local session")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, credentials and logs. Defaults to ~/.djombi
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in through the browser
    Login,
    /// Show session state, user and current organization
    Status,
    /// Print a valid access token
    Token {
        /// primary or secondary
        #[arg(default_value = "secondary")]
        class: TokenClass,
    },
    /// Sign out and clear stored credentials
    Logout,
    /// Manage organizations
    Orgs {
        #[command(subcommand)]
        command: OrgCommands,
    },
}

#[derive(Subcommand)]
enum OrgCommands {
    /// List memberships
    List,
    /// Make an organization current
    Switch { organization_id: String },
    /// Create an organization and make it current
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let app = app::build(cli.base_dir, cli.log_level.as_deref())?;

    match cli.command {
        Commands::Login => app::login(&app).await,
        Commands::Status => app::status(&app).await,
        Commands::Token { class } => app::print_token(&app, class).await,
        Commands::Logout => app::logout(&app),
        Commands::Orgs { command } => match command {
            OrgCommands::List => app::list_organizations(&app).await,
            OrgCommands::Switch { organization_id } => {
                app::switch_organization(&app, &organization_id).await
            }
            OrgCommands::Create { name, description } => {
                app::create_organization(&app, name, description).await
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_token_class() {
        let cli = Cli::try_parse_from(["djombi-auth", "token", "primary"]).unwrap();
        assert!(matches!(cli.command, Commands::Token { class: TokenClass::Primary }));

        let cli = Cli::try_parse_from(["djombi-auth", "token"]).unwrap();
        assert!(matches!(cli.command, Commands::Token { class: TokenClass::Secondary }));

        assert!(Cli::try_parse_from(["djombi-auth", "token", "tertiary"]).is_err());
    }

    #[test]
    fn test_parse_org_switch_with_global_flags() {
        let cli = Cli::try_parse_from([
            "djombi-auth",
            "orgs",
            "switch",
            "org-1",
            "--log-level",
            "debug",
            "--base-dir",
            "/tmp/djombi",
        ])
        .unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.base_dir, Some(PathBuf::from("/tmp/djombi")));
        assert!(matches!(
            cli.command,
            Commands::Orgs { command: OrgCommands::Switch { ref organization_id } } if organization_id == "org-1"
        ));
    }
}
