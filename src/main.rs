use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::warn;

use qbo_mcp::auth::Authenticator;
use qbo_mcp::config::QboConfig;

#[derive(Parser)]
#[command(
    name = "qbo-mcp",
    version,
    about = "QuickBooks Online access with managed OAuth2 tokens."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Token file path (overrides QBO_TOKEN_FILE)
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Authorize with QuickBooks Online (refreshes or opens the browser as needed)
    Login,
    /// Revoke stored tokens and delete the token file
    Logout,
    /// Show the connected company without calling QuickBooks
    Whoami,
    /// Run a QBO query, e.g. "SELECT * FROM Customer"
    Query {
        sql: String,
    },
    /// Fetch a report, e.g. ProfitAndLoss
    Report {
        name: String,

        /// Report parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries command output, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qbo_mcp=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = QboConfig::from_env();
    if let Some(path) = cli.token_file {
        config.token_file = path;
    }
    for problem in config.validate() {
        warn!("{problem}");
    }

    let auth = Authenticator::new(config);

    match cli.command {
        Command::Login => {
            auth.ensure_authenticated().await?;
            let info = auth.company_info()?;
            println!("✓ Connected to QuickBooks company {} ({})", info.realm_id, info.environment);
            println!("  Tokens saved to {}", auth.store().path().display());
        }
        Command::Logout => {
            if auth.revoke_tokens().await? {
                println!("✓ Logged out from QuickBooks Online.");
            } else {
                println!("Not logged in.");
            }
        }
        Command::Whoami => {
            let info = auth.company_info_json();
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Query { sql } => {
            if sql.trim().is_empty() {
                bail!("query must not be empty");
            }
            let client = auth.get_authenticated_client().await?;
            let result = client.query(&sql).await.context("query failed")?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Report { name, params } => {
            let client = auth.get_authenticated_client().await?;
            let result = client
                .report(&name, &params)
                .await
                .with_context(|| format!("report {name} failed"))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
