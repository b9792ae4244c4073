use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use gsuite::{AuthConfig, AuthError, Authenticator, Profile, ServiceFactory};

#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    message: String,
    exit_code: i32,
}

impl CliError {
    fn new(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }
}

impl From<AuthError> for CliError {
    fn from(err: AuthError) -> Self {
        let exit_code = match err {
            AuthError::Credentials(_) => 2,
            _ => 1,
        };
        if err.is_flow_error() {
            return Self::new(
                format!("login failed: {}. Run 'gsuite login' to try again", err),
                exit_code,
            );
        }
        Self::new(err.to_string(), exit_code)
    }
}

type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Google Workspace from the command line
#[derive(Debug, Parser)]
#[command(name = "gsuite", version, about, long_about = None)]
struct Cli {
    /// Account email to act as (defaults to the active account)
    #[arg(short, long, global = true, env = "GSUITE_ACCOUNT")]
    account: Option<String>,

    /// OAuth client credentials JSON downloaded from the Google Cloud console
    #[arg(short, long, global = true)]
    credentials_file: Option<PathBuf>,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Authenticate a Google account in the browser
    Login,
    /// Forget the selected account and delete its token
    Logout,
    /// Manage stored accounts
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },
    /// Show the authenticated account's profile
    Whoami,
}

#[derive(Debug, Subcommand)]
enum AccountsCommand {
    /// List stored accounts; `*` marks the active one
    #[command(alias = "ls")]
    List,
    /// Make an account the active one
    Switch { email: String },
    /// Remove an account and delete its token
    #[command(alias = "rm")]
    Remove { email: String },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("gsuite: {}", err.message);
        std::process::exit(err.exit_code);
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "gsuite=debug" } else { "gsuite=warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> CliResult<()> {
    let config = AuthConfig::from_defaults(cli.account, cli.credentials_file);
    let factory = ServiceFactory::new(&config);
    let format = cli.format;

    match cli.command {
        Command::Login => login(&factory, format),
        Command::Logout => {
            let email = factory.logout()?;
            print_done(format, "logged_out", &email, &format!("Logged out {}", email));
            Ok(())
        }
        Command::Accounts { command } => match command {
            AccountsCommand::List => list_accounts(&factory, format),
            AccountsCommand::Switch { email } => {
                let email = factory.switch_account(&email)?;
                print_done(format, "active", &email, &format!("Switched to {}", email));
                Ok(())
            }
            AccountsCommand::Remove { email } => {
                factory.remove_account(&email)?;
                print_done(format, "removed", &email, &format!("Removed account {}", email));
                Ok(())
            }
        },
        Command::Whoami => whoami(&factory, format),
    }
}

fn login(factory: &ServiceFactory, format: OutputFormat) -> CliResult<()> {
    let settings = factory.settings()?.clone();
    let authenticator = Authenticator::new(settings);
    let email = factory.login(&authenticator)?;
    print_done(format, "email", &email, &format!("Logged in as {}", email));
    Ok(())
}

fn list_accounts(factory: &ServiceFactory, format: OutputFormat) -> CliResult<()> {
    let snapshot = factory.list_accounts()?;

    if format == OutputFormat::Json {
        let rows: Vec<_> = snapshot
            .list()
            .into_iter()
            .map(|entry| {
                json!({
                    "email": entry.email,
                    "added_at": entry.added_at,
                    "active": snapshot.is_active(&entry.email),
                })
            })
            .collect();
        return print_json(&json!(rows));
    }

    if snapshot.is_empty() {
        println!("No accounts configured. Run 'gsuite login' to add one.");
        return Ok(());
    }
    for entry in snapshot.list() {
        let marker = if snapshot.is_active(&entry.email) { "*" } else { " " };
        println!(
            "{} {} (added {})",
            marker,
            entry.email,
            entry.added_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

fn whoami(factory: &ServiceFactory, format: OutputFormat) -> CliResult<()> {
    let client = factory.client()?;
    let profile = factory.profile(&client)?;

    match format {
        OutputFormat::Json => print_json(&profile_json(&profile)),
        OutputFormat::Text => {
            println!("Email:    {}", profile.email_address);
            println!("Messages: {}", profile.messages_total);
            println!("Threads:  {}", profile.threads_total);
            Ok(())
        }
    }
}

fn profile_json(profile: &Profile) -> serde_json::Value {
    json!({
        "email": profile.email_address,
        "messages_total": profile.messages_total,
        "threads_total": profile.threads_total,
    })
}

fn print_done(format: OutputFormat, key: &str, email: &str, text: &str) {
    match format {
        OutputFormat::Json => {
            let mut object = serde_json::Map::new();
            object.insert(key.to_string(), json!(email));
            println!("{}", serde_json::Value::Object(object));
        }
        OutputFormat::Text => println!("{}", text),
    }
}

fn print_json(value: &serde_json::Value) -> CliResult<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::new(format!("failed to encode JSON output: {}", err), 1))?;
    println!("{}", rendered);
    Ok(())
}
