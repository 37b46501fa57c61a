//! Diagnostic command line tool for the bezoek visitor-parking client.
//!
//! `bezoek check` runs a live login, permit, reservation, and favorite pass
//! against one provider deployment and prints masked summaries; license
//! plates and account details never reach the terminal unredacted. Log
//! verbosity follows `RUST_LOG`.

#![expect(clippy::print_stdout, reason = "terminal output is this tool's job")]

use std::fmt::Display;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use reqwest::Client;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use bezoek_core::client::{BezoekClient, ProviderOverrides};
use bezoek_core::error::BezoekError;
use bezoek_core::manifest::manifest_schema;
use bezoek_core::model::Credentials;
use bezoek_core::normalize::{format_timestamp, mask_license_plate};
use bezoek_core::provider::{ParkingProvider, merge_credentials};
use bezoek_core::registry::ProviderRegistry;
use bezoek_provider_amsterdam as amsterdam;
use bezoek_provider_dvsportal as dvsportal;
use bezoek_provider_thehague as the_hague;

#[derive(Parser)]
#[command(name = "bezoek", version, about = "Visitor parking provider diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in against a provider deployment and print masked summaries.
    Check(CheckArgs),
    /// List registered providers and their update capabilities.
    Providers,
    /// Print the JSON Schema for provider manifest documents.
    Schema,
}

#[derive(Args)]
struct CheckArgs {
    /// Provider id to check.
    #[arg(long, env = "BEZOEK_PROVIDER")]
    provider: String,
    /// Base URL of the provider deployment.
    #[arg(long, env = "BEZOEK_BASE_URL")]
    base_url: String,
    /// API prefix override for non-standard deployments.
    #[arg(long, env = "BEZOEK_API_URI")]
    api_uri: Option<String>,
    /// Account username, stored under the `username` credential key.
    #[arg(long, env = "BEZOEK_USERNAME")]
    username: Option<String>,
    /// Account password.
    #[arg(long, env = "BEZOEK_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// JSON file holding additional credential keys.
    #[arg(long, env = "BEZOEK_CREDENTIALS_FILE")]
    credentials_file: Option<PathBuf>,
    /// Extra credential as KEY=VALUE; repeatable.
    #[arg(long = "credential", value_name = "KEY=VALUE")]
    credentials: Vec<String>,
    /// Per-attempt HTTP timeout in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
    /// Transport retries granted to idempotent requests.
    #[arg(long, default_value_t = 0)]
    retry_count: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match Cli::parse().command {
        Command::Check(args) => check(args).await,
        Command::Providers => providers(),
        Command::Schema => schema(),
    }
}

fn registry() -> ProviderRegistry {
    ProviderRegistry::new(vec![
        amsterdam::registration(),
        dvsportal::registration(),
        the_hague::registration(),
    ])
}

fn providers() -> Result<()> {
    for info in registry().infos(false)? {
        println!(
            "{} (favorite updates: {}; reservation updates: {})",
            info.id,
            field_list(&info.favorite_update_fields),
            field_list(&info.reservation_update_fields),
        );
    }
    Ok(())
}

fn schema() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&manifest_schema())?);
    Ok(())
}

async fn check(args: CheckArgs) -> Result<()> {
    let credentials = build_credentials(&args)?;
    debug!(provider = %args.provider, "starting live check");

    let client = BezoekClient::builder(Arc::new(registry()))
        .http_client(
            Client::builder()
                .user_agent(concat!("bezoek/", env!("CARGO_PKG_VERSION")))
                .cookie_store(true)
                .build()?,
        )
        .base_url(args.base_url)
        .timeout(Duration::from_secs(args.timeout))
        .retry_count(args.retry_count)
        .build()?;
    let provider = client.get_provider(
        &args.provider,
        ProviderOverrides {
            base_url: None,
            api_uri: args.api_uri,
        },
    )?;

    run_check(provider.as_ref(), &credentials).await
}

async fn run_check(provider: &dyn ParkingProvider, credentials: &Credentials) -> Result<()> {
    let info = provider.info();
    println!("provider: {}", info.id);
    println!("  favorite updates: {}", field_list(&info.favorite_update_fields));
    println!("  reservation updates: {}", field_list(&info.reservation_update_fields));

    stage("login", provider.login(credentials).await)?;
    println!("login: ok");

    let permit = stage("permit", provider.get_permit().await)?;
    println!("permit: {} (balance {})", permit.id, permit.remaining_balance);
    for block in &permit.zone_validity {
        println!(
            "  paid window: {} .. {}",
            format_timestamp(block.start_time),
            format_timestamp(block.end_time)
        );
    }

    let reservations = stage("reservations", provider.list_reservations().await)?;
    println!("reservations: {}", reservations.len());
    for reservation in &reservations {
        println!(
            "  {}: {} {} .. {}",
            reservation.id,
            mask_license_plate(&reservation.license_plate),
            format_timestamp(reservation.start_time),
            format_timestamp(reservation.end_time)
        );
    }

    let favorites = stage("favorites", provider.list_favorites().await)?;
    println!("favorites: {}", favorites.len());
    for favorite in &favorites {
        // Some providers key favorites by plate, so the id is masked too.
        println!("  {}", mask_license_plate(&favorite.license_plate));
    }

    println!("check passed");
    Ok(())
}

fn stage<T>(name: &str, outcome: Result<T, BezoekError>) -> Result<T> {
    outcome.map_err(|err| anyhow!("{name} failed ({}): {err}", err.code()))
}

fn build_credentials(args: &CheckArgs) -> Result<Credentials> {
    let mut credentials = Credentials::new();
    if let Some(username) = &args.username {
        credentials.insert(String::from("username"), username.clone());
    }
    if let Some(password) = &args.password {
        credentials.insert(String::from("password"), password.clone());
    }
    if let Some(path) = &args.credentials_file {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading credentials file {}", path.display()))?;
        let from_file: Credentials = serde_json::from_str(&raw)
            .with_context(|| format!("parsing credentials file {}", path.display()))?;
        credentials = merge_credentials(&credentials, &from_file);
    }
    let mut from_flags = Credentials::new();
    for entry in &args.credentials {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("credential entries take the form KEY=VALUE, got {entry:?}");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("credential entries take the form KEY=VALUE, got {entry:?}");
        }
        from_flags.insert(key.to_owned(), value.to_owned());
    }
    Ok(merge_credentials(&credentials, &from_flags))
}

fn field_list<T: Display>(fields: &[T]) -> String {
    if fields.is_empty() {
        return String::from("none");
    }
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
