use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use server_api::{
    assemble_customer_listing, assemble_landing, assemble_movie_listing, ApiContext,
    RentalFailurePolicy,
};
use shared::view::SiteMetadata;
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/catalog.db")]
    database_url: String,
    #[arg(long, default_value = "data/common.json")]
    site_metadata: PathBuf,
    #[arg(long, default_value = "fail_page")]
    rental_failure_policy: RentalFailurePolicy,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a SQL script (e.g. crates/storage/fixtures/demo.sql) against the database.
    Seed { script: PathBuf },
    /// Print the landing page view model as JSON.
    Landing,
    /// Print the movie listing view model as JSON.
    Movies,
    /// Print the customer listing view model as JSON.
    Customers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Seed { script } => {
            let sql = fs::read_to_string(&script)
                .with_context(|| format!("failed to read '{}'", script.display()))?;
            storage.run_script(&sql).await?;
            println!("applied {}", script.display());
        }
        Command::Landing => {
            let ctx = page_context(storage, &cli.site_metadata, cli.rental_failure_policy)?;
            print_json(&assemble_landing(&ctx).await?)?;
        }
        Command::Movies => {
            let ctx = page_context(storage, &cli.site_metadata, cli.rental_failure_policy)?;
            print_json(&assemble_movie_listing(&ctx).await?)?;
        }
        Command::Customers => {
            let ctx = page_context(storage, &cli.site_metadata, cli.rental_failure_policy)?;
            print_json(&assemble_customer_listing(&ctx).await?)?;
        }
    }

    Ok(())
}

fn page_context(
    storage: Storage,
    site_metadata: &Path,
    policy: RentalFailurePolicy,
) -> Result<ApiContext> {
    let raw = fs::read_to_string(site_metadata)
        .with_context(|| format!("failed to read '{}'", site_metadata.display()))?;
    let site = SiteMetadata::from_json(&raw)
        .with_context(|| format!("'{}' is not a JSON object", site_metadata.display()))?;
    Ok(ApiContext::new(storage, site).with_rental_failure_policy(policy))
}

fn print_json<T: Serialize>(page: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(page)?);
    Ok(())
}
