//! possync CLI - inspect a local point-of-sale store and sync it with the server

mod cli;
mod commands;
mod config_profiles;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ProfileCommands};
use crate::commands::common::Settings;
use crate::commands::completions::run_completions;
use crate::commands::dirty::run_dirty;
use crate::commands::enqueue::{run_enqueue, EnqueueArgs};
use crate::commands::maintenance::{run_gc, run_quarantine, run_rebuild};
use crate::commands::ops::{run_discard, run_ops};
use crate::commands::profile::{run_profile_set, run_profile_show, run_profile_use, ProfileUpdate};
use crate::commands::reviews::{run_resolve, run_reviews};
use crate::commands::show::run_show;
use crate::commands::sync::{run_sync, run_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("possync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let profile = cli.settings.profile.clone();

    match cli.command {
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref()),
        Commands::Profile { command } => match command {
            ProfileCommands::Show => {
                let settings = Settings::resolve(&cli.settings)?;
                run_profile_show(&settings, profile.as_deref())
            }
            ProfileCommands::Set {
                db_path,
                tenant,
                device,
                server_url,
                config,
            } => run_profile_set(
                profile.as_deref(),
                ProfileUpdate {
                    db_path,
                    tenant,
                    device,
                    server_url,
                    config_path: config,
                },
            ),
            ProfileCommands::Use { name } => run_profile_use(&name),
        },
        command => {
            let settings = Settings::resolve(&cli.settings)?;
            dispatch(&settings, command).await
        }
    }
}

async fn dispatch(settings: &Settings, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Enqueue {
            kind,
            entity_type,
            entity_id,
            fields,
            operation_id,
            json,
        } => run_enqueue(
            settings,
            EnqueueArgs {
                kind: kind.into(),
                entity_type: &entity_type,
                entity_id: &entity_id,
                fields: &fields,
                operation_id: operation_id.as_deref(),
            },
            json,
        ),
        Commands::Show {
            entity_type,
            entity_id,
            json,
        } => run_show(settings, &entity_type, &entity_id, json),
        Commands::Dirty { limit, json } => run_dirty(settings, limit, json),
        Commands::Ops {
            status,
            failures,
            limit,
            json,
        } => run_ops(settings, status.map(Into::into), failures, limit, json),
        Commands::Discard { id } => run_discard(settings, &id),
        Commands::Sync { json } => run_sync(settings, json).await,
        Commands::Watch { cycles } => run_watch(settings, cycles).await,
        Commands::Reviews { all, limit, json } => run_reviews(settings, all, limit, json),
        Commands::Resolve { id, keep } => run_resolve(settings, id, keep.into()),
        Commands::Gc { json } => run_gc(settings, json),
        Commands::Rebuild => run_rebuild(settings),
        Commands::Quarantine => run_quarantine(settings),
        Commands::Profile { .. } | Commands::Completions { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests;
