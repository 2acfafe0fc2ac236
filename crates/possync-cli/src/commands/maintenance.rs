use possync_core::db::Database;

use crate::commands::common::Settings;
use crate::error::CliError;

pub fn run_gc(settings: &Settings, as_json: bool) -> Result<(), CliError> {
    let tenant = settings.tenant()?;
    let store = settings.open_store()?;
    let report = store.gc(&tenant, possync_core::util::now_ms())?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Purged {} tombstones, compacted {} operations",
            report.purged_tombstones, report.compacted_operations
        );
    }
    Ok(())
}

pub fn run_rebuild(settings: &Settings) -> Result<(), CliError> {
    let tenant = settings.tenant()?;
    let store = settings.open_store()?;
    let rebuilt = store.rebuild_operations_from_dirty(&tenant, &settings.actor()?)?;
    println!("Queued {rebuilt} operations");
    Ok(())
}

pub fn run_quarantine(settings: &Settings) -> Result<(), CliError> {
    match Database::quarantine_corrupted_files(&settings.db_path)? {
        Some(path) => println!("Moved store to {}", path.display()),
        None => println!("No store file at {}", settings.db_path.display()),
    }
    Ok(())
}
