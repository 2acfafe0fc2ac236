use possync_core::Record;

use crate::commands::common::Settings;
use crate::error::CliError;

pub fn run_dirty(settings: &Settings, limit: usize, as_json: bool) -> Result<(), CliError> {
    let tenant = settings.tenant()?;
    let store = settings.open_store()?;
    let records = store
        .scan_dirty(&tenant)
        .take(limit)
        .collect::<Result<Vec<Record>, _>>()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No unsynced local changes.");
        return Ok(());
    }
    for record in &records {
        let state = if record.deleted { " (deleted)" } else { "" };
        println!("{} {}{state}", record.key, record.version);
    }
    Ok(())
}
