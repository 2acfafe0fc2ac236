use crate::commands::common::{format_record_lines, Settings};
use crate::error::CliError;

pub fn run_show(
    settings: &Settings,
    entity_type: &str,
    entity_id: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let key = settings.record_key(entity_type, entity_id)?;
    let store = settings.open_store()?;
    let record = store
        .get(&key)?
        .ok_or_else(|| CliError::RecordNotFound(key.to_string()))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        for line in format_record_lines(&record) {
            println!("{line}");
        }
    }
    Ok(())
}
