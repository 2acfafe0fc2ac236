use possync_core::{Operation, OperationId, OperationStatus};

use crate::commands::common::{format_operation_line, Settings};
use crate::error::CliError;

pub fn run_ops(
    settings: &Settings,
    status: Option<OperationStatus>,
    failures: bool,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let tenant = settings.tenant()?;
    let store = settings.open_store()?;
    let operations: Vec<Operation> = if failures {
        store
            .surfaced_failures(&tenant)?
            .into_iter()
            .take(limit)
            .collect()
    } else {
        store.operations(&tenant, status, limit)?
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&operations)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("No operations.");
        return Ok(());
    }
    let now = possync_core::util::now_ms();
    for operation in &operations {
        println!("{}", format_operation_line(operation, now));
    }
    Ok(())
}

pub fn run_discard(settings: &Settings, id: &str) -> Result<(), CliError> {
    let id = parse_operation_id(id)?;
    let store = settings.open_store()?;
    let discarded = store.discard(&id)?;
    println!("Discarded {} for {}", discarded.operation_id, discarded.key);
    Ok(())
}

pub fn parse_operation_id(value: &str) -> Result<OperationId, CliError> {
    value
        .trim()
        .parse::<OperationId>()
        .map_err(|_| CliError::InvalidOperationId(value.to_string()))
}
