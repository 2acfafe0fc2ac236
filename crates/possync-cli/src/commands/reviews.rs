use possync_core::ReviewChoice;

use crate::commands::common::{format_review_line, Settings};
use crate::error::CliError;

pub fn run_reviews(
    settings: &Settings,
    include_resolved: bool,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let tenant = settings.tenant()?;
    let store = settings.open_store()?;
    let reviews = store.reviews(&tenant, !include_resolved, limit)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&reviews)?);
        return Ok(());
    }

    if reviews.is_empty() {
        println!("No manual reviews.");
        return Ok(());
    }
    for review in &reviews {
        println!("{}", format_review_line(review));
    }
    Ok(())
}

pub fn run_resolve(settings: &Settings, id: i64, choice: ReviewChoice) -> Result<(), CliError> {
    let store = settings.open_store()?;
    match store.resolve_review(id, choice, &settings.actor()?)? {
        Some(operation) => println!(
            "Resolved review #{id}; queued {} to push the local value",
            operation.operation_id
        ),
        None => println!("Resolved review #{id}; keeping the server value"),
    }
    Ok(())
}
