use possync_core::{FieldMap, Operation, OperationKind, Version};

use crate::commands::common::{parse_fields, Settings};
use crate::commands::ops::parse_operation_id;
use crate::error::CliError;

pub struct EnqueueArgs<'a> {
    pub kind: OperationKind,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub fields: &'a [String],
    pub operation_id: Option<&'a str>,
}

pub fn run_enqueue(
    settings: &Settings,
    args: EnqueueArgs<'_>,
    as_json: bool,
) -> Result<(), CliError> {
    let key = settings.record_key(args.entity_type, args.entity_id)?;
    let delta = parse_fields(args.fields)?;
    let actor = settings.actor()?;
    let store = settings.open_store()?;
    let operation = match args.operation_id {
        Some(id) => {
            let mut operation = Operation::new(
                key,
                args.kind,
                delta,
                Version::PROVISIONAL,
                FieldMap::new(),
                actor,
            );
            operation.operation_id = parse_operation_id(id)?;
            store.enqueue_operation(operation)?
        }
        None => store.enqueue(&key, args.kind, delta, &actor)?,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&operation)?);
    } else {
        println!(
            "Queued {} {} for {}",
            operation.kind, operation.operation_id, operation.key
        );
    }
    Ok(())
}
