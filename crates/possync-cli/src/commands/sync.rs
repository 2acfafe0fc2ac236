use std::sync::Arc;

use possync_core::{CancelFlag, SyncEvent, SyncResult, SyncScheduler};
use tokio::sync::broadcast::error::RecvError;

use crate::commands::common::Settings;
use crate::error::CliError;

pub async fn run_sync(settings: &Settings, as_json: bool) -> Result<(), CliError> {
    let tenant = settings.tenant()?;
    let client = settings.client()?;
    let result = client.run_sync_cycle(&tenant, &CancelFlag::new()).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for line in format_sync_result_lines(&result) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_watch(settings: &Settings, cycles: Option<usize>) -> Result<(), CliError> {
    let tenant = settings.tenant()?;
    let client = Arc::new(settings.client()?);
    let scheduler = SyncScheduler::spawn(client, tenant.clone());
    let mut events = scheduler.subscribe();
    let mut status = scheduler.watch_status();
    let mut completed = 0;

    println!("Watching {tenant}; press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                println!("status: {current}");
            }
            event = events.recv() => match event {
                Ok(SyncEvent::Completed(result)) => {
                    for line in format_sync_result_lines(&result) {
                        println!("{line}");
                    }
                    completed += 1;
                    if cycles.is_some_and(|limit| completed >= limit) {
                        break;
                    }
                }
                Ok(SyncEvent::Failed { detail, transient }) => {
                    let retry = if transient { ", will retry" } else { "" };
                    eprintln!("sync failed: {detail}{retry}");
                }
                Ok(SyncEvent::Cancelled(phase)) => println!("sync cancelled before {phase}"),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Missed {missed} sync events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    scheduler.cancel();
    scheduler.shutdown().await;
    Ok(())
}

pub fn format_sync_result_lines(result: &SyncResult) -> Vec<String> {
    let mut lines = vec![format!("Sync completed: {result}")];
    for rejected in &result.rejected {
        lines.push(format!(
            "  rejected {} on {}: {}",
            rejected.operation_id, rejected.key, rejected.reason
        ));
    }
    for report in &result.reports {
        lines.push(format!("  {report}"));
    }
    if result.more_pending {
        lines.push("  more operations are queued; run sync again".to_string());
    }
    lines
}
