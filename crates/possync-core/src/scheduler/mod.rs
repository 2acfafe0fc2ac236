//! Background sync scheduler.
//!
//! One tokio task per tenant owns the schedule. Triggers arrive as commands on
//! a single-consumer channel; the task runs at most one cycle at a time and
//! folds every trigger received during a cycle into a single follow-up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::models::TenantId;
use crate::state::SyncStatus;
use crate::sync::{Backoff, CancelFlag, DeltaSyncClient, Phase, SyncError, SyncResult};

const EVENT_CAPACITY: usize = 64;

/// Notifications broadcast to subscribers after each cycle
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Completed(SyncResult),
    Failed { detail: String, transient: bool },
    Cancelled(Phase),
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Explicit,
    Connectivity,
    LocalChange,
}

#[derive(Debug)]
enum Command {
    Trigger(Trigger),
    ConnectivityLost,
    Cancel,
    Resume,
    Shutdown,
}

/// Handle to a running scheduler task.
pub struct SyncScheduler {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    cancel: CancelFlag,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start scheduling cycles for `tenant`, assuming the device is online.
    ///
    /// The first cycle starts right away. Must be called inside a tokio runtime.
    pub fn spawn(client: Arc<DeltaSyncClient>, tenant: TenantId) -> Self {
        let config = client.store().config();
        let backoff = Backoff::new(config.backoff_base(), config.backoff_cap());
        let interval = config.sync_interval();
        let debounce = config.debounce();
        let max_failures = config.max_consecutive_failures;

        let (commands, receiver) = mpsc::unbounded_channel();
        let (status_sender, status) = watch::channel(SyncStatus::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancelFlag::new();

        let worker = Worker {
            client,
            tenant,
            commands: receiver,
            status: status_sender,
            events: events.clone(),
            cancel: cancel.clone(),
            backoff,
            interval,
            debounce,
            max_failures,
            online: true,
            halted: false,
            pending: true,
            failures: 0,
            debounce_at: None,
            retry_at: None,
        };
        let task = tokio::spawn(worker.run());

        Self {
            commands,
            status,
            events,
            cancel,
            task,
        }
    }

    pub fn request_sync(&self) {
        self.send(Command::Trigger(Trigger::Explicit));
    }

    /// Report a local enqueue; syncs after the debounce window while online
    pub fn notify_local_change(&self) {
        self.send(Command::Trigger(Trigger::LocalChange));
    }

    pub fn set_online(&self, online: bool) {
        self.send(if online {
            Command::Trigger(Trigger::Connectivity)
        } else {
            Command::ConnectivityLost
        });
    }

    /// Stop the running cycle at its next phase boundary and drop queued triggers
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.send(Command::Cancel);
    }

    /// Leave the halted state after a local storage failure
    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Stop the task once the current cycle, if any, has finished
    pub async fn shutdown(self) {
        self.send(Command::Shutdown);
        if let Err(error) = self.task.await {
            tracing::warn!("Sync scheduler task ended abnormally: {error}");
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Sync scheduler already stopped");
        }
    }
}

struct Worker {
    client: Arc<DeltaSyncClient>,
    tenant: TenantId,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    cancel: CancelFlag,
    backoff: Backoff,
    interval: Duration,
    debounce: Duration,
    max_failures: u32,
    online: bool,
    /// Set by local storage failures; only `resume` clears it
    halted: bool,
    pending: bool,
    failures: u32,
    debounce_at: Option<Instant>,
    retry_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self) {
        let mut periodic = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.ready() {
                self.pending = false;
                self.debounce_at = None;
                self.run_cycle().await;
                if !self.drain_commands() {
                    break;
                }
                continue;
            }

            let debounce_at = self.debounce_at;
            let retry_at = self.retry_at;
            let keep_running = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => false,
                },
                _ = periodic.tick() => {
                    if self.online {
                        self.pending = true;
                    }
                    true
                }
                () = sleep_until(debounce_at), if debounce_at.is_some() => {
                    self.debounce_at = None;
                    self.pending = true;
                    true
                }
                () = sleep_until(retry_at), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.pending = true;
                    true
                }
            };
            if !keep_running {
                break;
            }
        }

        tracing::debug!("Sync scheduler for {} stopped", self.tenant);
    }

    fn ready(&self) -> bool {
        self.pending && self.online && !self.halted && self.retry_at.is_none()
    }

    /// Apply commands queued while a cycle ran; false on shutdown
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            if !self.handle(command) {
                return false;
            }
        }
        true
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Trigger(Trigger::Explicit) => {
                self.pending = true;
                self.retry_at = None;
            }
            Command::Trigger(Trigger::Connectivity) => {
                tracing::info!("Connectivity regained for {}", self.tenant);
                self.online = true;
                self.pending = true;
                self.retry_at = None;
            }
            Command::Trigger(Trigger::LocalChange) => {
                if self.online && self.debounce_at.is_none() {
                    self.debounce_at = Some(Instant::now() + self.debounce);
                }
            }
            Command::ConnectivityLost => {
                tracing::info!("Connectivity lost for {}", self.tenant);
                self.online = false;
                self.pending = false;
                self.debounce_at = None;
                self.retry_at = None;
                if !self.halted {
                    self.set_status(SyncStatus::Idle);
                }
            }
            Command::Cancel => {
                self.cancel.reset();
                self.pending = false;
                self.debounce_at = None;
            }
            Command::Resume => {
                self.halted = false;
                self.failures = 0;
                self.retry_at = None;
                self.pending = true;
                self.set_status(SyncStatus::Idle);
            }
            Command::Shutdown => return false,
        }
        true
    }

    async fn run_cycle(&mut self) {
        self.set_status(SyncStatus::Syncing);

        match self.client.run_sync_cycle(&self.tenant, &self.cancel).await {
            Ok(result) => {
                self.failures = 0;
                self.retry_at = None;
                if result.more_pending {
                    self.pending = true;
                }
                self.set_status(SyncStatus::Idle);
                self.emit(SyncEvent::Completed(result));
            }
            Err(SyncError::Cancelled(phase)) => {
                self.set_status(SyncStatus::Idle);
                self.emit(SyncEvent::Cancelled(phase));
            }
            Err(SyncError::AlreadyRunning(_)) => {
                tracing::debug!("Cycle for {} already running elsewhere", self.tenant);
                self.pending = true;
                self.retry_at = Some(Instant::now() + self.debounce);
                self.set_status(SyncStatus::Idle);
            }
            Err(error) if error.is_fatal() => {
                let detail = error.to_string();
                tracing::error!("Sync for {} halted: {detail}", self.tenant);
                self.halted = true;
                self.set_status(SyncStatus::Error {
                    detail: detail.clone(),
                });
                self.emit(SyncEvent::Failed {
                    detail,
                    transient: false,
                });
            }
            Err(error) => {
                self.failures = self.failures.saturating_add(1);
                let delay = self.backoff.delay(self.failures - 1);
                self.retry_at = Some(Instant::now() + delay);

                let detail = error.to_string();
                tracing::warn!(
                    "Sync for {} failed {} time(s), retrying in {:?}: {}",
                    self.tenant,
                    self.failures,
                    delay,
                    detail
                );
                self.set_status(if self.failures >= self.max_failures {
                    SyncStatus::Error {
                        detail: detail.clone(),
                    }
                } else {
                    SyncStatus::Backoff {
                        attempt: self.failures,
                    }
                });
                self.emit(SyncEvent::Failed {
                    detail,
                    transient: error.is_transient(),
                });
            }
        }
    }

    fn set_status(&self, status: SyncStatus) {
        let previous = self.status.send_replace(status.clone());
        if previous != status {
            tracing::debug!("Sync status for {}: {status}", self.tenant);
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
