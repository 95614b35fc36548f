//! Local work engine
//!
//! The transport hands accepted work to a [`WorkEngine`]. [`SlotEngine`] is
//! the bundled implementation: it only does slot accounting for the short- and
//! long-running pools and leaves execution to a [`WorkRunner`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use uuid::Uuid;

use crate::protocol::{Pool, WorkFailure, WorkItem};

pub type WorkResult<T> = Result<T, WorkFailure>;

/// Engine the transport submits local work to
#[async_trait]
pub trait WorkEngine: Send + Sync {
    /// Accept the work for execution or reject it right away
    async fn do_work(&self, work: WorkItem) -> WorkResult<()>;

    /// Wait until the work has started; returns the start delay in milliseconds
    async fn start_work(&self, work: WorkItem) -> WorkResult<u64>;

    /// Queue the work and return without waiting for a slot
    async fn schedule_work(&self, work: WorkItem) -> WorkResult<()>;

    /// Free slots in a pool
    fn free(&self, pool: Pool) -> u64;
}

/// Executes work items once they hold a slot
#[async_trait]
pub trait WorkRunner: Send + Sync {
    async fn run(&self, work: &WorkItem) -> Result<(), String>;
}

/// Runner that only logs the work it receives
pub struct LogRunner;

#[async_trait]
impl WorkRunner for LogRunner {
    async fn run(&self, work: &WorkItem) -> Result<(), String> {
        tracing::info!(
            work = %work,
            bytes = work.payload.len(),
            long_running = work.long_running,
            "Executing work"
        );
        Ok(())
    }
}

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A work item finished running and released its slot
    Finished {
        work_id: Uuid,
        pool: Pool,
        succeeded: bool,
    },
}

/// Engine sizing
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub short_running_slots: usize,
    pub long_running_slots: usize,
    /// How long START_WORK may wait for a slot
    pub start_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            short_running_slots: 10,
            long_running_slots: 5,
            start_timeout: Duration::from_secs(10),
        }
    }
}

/// Slot-accounting engine backed by one semaphore per pool
pub struct SlotEngine {
    short_running: Arc<Semaphore>,
    long_running: Arc<Semaphore>,
    start_timeout: Duration,
    runner: Arc<dyn WorkRunner>,
    /// Event sender
    event_tx: mpsc::Sender<EngineEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<EngineEvent>>,
}

impl SlotEngine {
    pub fn new(config: EngineConfig, runner: Arc<dyn WorkRunner>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            short_running: Arc::new(Semaphore::new(config.short_running_slots)),
            long_running: Arc::new(Semaphore::new(config.long_running_slots)),
            start_timeout: config.start_timeout,
            runner,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.event_rx.take()
    }

    fn slots(&self, pool: Pool) -> &Arc<Semaphore> {
        match pool {
            Pool::ShortRunning => &self.short_running,
            Pool::LongRunning => &self.long_running,
        }
    }

    /// Run the work on its own task; the slot is released when it finishes
    fn spawn(&self, work: WorkItem, permit: OwnedSemaphorePermit) {
        tokio::spawn(execute(self.runner.clone(), self.event_tx.clone(), work, permit));
    }
}

async fn execute(
    runner: Arc<dyn WorkRunner>,
    event_tx: mpsc::Sender<EngineEvent>,
    work: WorkItem,
    permit: OwnedSemaphorePermit,
) {
    let pool = Pool::of(&work);
    let result = runner.run(&work).await;
    drop(permit);

    if let Err(e) = &result {
        tracing::warn!(work = %work, error = %e, "Work failed");
    }

    let _ = event_tx
        .send(EngineEvent::Finished {
            work_id: work.id,
            pool,
            succeeded: result.is_ok(),
        })
        .await;
}

#[async_trait]
impl WorkEngine for SlotEngine {
    async fn do_work(&self, work: WorkItem) -> WorkResult<()> {
        let pool = Pool::of(&work);
        let permit = match self.slots(pool).clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(WorkFailure::Rejected(format!("no free {} slot", pool)));
            }
            Err(TryAcquireError::Closed) => {
                return Err(WorkFailure::Rejected("engine is shut down".to_string()));
            }
        };

        self.spawn(work, permit);
        Ok(())
    }

    async fn start_work(&self, work: WorkItem) -> WorkResult<u64> {
        let started = Instant::now();
        let slots = self.slots(Pool::of(&work)).clone();

        let permit = match tokio::time::timeout(self.start_timeout, slots.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(WorkFailure::Rejected("engine is shut down".to_string())),
            Err(_) => {
                return Err(WorkFailure::StartTimedOut(self.start_timeout.as_millis() as u64));
            }
        };

        self.spawn(work, permit);
        Ok(started.elapsed().as_millis() as u64)
    }

    async fn schedule_work(&self, work: WorkItem) -> WorkResult<()> {
        let slots = self.slots(Pool::of(&work)).clone();
        if slots.is_closed() {
            return Err(WorkFailure::Rejected("engine is shut down".to_string()));
        }

        let runner = self.runner.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let Ok(permit) = slots.acquire_owned().await else {
                tracing::warn!(work = %work, "Engine shut down before scheduled work started");
                return;
            };
            execute(runner, event_tx, work, permit).await;
        });

        Ok(())
    }

    fn free(&self, pool: Pool) -> u64 {
        self.slots(pool).available_permits() as u64
    }
}
