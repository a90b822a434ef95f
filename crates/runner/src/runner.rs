//! Main runner implementation driving one coordinator

use crate::error::{Result, RunnerError};
use std::time::{Duration, Instant};
use tmx_coordinator::{Coordinator, Handled};
use tmx_journal::Journal;
use tmx_transport::{Message, Transport};
use tokio::sync::mpsc;

/// Owns a coordinator and its inbound queue
pub struct Runner<T: Transport, J: Journal> {
    coordinator: Coordinator<T, J>,
    inbound: mpsc::Receiver<Message>,
}

impl<T: Transport, J: Journal> Runner<T, J> {
    pub fn new(coordinator: Coordinator<T, J>, inbound: mpsc::Receiver<Message>) -> Self {
        Self {
            coordinator,
            inbound,
        }
    }

    pub fn coordinator(&self) -> &Coordinator<T, J> {
        &self.coordinator
    }

    /// Recover outstanding decisions, then serve the inbound queue until a
    /// shutdown message arrives.
    ///
    /// Messages are taken in batches of at most `batch_size`. After every
    /// batch, and whenever the queue stays quiet for a poll interval while
    /// work is deferred, expired participants are failed, the log is
    /// flushed and deferred requests are retried.
    pub async fn run(mut self) -> Result<()> {
        let recovered = self.coordinator.recover()?;
        tracing::info!(
            "coordinator {} running, {} transactions recovered",
            self.coordinator.identity(),
            recovered
        );
        self.housekeeping()?;

        loop {
            let message = match self.wait(Instant::now()) {
                None => self.inbound.recv().await,
                Some(wait) => match tokio::time::timeout(wait, self.inbound.recv()).await {
                    Ok(message) => message,
                    Err(_) => {
                        self.housekeeping()?;
                        continue;
                    }
                },
            };

            let Some(message) = message else {
                tracing::warn!("inbound queue closed without shutdown");
                self.coordinator.flush()?;
                return Err(RunnerError::InboundClosed);
            };

            if self.batch(message)? == Handled::Shutdown {
                self.coordinator.flush()?;
                tracing::info!("coordinator {} shut down", self.coordinator.identity());
                return Ok(());
            }

            self.housekeeping()?;
        }
    }

    /// Handle `first` and whatever else is queued, up to a batch
    fn batch(&mut self, first: Message) -> Result<Handled> {
        let limit = self.coordinator.config().batch_size.max(1);
        let mut handled = 1;

        if self.coordinator.handle_message(&first)? == Handled::Shutdown {
            return Ok(Handled::Shutdown);
        }

        while handled < limit {
            let Ok(message) = self.inbound.try_recv() else {
                break;
            };
            handled += 1;
            if self.coordinator.handle_message(&message)? == Handled::Shutdown {
                return Ok(Handled::Shutdown);
            }
        }

        tracing::trace!("handled a batch of {} messages", handled);
        Ok(Handled::Processed)
    }

    fn housekeeping(&mut self) -> Result<()> {
        let now = Instant::now();
        self.coordinator.tick(now)?;
        self.coordinator.flush_at(now)?;
        self.coordinator.drain_at(now)?;
        Ok(())
    }

    /// How long to block on the inbound queue. `None` blocks until the next
    /// message since nothing else can make progress.
    fn wait(&self, now: Instant) -> Option<Duration> {
        let deadline = self
            .coordinator
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        let poll = self
            .coordinator
            .outstanding()
            .then(|| self.coordinator.config().poll_interval);

        match (deadline, poll) {
            (Some(deadline), Some(poll)) => Some(deadline.min(poll)),
            (deadline, poll) => deadline.or(poll),
        }
    }
}
