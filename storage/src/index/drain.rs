use super::{disk::Shared, metrics::Metrics, Error};
use crate::{handoff, locator::Locator};
use futures::channel::oneshot;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{io::AsyncWriteExt, sync::mpsc, time::sleep};
use tracing::{debug, error, info, trace};

/// Token delivered to the drain loop.
pub(super) enum Wake {
    /// Drain and flush whatever is buffered.
    Signal,
    /// Drain, flush and sync, then report the outcome.
    Sync(oneshot::Sender<Result<(), Error>>),
}

/// Sole consumer of the handoff buffer for one open index.
///
/// The loop waits for a wake (or for `interval` to pass), drains every committed locator into the
/// write buffer and flushes it. Any fault wedges the loop: the fault is recorded, the file is left
/// open, and the loop exits. When the wake channel closes, the loop performs a final drain, flush,
/// and sync, closes the file, and exits.
pub(super) struct Drainer {
    pub path: PathBuf,
    pub consumer: handoff::Consumer<Locator>,
    pub shared: Arc<Shared>,
    pub wake: mpsc::Receiver<Wake>,
    pub interval: Duration,
    pub metrics: Metrics,
}

impl Drainer {
    /// Run until shutdown (or a fault), reporting the outcome on `done` and handing the consumer
    /// back so the index can be reopened.
    pub async fn run(
        mut self,
        done: oneshot::Sender<Result<(), Error>>,
    ) -> handoff::Consumer<Locator> {
        debug!(path = ?self.path, "drain loop started");
        loop {
            let wake = tokio::select! {
                wake = self.wake.recv() => match wake {
                    Some(wake) => wake,
                    None => break,
                },
                _ = sleep(self.interval) => {
                    trace!(path = ?self.path, "wake interval elapsed");
                    Wake::Signal
                },
            };

            let (result, ack) = match wake {
                Wake::Signal => (self.drain().await, None),
                Wake::Sync(ack) => {
                    let result = match self.drain().await {
                        Ok(()) => self.sync().await,
                        Err(err) => Err(err),
                    };
                    (result, Some(ack))
                }
            };

            // Record the fault before anyone waiting on a sync can observe it
            let result = result.map_err(|err| self.shared.fault.set(err));
            if let Some(ack) = ack {
                let _ = ack.send(result.clone());
            }
            if let Err(err) = result {
                error!(path = ?self.path, ?err, "drain failed, index wedged");
                let _ = done.send(Err(err));
                return self.consumer;
            }
        }

        let result = self.shutdown().await;
        let _ = done.send(result);
        self.consumer
    }

    /// Move every committed locator into the write buffer, then flush it.
    async fn drain(&mut self) -> Result<(), Error> {
        self.shared.fault.check()?;
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::Closed)?;

        let mut drained = 0u64;
        while let Ok(locator) = self.consumer.reserve_read() {
            let locator = *locator;
            locator.write(writer).await?;
            self.consumer.commit_read();
            drained += 1;
        }
        writer.flush().await?;

        self.metrics.drained.inc_by(drained);
        self.metrics.flushes.inc();
        self.metrics.pending.set(self.consumer.occupancy() as i64);
        if drained > 0 {
            debug!(path = ?self.path, drained, "drained handoff buffer");
        }
        Ok(())
    }

    /// Force flushed data to stable storage.
    async fn sync(&mut self) -> Result<(), Error> {
        let writer = self.shared.writer.lock().await;
        let writer = writer.as_ref().ok_or(Error::Closed)?;
        writer.get_ref().sync_all().await?;
        self.metrics.syncs.inc();
        Ok(())
    }

    /// Final drain, flush, sync and close. Failures are logged and the first one is returned.
    async fn shutdown(&mut self) -> Result<(), Error> {
        let mut first = None;
        if let Err(err) = self.drain().await {
            error!(path = ?self.path, ?err, "final drain failed");
            first = Some(err);
        }

        let Some(writer) = self.shared.writer.lock().await.take() else {
            return Err(first.unwrap_or(Error::Closed));
        };
        match writer.get_ref().sync_all().await {
            Ok(()) => {
                self.metrics.syncs.inc();
            }
            Err(err) => {
                error!(path = ?self.path, ?err, "sync failed");
                first.get_or_insert(err.into());
            }
        }
        drop(writer);
        info!(path = ?self.path, "index closed");

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
