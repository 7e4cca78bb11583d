use super::{
    drain::{Drainer, Wake},
    fault::Fault,
    metrics::Metrics,
    preallocate::preallocate,
    scan::scan,
    Config, Error,
};
use crate::{handoff, locator::Locator};
use futures::channel::oneshot;
use prometheus_client::registry::Registry;
use std::{
    future::Future,
    io::SeekFrom,
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt, BufWriter},
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

/// State shared between the [Index] front door and its drain loop.
pub(super) struct Shared {
    /// Write buffer over the open file. `None` once the drain loop has closed it.
    pub writer: Mutex<Option<BufWriter<File>>>,
    pub fault: Fault,
}

/// Handles that only exist while the drain loop is accepting wakes.
struct Open {
    wake: mpsc::Sender<Wake>,
    done: oneshot::Receiver<Result<(), Error>>,
}

/// The drain loop, or the consumer it handed back once it stopped.
enum Drain {
    Running(JoinHandle<handoff::Consumer<Locator>>),
    Stopped(handoff::Consumer<Locator>),
}

/// Future resolved once a closed [Index] has drained, flushed, synced and closed its file.
///
/// Dropping it does not affect shutdown, which always runs to completion in the background.
pub struct Closed(oneshot::Receiver<Result<(), Error>>);

impl Future for Closed {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::DrainFailed)))
    }
}

/// Append-only index of needle locators, persisted asynchronously.
pub struct Index {
    cfg: Config,
    producer: handoff::Producer<Locator>,
    shared: Arc<Shared>,
    metrics: Metrics,
    last_wake: Instant,

    open: Option<Open>,
    drain: Option<Drain>,
}

impl Index {
    /// Open (or create) the index file described by `cfg` and start its drain loop.
    ///
    /// A newly created (empty) file has `cfg.preallocate` bytes of disk reserved for it. The
    /// append cursor starts at the end of the file; call [Index::recover] to replay existing
    /// records and discard any partial tail.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn init(cfg: Config) -> Result<Self, Error> {
        let file = Self::open_file(&cfg.path).await?;
        let len = file.metadata().await?.len();
        if len == 0 {
            preallocate(&file, cfg.preallocate)?;
            debug!(path = ?cfg.path, bytes = cfg.preallocate, "preallocated index");
        }
        info!(path = ?cfg.path, len, "opened index");

        let (producer, consumer) = handoff::channel(cfg.capacity);
        let shared = Arc::new(Shared {
            writer: Mutex::new(Some(Self::writer(&cfg, file))),
            fault: Fault::default(),
        });
        let mut index = Self {
            cfg,
            producer,
            shared,
            metrics: Metrics::default(),
            last_wake: Instant::now(),
            open: None,
            drain: None,
        };
        index.start(consumer);
        Ok(index)
    }

    /// Reopen an index previously shut down with [Index::close].
    ///
    /// Waits for the previous drain loop to finish before reopening the file. A fault recorded
    /// before the index was closed remains in effect.
    pub async fn reopen(&mut self) -> Result<(), Error> {
        if self.open.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let consumer = match self.drain.take() {
            Some(Drain::Running(handle)) => handle.await.map_err(|_| Error::DrainFailed)?,
            Some(Drain::Stopped(consumer)) => consumer,
            None => return Err(Error::DrainFailed),
        };

        let file = match Self::open_file(&self.cfg.path).await {
            Ok(file) => file,
            Err(err) => {
                self.drain = Some(Drain::Stopped(consumer));
                return Err(err);
            }
        };
        *self.shared.writer.lock().await = Some(Self::writer(&self.cfg, file));
        info!(path = ?self.cfg.path, "reopened index");

        self.start(consumer);
        Ok(())
    }

    /// Open the file read/write, creating it if missing, with the cursor at its end.
    async fn open_file(path: &Path) -> Result<File, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .inspect_err(|err| warn!(?path, ?err, "failed to open index"))?;
        file.seek(SeekFrom::End(0)).await?;
        Ok(file)
    }

    fn writer(cfg: &Config, file: File) -> BufWriter<File> {
        BufWriter::with_capacity(cfg.max_record_size as usize, file)
    }

    /// Spawn a drain loop owning `consumer`.
    fn start(&mut self, consumer: handoff::Consumer<Locator>) {
        let (wake, receiver) = mpsc::channel(1);
        let (done, completion) = oneshot::channel();
        let drainer = Drainer {
            path: self.cfg.path.clone(),
            consumer,
            shared: self.shared.clone(),
            wake: receiver,
            interval: self.cfg.wake_interval,
            metrics: self.metrics.clone(),
        };
        self.drain = Some(Drain::Running(tokio::spawn(drainer.run(done))));
        self.open = Some(Open {
            wake,
            done: completion,
        });
    }

    /// Register the index metrics with `registry`.
    pub fn register(&self, registry: &mut Registry) {
        self.metrics.register(registry);
    }

    /// Queue a locator for persistence.
    ///
    /// Never blocks and never allocates. When more than half of the handoff buffer is occupied,
    /// or when the wake interval has passed since the last wake, the drain loop is woken. Wakes
    /// coalesce: at most one is outstanding at any time.
    ///
    /// A full handoff buffer fails with [Error::BufferFull], which also becomes the sticky fault
    /// of this index. Once any fault is recorded every call fails with it.
    pub fn insert(&mut self, key: i64, offset: u32, size: i32) -> Result<(), Error> {
        self.shared.fault.check()?;
        let open = self.open.as_ref().ok_or(Error::Closed)?;

        let now = Instant::now();
        if self.producer.occupancy() > self.producer.capacity() / 2
            || now.duration_since(self.last_wake) > self.cfg.wake_interval
        {
            // A full channel already holds a pending wake, so this one can be dropped
            if open.wake.try_send(Wake::Signal).is_ok() {
                self.last_wake = now;
                self.metrics.wakes.inc();
            }
        }

        let slot = match self.producer.reserve_write() {
            Ok(slot) => slot,
            Err(_) => {
                let err = self.shared.fault.set(Error::BufferFull);
                warn!(path = ?self.cfg.path, ?err, "handoff buffer full");
                return Err(err);
            }
        };
        slot.key = key;
        slot.offset = offset;
        slot.size = size;
        self.producer.commit_write();

        self.metrics.inserted.inc();
        self.metrics.pending.set(self.producer.occupancy() as i64);
        Ok(())
    }

    /// Encode a locator straight into the write buffer, bypassing the handoff buffer.
    ///
    /// Intended for rebuilding an index before normal operation starts. Records written this way
    /// are not ordered with respect to locators still waiting in the handoff buffer, so inserts
    /// and direct writes must not be mixed on the same index.
    pub async fn direct_write(&self, key: i64, offset: u32, size: i32) -> Result<(), Error> {
        self.shared.fault.check()?;
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::Closed)?;
        let result = Locator::new(key, offset, size)
            .write(writer)
            .await
            .map_err(Error::from);
        self.shared.fault.observe(result)
    }

    /// Flush the write buffer to the file. This is not a durability barrier (see [Index::sync]).
    pub async fn flush(&self) -> Result<(), Error> {
        self.shared.fault.check()?;
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::Closed)?;
        let result = writer.flush().await.map_err(Error::from);
        if result.is_ok() {
            self.metrics.flushes.inc();
        }
        self.shared
            .fault
            .observe(result)
            .inspect_err(|err| warn!(path = ?self.cfg.path, ?err, "flush failed"))
    }

    /// Have the drain loop persist everything inserted so far: drain, flush and sync the file.
    ///
    /// Waits for a pending wake to be consumed if necessary.
    pub async fn sync(&self) -> Result<(), Error> {
        self.shared.fault.check()?;
        let open = self.open.as_ref().ok_or(Error::Closed)?;
        let (ack, result) = oneshot::channel();
        if open.wake.send(Wake::Sync(ack)).await.is_err() {
            // The drain loop has exited, which only happens after recording a fault
            return Err(self.shared.fault.get().unwrap_or(Error::DrainFailed));
        }
        result.await.unwrap_or(Err(Error::DrainFailed))
    }

    /// Replay every valid record of the index file into `callback`, then move the append
    /// cursor to the end of the last valid record.
    ///
    /// A partial trailing record is not replayed and will be overwritten by the next append.
    /// Returns the new append offset.
    ///
    /// If the scan fails (an invalid record, or an error returned by `callback`), the append
    /// cursor is restored to where it was before the call and the error is returned. Errors
    /// returned by `callback` never become the sticky fault of this index.
    pub async fn recover<F>(&self, mut callback: F) -> Result<u64, Error>
    where
        F: FnMut(Locator) -> Result<(), Error>,
    {
        self.shared.fault.check()?;
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::Closed)?;
        self.shared
            .fault
            .observe(writer.flush().await.map_err(Error::from))?;
        let file = writer.get_mut();
        let start = self
            .shared
            .fault
            .observe(file.stream_position().await.map_err(Error::from))?;

        let mut rejected = false;
        let result = scan(&mut *file, self.cfg.max_record_size, |locator| {
            callback(locator).inspect_err(|_| rejected = true)
        })
        .await;

        // Reading moved the cursor, so put it back before anything else is appended
        let offset = match &result {
            Ok(offset) => *offset,
            Err(_) => start,
        };
        self.shared
            .fault
            .observe(file.seek(SeekFrom::Start(offset)).await.map_err(Error::from))?;

        match result {
            Ok(offset) => {
                info!(path = ?self.cfg.path, offset, "recovered index");
                Ok(offset)
            }
            Err(err) if rejected => {
                warn!(path = ?self.cfg.path, ?err, "recovery rejected by callback");
                Err(err)
            }
            Err(err) => {
                warn!(path = ?self.cfg.path, ?err, "recovery failed");
                self.shared.fault.observe(Err(err))
            }
        }
    }

    /// Stop accepting inserts and shut the drain loop down.
    ///
    /// Returns immediately. The drain loop performs a final drain, flush and sync and closes the
    /// file in the background; await the returned [Closed] to wait for that to finish.
    ///
    /// If a fault has been recorded (including [Error::BufferFull] from [Index::insert]), the
    /// final drain is skipped: locators still waiting in the handoff buffer are never written and
    /// [Closed] resolves to that fault.
    pub fn close(&mut self) -> Result<Closed, Error> {
        let Open { wake, done } = self.open.take().ok_or(Error::Closed)?;
        drop(wake);
        debug!(path = ?self.cfg.path, "closing index");
        Ok(Closed(done))
    }

    /// Path of the index file.
    pub fn path(&self) -> &Path {
        &self.cfg.path
    }

    /// The sticky fault, if one has been recorded.
    pub fn fault(&self) -> Option<Error> {
        self.shared.fault.get()
    }

    /// Number of locators inserted but not yet drained.
    pub fn pending(&self) -> usize {
        self.producer.occupancy()
    }

    /// Returns true until [Index::close] is called (and again after [Index::reopen]).
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }
}
