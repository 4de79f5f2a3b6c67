//! Background thread that appends programs to the disk cache.

use std::io;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::host_storage::DiskCacheHostStorage;
use super::PersistRequest;

enum WriterMessage {
    Add(Box<PersistRequest>),
    Flush(mpsc::SyncSender<()>),
}

/// Owns the cache storage once loading is done. Requests are written in the
/// order they were sent; dropping the writer finishes the backlog.
pub struct BackgroundDiskCacheWriter {
    sender: Option<Sender<WriterMessage>>,
    handle: Option<JoinHandle<Option<DiskCacheHostStorage>>>,
}

impl BackgroundDiskCacheWriter {
    /// Starts the writer thread. If the thread cannot be started the storage
    /// is handed back with the error.
    pub fn spawn(
        storage: DiskCacheHostStorage,
    ) -> Result<Self, (io::Error, DiskCacheHostStorage)> {
        let builder = thread::Builder::new().name("shader-cache-writer".to_owned());
        Self::spawn_with(builder, storage)
    }

    fn spawn_with(
        builder: thread::Builder,
        storage: DiskCacheHostStorage,
    ) -> Result<Self, (io::Error, DiskCacheHostStorage)> {
        // The storage only moves to the thread once it is running.
        let (handoff, storage_rx) = mpsc::sync_channel::<DiskCacheHostStorage>(1);
        let (sender, receiver) = mpsc::channel::<WriterMessage>();
        let spawned = builder.spawn(move || {
            let mut storage = storage_rx.recv().ok()?;
            for message in receiver {
                match message {
                    WriterMessage::Add(request) => {
                        if let Err(err) = storage.add_program(&request) {
                            warn!(error = %err, "failed to write shader program to disk cache");
                        }
                    }
                    WriterMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("shader cache writer stopped");
            Some(storage)
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => return Err((err, storage)),
        };
        if let Err(mpsc::SendError(storage)) = handoff.send(storage) {
            let _ = handle.join();
            return Err((io::Error::other("shader cache writer exited early"), storage));
        }
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    pub fn add_shader(&self, request: PersistRequest) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(WriterMessage::Add(Box::new(request))).is_err() {
            warn!("shader cache writer is gone, dropping program");
        }
    }

    /// Blocks until every request sent so far has been written.
    pub fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (done, wait) = mpsc::sync_channel(1);
        if sender.send(WriterMessage::Flush(done)).is_ok() {
            let _ = wait.recv();
        }
    }

    /// Stops the thread after the backlog and hands the storage back.
    pub fn finish(mut self) -> Option<DiskCacheHostStorage> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<DiskCacheHostStorage> {
        drop(self.sender.take());
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(storage) => storage,
            Err(_) => {
                warn!("shader cache writer panicked");
                None
            }
        }
    }
}

impl Drop for BackgroundDiskCacheWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
