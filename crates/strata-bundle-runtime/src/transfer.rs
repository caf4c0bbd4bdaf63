use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use strata_content_store::{BundleStore, BundleVersion, ContentAsyncRead};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::{BundleName, Device, Error, OperationId, Result};

const CHUNK_SIZE: usize = 64 * 1024;

/// The polled bridge over one host-driven fetch.
///
/// The actual I/O runs as a task on the host runtime; the single-threaded
/// core polls for the terminal result and reads fractional progress from a
/// shared counter. Nothing in the core ever blocks on the task.
pub(crate) struct Transfer {
    progress: Arc<AtomicU32>,
    result_rx: crossbeam_channel::Receiver<Result<Vec<u8>>>,
    task: tokio::task::JoinHandle<()>,
    outcome: Option<Result<Vec<u8>>>,
}

impl Transfer {
    /// Start pulling a bundle payload from the store.
    pub fn spawn_pull(
        io: &tokio::runtime::Handle,
        store: Arc<dyn BundleStore>,
        name: BundleName,
        version: BundleVersion,
    ) -> Self {
        Self::spawn(io, move |progress| async move {
            debug!("pulling bundle `{name}` at {version:?}");
            let (reader, size) = store.pull(name.as_str(), &version).await?;
            read_to_end(reader, size, &progress).await
        })
    }

    /// Start resolving a payload from a mounted device namespace.
    pub fn spawn_device(
        io: &tokio::runtime::Handle,
        device: Arc<dyn Device>,
        path: String,
        id: OperationId,
    ) -> Self {
        Self::spawn(io, move |progress| async move {
            let result = device
                .load(&path)
                .await
                .ok_or(Error::AssetNotFound(id));
            progress.store(1.0f32.to_bits(), Ordering::Relaxed);
            result
        })
    }

    fn spawn<F, Fut>(io: &tokio::runtime::Handle, work: F) -> Self
    where
        F: FnOnce(Arc<AtomicU32>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let progress = Arc::new(AtomicU32::new(0));
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        let task_progress = Arc::clone(&progress);
        let task = io.spawn(async move {
            let result = work(task_progress).await;
            let _ = result_tx.send(result);
        });

        Self {
            progress,
            result_rx,
            task,
            outcome: None,
        }
    }

    /// Whether the transfer has reached a terminal state.
    pub fn poll(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match self.result_rx.try_recv() {
            Ok(result) => {
                self.outcome = Some(result);
                true
            }
            Err(crossbeam_channel::TryRecvError::Empty) => false,
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                self.outcome = Some(Err(Error::TransferInterrupted));
                true
            }
        }
    }

    /// Fractional completion of the transfer, in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }

    /// Take the terminal result. Only valid after `poll` returned `true`.
    pub fn take_outcome(&mut self) -> Result<Vec<u8>> {
        self.outcome.take().unwrap_or(Err(Error::TransferInterrupted))
    }

    /// Abort the in-flight task. The transfer delivers no result afterwards.
    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn read_to_end(
    mut reader: ContentAsyncRead,
    size: Option<u64>,
    progress: &AtomicU32,
) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(size.unwrap_or(0) as usize);
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let read = reader
            .read(&mut chunk)
            .await
            .map_err(strata_content_store::Error::from)?;
        if read == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..read]);

        if let Some(total) = size {
            if total > 0 {
                let fraction = (data.len() as f32 / total as f32).min(1.0);
                progress.store(fraction.to_bits(), Ordering::Relaxed);
            }
        }
    }

    progress.store(1.0f32.to_bits(), Ordering::Relaxed);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use strata_content_store::{CachedStore, MemoryContentCache, MemoryContentSource};

    use super::*;
    use crate::AssetType;

    async fn settle(transfer: &mut Transfer) -> Result<Vec<u8>> {
        let mut timeout = std::time::Duration::from_millis(500);
        while timeout > std::time::Duration::ZERO && !transfer.poll() {
            let step = std::time::Duration::from_millis(5);
            tokio::time::sleep(step).await;
            timeout -= step;
        }
        assert!(transfer.poll(), "transfer did not settle in time");
        transfer.take_outcome()
    }

    #[tokio::test]
    async fn pull_transfer_delivers_the_payload() {
        let source = MemoryContentSource::new();
        source.publish("level1", b"payload".to_vec());
        let store: Arc<dyn BundleStore> =
            Arc::new(CachedStore::new(source, MemoryContentCache::new()));

        let mut transfer = Transfer::spawn_pull(
            &tokio::runtime::Handle::current(),
            store,
            BundleName::new("level1"),
            BundleVersion::ForceDownload,
        );

        assert_eq!(settle(&mut transfer).await.unwrap(), b"payload");
        assert_eq!(transfer.progress(), 1.0);
    }

    #[tokio::test]
    async fn failed_pull_surfaces_the_transport_error() {
        let store: Arc<dyn BundleStore> = Arc::new(CachedStore::new(
            MemoryContentSource::new(),
            MemoryContentCache::new(),
        ));

        let mut transfer = Transfer::spawn_pull(
            &tokio::runtime::Handle::current(),
            store,
            BundleName::new("absent"),
            BundleVersion::ForceDownload,
        );

        assert!(matches!(
            settle(&mut transfer).await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn aborted_transfer_delivers_nothing() {
        let store: Arc<dyn BundleStore> = Arc::new(CachedStore::new(
            MemoryContentSource::new(),
            MemoryContentCache::new(),
        ));

        let mut transfer = Transfer::spawn_pull(
            &tokio::runtime::Handle::current(),
            store,
            BundleName::new("absent"),
            BundleVersion::ForceDownload,
        );
        transfer.abort();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        if transfer.poll() {
            assert!(matches!(
                transfer.take_outcome(),
                Err(Error::TransferInterrupted) | Err(Error::Transport(_))
            ));
        }
    }

    #[tokio::test]
    async fn device_transfer_resolves_and_misses() {
        let device = Arc::new(crate::MemoryDevice::new());
        device.insert("strings/en", b"hello".to_vec());
        let id = OperationId::resource("strings/en", &AssetType::new("Text"));

        let mut transfer = Transfer::spawn_device(
            &tokio::runtime::Handle::current(),
            device.clone() as Arc<dyn Device>,
            "strings/en".to_string(),
            id.clone(),
        );
        assert_eq!(settle(&mut transfer).await.unwrap(), b"hello");

        let mut missing = Transfer::spawn_device(
            &tokio::runtime::Handle::current(),
            device as Arc<dyn Device>,
            "strings/fr".to_string(),
            id,
        );
        assert!(matches!(
            settle(&mut missing).await,
            Err(Error::AssetNotFound(_))
        ));
    }
}
