//! Concurrent fetch of an image graph into the content store.
//!
//! Starting from a root descriptor, each blob is fetched (unless already
//! present) and, if it is a manifest or index, parsed for the blobs it
//! references. Every digest is fetched at most once per dispatch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use cage_core::descriptor::Descriptor;
use cage_core::error::{CageError, Result};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;

use super::image::children;
use super::registry::Fetcher;
use crate::content::ContentStore;

/// Walks an image graph and fills the content store.
pub struct Dispatcher {
    store: ContentStore,
    fetcher: Arc<dyn Fetcher>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(store: ContentStore, fetcher: Arc<dyn Fetcher>, concurrency: usize) -> Self {
        Self {
            store,
            fetcher,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetch `root` and everything reachable from it.
    ///
    /// The first failure aborts the remaining fetches. Blobs committed
    /// before the failure stay in the store.
    pub async fn dispatch(&self, root: &Descriptor, cancel: &CancellationToken) -> Result<()> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending: VecDeque<Descriptor> = VecDeque::new();
        let mut tasks: JoinSet<Result<Vec<Descriptor>>> = JoinSet::new();
        let mut in_flight: HashMap<Id, String> = HashMap::new();

        seen.insert(root.digest.clone());
        pending.push_back(root.clone());

        loop {
            while tasks.len() < self.concurrency {
                let Some(desc) = pending.pop_front() else {
                    break;
                };
                let digest = desc.digest.clone();
                let handle = tasks.spawn(fetch_one(self.store.clone(), self.fetcher.clone(), desc));
                in_flight.insert(handle.id(), digest);
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(CageError::Cancelled);
                }
                joined = tasks.join_next_with_id() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let found = match joined {
                Ok((id, found)) => {
                    in_flight.remove(&id);
                    found?
                }
                Err(e) => {
                    return Err(CageError::FetchError {
                        digest: in_flight.remove(&e.id()).unwrap_or_default(),
                        message: format!("fetch task failed: {}", e),
                    })
                }
            };
            for child in found {
                if seen.insert(child.digest.clone()) {
                    pending.push_back(child);
                }
            }
        }

        tracing::debug!(root = %root.digest, blobs = seen.len(), "Dispatch complete");
        Ok(())
    }
}

async fn fetch_one(
    store: ContentStore,
    fetcher: Arc<dyn Fetcher>,
    desc: Descriptor,
) -> Result<Vec<Descriptor>> {
    if store.contains(&desc.digest) {
        tracing::debug!(digest = %desc.digest, "Blob already present");
    } else {
        let mut writer = store.writer(&desc).await?;
        fetcher.fetch(&desc, &mut writer).await?;
        let bytes = writer.written();
        writer.commit().await?;
        tracing::debug!(digest = %desc.digest, bytes, "Fetched blob");
    }

    if desc.is_manifest() || desc.is_index() {
        let data = store.read_blob(&desc).await?;
        return children(&desc, &data);
    }
    Ok(Vec::new())
}
