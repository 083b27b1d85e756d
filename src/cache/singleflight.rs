//! Single-flight deduplication of concurrent fetches.
//!
//! All callers that arrive while a fetch for the same key is outstanding
//! share that fetch's future: one upstream call is issued, and every caller
//! observes the identical success or failure. The map is process-local and
//! sheds entries as flights complete, so it stays bounded.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

type SharedFlight<T, E> = Shared<BoxFuture<'static, Result<Arc<T>, Arc<E>>>>;

pub struct Singleflight<T, E> {
    inflight: DashMap<String, SharedFlight<T, E>>,
}

impl<T, E> Default for Singleflight<T, E> {
    fn default() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }
}

impl<T, E> Singleflight<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flights currently outstanding.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Join the outstanding flight for `key`, or become its leader by
    /// running `fetch`. The leader removes the entry once the flight lands.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> Result<Arc<T>, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (flight, leader) = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let future = fetch();
                let flight = async move { future.await.map(Arc::new).map_err(Arc::new) }
                    .boxed()
                    .shared();
                entry.insert(flight.clone());
                (flight, true)
            }
        };

        let result = flight.await;
        if leader {
            self.inflight.remove(key);
        }
        result
    }
}
