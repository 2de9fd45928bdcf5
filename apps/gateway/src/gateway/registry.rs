//! Key-to-room registry, one per room kind.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// A room the hub can hold. A closed room has lost its last member and will
/// never accept another; the hub treats it as absent.
pub trait HubRoom: Send + Sync + 'static {
    fn is_closed(&self) -> bool;

    /// Cancelled once a closed room has finished its teardown. No successor
    /// is built for the key before that.
    fn retirement(&self) -> &CancellationToken;
}

/// Concurrency-safe room registry.
///
/// Each key maps to a cell that is initialized at most once, so joiners racing
/// on an absent key all wait on the same initialization and receive the same
/// room.
pub struct RoomHub<R> {
    rooms: DashMap<String, Arc<OnceCell<Arc<R>>>>,
}

impl<R: HubRoom> Default for RoomHub<R> {
    fn default() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }
}

impl<R: HubRoom> RoomHub<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live room for `key`, running `init` to build it if absent.
    ///
    /// A failed `init` leaves nothing behind, so the next caller retries.
    /// A closed room still registered under `key` is replaced once it has
    /// retired, so its teardown side effects land before the successor's
    /// setup.
    pub async fn get_or_create<F, Fut, E>(&self, key: &str, mut init: F) -> Result<Arc<R>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Arc<R>, E>>,
    {
        loop {
            let cell = self.rooms.entry(key.to_string()).or_default().clone();

            let room = match cell.get_or_try_init(&mut init).await {
                Ok(room) => room.clone(),
                Err(err) => {
                    self.rooms
                        .remove_if(key, |_, c| Arc::ptr_eq(c, &cell) && !c.initialized());
                    return Err(err);
                }
            };

            if !room.is_closed() {
                return Ok(room);
            }

            tracing::debug!(%key, "waiting for closed room to retire");
            room.retirement().cancelled().await;
            self.rooms.remove_if(key, |_, c| Arc::ptr_eq(c, &cell));
        }
    }

    /// Live room for `key`, if this process hosts one.
    pub fn find(&self, key: &str) -> Option<Arc<R>> {
        self.rooms
            .get(key)
            .and_then(|cell| cell.get().cloned())
            .filter(|room| !room.is_closed())
    }

    /// Evict `room` from `key`. A different room registered under the same key
    /// in the meantime is left alone.
    pub fn remove(&self, key: &str, room: &Arc<R>) -> bool {
        self.rooms
            .remove_if(key, |_, cell| cell.get().is_some_and(|r| Arc::ptr_eq(r, room)))
            .is_some()
    }

    /// Number of keys currently registered, including rooms still initializing.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
