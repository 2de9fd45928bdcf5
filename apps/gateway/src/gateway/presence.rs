//! Per-identity client counting for theater rooms.
//!
//! Membership in a theater is per **user**, not per session. A user shows up
//! as a member on their first client and drops out only when the last one
//! leaves. Guests are never counted.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use marquee_protocol::pb::User;

struct Viewer {
    user: User,
    /// Number of this user's sessions attached to the room.
    session_count: usize,
}

/// Thread-safe, DashMap-backed viewer registry.
#[derive(Default)]
pub struct ViewerRegistry {
    inner: DashMap<String, Viewer>,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more session for `user`. Returns `true` when this is the
    /// user's first session, i.e. the user just became a member.
    pub fn add(&self, user: &User) -> bool {
        let mut entry = self.inner.entry(user.id.clone()).or_insert_with(|| Viewer {
            user: user.clone(),
            session_count: 0,
        });
        entry.session_count += 1;
        entry.session_count == 1
    }

    /// Count one session fewer for `user_id`. Returns `true` when that was
    /// the user's last session. Decrement and eviction happen under one shard
    /// lock, so a concurrent `add` either lands before and keeps the entry or
    /// lands after and starts a fresh one.
    pub fn remove(&self, user_id: &str) -> bool {
        match self.inner.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let viewer = entry.get_mut();
                viewer.session_count = viewer.session_count.saturating_sub(1);
                if viewer.session_count == 0 {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Current members, in no particular order.
    pub fn members(&self) -> Vec<User> {
        self.inner.iter().map(|entry| entry.user.clone()).collect()
    }

    pub fn session_count(&self, user_id: &str) -> usize {
        self.inner.get(user_id).map(|v| v.session_count).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
