//! Room capability shared by user and theater rooms.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use marquee_protocol::Packet;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::fanout::{published_by, Subscription};
use super::session::Session;
use super::theater_room::TheaterRoom;
use super::user_room::UserRoom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    User,
    Theater,
}

impl RoomKind {
    pub fn allows_guests(self) -> bool {
        matches!(self, Self::Theater)
    }
}

/// The room emptied out and shut down before the join landed.
#[derive(Debug, Error)]
#[error("room is closed")]
pub struct RoomClosed;

/// A room a session has joined.
#[derive(Clone)]
pub enum JoinedRoom {
    User(Arc<UserRoom>),
    Theater(Arc<TheaterRoom>),
}

impl JoinedRoom {
    pub fn kind(&self) -> RoomKind {
        match self {
            Self::User(_) => RoomKind::User,
            Self::Theater(_) => RoomKind::Theater,
        }
    }

    pub async fn join(&self, session: &Arc<Session>) -> Result<(), RoomClosed> {
        match self {
            Self::User(room) => room.join(session).await,
            Self::Theater(room) => room.join(session).await,
        }
    }

    pub async fn leave(&self, session: &Arc<Session>) {
        match self {
            Self::User(room) => room.leave(session).await,
            Self::Theater(room) => room.leave(session).await,
        }
    }

    /// Run the room's handling loop for `session` until the session ends.
    pub fn spawn_event_loop(
        &self,
        session: Arc<Session>,
        events: mpsc::Receiver<Packet>,
    ) -> JoinHandle<()> {
        match self {
            Self::User(room) => tokio::spawn(room.clone().handle_events(session, events)),
            Self::Theater(room) => tokio::spawn(room.clone().handle_events(session, events)),
        }
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        match self {
            Self::User(room) => room.sessions(),
            Self::Theater(room) => room.sessions(),
        }
    }
}

struct Lifecycle {
    closed: bool,
}

/// Holds the lifecycle lock while the caller reacts to a join.
pub struct Admission<'a> {
    /// This join took the room from zero members to one.
    pub first: bool,
    _guard: MutexGuard<'a, Lifecycle>,
}

/// Holds the lifecycle lock while the caller reacts to a leave.
pub struct Departure<'a> {
    pub was_member: bool,
    /// This leave emptied the room; it is now closed.
    pub last: bool,
    _guard: MutexGuard<'a, Lifecycle>,
}

/// Session membership shared by both room kinds.
///
/// Joins and leaves are serialized by an async lifecycle lock that callers
/// keep while they run the side effects of a transition, so a 0->1 and the
/// following 1->0 can never be observed out of order. Broadcasts only take
/// the short session-map lock.
pub struct Members {
    sessions: Mutex<HashMap<u64, Weak<Session>>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    closed: AtomicBool,
    retired: CancellationToken,
}

impl Default for Members {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(Lifecycle { closed: false }),
            closed: AtomicBool::new(false),
            retired: CancellationToken::new(),
        }
    }
}

impl Members {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn admit(&self, session: &Arc<Session>) -> Result<Admission<'_>, RoomClosed> {
        let guard = self.lifecycle.lock().await;
        if guard.closed {
            return Err(RoomClosed);
        }

        let mut sessions = self.sessions.lock();
        let inserted = sessions
            .insert(session.id(), Arc::downgrade(session))
            .is_none();
        let first = inserted && sessions.len() == 1;
        drop(sessions);

        Ok(Admission {
            first,
            _guard: guard,
        })
    }

    pub async fn depart(&self, session_id: u64) -> Departure<'_> {
        let mut guard = self.lifecycle.lock().await;

        let mut sessions = self.sessions.lock();
        let was_member = sessions.remove(&session_id).is_some();
        let last = was_member && sessions.is_empty();
        drop(sessions);

        if last {
            guard.closed = true;
            self.closed.store(true, Ordering::SeqCst);
        }

        Departure {
            was_member,
            last,
            _guard: guard,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark teardown of a closed room as finished. The hub builds a
    /// successor only after this.
    pub fn retire(&self) {
        self.retired.cancel();
    }

    pub fn retirement(&self) -> &CancellationToken {
        &self.retired
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Queue `frame` on every member except `except`. Returns how many
    /// sessions accepted it.
    pub fn broadcast(&self, frame: &Bytes, except: Option<u64>) -> usize {
        self.sessions()
            .into_iter()
            .filter(|s| Some(s.id()) != except)
            .filter(|s| s.send(frame.clone()))
            .count()
    }
}

/// Relay every payload on `subscription` to `session` verbatim until the
/// session ends. Frames this instance published were already delivered
/// locally and are skipped. Dropping the subscription on exit unsubscribes.
pub fn forward_subscription(session: Arc<Session>, mut subscription: Subscription) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = session.lifetime().cancelled() => break,
                payload = subscription.recv() => match payload {
                    Some(frame) => {
                        if !published_by(&frame, session.origin()) {
                            session.send(frame);
                        }
                    }
                    None => {
                        tracing::debug!(
                            session_id = session.id(),
                            channel = %subscription.channel(),
                            "subscription ended"
                        );
                        break;
                    }
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use marquee_common::InstanceId;

    fn session(id: u64, root: &CancellationToken) -> (Arc<Session>, mpsc::Receiver<Bytes>) {
        Session::new(id, RoomKind::User, InstanceId::from("gw_test"), root, 8, 8)
    }

    #[tokio::test]
    async fn first_and_last_are_reported_once() {
        let root = CancellationToken::new();
        let members = Members::new();
        let (a, _ra) = session(1, &root);
        let (b, _rb) = session(2, &root);

        assert!(members.admit(&a).await.unwrap().first);
        assert!(!members.admit(&b).await.unwrap().first);
        assert_eq!(members.len(), 2);

        let d = members.depart(1).await;
        assert!(d.was_member && !d.last);
        drop(d);

        let d = members.depart(2).await;
        assert!(d.was_member && d.last);
        drop(d);

        assert!(members.is_closed());
        assert!(matches!(members.admit(&a).await, Err(RoomClosed)));
        assert!(!members.retirement().is_cancelled());

        members.retire();
        assert!(members.retirement().is_cancelled());
    }

    #[tokio::test]
    async fn departing_a_stranger_changes_nothing() {
        let root = CancellationToken::new();
        let members = Members::new();
        let (a, _ra) = session(1, &root);
        drop(members.admit(&a).await.unwrap());

        let d = members.depart(99).await;
        assert!(!d.was_member && !d.last);
        drop(d);
        assert!(!members.is_closed());
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn readmitting_same_session_is_not_a_new_member() {
        let root = CancellationToken::new();
        let members = Members::new();
        let (a, _ra) = session(1, &root);

        assert!(members.admit(&a).await.unwrap().first);
        assert!(!members.admit(&a).await.unwrap().first);
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_member() {
        let root = CancellationToken::new();
        let members = Members::new();
        let (a, mut ra) = session(1, &root);
        let (b, mut rb) = session(2, &root);
        drop(members.admit(&a).await.unwrap());
        drop(members.admit(&b).await.unwrap());

        let delivered = members.broadcast(&Bytes::from_static(b"x"), Some(1));
        assert_eq!(delivered, 1);
        assert_eq!(rb.recv().await.unwrap(), Bytes::from_static(b"x"));
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_sessions_are_not_broadcast_to() {
        let root = CancellationToken::new();
        let members = Members::new();
        let (a, _ra) = session(1, &root);
        drop(members.admit(&a).await.unwrap());
        drop(a);

        assert!(members.sessions().is_empty());
        assert_eq!(members.broadcast(&Bytes::from_static(b"x"), None), 0);
    }
}
