//! SockJS sessions: the state machine gluing stateless HTTP polls to a
//! single logical duplex endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::endpoint::{Conn, Endpoint, Payload};
use crate::error::Error;

/// Sessions of one SockJS route, keyed by session id.
#[derive(Default)]
pub(crate) struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub(crate) fn new() -> SessionStore {
        SessionStore::default()
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    pub(crate) fn insert(&self, id: String, session: Arc<Session>) {
        self.lock().insert(id, session);
    }

    pub(crate) fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Queue and lifecycle flags of a session. Held behind a sync mutex
/// with short critical sections; never lock across an await.
pub(crate) struct SessionState {
    pub(crate) pending_inbound: VecDeque<String>,
    pub(crate) outbound: VecDeque<String>,
    /// Cleared by the first session-initiating poll, which emits `o`.
    pub(crate) is_new: bool,
    /// A transport currently holds the outbound stream.
    pub(crate) attached: bool,
    /// The endpoint asked to close; next poll delivers `c[3000,...]`.
    pub(crate) closed: bool,
    /// Torn down server-side; polls must see `c[1002,...]`.
    pub(crate) terminated: bool,
    close_delivered: bool,
}

pub(crate) struct Session {
    id: String,
    state: Mutex<SessionState>,
    // the endpoint serializes deliveries; `on_message` may suspend
    endpoint: AsyncMutex<Box<dyn Endpoint>>,
    waiter: Notify,
}

impl Session {
    pub(crate) fn new(id: String, endpoint: Box<dyn Endpoint>) -> Arc<Session> {
        Arc::new(Session {
            id,
            state: Mutex::new(SessionState {
                pending_inbound: VecDeque::new(),
                outbound: VecDeque::new(),
                is_new: true,
                attached: false,
                closed: false,
                terminated: false,
                close_delivered: false,
            }),
            endpoint: AsyncMutex::new(endpoint),
            waiter: Notify::new(),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake whatever poll is parked on the waiter, if any. A permit is
    /// stored so a send racing ahead of the park is not lost.
    pub(crate) fn notify(&self) {
        self.waiter.notify_one();
    }

    /// Park until outbound data is available or the session changes
    /// state. Cancellation-safe: an abandoned poll leaves no residue.
    pub(crate) async fn wait(&self) {
        self.waiter.notified().await;
    }

    /// Queue an outbound message and wake the attached poll.
    pub(crate) fn push_outbound(&self, msg: String) {
        self.state().outbound.push_back(msg);
        self.notify();
    }

    /// The endpoint asked to close the session.
    pub(crate) fn close(&self) {
        self.state().closed = true;
        self.notify();
    }

    pub(crate) fn drain_outbound(&self) -> Vec<String> {
        self.state().outbound.drain(..).collect()
    }

    pub(crate) fn push_inbound(&self, msgs: Vec<String>) {
        self.state().pending_inbound.extend(msgs);
    }

    /// Deliver queued inbound messages to the endpoint, in order, one
    /// at a time.
    pub(crate) async fn consume(&self, conn: &Conn) {
        loop {
            let msg = match self.state().pending_inbound.pop_front() {
                Some(msg) => msg,
                None => return,
            };
            self.endpoint
                .lock()
                .await
                .on_message(conn, Payload::Text(msg))
                .await;
        }
    }

    pub(crate) async fn connect(&self, conn: &Conn) {
        self.endpoint.lock().await.on_connect(conn).await;
    }

    /// Run `on_close` exactly once, no matter how many polls observe
    /// the session's end.
    pub(crate) async fn deliver_close(&self, err: Option<&Error>) {
        {
            let mut state = self.state();
            if state.close_delivered {
                return;
            }
            state.close_delivered = true;
        }
        self.endpoint.lock().await.on_close(err).await;
    }
}

/// Clears the `attached` flag when the poll holding the outbound
/// stream ends, including when its connection task is cancelled.
pub(crate) struct AttachGuard {
    session: Arc<Session>,
}

impl AttachGuard {
    pub(crate) fn new(session: Arc<Session>) -> AttachGuard {
        AttachGuard { session }
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.session.state().attached = false;
    }
}
