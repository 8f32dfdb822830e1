use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bson::{doc, Document};
use tokio::sync::Mutex;

/// A server session as defined by the sessions specification: an id the server uses to
/// associate operations, a monotonically increasing transaction number, and bookkeeping for
/// pooling.
#[derive(Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session, a document of the form `{ id: <uuid> }`.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// The transaction number allocator for this session. Incremented when a retryable
    /// write or transaction starts; the same number is reused on retry.
    pub(crate) txn_number: i64,

    /// Whether a network error was seen while using this session. Dirty sessions are
    /// discarded rather than returned to the pool, since their state on the server is
    /// unknown.
    pub(crate) dirty: bool,
}

impl ServerSession {
    pub(crate) fn new() -> Self {
        Self {
            id: doc! { "id": bson::Uuid::from_bytes(uuid::Uuid::new_v4().into_bytes()) },
            last_use: Instant::now(),
            txn_number: 0,
            dirty: false,
        }
    }

    pub(crate) fn update_last_use(&mut self) {
        self.last_use = Instant::now();
    }

    /// Whether the session will expire within one minute, making it unsafe to reuse.
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        match logical_session_timeout {
            Some(timeout) => {
                let expiry_buffer = Duration::from_secs(60);
                timeout
                    .checked_sub(expiry_buffer)
                    .map_or(true, |usable| self.last_use.elapsed() > usable)
            }
            None => false,
        }
    }
}

/// A pool of server sessions, reused across operations to keep the number of sessions the
/// server must track low.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Checks out a server session, discarding pooled sessions that are about to expire.
    /// A fresh session is created when none are reusable.
    pub(crate) async fn check_out(
        &self,
        logical_session_timeout: Option<Duration>,
    ) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if !session.is_about_to_expire(logical_session_timeout) {
                return session;
            }
        }
        ServerSession::new()
    }

    /// Returns a session to the pool. Dirty or expiring sessions are discarded, as are all
    /// pooled sessions that have aged out behind them.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;
        while let Some(pooled) = pool.back() {
            if pooled.is_about_to_expire(logical_session_timeout) {
                pool.pop_back();
            } else {
                break;
            }
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    #[cfg(test)]
    pub(crate) async fn clear(&self) {
        self.pool.lock().await.clear();
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &Document) -> bool {
        self.pool.lock().await.iter().any(|session| &session.id == id)
    }
}
