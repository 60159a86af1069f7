// Registry of live sessions. Broadcast walks a snapshot of the set;
// individual write failures are swallowed because the failing session's
// own read loop surfaces the error separately.
use dashmap::DashMap;
use quiver_wire::Message;
use std::sync::Arc;

use crate::session::Session;

#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<u64, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
        metrics::gauge!("quiver_active_sessions").set(self.sessions.len() as f64);
    }

    pub fn remove(&self, session_id: u64) {
        self.sessions.remove(&session_id);
        metrics::gauge!("quiver_active_sessions").set(self.sessions.len() as f64);
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<Session>> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn broadcast(&self, message: Message) {
        let snapshot: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in snapshot {
            if let Err(err) = session.write(message.clone()).await {
                tracing::debug!(session = session.id(), error = %err, "broadcast write skipped");
            }
        }
    }

    /// Cancel every live session. Used by broker shutdown.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().close();
        }
    }
}
