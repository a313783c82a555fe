//! Session persistence

use crate::session::Session;
use dashmap::DashMap;
use troupe_core::{Error, Result};

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Session>;

    async fn add(&self, session: Session) -> Result<()>;

    /// Replace a stored session. Fails with `SessionNotFound` when absent.
    async fn update(&self, session: Session) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// All sessions, oldest first.
    async fn list(&self) -> Result<Vec<Session>>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &str) -> Result<Session> {
        self.sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    async fn add(&self, session: Session) -> Result<()> {
        if self.sessions.contains_key(&session.id) {
            return Err(Error::InvalidRequest(format!("session {} already exists", session.id)));
        }
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn update(&self, session: Session) -> Result<()> {
        match self.sessions.get_mut(&session.id) {
            Some(mut entry) => {
                *entry = session;
                Ok(())
            }
            None => Err(Error::SessionNotFound(session.id)),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }
}
