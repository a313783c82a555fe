//! Session manager: runs stored sessions by id and writes them back when
//! the run ends.

use crate::runtime::{EventStream, Runtime};
use crate::session::{Session, SharedSession};
use crate::store::SessionStore;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use troupe_core::{Error, ResumeElicitationRequest, Result};

/// Removes the session from the running set when dropped.
struct RunningGuard {
    running: Arc<DashMap<String, ()>>,
    id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

pub struct SessionManager {
    runtime: Runtime,
    store: Arc<dyn SessionStore>,
    running: Arc<DashMap<String, ()>>,
}

impl SessionManager {
    pub fn new(runtime: Runtime, store: Arc<dyn SessionStore>) -> Self {
        Self {
            runtime,
            store,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.running.contains_key(session_id)
    }

    pub async fn create_session(&self, session: Session) -> Result<String> {
        let id = session.id.clone();
        self.store.add(session).await?;
        Ok(id)
    }

    fn claim(&self, session_id: &str) -> Result<RunningGuard> {
        match self.running.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::SessionBusy(session_id.to_string())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(RunningGuard {
                    running: self.running.clone(),
                    id: session_id.to_string(),
                })
            }
        }
    }

    /// Run a stored session, optionally appending a user message first.
    pub async fn run_session(
        &self,
        session_id: &str,
        user_message: Option<String>,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let guard = self.claim(session_id)?;
        let mut session = self.store.get(session_id).await?;
        if let Some(content) = user_message {
            session.add_user_message(content);
        }
        let session = session.into_shared();
        let inner = self.runtime.run_stream(session.clone(), cancel).await?;
        Ok(self.forward(inner, session, guard))
    }

    /// Answer the elicitation a stored session is suspended on.
    pub async fn resume_elicitation(
        &self,
        session_id: &str,
        request: ResumeElicitationRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let guard = self.claim(session_id)?;
        let session = self.store.get(session_id).await?.into_shared();
        let inner = self.runtime.resume_stream(session.clone(), request, cancel).await?;
        Ok(self.forward(inner, session, guard))
    }

    /// Relay events, then persist the session before the caller's stream ends.
    fn forward(&self, mut inner: EventStream, session: SharedSession, guard: RunningGuard) -> EventStream {
        let (tx, rx) = mpsc::channel(self.runtime.config().event_buffer.max(1));
        let store = self.store.clone();
        tokio::spawn(async move {
            while let Some(event) = inner.next().await {
                // Keep draining if the caller went away so the run still finishes.
                let _ = tx.send(event).await;
            }
            let snapshot = session.read().await.clone();
            debug!("Persisting session {} ({} items)", snapshot.id, snapshot.items.len());
            if let Err(e) = store.update(snapshot).await {
                warn!("Failed to persist session: {}", e);
            }
            drop(guard);
        });
        ReceiverStream::new(rx)
    }
}
