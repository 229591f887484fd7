//! Session registry.
//!
//! Owns every console session between token acceptance and relay teardown.
//! All access goes through one `RwLock` over the map; the handshake path
//! inserts, WebSocket upgrades read and mutate, and relay teardown deletes.

use super::link::Link;
use console_core::{ConsoleError, ConsoleResult, SessionDescriptor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Lifecycle of a console session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Descriptor validated, no browser attached yet.
    Created,
    /// A browser asked for the WebSocket; the upstream tunnel is being dialed.
    Connecting,
    /// Both legs are open and the pump is running.
    Active,
    /// A leg failed or the entry was deleted.
    Closed,
}

/// A registered console session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub descriptor: SessionDescriptor,
    pub state: SessionState,
    pub created_at: Instant,
    /// Handle on the live connection pair, if a browser is attached.
    link: Option<Link>,
}

impl Session {
    pub fn new(id: String, descriptor: SessionDescriptor) -> Self {
        Self {
            id,
            descriptor,
            state: SessionState::Created,
            created_at: Instant::now(),
            link: None,
        }
    }
}

/// Concurrency-safe map of session id to [`Session`].
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    max_sessions: usize,
    next_link_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            next_link_id: AtomicU64::new(1),
        }
    }

    /// Register a validated descriptor under a freshly issued id.
    pub async fn create(&self, descriptor: SessionDescriptor) -> ConsoleResult<String> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            warn!(max = self.max_sessions, "session capacity reached");
            return Err(ConsoleError::Capacity(self.max_sessions));
        }

        let id = generate_session_id();
        info!(session_id = %id, host = %descriptor.client_host_address, "session created");
        sessions.insert(id.clone(), Session::new(id.clone(), descriptor));
        Ok(id)
    }

    /// Insert `session` under its own id, tearing down any session it replaces.
    #[cfg(test)]
    pub async fn insert(&self, session: Session) {
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.insert(session.id.clone(), session) {
            if let Some(link) = old.link {
                link.close();
            }
        }
    }

    /// Look up a session by id.
    pub async fn lookup(&self, id: &str) -> ConsoleResult<Session> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ConsoleError::Lookup(id.to_string()))
    }

    /// Current state of `id`; absent sessions are [`SessionState::Closed`].
    pub async fn state(&self, id: &str) -> SessionState {
        self.sessions
            .read()
            .await
            .get(id)
            .map_or(SessionState::Closed, |s| s.state)
    }

    /// Remove a session and tear down its live pair. Absent ids are a no-op.
    #[cfg(test)]
    pub async fn delete(&self, id: &str) {
        let removed = self.sessions.write().await.remove(id);
        if let Some(session) = removed {
            if let Some(link) = session.link {
                link.close();
            }
            info!(session_id = %id, "session removed");
        }
    }

    /// Start attaching a browser to `id`.
    ///
    /// Any previously live pair is torn down first. Returns the descriptor to
    /// dial and the new link the pump must run under.
    pub async fn begin_connect(&self, id: &str) -> ConsoleResult<(SessionDescriptor, Link)> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| ConsoleError::Lookup(id.to_string()))?;

        if let Some(previous) = session.link.take() {
            info!(session_id = %id, "closing previous connection");
            previous.close();
        }

        let link = Link::new(self.next_link_id.fetch_add(1, Ordering::Relaxed));
        session.link = Some(link.clone());
        session.state = SessionState::Connecting;
        Ok((session.descriptor.clone(), link))
    }

    /// Mark the session active if `link` is still its current link.
    pub async fn activate(&self, id: &str, link: &Link) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) if is_current(session, link) => {
                session.state = SessionState::Active;
                true
            }
            _ => false,
        }
    }

    /// Remove the session if `link` is still its current link.
    ///
    /// Both relay legs call this on exit, and a pump that was superseded by a
    /// newer browser connection must leave the newer entry alone. Safe to call
    /// any number of times.
    pub async fn release(&self, id: &str, link: &Link) -> bool {
        link.close();
        let mut sessions = self.sessions.write().await;
        match sessions.get(id) {
            Some(session) if is_current(session, link) => {
                sessions.remove(id);
                info!(session_id = %id, "session closed");
                true
            }
            _ => false,
        }
    }

    /// Drop sessions that were never connected and are older than `ttl`.
    pub async fn gc(&self, ttl: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let mut removed = Vec::new();

        sessions.retain(|_, session| {
            if session.state == SessionState::Created && session.created_at.elapsed() > ttl {
                removed.push(session.id.clone());
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            debug!(count = removed.len(), "GC removed unclaimed sessions");
        }
        removed
    }

    /// Number of registered sessions.
    #[cfg(test)]
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn is_current(session: &Session, link: &Link) -> bool {
    session.link.as_ref().map(Link::id) == Some(link.id())
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            client_host_address: "10.0.0.5".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_lookup_delete() {
        let registry = SessionRegistry::new(10);
        registry
            .insert(Session::new("abc".into(), descriptor()))
            .await;

        let found = registry.lookup("abc").await.unwrap();
        assert_eq!(found.descriptor, descriptor());
        assert_eq!(found.state, SessionState::Created);

        registry.delete("abc").await;
        assert!(matches!(
            registry.lookup("abc").await,
            Err(ConsoleError::Lookup(_))
        ));

        // Second delete is a no-op.
        registry.delete("abc").await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn create_issues_unique_random_ids() {
        let registry = SessionRegistry::new(10);
        let a = registry.create(descriptor()).await.unwrap();
        let b = registry.create(descriptor()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn create_respects_capacity() {
        let registry = SessionRegistry::new(1);
        registry.create(descriptor()).await.unwrap();
        assert!(matches!(
            registry.create(descriptor()).await,
            Err(ConsoleError::Capacity(1))
        ));
    }

    #[tokio::test]
    async fn connect_lifecycle() {
        let registry = SessionRegistry::new(10);
        let id = registry.create(descriptor()).await.unwrap();

        let (d, link) = registry.begin_connect(&id).await.unwrap();
        assert_eq!(d, descriptor());
        assert_eq!(registry.state(&id).await, SessionState::Connecting);

        assert!(registry.activate(&id, &link).await);
        assert_eq!(registry.state(&id).await, SessionState::Active);

        assert!(registry.release(&id, &link).await);
        assert!(link.is_closed());
        assert_eq!(registry.state(&id).await, SessionState::Closed);
        assert!(!registry.release(&id, &link).await);
    }

    #[tokio::test]
    async fn begin_connect_unknown_id() {
        let registry = SessionRegistry::new(10);
        assert!(matches!(
            registry.begin_connect("missing").await,
            Err(ConsoleError::Lookup(_))
        ));
    }

    #[tokio::test]
    async fn second_connect_supersedes_first() {
        let registry = SessionRegistry::new(10);
        let id = registry.create(descriptor()).await.unwrap();

        let (_, first) = registry.begin_connect(&id).await.unwrap();
        let (_, second) = registry.begin_connect(&id).await.unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());

        // The superseded pump can neither activate nor remove the entry.
        assert!(!registry.activate(&id, &first).await);
        assert!(!registry.release(&id, &first).await);
        assert!(registry.lookup(&id).await.is_ok());

        assert!(registry.activate(&id, &second).await);
    }

    #[tokio::test]
    async fn delete_closes_live_link() {
        let registry = SessionRegistry::new(10);
        let id = registry.create(descriptor()).await.unwrap();
        let (_, link) = registry.begin_connect(&id).await.unwrap();
        registry.delete(&id).await;
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn gc_only_removes_unclaimed_sessions() {
        let registry = SessionRegistry::new(10);
        let idle = registry.create(descriptor()).await.unwrap();
        let busy = registry.create(descriptor()).await.unwrap();
        registry.begin_connect(&busy).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = registry.gc(Duration::from_millis(10)).await;
        assert_eq!(removed, vec![idle.clone()]);
        assert!(registry.lookup(&idle).await.is_err());
        assert!(registry.lookup(&busy).await.is_ok());

        assert!(registry.gc(Duration::from_secs(3600)).await.is_empty());
    }
}
