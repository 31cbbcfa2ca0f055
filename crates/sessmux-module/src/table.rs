//! Session table: the single source of truth for "is this identity live".
//!
//! Owns the identity pool and every `Arc<Session>`. All mutation (admit,
//! remove, maintenance) happens under one `parking_lot::Mutex`, so the
//! capacity check, the identity acquisition and the insert are one atomic
//! step as far as other threads can tell.
//!
//! Closed identities go into a quarantine queue instead of straight back
//! to the pool; the maintenance tick returns them once they are older than
//! `identity_quarantine`. Every admission also gets a fresh generation, so
//! an event token minted for a previous holder of the identity no longer
//! resolves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sessmux_core::{Error, Identity, IdentityPool, Result, ServerConfig, Token};

use crate::session::{Session, SessionLimits};

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Maintenance {
    /// Entries dropped from the recently-invalidated set.
    pub cleared: usize,
    /// Quarantined identities returned to the pool.
    pub released: usize,
}

struct TableInner {
    by_identity: HashMap<Identity, Arc<Session>>,
    by_fd: HashMap<RawFd, Identity>,
    /// Closed identities waiting to go back to the pool.
    quarantine: VecDeque<(Identity, Instant)>,
    /// Identities removed (or missed) since the last maintenance tick.
    invalidated: HashSet<Identity>,
    next_generation: u32,
    accepting: bool,
}

pub struct SessionTable {
    inner: Mutex<TableInner>,
    pool: IdentityPool,
    capacity: usize,
    limits: SessionLimits,
    recycle: bool,
    quarantine: Duration,
}

impl SessionTable {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                by_identity: HashMap::with_capacity(config.max_sessions.min(65536)),
                by_fd: HashMap::with_capacity(config.max_sessions.min(65536)),
                quarantine: VecDeque::new(),
                invalidated: HashSet::new(),
                next_generation: 0,
                accepting: true,
            }),
            pool: IdentityPool::new(config.max_sessions),
            capacity: config.max_sessions,
            limits: SessionLimits::from(config),
            recycle: config.recycle_identities,
            quarantine: config.identity_quarantine,
        }
    }

    /// Admit a freshly accepted connection.
    ///
    /// Checks, in order: shutting down, table at capacity, identity pool
    /// exhausted. Any rejection drops `stream` (closing it) and leaves the
    /// table and the pool untouched.
    pub fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Result<Arc<Session>> {
        let mut inner = self.inner.lock();
        if !inner.accepting {
            return Err(Error::ShuttingDown);
        }
        if inner.by_identity.len() >= self.capacity {
            return Err(Error::TableFull {
                capacity: self.capacity,
            });
        }
        let identity = self.pool.acquire()?;

        inner.next_generation = inner.next_generation.wrapping_add(1);
        let session = Arc::new(Session::new(
            identity,
            inner.next_generation,
            stream,
            peer,
            &self.limits,
        ));
        inner.by_fd.insert(session.fd(), identity);
        inner.by_identity.insert(identity, Arc::clone(&session));
        inner.invalidated.remove(&identity);
        Ok(session)
    }

    /// Resolve an event token. A different generation is a miss.
    pub fn lookup(&self, token: Token) -> Option<Arc<Session>> {
        let inner = self.inner.lock();
        inner
            .by_identity
            .get(&token.identity())
            .filter(|s| s.generation() == token.generation())
            .cloned()
    }

    pub fn get(&self, identity: Identity) -> Option<Arc<Session>> {
        self.inner.lock().by_identity.get(&identity).cloned()
    }

    pub fn identity_of(&self, fd: RawFd) -> Option<Identity> {
        self.inner.lock().by_fd.get(&fd).copied()
    }

    /// Remove `session` from both maps and quarantine its identity.
    ///
    /// A no-op returning false if the table holds a different session
    /// under that identity (or none).
    pub fn remove(&self, session: &Session) -> bool {
        let mut inner = self.inner.lock();
        let identity = session.identity();
        match inner.by_identity.get(&identity) {
            Some(s) if s.generation() == session.generation() => {}
            _ => return false,
        }
        inner.by_identity.remove(&identity);
        if inner.by_fd.get(&session.fd()) == Some(&identity) {
            inner.by_fd.remove(&session.fd());
        }
        inner.invalidated.insert(identity);
        if self.recycle {
            inner.quarantine.push_back((identity, Instant::now()));
        }
        true
    }

    /// Record an event that referenced a session no longer in the table.
    ///
    /// Returns true the first time an identity is seen since the last
    /// maintenance tick; callers log only then. Identities closed through
    /// `remove` are already recorded, so their trailing events stay quiet.
    pub fn record_miss(&self, identity: Identity) -> bool {
        self.inner.lock().invalidated.insert(identity)
    }

    /// Periodic housekeeping: forget invalidated identities and release
    /// quarantined ones older than the configured quarantine.
    pub fn maintain(&self, now: Instant) -> Maintenance {
        let mut inner = self.inner.lock();
        let cleared = inner.invalidated.len();
        inner.invalidated.clear();

        let mut released = 0;
        while let Some(&(identity, since)) = inner.quarantine.front() {
            if now.saturating_duration_since(since) < self.quarantine {
                break;
            }
            inner.quarantine.pop_front();
            if self.pool.release(identity) {
                released += 1;
            }
        }
        Maintenance { cleared, released }
    }

    /// Stop admitting sessions.
    pub fn begin_shutdown(&self) {
        self.inner.lock().accepting = false;
    }

    /// Snapshot of every live session, for shutdown.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.lock().by_identity.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_identities(&self) -> usize {
        self.pool.available()
    }

    pub fn quarantined(&self) -> usize {
        self.inner.lock().quarantine.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::tcp_pair;
    use std::collections::HashSet;
    use std::io::Read;
    use std::thread;

    fn config(max: usize) -> ServerConfig {
        ServerConfig::new()
            .max_sessions(max)
            .identity_quarantine(Duration::ZERO)
    }

    fn admit(table: &SessionTable) -> Result<(Arc<Session>, TcpStream)> {
        let (server, client) = tcp_pair();
        let peer = client.local_addr().unwrap();
        table.admit(server, peer).map(|s| (s, client))
    }

    #[test]
    fn test_admit_and_lookup() {
        let table = SessionTable::new(&config(4));
        let (s, _c) = admit(&table).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(s.token()).unwrap().identity(), s.identity());
        assert_eq!(table.identity_of(s.fd()), Some(s.identity()));
        assert!(table.get(s.identity()).is_some());
    }

    #[test]
    fn test_rejects_when_table_full() {
        let table = SessionTable::new(&config(1));
        let (_s, _c) = admit(&table).unwrap();
        let before = table.available_identities();

        let (server, mut client) = tcp_pair();
        let peer = client.local_addr().unwrap();
        let err = table.admit(server, peer).unwrap_err();
        assert!(matches!(err, Error::TableFull { capacity: 1 }));
        assert_eq!(table.len(), 1);
        assert_eq!(table.available_identities(), before);

        // the rejected stream was dropped: the client sees EOF
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_rejects_when_pool_empty_with_table_headroom() {
        let table = SessionTable::new(&config(2).recycle_identities(false));
        for _ in 0..2 {
            let (s, _c) = admit(&table).unwrap();
            assert!(table.remove(&s));
        }
        assert!(table.is_empty());
        assert_eq!(table.available_identities(), 0);

        let err = admit(&table).unwrap_err();
        assert!(matches!(err, Error::IdentityExhausted));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = SessionTable::new(&config(2));
        let (s, _c) = admit(&table).unwrap();
        assert!(table.remove(&s));
        assert!(!table.remove(&s));
        assert!(table.lookup(s.token()).is_none());
        assert!(table.identity_of(s.fd()).is_none());
        assert_eq!(table.quarantined(), 1);
    }

    #[test]
    fn test_recycled_identity_gets_new_generation() {
        let table = SessionTable::new(&config(1));
        let (old, _c1) = admit(&table).unwrap();
        table.remove(&old);
        assert_eq!(table.maintain(Instant::now()).released, 1);

        let (new, _c2) = admit(&table).unwrap();
        assert_eq!(new.identity(), old.identity());
        assert_ne!(new.generation(), old.generation());
        // an event minted for the old session misses
        assert!(table.lookup(old.token()).is_none());
        assert!(table.lookup(new.token()).is_some());
        // removing the old session again does not touch the new one
        assert!(!table.remove(&old));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_quarantine_holds_until_aged() {
        let table = SessionTable::new(
            &ServerConfig::new()
                .max_sessions(1)
                .identity_quarantine(Duration::from_secs(60)),
        );
        let (s, _c) = admit(&table).unwrap();
        table.remove(&s);
        assert_eq!(table.maintain(Instant::now()).released, 0);
        assert!(matches!(admit(&table), Err(Error::IdentityExhausted)));

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(table.maintain(later).released, 1);
        assert!(admit(&table).is_ok());
    }

    #[test]
    fn test_miss_reported_once_per_window() {
        let table = SessionTable::new(&config(2));
        let id = Identity::new(9);
        assert!(table.record_miss(id));
        assert!(!table.record_miss(id));
        assert_eq!(table.maintain(Instant::now()).cleared, 1);
        assert!(table.record_miss(id));

        // closed sessions are pre-recorded
        let (s, _c) = admit(&table).unwrap();
        table.remove(&s);
        assert!(!table.record_miss(s.identity()));
    }

    #[test]
    fn test_shutdown_stops_admission() {
        let table = SessionTable::new(&config(2));
        table.begin_shutdown();
        assert!(matches!(admit(&table), Err(Error::ShuttingDown)));
    }

    #[test]
    fn test_concurrent_admit_never_duplicates() {
        let table = Arc::new(SessionTable::new(&config(64)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..20 {
                        if let Ok(pair) = admit(&table) {
                            held.push(pair);
                        }
                    }
                    held
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        assert_eq!(all.len(), 64);
        assert_eq!(table.len(), 64);
        let ids: HashSet<_> = all.iter().map(|(s, _)| s.identity()).collect();
        assert_eq!(ids.len(), 64);
    }
}
