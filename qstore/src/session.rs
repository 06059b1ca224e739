use std::{
    collections::HashMap,
    fmt::Display,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use lazy_static::lazy_static;
use log::{debug, info};

use crate::{err::Result, transport::SessionId, util::HandleSemaphore};

/// Identity of one physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// Filesystem device root directory.
    Root(PathBuf),
    /// Token handed out by a transport handshake.
    Remote(SessionId),
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKey::Root(p) => write!(f, "root:{}", p.display()),
            SessionKey::Remote(id) => write!(f, "remote:{}", id),
        }
    }
}

#[derive(Debug)]
struct DeviceSession {
    sem: Arc<HandleSemaphore>,
    refs: usize,
}

/// Reference counted table of open physical connections. Logical devices
/// opened against the same endpoint share one session and its admission budget.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, DeviceSession>>,
}

lazy_static! {
    static ref GLOBAL_REGISTRY: Arc<SessionRegistry> = Arc::new(SessionRegistry::new());
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Arc<SessionRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    /// Joins the session for `key`, running `establish` only when no session
    /// exists yet. Nothing is registered when `establish` fails.
    pub fn connect<F>(&self, key: SessionKey, capacity: usize, establish: F) -> Result<Arc<HandleSemaphore>>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(&key) {
            session.refs += 1;
            debug!("same device session already opened: {} refs: {}", key, session.refs);
            return Ok(session.sem.clone());
        }

        establish()?;
        let sem = HandleSemaphore::new(capacity);
        info!("new device session opened: {}", key);
        sessions.insert(
            key,
            DeviceSession {
                sem: sem.clone(),
                refs: 1,
            },
        );
        Ok(sem)
    }

    /// Runs a protocol `handshake` and joins the session for the token it
    /// returns. The handshake holds the table lock, so a concurrent last
    /// `release` can not tear the token down before it is registered.
    pub fn connect_remote<F>(&self, capacity: usize, handshake: F) -> Result<(SessionId, Arc<HandleSemaphore>)>
    where
        F: FnOnce() -> Result<SessionId>,
    {
        let mut sessions = self.sessions.lock().unwrap();
        let id = handshake()?;
        let key = SessionKey::Remote(id);
        if let Some(session) = sessions.get_mut(&key) {
            session.refs += 1;
            debug!("same device session already opened: {} refs: {}", key, session.refs);
            return Ok((id, session.sem.clone()));
        }

        let sem = HandleSemaphore::new(capacity);
        info!("new device session opened: {}", key);
        sessions.insert(
            key,
            DeviceSession {
                sem: sem.clone(),
                refs: 1,
            },
        );
        Ok((id, sem))
    }

    /// Drops one reference; the last one removes the entry and runs `teardown`.
    /// Returns true if the session was torn down.
    pub fn release<F>(&self, key: &SessionKey, teardown: F) -> bool
    where
        F: FnOnce(),
    {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(key) else {
            debug!("release of unknown device session {}", key);
            return false;
        };
        session.refs -= 1;
        if session.refs > 0 {
            debug!("device session {} still has {} refs", key, session.refs);
            return false;
        }
        sessions.remove(key);
        teardown();
        info!("device session closed: {}", key);
        true
    }

    pub fn ref_count(&self, key: &SessionKey) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(key)
            .map(|s| s.refs)
            .unwrap_or(0)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::err::DeviceError;

    use super::*;

    fn key(n: u64) -> SessionKey {
        SessionKey::Remote(SessionId(n))
    }

    #[test]
    pub fn shared_semaphore() {
        let registry = SessionRegistry::new();
        let a = registry.connect(key(1), 5, || Ok(())).unwrap();
        let b = registry
            .connect(key(1), 9, || panic!("second connect must not establish"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.capacity(), 5);
        assert_eq!(registry.ref_count(&key(1)), 2);

        let other = registry.connect(key(2), 5, || Ok(())).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    pub fn failed_establish_registers_nothing() {
        let registry = SessionRegistry::new();
        let root = SessionKey::Root("/no/such/root".into());
        let r = registry.connect(root.clone(), 5, || {
            Err(DeviceError::Connect("root path does not exist".into()))
        });
        assert_eq!(r.unwrap_err(), DeviceError::Connect(String::new()));
        assert!(!registry.contains(&root));
    }

    #[test]
    pub fn release_unknown_is_noop() {
        let registry = SessionRegistry::new();
        assert!(!registry.release(&key(7), || panic!("no teardown expected")));
        assert!(registry.is_empty());
    }

    #[test]
    pub fn concurrent_connect_disconnect() {
        let registry = SessionRegistry::new();
        let teardowns = AtomicUsize::new(0);
        let establishes = AtomicUsize::new(0);

        // hold one reference across the storm so it never hits zero midway
        registry.connect(key(3), 5, || Ok(())).unwrap();
        establishes.fetch_add(1, Ordering::SeqCst);

        crossbeam::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    for _ in 0..50 {
                        registry
                            .connect(key(3), 5, || {
                                establishes.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                        registry.release(&key(3), || {
                            teardowns.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(registry.ref_count(&key(3)), 1);
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        assert_eq!(establishes.load(Ordering::SeqCst), 1);

        assert!(registry.release(&key(3), || {
            teardowns.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!registry.contains(&key(3)));
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    pub fn handshake_serialized_with_release() {
        let registry = SessionRegistry::new();
        let teardowns = AtomicUsize::new(0);
        registry.connect_remote(5, || Ok(SessionId(9))).unwrap();

        let (started_tx, started_rx) = crossbeam::channel::bounded(1);
        crossbeam::scope(|s| {
            let joiner = s.spawn(|_| {
                registry
                    .connect_remote(5, || {
                        started_tx.send(()).unwrap();
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        Ok(SessionId(9))
                    })
                    .unwrap()
            });
            started_rx.recv().unwrap();
            // the first holder leaves while the second is mid handshake
            registry.release(&key(9), || {
                teardowns.fetch_add(1, Ordering::SeqCst);
            });
            let (id, _) = joiner.join().unwrap();
            assert_eq!(id, SessionId(9));
        })
        .unwrap();

        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        assert_eq!(registry.ref_count(&key(9)), 1);
    }

    #[test]
    pub fn failed_handshake_registers_nothing() {
        let registry = SessionRegistry::new();
        let r = registry.connect_remote(5, || Err(DeviceError::Connect("credentials rejected".into())));
        assert_eq!(r.unwrap_err(), DeviceError::Connect(String::new()));
        assert!(registry.is_empty());
    }

    #[test]
    pub fn n_connects_n_releases_leave_nothing() {
        let registry = SessionRegistry::new();
        let root = SessionKey::Root("/backups".into());
        crossbeam::scope(|s| {
            for _ in 0..16 {
                s.spawn(|_| registry.connect(root.clone(), 5, || Ok(())).unwrap());
            }
        })
        .unwrap();
        assert_eq!(registry.ref_count(&root), 16);

        let teardowns = AtomicUsize::new(0);
        crossbeam::scope(|s| {
            for _ in 0..16 {
                s.spawn(|_| {
                    registry.release(&root, || {
                        teardowns.fetch_add(1, Ordering::SeqCst);
                    })
                });
            }
        })
        .unwrap();
        assert!(!registry.contains(&root));
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }
}
