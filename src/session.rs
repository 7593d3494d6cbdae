//! Session management for the streamable HTTP carrier
//!
//! Sessions live in a fixed slot table, carry an idle timeout, and are
//! identified by 32 lowercase hex characters rendered from 16 bytes of
//! cryptographically strong randomness. State transitions
//! (Active -> Expired, Active -> Terminated) are reported through an
//! optional event callback so the embedding server can drop per-session
//! resources.

use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use rand::RngCore;

use crate::error::{Result, TransportError};
use crate::text;

/// Hard upper bound on accepted session-id lengths (exclusive).
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Usable; `last_access` is being refreshed.
    Active,
    /// Idle timeout elapsed.
    Expired,
    /// Explicitly ended by the peer or the server.
    Terminated,
}

/// Snapshot of one session, returned by [`SessionManager::get`].
#[derive(Debug, Clone)]
pub struct Session {
    /// 32 lowercase hex characters.
    pub id: String,
    /// Wall-clock creation time.
    pub created_at: SystemTime,
    /// Idle timeout; `None` means the session never expires.
    pub timeout: Option<Duration>,
    /// Opaque application data attached via [`SessionManager::set_data`].
    pub data: Option<serde_json::Value>,
}

/// Callback invoked on Expired and Terminated transitions.
pub type SessionEventFn = dyn Fn(&str, SessionState) + Send + Sync;

struct Slot {
    id: String,
    created_at: SystemTime,
    last_access: Instant,
    timeout: Option<Duration>,
    data: Option<serde_json::Value>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        match self.timeout {
            Some(t) => now.duration_since(self.last_access) > t,
            None => false,
        }
    }

    fn snapshot(&self) -> Session {
        Session {
            id: self.id.clone(),
            created_at: self.created_at,
            timeout: self.timeout,
            data: self.data.clone(),
        }
    }
}

struct Table {
    slots: Vec<Option<Slot>>,
    active: usize,
}

/// Fixed-capacity session table with timeout-driven expiry.
pub struct SessionManager {
    table: Mutex<Table>,
    default_timeout: Duration,
    on_event: Option<Box<SessionEventFn>>,
}

impl SessionManager {
    /// Create a manager with `capacity` slots and the given default
    /// timeout for `create(0)`.
    pub fn new(capacity: usize, default_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(Table {
                slots: (0..capacity).map(|_| None).collect(),
                active: 0,
            }),
            default_timeout,
            on_event: None,
        }
    }

    /// Register the state-change callback. Replaces any previous one.
    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&str, SessionState) + Send + Sync + 'static,
    ) -> Self {
        self.on_event = Some(Box::new(callback));
        self
    }

    fn notify(&self, id: &str, state: SessionState) {
        if let Some(cb) = &self.on_event {
            cb(id, state);
        }
    }

    /// Validate a peer-supplied session identifier.
    ///
    /// Valid ids are non-empty, strictly shorter than
    /// [`MAX_SESSION_ID_LEN`], and visible ASCII throughout.
    pub fn is_valid_id(id: &str) -> bool {
        id.len() < MAX_SESSION_ID_LEN && text::is_visible_ascii(id)
    }

    /// Create a session and return its identifier.
    ///
    /// `timeout_s == 0` applies the manager default; a negative value
    /// disables expiry for this session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CapacityExhausted`] when every slot is
    /// in use.
    pub fn create(&self, timeout_s: i64) -> Result<String> {
        let timeout = match timeout_s {
            0 => Some(self.default_timeout),
            t if t < 0 => None,
            t => Some(Duration::from_secs(t as u64)),
        };

        let id = generate_id();
        let mut table = self.table.lock().expect("session table lock poisoned");
        let free = table
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or_else(|| TransportError::CapacityExhausted("session table full".into()))?;

        *free = Some(Slot {
            id: id.clone(),
            created_at: SystemTime::now(),
            last_access: Instant::now(),
            timeout,
            data: None,
        });
        table.active += 1;

        tracing::debug!(session_id = %id, "session created");
        Ok(id)
    }

    /// Look up a session by id.
    ///
    /// A session found expired is removed, reported through the event
    /// callback, and `None` is returned.
    pub fn get(&self, id: &str) -> Option<Session> {
        let expired = {
            let mut guard = self.table.lock().expect("session table lock poisoned");
            let table = &mut *guard;
            let now = Instant::now();
            let slot = table
                .slots
                .iter_mut()
                .find(|s| s.as_ref().is_some_and(|slot| slot.id == id))?;

            let is_expired = slot.as_ref().is_some_and(|s| s.is_expired(now));
            if is_expired {
                *slot = None;
                table.active -= 1;
                true
            } else {
                return slot.as_ref().map(|s| s.snapshot());
            }
        };

        if expired {
            self.notify(id, SessionState::Expired);
        }
        None
    }

    /// Refresh a session's last-access time.
    ///
    /// Returns `false` when no live session has this id.
    pub fn touch(&self, id: &str) -> bool {
        let mut table = self.table.lock().expect("session table lock poisoned");
        for slot in table.slots.iter_mut().flatten() {
            if slot.id == id {
                slot.last_access = Instant::now();
                return true;
            }
        }
        false
    }

    /// Attach opaque application data to a session.
    pub fn set_data(&self, id: &str, data: serde_json::Value) -> bool {
        let mut table = self.table.lock().expect("session table lock poisoned");
        for slot in table.slots.iter_mut().flatten() {
            if slot.id == id {
                slot.data = Some(data);
                return true;
            }
        }
        false
    }

    /// Terminate an active session.
    ///
    /// Returns `true` when the session existed and was live.
    pub fn terminate(&self, id: &str) -> bool {
        let removed = {
            let mut guard = self.table.lock().expect("session table lock poisoned");
            let table = &mut *guard;
            let slot = table
                .slots
                .iter_mut()
                .find(|s| s.as_ref().is_some_and(|slot| slot.id == id));
            match slot {
                Some(s) => {
                    *s = None;
                    table.active -= 1;
                    true
                }
                None => false,
            }
        };
        if removed {
            self.notify(id, SessionState::Terminated);
        }
        removed
    }

    /// Expire every session whose idle timeout has elapsed.
    ///
    /// Returns the number of sessions cleaned.
    pub fn cleanup_expired(&self) -> usize {
        let expired_ids: Vec<String> = {
            let mut table = self.table.lock().expect("session table lock poisoned");
            let now = Instant::now();
            let mut ids = Vec::new();
            for slot in table.slots.iter_mut() {
                if slot.as_ref().is_some_and(|s| s.is_expired(now)) {
                    if let Some(s) = slot.take() {
                        ids.push(s.id);
                    }
                }
            }
            table.active -= ids.len();
            ids
        };

        for id in &expired_ids {
            self.notify(id, SessionState::Expired);
        }
        expired_ids.len()
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.table.lock().expect("session table lock poisoned").active
    }
}

/// Render 16 bytes of OS randomness as 32 lowercase hex characters.
fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    let mut id = String::with_capacity(32);
    for b in bytes {
        let _ = write!(id, "{:02x}", b);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manager() -> SessionManager {
        SessionManager::new(16, Duration::from_secs(3600))
    }

    #[test]
    fn test_create_returns_32_hex_chars() {
        let m = manager();
        let id = m.create(0).unwrap();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn test_ids_are_unique() {
        let m = manager();
        let a = m.create(0).unwrap();
        let b = m.create(0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_get_returns_live_session() {
        let m = manager();
        let id = m.create(0).unwrap();
        let session = m.get(&id).unwrap();
        assert_eq!(session.id, id);
        assert_eq!(m.active_count(), 1);
    }

    #[test]
    fn test_get_unknown_id_is_none() {
        let m = manager();
        assert!(m.get("deadbeefdeadbeefdeadbeefdeadbeef").is_none());
    }

    #[test]
    fn test_capacity_exhausted() {
        let m = SessionManager::new(2, Duration::from_secs(10));
        m.create(0).unwrap();
        m.create(0).unwrap();
        let err = m.create(0).unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(TransportError::CapacityExhausted(_))
        ));
    }

    #[test]
    fn test_terminate_frees_slot_and_notifies() {
        let terminated = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&terminated);
        let m = SessionManager::new(1, Duration::from_secs(10)).with_event_callback(
            move |_, state| {
                if state == SessionState::Terminated {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        let id = m.create(0).unwrap();
        assert!(m.terminate(&id));
        assert!(!m.terminate(&id), "second terminate is a no-op");
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert_eq!(m.active_count(), 0);

        // The slot is reusable afterwards.
        m.create(0).unwrap();
    }

    #[test]
    fn test_expiry_via_get() {
        let expired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&expired);
        let m = SessionManager::new(4, Duration::from_secs(3600)).with_event_callback(
            move |_, state| {
                if state == SessionState::Expired {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        let id = m.create(1).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(m.get(&id).is_none());
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert_eq!(m.active_count(), 0);
    }

    #[test]
    fn test_negative_timeout_never_expires() {
        let m = manager();
        let id = m.create(-1).unwrap();
        assert_eq!(m.cleanup_expired(), 0);
        assert!(m.get(&id).is_some());
    }

    #[test]
    fn test_touch_defers_expiry() {
        let m = manager();
        let id = m.create(1).unwrap();
        std::thread::sleep(Duration::from_millis(700));
        assert!(m.touch(&id));
        std::thread::sleep(Duration::from_millis(700));
        // 1.4s total but only 0.7s since the touch.
        assert!(m.get(&id).is_some());
    }

    #[test]
    fn test_cleanup_expired_counts() {
        let m = manager();
        m.create(1).unwrap();
        m.create(1).unwrap();
        m.create(-1).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(m.cleanup_expired(), 2);
        assert_eq!(m.active_count(), 1);
    }

    #[test]
    fn test_id_validation_rules() {
        assert!(SessionManager::is_valid_id("abc123"));
        assert!(!SessionManager::is_valid_id(""));
        assert!(!SessionManager::is_valid_id(&"x".repeat(64)));
        assert!(!SessionManager::is_valid_id("has space"));
        assert!(SessionManager::is_valid_id(&"x".repeat(63)));
    }

    #[test]
    fn test_set_data_roundtrip() {
        let m = manager();
        let id = m.create(0).unwrap();
        assert!(m.set_data(&id, serde_json::json!({"k": 1})));
        let session = m.get(&id).unwrap();
        assert_eq!(session.data.unwrap()["k"], 1);
    }
}
