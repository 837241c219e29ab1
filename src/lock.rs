//! WebDAV 独占写锁管理器：深度覆盖、超时与惰性清理。
//!
//! Lock regions are kept disjoint: no live lock's root may fall inside
//! another live lock's scope. Expired locks are swept at every entry
//! point rather than by a background task.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;
use xmltree::{Element, XMLNode};

use crate::davpath;
use crate::error::DavError;
use crate::xml::{dav_element, text_element};

pub const MIN_LOCK_DURATION: Duration = Duration::from_secs(20);
pub const MAX_LOCK_DURATION: Duration = Duration::from_secs(300);

/// An exclusive write lock on a subtree root.
#[derive(Debug, Clone)]
pub struct Lock {
    pub token: String,
    pub path: String,
    /// 0 covers the resource alone, negative covers the whole subtree.
    pub depth: i32,
    /// Verbatim owner fragment supplied by the client.
    pub owner: Option<Element>,
    pub duration: Duration,
    modified: Instant,
}

impl Lock {
    /// Validity remaining before the lock expires.
    pub fn remaining(&self) -> Duration {
        (self.modified + self.duration).saturating_duration_since(Instant::now())
    }

    fn expired(&self, now: Instant) -> bool {
        now >= self.modified + self.duration
    }

    /// Renders the `activelock` fragment advertised through
    /// `lockdiscovery` and the LOCK response.
    pub fn active_lock_xml(&self) -> Element {
        let depth = if self.depth < 0 {
            "infinity".to_string()
        } else {
            self.depth.to_string()
        };

        let mut locktype = dav_element("locktype");
        locktype
            .children
            .push(XMLNode::Element(dav_element("write")));
        let mut lockscope = dav_element("lockscope");
        lockscope
            .children
            .push(XMLNode::Element(dav_element("exclusive")));
        let owner = self.owner.clone().unwrap_or_else(|| dav_element("owner"));
        let mut locktoken = dav_element("locktoken");
        locktoken
            .children
            .push(XMLNode::Element(text_element("href", self.token.clone())));
        let mut lockroot = dav_element("lockroot");
        lockroot.children.push(XMLNode::Element(text_element(
            "href",
            davpath::url_encode(&self.path),
        )));

        let mut active = dav_element("activelock");
        for child in [
            locktype,
            lockscope,
            text_element("depth", depth),
            owner,
            text_element("timeout", format!("Second-{}", self.remaining().as_secs())),
            locktoken,
            lockroot,
        ] {
            active.children.push(XMLNode::Element(child));
        }
        active
    }
}

/// 锁注册表：token 到活动锁的映射，内部由单个互斥锁串行化。
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Lock>>,
}

fn clamp_duration(duration: Duration) -> Duration {
    duration.clamp(MIN_LOCK_DURATION, MAX_LOCK_DURATION)
}

fn generate_token() -> String {
    Uuid::new_v4().urn().to_string()
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked_registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lock>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        locks.retain(|_, lock| !lock.expired(now));
        locks
    }

    /// Creates a lock over `(path, depth)` unless the region intersects an
    /// existing live lock in either direction.
    pub fn create_lock(
        &self,
        owner: Option<Element>,
        path: &str,
        depth: i32,
        duration: Duration,
    ) -> Result<Lock, DavError> {
        let mut locks = self.locked_registry();
        for existing in locks.values() {
            // The request falls within an existing lock, or would engulf one.
            if davpath::included(path, &existing.path, existing.depth).is_some()
                || davpath::included(&existing.path, path, depth).is_some()
            {
                return Err(DavError::LOCKED);
            }
        }

        let lock = Lock {
            token: generate_token(),
            path: path.to_string(),
            depth,
            owner,
            duration: clamp_duration(duration),
            modified: Instant::now(),
        };
        locks.insert(lock.token.clone(), lock.clone());
        Ok(lock)
    }

    /// Extends an existing lock's validity; the refresh target must lie
    /// within the lock's scope.
    pub fn refresh_lock(
        &self,
        token: &str,
        path: &str,
        duration: Duration,
    ) -> Result<Lock, DavError> {
        let mut locks = self.locked_registry();
        let Some(lock) = locks.get_mut(token) else {
            return Err(DavError::BAD_LOCK.with_cause(format!("unknown lock: {token}")));
        };
        if davpath::included(path, &lock.path, lock.depth).is_none() {
            return Err(DavError::BAD_LOCK.with_cause("path not within lock"));
        }
        lock.duration = clamp_duration(duration);
        lock.modified = Instant::now();
        Ok(lock.clone())
    }

    /// Removes the lock unconditionally.
    pub fn unlock(&self, token: &str) {
        self.locked_registry().remove(token);
    }

    /// Whether `token` names a live lock whose scope includes `path`.
    pub fn is_locked(&self, path: &str, token: &str) -> bool {
        self.locked_registry()
            .get(token)
            .is_some_and(|lock| davpath::included(path, &lock.path, lock.depth).is_some())
    }

    /// Any live lock whose scope includes `path`.
    pub fn lock_for_path(&self, path: &str) -> Option<Lock> {
        self.locked_registry()
            .values()
            .find(|lock| davpath::included(path, &lock.path, lock.depth).is_some())
            .cloned()
    }

    #[cfg(test)]
    fn age_lock(&self, token: &str, by: Duration) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get_mut(token) {
            lock.modified -= by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn tokens_are_urn_form_and_unique() {
        let lm = LockManager::new();
        let a = lm.create_lock(None, "/a", 0, MINUTE).unwrap();
        let b = lm.create_lock(None, "/b", 0, MINUTE).unwrap();
        assert!(a.token.starts_with("urn:uuid:"));
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let lm = LockManager::new();
        let held = lm.create_lock(None, "/a", -1, MINUTE).unwrap();

        // Inside an existing lock.
        assert!(lm.create_lock(None, "/a/b", -1, MINUTE).is_err());
        assert!(lm.create_lock(None, "/a", 0, MINUTE).is_err());
        // Engulfing an existing lock.
        assert!(lm.create_lock(None, "/", -1, MINUTE).is_err());
        // Disjoint is fine.
        lm.create_lock(None, "/b", -1, MINUTE).unwrap();

        lm.unlock(&held.token);
        lm.create_lock(None, "/a/b", -1, MINUTE).unwrap();
    }

    #[test]
    fn depth_zero_does_not_block_children() {
        let lm = LockManager::new();
        lm.create_lock(None, "/a", 0, MINUTE).unwrap();
        lm.create_lock(None, "/a/b", 0, MINUTE).unwrap();
    }

    #[test]
    fn coverage_follows_depth() {
        let lm = LockManager::new();
        let deep = lm.create_lock(None, "/d", -1, MINUTE).unwrap();
        assert!(lm.is_locked("/d", &deep.token));
        assert!(lm.is_locked("/d/x", &deep.token));
        assert!(lm.is_locked("/d/x/y", &deep.token));
        assert!(!lm.is_locked("/e", &deep.token));

        let shallow = lm.create_lock(None, "/f", 0, MINUTE).unwrap();
        assert!(lm.is_locked("/f", &shallow.token));
        assert!(!lm.is_locked("/f/x", &shallow.token));
    }

    #[test]
    fn expired_locks_are_swept() {
        let lm = LockManager::new();
        let lock = lm.create_lock(None, "/gone", -1, MINUTE).unwrap();
        lm.age_lock(&lock.token, MINUTE + Duration::from_secs(1));

        assert!(!lm.is_locked("/gone", &lock.token));
        lm.create_lock(None, "/gone/child", 0, MINUTE).unwrap();
    }

    #[test]
    fn refresh_extends_the_deadline() {
        let lm = LockManager::new();
        let lock = lm.create_lock(None, "/r", -1, MIN_LOCK_DURATION).unwrap();
        lm.age_lock(&lock.token, Duration::from_secs(15));

        let refreshed = lm
            .refresh_lock(&lock.token, "/r/sub", Duration::from_secs(200))
            .unwrap();
        assert!(refreshed.remaining() > Duration::from_secs(190));

        assert!(lm.refresh_lock("urn:uuid:nope", "/r", MINUTE).is_err());
    }

    #[test]
    fn refresh_outside_scope_fails() {
        let lm = LockManager::new();
        let lock = lm.create_lock(None, "/s", 0, MINUTE).unwrap();
        assert!(lm.refresh_lock(&lock.token, "/s/sub", MINUTE).is_err());
    }

    #[test]
    fn durations_are_clamped() {
        let lm = LockManager::new();
        let short = lm
            .create_lock(None, "/short", 0, Duration::from_secs(1))
            .unwrap();
        assert!(short.remaining() > Duration::from_secs(15));

        let long = lm
            .create_lock(None, "/long", 0, Duration::from_secs(100_000))
            .unwrap();
        assert!(long.remaining() <= MAX_LOCK_DURATION);
    }

    #[test]
    fn active_lock_fragment_carries_token_and_root() {
        let lm = LockManager::new();
        let lock = lm.create_lock(None, "/frag", -1, MINUTE).unwrap();
        let element = lock.active_lock_xml();
        assert_eq!(element.name, "activelock");
        let token = element
            .get_child("locktoken")
            .and_then(|t| t.get_child("href"))
            .and_then(|h| h.get_text())
            .unwrap();
        assert_eq!(token, lock.token);
        let depth = element.get_child("depth").and_then(|d| d.get_text()).unwrap();
        assert_eq!(depth, "infinity");
    }
}
