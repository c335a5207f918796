//! Recency-ordered session cache.
//!
//! Sessions sit on a doubly linked list ordered by last access, oldest at
//! the head. Nodes live in a slab (`Vec<Option<Node>>` plus a free list)
//! and link to each other by index, so touching or evicting a node is O(1).
//!
//! Eviction is lazy: creating a session first sweeps idle sessions off the
//! head. Lookups never evict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use super::auth::Permissions;
use crate::metrics::{SESSIONS_ACTIVE, SESSIONS_CREATED_TOTAL, SESSIONS_EVICTED_TOTAL};

/// A token's cached permissions.
#[derive(Clone, Debug)]
pub struct Session {
    /// Bearer token the session belongs to.
    pub token: String,
    /// Devices the token may reach.
    pub permissions: Arc<Permissions>,
    /// Last time the session was created or looked up.
    pub last_access: Instant,
}

#[derive(Debug)]
struct Node {
    session: Session,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Index-linked recency list with a token index.
#[derive(Debug)]
pub struct RecencyList {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    idle: Duration,
}

impl RecencyList {
    /// Create an empty list evicting sessions idle longer than `idle`.
    pub fn new(idle: Duration) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            idle,
        }
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the list holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up `token`, refreshing its access time and moving it to the tail.
    pub fn get(&mut self, token: &str, now: Instant) -> Option<&Session> {
        let idx = *self.index.get(token)?;
        self.touch(idx, now);
        self.nodes[idx].as_ref().map(|n| &n.session)
    }

    /// Return the session for `token`, creating it with `factory` if absent.
    ///
    /// An existing session is refreshed as by [`get`](Self::get) and the
    /// factory is not called. Otherwise idle sessions are swept from the
    /// head first. Returns the session and the number evicted.
    pub fn create(
        &mut self,
        token: &str,
        now: Instant,
        factory: impl FnOnce() -> Permissions,
    ) -> (Session, usize) {
        if let Some(session) = self.get(token, now) {
            return (session.clone(), 0);
        }
        let evicted = self.evict_idle(now);
        let session = Session {
            token: token.to_string(),
            permissions: Arc::new(factory()),
            last_access: now,
        };
        let node = Node {
            session: session.clone(),
            prev: None,
            next: None,
        };
        let idx = if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        };
        let _ = self.index.insert(token.to_string(), idx);
        self.push_back(idx);
        (session, evicted)
    }

    /// Remove sessions from the head while they have been idle longer than
    /// the threshold. Returns how many were removed.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some(idx) = self.head {
            let Some(node) = self.nodes[idx].as_ref() else {
                break;
            };
            if now.saturating_duration_since(node.session.last_access) <= self.idle {
                break;
            }
            self.unlink(idx);
            if let Some(node) = self.nodes[idx].take() {
                let _ = self.index.remove(&node.session.token);
            }
            self.free.push(idx);
            evicted += 1;
        }
        evicted
    }

    /// Tokens from least to most recently used.
    pub fn tokens_oldest_first(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(node) = self.nodes[idx].as_ref() else {
                break;
            };
            out.push(node.session.token.as_str());
            cursor = node.next;
        }
        out
    }

    fn touch(&mut self, idx: usize, now: Instant) {
        if let Some(node) = self.nodes[idx].as_mut() {
            node.session.last_access = now;
        }
        if self.tail != Some(idx) {
            self.unlink(idx);
            self.push_back(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.nodes[idx].as_mut() {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn push_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(node) = self.nodes[t].as_mut() {
                    node.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    /// Walk the list both ways and check every link, the index, and the
    /// ordering by access time.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let forward = self.tokens_oldest_first();
        assert_eq!(forward.len(), self.index.len());

        let mut backward = Vec::new();
        let mut cursor = self.tail;
        let mut last_seen: Option<Instant> = None;
        while let Some(idx) = cursor {
            let node = self.nodes[idx].as_ref().unwrap();
            assert_eq!(self.index[&node.session.token], idx);
            if let Some(later) = last_seen {
                assert!(node.session.last_access <= later);
            }
            last_seen = Some(node.session.last_access);
            backward.push(node.session.token.as_str());
            cursor = node.prev;
        }
        backward.reverse();
        assert_eq!(forward, backward);
        let live = self.nodes.iter().filter(|n| n.is_some()).count();
        assert_eq!(live, self.index.len());
        assert_eq!(live + self.free.len(), self.nodes.len());
    }
}

/// Thread-safe session cache.
#[derive(Debug)]
pub struct SessionCache {
    list: Mutex<RecencyList>,
}

impl SessionCache {
    /// Create a cache evicting sessions idle longer than `idle`.
    pub fn new(idle: Duration) -> Self {
        Self {
            list: Mutex::new(RecencyList::new(idle)),
        }
    }

    /// Look up a session, refreshing it.
    pub fn get(&self, token: &str) -> Option<Session> {
        self.list.lock().get(token, Instant::now()).cloned()
    }

    /// Return the session for `token`, creating it from `factory` if absent.
    #[allow(clippy::cast_precision_loss)]
    pub fn create(&self, token: &str, factory: impl FnOnce() -> Permissions) -> Session {
        let (session, evicted, total, created) = {
            let mut list = self.list.lock();
            let before = list.len();
            let (session, evicted) = list.create(token, Instant::now(), factory);
            let total = list.len();
            (session, evicted, total, total + evicted > before)
        };
        if created {
            metrics::counter!(SESSIONS_CREATED_TOTAL).increment(1);
            metrics::counter!(SESSIONS_EVICTED_TOTAL).increment(evicted as u64);
            metrics::gauge!(SESSIONS_ACTIVE).set(total as f64);
            info!(added = 1, removed = evicted, total, "session cache updated");
        }
        session
    }

    /// Number of cached sessions.
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}
