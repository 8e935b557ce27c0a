//! In-process store used by tests
//!
//! Keys live in one sorted map per node. Cursors are continuation keys, so
//! a scan visits every key present for the whole scan exactly once even
//! while earlier pages are being deleted. Faults can be injected per key,
//! per call number, or for the whole store.

use crate::action::KeyType;
use crate::error::{StoreError, StoreResult};
use crate::store::{
    key_hash_slot, KeyOutcome, Mutation, NodeHandle, ShardedStoreClient, SlotRange, CURSOR_START,
    SLOT_COUNT,
};

use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Prefix that marks a continuation cursor
const CURSOR_PREFIX: &str = "after:";

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    key_type: KeyType,
}

/// Calls numbered `from..from + count` fail with `error`
#[derive(Debug, Clone)]
struct CallFault {
    from: u64,
    count: u64,
    error: StoreError,
}

impl CallFault {
    fn hits(&self, call: u64) -> bool {
        call >= self.from && call < self.from + self.count
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<BTreeMap<String, StoredValue>>,
    failing_keys: HashMap<String, String>,
    scan_faults: Vec<CallFault>,
    apply_faults: Vec<CallFault>,
    topology_error: Option<String>,
    topology_delay: Option<Duration>,
    disconnected: bool,
    ignore_count: bool,
    scan_delay: Option<Duration>,
    apply_delay: Option<Duration>,
    apply_log: Vec<Vec<String>>,
}

/// In-memory [`ShardedStoreClient`]
pub struct MemoryStore {
    nodes: Vec<NodeHandle>,
    state: Mutex<MemoryState>,
    scan_calls: AtomicU64,
    apply_calls: AtomicU64,
    scan_permits: Mutex<Option<Arc<Semaphore>>>,
}

impl MemoryStore {
    /// Single-node deployment
    pub fn single() -> Self {
        Self::with_nodes(vec![NodeHandle::standalone("memory:6379")])
    }

    /// Partitioned deployment with `primaries` nodes splitting the slots evenly
    pub fn cluster(primaries: usize) -> Self {
        let primaries = primaries.max(1) as u32;
        let total = SLOT_COUNT as u32;
        let nodes = (0..primaries)
            .map(|i| {
                let start = (i * total / primaries) as u16;
                let end = ((i + 1) * total / primaries - 1) as u16;
                NodeHandle {
                    id: format!("memory-node-{}", i),
                    address: format!("memory:{}", 7000 + i),
                    slots: vec![SlotRange::new(start, end)],
                }
            })
            .collect();
        Self::with_nodes(nodes)
    }

    fn with_nodes(nodes: Vec<NodeHandle>) -> Self {
        let state = MemoryState {
            data: vec![BTreeMap::new(); nodes.len()],
            ..Default::default()
        };
        Self {
            nodes,
            state: Mutex::new(state),
            scan_calls: AtomicU64::new(0),
            apply_calls: AtomicU64::new(0),
            scan_permits: Mutex::new(None),
        }
    }

    /// Primary nodes of this store
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    fn owner_index(&self, key: &str) -> usize {
        let slot = key_hash_slot(key.as_bytes());
        self.nodes
            .iter()
            .position(|n| n.owns_slot(slot))
            .unwrap_or(0)
    }

    fn node_index(&self, node: &NodeHandle) -> StoreResult<usize> {
        self.nodes
            .iter()
            .position(|n| n.id == node.id)
            .ok_or_else(|| StoreError::Command(format!("unknown node '{}'", node.id)))
    }

    /// Insert a string key on its owning node
    pub fn insert(&self, key: &str, value: &str) {
        self.insert_typed(key, value, KeyType::String);
    }

    /// Insert a key of a given type on its owning node
    pub fn insert_typed(&self, key: &str, value: &str, key_type: KeyType) {
        let idx = self.owner_index(key);
        self.state.lock().data[idx].insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                key_type,
            },
        );
    }

    /// Insert `count` string keys named `{prefix}{n}`
    pub fn populate(&self, prefix: &str, count: usize) {
        for n in 0..count {
            self.insert(&format!("{}{}", prefix, n), "v");
        }
    }

    /// Remove a key behind the engine's back
    pub fn remove(&self, key: &str) -> bool {
        let idx = self.owner_index(key);
        self.state.lock().data[idx].remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        let idx = self.owner_index(key);
        self.state.lock().data[idx].contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let idx = self.owner_index(key);
        self.state.lock().data[idx].get(key).map(|v| v.value.clone())
    }

    /// Total number of keys across nodes
    pub fn len(&self) -> usize {
        self.state.lock().data.iter().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys stored on node `index`
    pub fn node_len(&self, index: usize) -> usize {
        self.state.lock().data.get(index).map_or(0, BTreeMap::len)
    }

    /// Make every mutation of `key` fail with `message`
    pub fn fail_key(&self, key: &str, message: &str) {
        self.state
            .lock()
            .failing_keys
            .insert(key.to_string(), message.to_string());
    }

    /// Fail scan calls numbered `from..from + count` (1-based)
    pub fn fail_scans(&self, from: u64, count: u64, error: StoreError) {
        self.state
            .lock()
            .scan_faults
            .push(CallFault { from, count, error });
    }

    /// Fail pipeline calls numbered `from..from + count` (1-based)
    pub fn fail_applies(&self, from: u64, count: u64, error: StoreError) {
        self.state
            .lock()
            .apply_faults
            .push(CallFault { from, count, error });
    }

    /// Make topology discovery fail
    pub fn fail_topology(&self, reason: &str) {
        self.state.lock().topology_error = Some(reason.to_string());
    }

    /// Drop the connection; every later call fails
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    /// Return every remaining key in one page regardless of COUNT
    pub fn ignore_count(&self, ignore: bool) {
        self.state.lock().ignore_count = ignore;
    }

    /// Stall topology discovery, as a hung node would
    pub fn set_topology_delay(&self, delay: Duration) {
        self.state.lock().topology_delay = Some(delay);
    }

    pub fn set_scan_delay(&self, delay: Duration) {
        self.state.lock().scan_delay = Some(delay);
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        self.state.lock().apply_delay = Some(delay);
    }

    /// Let only `permits` more scans proceed; later scans wait for
    /// [`release_scans`](Self::release_scans)
    pub fn limit_scans(&self, permits: usize) {
        *self.scan_permits.lock() = Some(Arc::new(Semaphore::new(permits)));
    }

    /// Allow `permits` more gated scans
    pub fn release_scans(&self, permits: usize) {
        if let Some(sem) = self.scan_permits.lock().as_ref() {
            sem.add_permits(permits);
        }
    }

    pub fn scan_calls(&self) -> u64 {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn apply_calls(&self) -> u64 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Keys of every pipeline call that reached the store, in call order
    pub fn apply_log(&self) -> Vec<Vec<String>> {
        self.state.lock().apply_log.clone()
    }

    fn check_connected(&self) -> StoreResult<()> {
        if self.state.lock().disconnected {
            return Err(StoreError::Disconnected("memory store disconnected".to_string()));
        }
        Ok(())
    }

    fn apply_one(&self, data: &mut BTreeMap<String, StoredValue>, node: &NodeHandle, m: &Mutation) -> KeyOutcome {
        let key = m.key();
        match m {
            Mutation::Delete(_) | Mutation::Unlink(_) => match data.remove(key) {
                Some(_) => KeyOutcome::ok(key),
                None => KeyOutcome::failed(key, "key not found"),
            },
            Mutation::Set { value, .. } => {
                if !node.owns_key(key) {
                    return KeyOutcome::failed(
                        key,
                        format!("MOVED {}", key_hash_slot(key.as_bytes())),
                    );
                }
                data.insert(
                    key.to_string(),
                    StoredValue {
                        value: value.clone(),
                        key_type: KeyType::String,
                    },
                );
                KeyOutcome::ok(key)
            }
        }
    }
}

#[async_trait::async_trait]
impl ShardedStoreClient for MemoryStore {
    async fn list_primary_nodes(&self) -> StoreResult<Vec<NodeHandle>> {
        let delay = self.state.lock().topology_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check_connected()?;
        if let Some(reason) = self.state.lock().topology_error.clone() {
            return Err(StoreError::Topology(reason));
        }
        Ok(self.nodes.clone())
    }

    async fn scan_page(
        &self,
        node: &NodeHandle,
        cursor: &str,
        pattern: &str,
        key_type: Option<KeyType>,
        count: usize,
    ) -> StoreResult<(Vec<String>, String)> {
        let call = self.scan_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let gate = self.scan_permits.lock().clone();
        if let Some(sem) = gate {
            if let Ok(permit) = sem.acquire().await {
                permit.forget();
            }
        }

        let delay = self.state.lock().scan_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check_connected()?;
        let idx = self.node_index(node)?;
        let matcher = glob_regex(pattern)?;

        let state = self.state.lock();
        if let Some(fault) = state.scan_faults.iter().find(|f| f.hits(call)) {
            return Err(fault.error.clone());
        }

        let data = &state.data[idx];
        let lower = match cursor.strip_prefix(CURSOR_PREFIX) {
            Some(after) => Bound::Excluded(after.to_string()),
            None if cursor == CURSOR_START => Bound::Unbounded,
            None => return Err(StoreError::Command(format!("invalid cursor '{}'", cursor))),
        };

        let limit = if state.ignore_count { usize::MAX } else { count.max(1) };
        let mut examined = 0usize;
        let mut last = None;
        let mut keys = Vec::new();

        for (key, stored) in data.range((lower, Bound::Unbounded)) {
            if examined == limit {
                break;
            }
            examined += 1;
            last = Some(key.clone());
            let type_ok = key_type.map_or(true, |t| t == stored.key_type);
            if type_ok && matcher.is_match(key) {
                keys.push(key.clone());
            }
        }

        let next = match last {
            Some(last)
                if data
                    .range((Bound::Excluded(last.clone()), Bound::Unbounded))
                    .next()
                    .is_some() =>
            {
                format!("{}{}", CURSOR_PREFIX, last)
            }
            _ => CURSOR_START.to_string(),
        };

        Ok((keys, next))
    }

    async fn pipeline_apply(
        &self,
        node: &NodeHandle,
        mutations: &[Mutation],
    ) -> StoreResult<Vec<KeyOutcome>> {
        let call = self.apply_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = self.state.lock().apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check_connected()?;
        let idx = self.node_index(node)?;

        let mut state = self.state.lock();
        if let Some(fault) = state.apply_faults.iter().find(|f| f.hits(call)) {
            return Err(fault.error.clone());
        }

        let mut outcomes = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            if let Some(message) = state.failing_keys.get(mutation.key()) {
                outcomes.push(KeyOutcome::failed(mutation.key(), message.clone()));
                continue;
            }
            let outcome = self.apply_one(&mut state.data[idx], node, mutation);
            outcomes.push(outcome);
        }

        state
            .apply_log
            .push(mutations.iter().map(|m| m.key().to_string()).collect());
        Ok(outcomes)
    }
}

/// Compile a store glob (`*`, `?`, `[set]`, `[^set]`, `[a-z]`, `\` escapes)
/// into an anchored regex
pub fn glob_regex(pattern: &str) -> StoreResult<Regex> {
    let mut re = String::with_capacity(pattern.len() * 2 + 8);
    re.push_str("(?s)^");

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                re.push_str(&regex::escape(&chars[i].to_string()));
            }
            '[' => match glob_class(&chars[i + 1..]) {
                Some((class, used)) => {
                    re.push_str(&class);
                    i += used;
                }
                None => re.push_str(r"\["),
            },
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');

    Regex::new(&re)
        .map_err(|e| StoreError::Command(format!("invalid pattern '{}': {}", pattern, e)))
}

/// Translate the body of a `[...]` class; returns the regex class and how
/// many chars it consumed including the closing bracket
fn glob_class(body: &[char]) -> Option<(String, usize)> {
    let mut i = 0;
    let negate = body.first() == Some(&'^');
    if negate {
        i += 1;
    }

    let mut members = String::new();
    while i < body.len() && body[i] != ']' {
        if body[i] == '\\' && i + 1 < body.len() {
            i += 1;
        }
        let lo = body[i];
        if i + 2 < body.len() && body[i + 1] == '-' && body[i + 2] != ']' {
            let hi = body[i + 2];
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            members.push_str(&format!("{}-{}", class_char(lo), class_char(hi)));
            i += 3;
        } else {
            members.push_str(&class_char(lo));
            i += 1;
        }
    }

    if i >= body.len() || members.is_empty() {
        return None;
    }
    let class = format!("[{}{}]", if negate { "^" } else { "" }, members);
    Some((class, i + 1))
}

fn class_char(c: char) -> String {
    format!("\\x{{{:X}}}", c as u32)
}
