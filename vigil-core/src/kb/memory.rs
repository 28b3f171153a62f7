//! In-process KB store with the list/hash semantics of the Redis commands the
//! client issues. Clones share one store, so several contexts (and simulated
//! engines) observe each other exactly as separate processes would through
//! the real server.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use super::{KbConnection, KbConnector, KbContext, KbError, KbResult, RetryPolicy};

#[derive(Debug)]
enum Value {
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug)]
struct MemoryState {
    databases: Vec<HashMap<String, Value>>,
    config: HashMap<String, String>,
    commands: u64,
    failing: HashSet<&'static str>,
    refused_connections: u32,
}

/// Shared in-memory store.
#[derive(Clone, Debug)]
pub struct MemoryKb {
    state: Arc<Mutex<MemoryState>>,
    /// Connections opened before the current epoch are dead.
    epoch: Arc<AtomicU64>,
}

impl MemoryKb {
    /// Store with `databases` logical databases, advertised through the
    /// `databases` server setting like a real server does.
    pub fn new(databases: usize) -> Self {
        let mut config = HashMap::new();
        config.insert("databases".to_string(), databases.to_string());
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                databases: (0..databases.max(1)).map(|_| HashMap::new()).collect(),
                config,
                commands: 0,
                failing: HashSet::new(),
                refused_connections: 0,
            })),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A context on database 0.
    pub fn context(&self) -> KbContext {
        KbContext::new(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            current_epoch: Arc::clone(&self.epoch),
            epoch: self.epoch.load(Ordering::SeqCst),
            index: 0,
        }))
    }

    /// Overrides (or with `None`, removes) a server setting.
    pub async fn set_server_config(&self, name: &str, value: Option<&str>) {
        let mut state = self.state.lock().await;
        match value {
            Some(value) => state.config.insert(name.to_string(), value.to_string()),
            None => state.config.remove(name),
        };
    }

    /// Makes every subsequent `command` fail as a transport error would.
    pub async fn fail_command(&self, command: &'static str) {
        self.state.lock().await.failing.insert(command);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failing.clear();
    }

    /// Refuse the next `count` connection attempts.
    pub async fn refuse_connections(&self, count: u32) {
        self.state.lock().await.refused_connections = count;
    }

    /// Breaks every open connection, as a server restart would. Contexts
    /// opened afterwards work normally.
    pub fn drop_connections(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Commands that reached the store so far.
    pub async fn command_count(&self) -> u64 {
        self.state.lock().await.commands
    }
}

#[derive(Debug)]
struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    current_epoch: Arc<AtomicU64>,
    epoch: u64,
    index: usize,
}

impl MemoryConnection {
    async fn begin(&self, command: &'static str) -> KbResult<MutexGuard<'_, MemoryState>> {
        if self.epoch != self.current_epoch.load(Ordering::SeqCst) {
            return Err(KbError::Connection("connection reset by peer".to_string()));
        }
        let mut state = self.state.lock().await;
        state.begin(command)?;
        Ok(state)
    }
}

impl MemoryState {
    fn begin(&mut self, command: &'static str) -> KbResult<()> {
        self.commands += 1;
        if self.failing.contains(command) {
            return Err(KbError::command(command, "injected failure"));
        }
        Ok(())
    }

    fn db(&mut self, index: usize) -> KbResult<&mut HashMap<String, Value>> {
        self.databases
            .get_mut(index)
            .ok_or_else(|| KbError::command("SELECT", "DB index is out of range"))
    }

    fn list_mut(
        &mut self,
        index: usize,
        key: &str,
        create: bool,
    ) -> KbResult<Option<&mut VecDeque<String>>> {
        let db = self.db(index)?;
        if create && !db.contains_key(key) {
            db.insert(key.to_string(), Value::List(VecDeque::new()));
        }
        match db.get_mut(key) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(Some(list)),
            Some(Value::Hash(_)) => Err(wrong_type()),
        }
    }

    fn drop_if_empty(&mut self, index: usize, key: &str) {
        if let Some(db) = self.databases.get_mut(index) {
            let empty = match db.get(key) {
                Some(Value::List(list)) => list.is_empty(),
                Some(Value::Hash(hash)) => hash.is_empty(),
                None => false,
            };
            if empty {
                db.remove(key);
            }
        }
    }
}

fn wrong_type() -> KbError {
    KbError::command(
        "WRONGTYPE",
        "Operation against a key holding the wrong kind of value",
    )
}

fn normalize(len: usize, index: isize) -> Option<usize> {
    let len = len as isize;
    let idx = if index < 0 { len + index } else { index };
    (0..len).contains(&idx).then_some(idx as usize)
}

#[async_trait]
impl KbConnection for MemoryConnection {
    async fn select(&mut self, index: usize) -> KbResult<()> {
        self.begin("SELECT").await?.db(index)?;
        self.index = index;
        Ok(())
    }

    async fn rpush(&mut self, key: &str, values: &[String]) -> KbResult<()> {
        let mut state = self.begin("RPUSH").await?;
        if let Some(list) = state.list_mut(self.index, key, true)? {
            list.extend(values.iter().cloned());
        }
        Ok(())
    }

    async fn lpush(&mut self, key: &str, values: &[String]) -> KbResult<()> {
        let mut state = self.begin("LPUSH").await?;
        if let Some(list) = state.list_mut(self.index, key, true)? {
            for value in values {
                list.push_front(value.clone());
            }
        }
        Ok(())
    }

    async fn lrange(&mut self, key: &str) -> KbResult<Vec<String>> {
        let mut state = self.begin("LRANGE").await?;
        Ok(state
            .list_mut(self.index, key, false)?
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn rpop(&mut self, key: &str) -> KbResult<Option<String>> {
        let mut state = self.begin("RPOP").await?;
        let popped = state
            .list_mut(self.index, key, false)?
            .and_then(|list| list.pop_back());
        state.drop_if_empty(self.index, key);
        Ok(popped)
    }

    async fn lindex(&mut self, key: &str, index: isize) -> KbResult<Option<String>> {
        let mut state = self.begin("LINDEX").await?;
        Ok(state.list_mut(self.index, key, false)?.and_then(|list| {
            normalize(list.len(), index).and_then(|idx| list.get(idx).cloned())
        }))
    }

    async fn lrem_all(&mut self, key: &str, value: &str) -> KbResult<usize> {
        let mut state = self.begin("LREM").await?;
        let removed = match state.list_mut(self.index, key, false)? {
            Some(list) => {
                let before = list.len();
                list.retain(|item| item != value);
                before - list.len()
            }
            None => 0,
        };
        state.drop_if_empty(self.index, key);
        Ok(removed)
    }

    async fn replace_list(&mut self, key: &str, values: &[String]) -> KbResult<()> {
        let mut state = self.begin("MULTI").await?;
        let db = state.db(self.index)?;
        db.insert(
            key.to_string(),
            Value::List(values.iter().cloned().collect()),
        );
        Ok(())
    }

    async fn keys(&mut self, pattern: &str) -> KbResult<Vec<String>> {
        let mut state = self.begin("KEYS").await?;
        let db = state.db(self.index)?;
        let mut keys: Vec<String> = db
            .keys()
            .filter(|key| glob_match(pattern.as_bytes(), key.as_bytes()))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hsetnx(&mut self, key: &str, field: &str, value: &str) -> KbResult<bool> {
        let mut state = self.begin("HSETNX").await?;
        let db = state.db(self.index)?;
        let entry = db
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        match entry {
            Value::Hash(hash) => {
                if hash.contains_key(field) {
                    Ok(false)
                } else {
                    hash.insert(field.to_string(), value.to_string());
                    Ok(true)
                }
            }
            Value::List(_) => Err(wrong_type()),
        }
    }

    async fn hdel(&mut self, key: &str, field: &str) -> KbResult<()> {
        let mut state = self.begin("HDEL").await?;
        let db = state.db(self.index)?;
        match db.get_mut(key) {
            Some(Value::Hash(hash)) => {
                hash.remove(field);
            }
            Some(Value::List(_)) => return Err(wrong_type()),
            None => {}
        }
        state.drop_if_empty(self.index, key);
        Ok(())
    }

    async fn config_get(&mut self, name: &str) -> KbResult<Option<String>> {
        let mut state = self.begin("CONFIG").await?;
        Ok(state.config.get(name).cloned())
    }

    async fn flushdb(&mut self) -> KbResult<()> {
        let mut state = self.begin("FLUSHDB").await?;
        state.db(self.index)?.clear();
        Ok(())
    }
}

/// Redis-style glob: `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\` escapes.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = match_class(pattern, p, text[t])
                        && matched
                    {
                        p = next;
                        t += 1;
                        continue;
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }

        match backtrack {
            Some((star, consumed)) => {
                p = star + 1;
                t = consumed + 1;
                backtrack = Some((star, consumed + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Matches `c` against the class opening at `pattern[start]`. Returns the
/// outcome and the index just past the closing bracket.
fn match_class(pattern: &[u8], start: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < pattern.len() && pattern[i] != b']' {
        if pattern[i] == b'\\' && i + 1 < pattern.len() {
            matched |= pattern[i + 1] == c;
            i += 2;
        } else if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
            let (lo, hi) = (pattern[i].min(pattern[i + 2]), pattern[i].max(pattern[i + 2]));
            matched |= (lo..=hi).contains(&c);
            i += 3;
        } else {
            matched |= pattern[i] == c;
            i += 1;
        }
    }

    (i < pattern.len()).then_some((matched != negate, i + 1))
}

/// Hands out contexts on a [`MemoryKb`] with the same retry policy the Redis
/// connector applies.
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    kb: MemoryKb,
    retry: RetryPolicy,
}

impl MemoryConnector {
    pub fn new(kb: MemoryKb, retry: RetryPolicy) -> Self {
        Self { kb, retry }
    }

    pub fn store(&self) -> &MemoryKb {
        &self.kb
    }
}

#[async_trait]
impl KbConnector for MemoryConnector {
    async fn connect(&self) -> KbResult<KbContext> {
        super::connect_with_retry(&self.retry, "memory://", || async {
            let mut state = self.kb.state.lock().await;
            if state.refused_connections > 0 {
                state.refused_connections -= 1;
                return Err(KbError::Connection("connection refused".to_string()));
            }
            drop(state);
            Ok(self.kb.context())
        })
        .await
    }
}
