//! Prepared statement tracking and caching.
//!
//! This module provides:
//! - `Key`: the identity of a query (text plus parameter type OIDs)
//! - `Prepare`: the per-execution decision handed to the protocol driver
//! - `PrepareManager`: O(1) LRU record of what is prepared on a connection
//!
//! The manager never talks to the server. When its view of the server state
//! changes it returns a `MaintenanceCommand` that the caller must send,
//! typically ahead of the next query. A command that is never sent leaves the
//! cache out of sync with the server; nothing here detects that.

use std::fmt;

use bytes::Bytes;
use lru::LruCache;
use smallvec::SmallVec;
use tracing::debug;

use crate::config::PrepareConfig;

/// PostgreSQL type OID.
pub type Oid = u32;

// ============================================================================
// Query Key
// ============================================================================

/// Cache key: raw query bytes and the parameter type OIDs, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    query: Bytes,
    types: SmallVec<[Oid; 8]>,
}

impl Key {
    /// Build a key from the query text and its parameter types.
    pub fn new(query: &[u8], types: &[Oid]) -> Self {
        Self {
            query: Bytes::copy_from_slice(query),
            types: SmallVec::from_slice(types),
        }
    }

    /// The query text.
    pub fn query(&self) -> &[u8] {
        &self.query
    }

    /// The parameter type OIDs.
    pub fn types(&self) -> &[Oid] {
        &self.types
    }
}

/// What the cache knows about a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Number of times the query was executed without being prepared.
    Seen(u32),
    /// Name of the server-side prepared statement.
    Prepared(Bytes),
}

// ============================================================================
// Decisions and Results
// ============================================================================

/// How the driver should execute a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepare {
    /// Don't prepare: send the query text.
    No,
    /// Already prepared under this name: execute it.
    Yes(Bytes),
    /// Prepare it now under this new name, then execute it.
    Should(Bytes),
}

impl Prepare {
    /// The statement name, if any.
    pub fn name(&self) -> Option<&Bytes> {
        match self {
            Prepare::No => None,
            Prepare::Yes(name) | Prepare::Should(name) => Some(name),
        }
    }
}

/// Execution status of one server result, as far as the cache cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Command completed and returned no rows.
    CommandOk,
    /// Command completed and returned rows.
    TuplesOk,
    /// Anything else: errors, COPY, empty query...
    Other,
}

/// Summary of one result returned by the server for an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSummary {
    pub status: ExecStatus,
    /// Command tag (e.g. `SELECT 5` or `DROP TABLE`)
    pub command_tag: Option<Bytes>,
}

impl ResultSummary {
    /// Create a summary with a command tag.
    pub fn new(status: ExecStatus, command_tag: &[u8]) -> Self {
        Self {
            status,
            command_tag: Some(Bytes::copy_from_slice(command_tag)),
        }
    }

    /// Create a summary for a result that carries no command tag.
    pub fn untagged(status: ExecStatus) -> Self {
        Self {
            status,
            command_tag: None,
        }
    }

    /// True if this result means server-side prepared statements may refer to
    /// objects that no longer exist (rollback, or any `DROP ...`).
    fn invalidates_prepared(&self) -> bool {
        if self.status != ExecStatus::CommandOk {
            return false;
        }
        match &self.command_tag {
            Some(tag) => {
                let first = tag[..]
                    .split(|b| b.is_ascii_whitespace())
                    .next()
                    .unwrap_or_default();
                first == b"DROP" || &tag[..] == b"ROLLBACK"
            }
            None => false,
        }
    }
}

/// A command the caller has to send to keep the server in sync with the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceCommand {
    /// `DEALLOCATE ALL`
    DeallocateAll,
    /// `DEALLOCATE <name>`
    Deallocate(Bytes),
}

impl MaintenanceCommand {
    /// The SQL text to send to the server.
    pub fn as_sql(&self) -> Bytes {
        match self {
            MaintenanceCommand::DeallocateAll => Bytes::from_static(b"DEALLOCATE ALL"),
            MaintenanceCommand::Deallocate(name) => {
                let mut sql = Vec::with_capacity(11 + name.len());
                sql.extend_from_slice(b"DEALLOCATE ");
                sql.extend_from_slice(name);
                Bytes::from(sql)
            }
        }
    }
}

impl fmt::Display for MaintenanceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.as_sql()))
    }
}

// ============================================================================
// Prepare Manager (O(1) LRU)
// ============================================================================

/// Per-connection record of executed and prepared queries.
///
/// Queries are counted until they reach `prepare_threshold` executions, then
/// prepared under a connection-unique name. At most `prepared_max` entries are
/// tracked (counted and prepared together); the least recently used entry is
/// evicted first, and deallocated on the server if it was prepared.
///
/// A connection is never used concurrently, so there is no locking here.
pub struct PrepareManager {
    /// Number of executions before a query is prepared (`None` = never).
    prepare_threshold: Option<u32>,
    /// Maximum number of tracked entries.
    prepared_max: usize,
    /// key → execution count or prepared statement name, in recency order.
    /// Unbounded: eviction is done by hand so it can emit a command.
    prepared: LruCache<Key, Value>,
    /// Counter for generating unique statement names
    prepared_idx: u64,
}

impl PrepareManager {
    /// Create a manager from its configuration.
    pub fn new(config: PrepareConfig) -> Self {
        Self {
            prepare_threshold: config.prepare_threshold,
            prepared_max: config.prepared_max,
            prepared: LruCache::unbounded(),
            prepared_idx: 0,
        }
    }

    /// Current prepare threshold.
    pub fn prepare_threshold(&self) -> Option<u32> {
        self.prepare_threshold
    }

    /// Change the prepare threshold. `None` disables preparing.
    pub fn set_prepare_threshold(&mut self, threshold: Option<u32>) {
        self.prepare_threshold = threshold;
    }

    /// Current capacity.
    pub fn prepared_max(&self) -> usize {
        self.prepared_max
    }

    /// Change the capacity.
    ///
    /// Shrinking doesn't evict anything now: every later `record()` that adds
    /// an entry evicts one, so the excess is deallocated gradually.
    pub fn set_prepared_max(&mut self, max: usize) {
        self.prepared_max = max;
    }

    /// Check if a query is prepared, tell back whether to prepare it.
    ///
    /// `prepare` is the caller's explicit choice: `Some(false)` never
    /// prepares, `Some(true)` prepares regardless of the count.
    pub fn decide(&mut self, key: &Key, prepare: Option<bool>) -> Prepare {
        let threshold = match self.prepare_threshold {
            Some(threshold) if prepare != Some(false) => threshold,
            _ => return Prepare::No,
        };

        let seen = match self.prepared.peek(key) {
            Some(Value::Prepared(name)) => return Prepare::Yes(name.clone()),
            Some(Value::Seen(count)) => *count,
            None => 0,
        };

        if seen >= threshold || prepare == Some(true) {
            Prepare::Should(self.next_statement_name())
        } else {
            Prepare::No
        }
    }

    /// Update the cache after `key` was executed with decision `prep` and the
    /// server answered with `results`.
    ///
    /// Returns the command the caller must send, if any.
    pub fn record(
        &mut self,
        key: &Key,
        prep: &Prepare,
        results: &[ResultSummary],
    ) -> Option<MaintenanceCommand> {
        if self.prepare_threshold.is_none() {
            return None;
        }

        if let Some(cmd) = self.should_discard(prep, results) {
            return Some(cmd);
        }

        if let Some(value) = self.prepared.get_mut(key) {
            // get_mut already moved the entry to the most recently used end.
            if let Value::Seen(count) = *value {
                *value = match prep {
                    Prepare::Should(name) => {
                        debug!(name = %String::from_utf8_lossy(name), "promoting query to prepared");
                        Value::Prepared(name.clone())
                    }
                    _ => Value::Seen(count.saturating_add(1)),
                };
            }
            return None;
        }

        // The query is not in cache. Let's see if we must add it.
        if results.len() != 1 {
            // We cannot prepare a multiple statement
            return None;
        }
        if !matches!(results[0].status, ExecStatus::CommandOk | ExecStatus::TuplesOk) {
            // We don't prepare failed queries or other weird results
            return None;
        }

        let value = match prep {
            Prepare::Should(name) => Value::Prepared(name.clone()),
            _ => Value::Seen(1),
        };
        self.prepared.put(key.clone(), value);

        // Evict only once: if the cache was shrunk, drain it gradually.
        if self.prepared.len() <= self.prepared_max {
            return None;
        }
        match self.prepared.pop_lru() {
            Some((_, Value::Prepared(name))) => {
                debug!(name = %String::from_utf8_lossy(&name), "evicting prepared statement");
                Some(MaintenanceCommand::Deallocate(name))
            }
            _ => None,
        }
    }

    /// Forget everything prepared on the connection.
    ///
    /// Returns `DeallocateAll` if a name was ever handed out, else leaves the
    /// state untouched.
    pub fn reset(&mut self) -> Option<MaintenanceCommand> {
        if self.prepared_idx == 0 {
            return None;
        }
        self.prepared.clear();
        self.prepared_idx = 0;
        Some(MaintenanceCommand::DeallocateAll)
    }

    /// Peek at the value for a key without touching its recency.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.prepared.peek(key)
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.prepared.len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.prepared.is_empty()
    }

    /// Tracked keys, least recently used first.
    pub fn keys_lru(&self) -> Vec<&Key> {
        self.prepared.iter().rev().map(|(key, _)| key).collect()
    }

    /// Names of the statements currently prepared on the server.
    pub fn prepared_names(&self) -> Vec<Bytes> {
        self.prepared
            .iter()
            .filter_map(|(_, value)| match value {
                Value::Prepared(name) => Some(name.clone()),
                Value::Seen(_) => None,
            })
            .collect()
    }

    /// Drop the whole state if `results` contain a rollback or a `DROP`:
    /// the same objects may get recreated and the server would fail internal
    /// lookups for statements prepared against the old ones.
    fn should_discard(
        &mut self,
        prep: &Prepare,
        results: &[ResultSummary],
    ) -> Option<MaintenanceCommand> {
        if self.prepared.is_empty() && !matches!(prep, Prepare::Should(_)) {
            return None;
        }
        if results.iter().any(ResultSummary::invalidates_prepared) {
            debug!(entries = self.prepared.len(), "discarding prepared statements");
            self.prepared.clear();
            return Some(MaintenanceCommand::DeallocateAll);
        }
        None
    }

    /// Generate a unique statement name for this connection.
    fn next_statement_name(&mut self) -> Bytes {
        let name = format!("_pg3_{}", self.prepared_idx);
        self.prepared_idx += 1;
        Bytes::from(name)
    }
}

impl Default for PrepareManager {
    fn default() -> Self {
        Self::new(PrepareConfig::default())
    }
}
