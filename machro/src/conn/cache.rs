use std::{collections::HashMap, sync::Mutex};

use crate::{handle::StmtHandle, pool::ReusePolicy};

/// Prepared statements kept for reuse, keyed by query text.
///
/// The most recently released statement sits in a single fast slot, the rest
/// in a multimap bounded in total and per query.
#[derive(Debug)]
pub(crate) struct StmtCache {
    policy: ReusePolicy,
    cap: usize,
    per_key: usize,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    fast: Option<(String, StmtHandle)>,
    pool: HashMap<String, Vec<StmtHandle>>,
    count: usize,
}

impl StmtCache {
    pub(crate) fn new(policy: ReusePolicy, cap: usize, per_key: usize) -> StmtCache {
        Self { policy, cap, per_key, state: Mutex::default() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn reuses(&self, query: &str) -> bool {
        self.policy.reuses(query)
    }

    /// Take a prepared statement of `query`, fast slot first.
    pub(crate) fn take(&self, query: &str) -> Option<StmtHandle> {
        let mut state = self.lock();

        if state.fast.as_ref().is_some_and(|(key, _)| key == query) {
            return state.fast.take().map(|(_, stmt)| stmt);
        }

        let stmts = state.pool.get_mut(query)?;
        let stmt = stmts.pop();
        if stmts.is_empty() {
            state.pool.remove(query);
        }
        if stmt.is_some() {
            state.count = state.count.saturating_sub(1);
        }
        stmt
    }

    /// Keep `stmt` for `query`, returns it back when the cache is full.
    pub(crate) fn put(&self, query: &str, stmt: StmtHandle) -> Option<StmtHandle> {
        let mut state = self.lock();

        if state.fast.is_none() {
            state.fast = Some((query.to_owned(), stmt));
            return None;
        }

        if state.count >= self.cap {
            return Some(stmt);
        }
        let stmts = state.pool.entry(query.to_owned()).or_default();
        if stmts.len() >= self.per_key {
            return Some(stmt);
        }
        stmts.push(stmt);
        state.count += 1;
        None
    }

    /// Remove every cached statement.
    pub(crate) fn drain(&self) -> Vec<StmtHandle> {
        let mut state = self.lock();
        let mut stmts = Vec::with_capacity(state.count + 1);
        stmts.extend(state.fast.take().map(|(_, stmt)| stmt));
        stmts.extend(state.pool.drain().flat_map(|(_, stmts)| stmts));
        state.count = 0;
        stmts
    }

    /// Number of cached statements.
    pub(crate) fn len(&self) -> usize {
        let state = self.lock();
        state.count + state.fast.is_some() as usize
    }
}
