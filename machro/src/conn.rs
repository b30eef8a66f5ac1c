//! Pooled connection.
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

use crate::{
    Result, Value,
    common::{logged, verbose},
    error::StatusError,
    handle::{ConnHandle, StmtHandle, error_with_cause},
    pool::query_head,
    result::{ExecResult, QueryRow, Rows},
    row::{Row, RowNotFound},
    statement::PreparedStmt,
};

mod cache;

pub(crate) use cache::StmtCache;

/// A connection checked out of a [`Database`][crate::Database].
///
/// Hot queries keep their prepared statement in a per connection cache, see
/// [`ReusePolicy`][crate::ReusePolicy].
///
/// Dropping without [`close`][Conn::close] gives the pool permit back
/// immediately and disconnects in the background.
#[derive(Debug)]
pub struct Conn {
    handle: ConnHandle,
    user: String,
    cache: Arc<StmtCache>,
    permit: Option<OwnedSemaphorePermit>,
    closed: bool,
}

impl Conn {
    pub(crate) fn new(
        handle: ConnHandle,
        user: String,
        cache: StmtCache,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Conn {
        Self { handle, user, cache: Arc::new(cache), permit, closed: false }
    }

    /// Connected user, uppercased.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn session_id(&self) -> u64 {
        self.handle.session_id()
    }

    /// Underlying connection handle.
    pub fn handle(&self) -> &ConnHandle {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.handle.is_closed()
    }

    /// Last error of an operation on this connection.
    pub fn error(&self) -> Option<StatusError> {
        self.handle.error()
    }

    /// Number of prepared statements kept for reuse.
    pub fn cached_statements(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn alloc(&self) -> Result<StmtHandle> {
        self.handle.alloc_stmt().map_err(|e| error_with_cause(&self.handle, e))
    }

    /// A prepared statement of `query`, from the cache when allowed.
    async fn acquire(&self, query: &str) -> Result<StmtHandle> {
        if self.cache.reuses(query) {
            if let Some(stmt) = self.cache.take(query) {
                verbose!(id = stmt.id(), "Reuse statement");
                return Ok(stmt);
            }
        }

        let mut stmt = self.alloc()?;
        if let Err(err) = stmt.prepare(query).await {
            let err = error_with_cause(&stmt, err);
            free(stmt).await.ok();
            return Err(err);
        }
        Ok(stmt)
    }

    /// Execute `query`.
    ///
    /// Without arguments the text is sent as is on a one shot statement,
    /// otherwise it is prepared and the statement may be reused.
    pub async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        if args.is_empty() {
            let mut stmt = self.alloc()?;
            let result = match stmt.exec_direct(query).await {
                Ok(()) => Ok(ExecResult::new(stmt.stmt_type(), stmt.row_count(), &query_head(query))),
                Err(err) => Err(error_with_cause(&self.handle, err)),
            };
            if let Err(_err) = free(stmt).await {
                logged!(warn, "{_err}");
            }
            return result;
        }

        let mut stmt = self.acquire(query).await?;
        let result = match execute_args(&mut stmt, args).await {
            Ok(()) => Ok(ExecResult::new(stmt.stmt_type(), stmt.row_count(), &query_head(query))),
            Err(err) => Err(err),
        };
        let released = release(&self.cache, query, stmt, result.is_ok()).await;
        let result = result?;
        released.map(|_| result)
    }

    /// Execute `query` and iterate its rows.
    ///
    /// Closing or dropping the [`Rows`] gives the statement back to the cache.
    pub async fn query(&self, query: &str, args: &[Value]) -> Result<Rows<'static>> {
        let mut stmt = self.acquire(query).await?;
        if let Err(err) = execute_args(&mut stmt, args).await {
            release(&self.cache, query, stmt, false).await?;
            return Err(err);
        }
        Ok(Rows::pooled(stmt, self.cache.clone(), query.to_owned()))
    }

    /// Execute `query` and return its first row.
    ///
    /// Returns [`RowNotFound`] error when there is no row.
    pub async fn query_row(&self, query: &str, args: &[Value]) -> Result<QueryRow> {
        let mut stmt = self.acquire(query).await?;
        let result = fetch_one(&mut stmt, args).await;
        let reusable = match &result {
            Ok(_) => true,
            Err(err) => err.is_row_not_found(),
        };
        let released = release(&self.cache, query, stmt, reusable).await;
        let result = result?;
        released.map(|_| result)
    }

    /// Prepare `query` on a dedicated statement.
    pub async fn prepare(&self, query: &str) -> Result<PreparedStmt> {
        let mut stmt = self.alloc()?;
        if let Err(err) = stmt.prepare(query).await {
            let err = error_with_cause(&stmt, err);
            free(stmt).await.ok();
            return Err(err);
        }
        Ok(PreparedStmt::new(stmt))
    }

    /// Returns the execution plan of `query`, one line per row.
    pub async fn explain(&self, query: &str, full: bool) -> Result<String> {
        let sql = match full {
            true => format!("explain full {query}"),
            false => format!("explain {query}"),
        };

        let mut stmt = self.alloc()?;
        let result = match stmt.exec_direct(&sql).await {
            Ok(()) => {
                let mut lines = vec![];
                while let Some(row) = stmt.fetch_current() {
                    lines.push(row.first().map(Value::to_string).unwrap_or_default());
                }
                Ok(lines.join("\n"))
            }
            Err(err) => Err(error_with_cause(&self.handle, err)),
        };
        if let Err(_err) = free(stmt).await {
            logged!(warn, "{_err}");
        }
        result
    }

    /// Free every cached statement and disconnect, subsequent calls are no-op.
    ///
    /// The pool permit is given back even when an error is returned.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut result = Ok(());
        for stmt in self.cache.drain() {
            if let Err(err) = free(stmt).await {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        if let Err(err) = self.handle.disconnect().await {
            if result.is_ok() {
                result = Err(error_with_cause(&self.handle, err));
            }
        }

        self.permit.take();
        verbose!(session = self.handle.session_id(), "Closed");
        result
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let stmts = self.cache.drain();
        let handle = self.handle.clone();
        spawn_detached(async move {
            for stmt in stmts {
                free(stmt).await.ok();
            }
            handle.disconnect().await.ok();
        });
    }
}

// ===== Statement helpers =====

/// Bind `args` to the prepared parameters then execute.
///
/// Null arguments take the described parameter type.
pub(crate) async fn execute_args(stmt: &mut StmtHandle, args: &[Value]) -> Result<()> {
    let expect = stmt.num_params();
    if args.len() != expect {
        let msg = format!("parameter count mismatch (expect {expect}, got {})", args.len());
        return Err(StatusError::client(msg).into());
    }

    for (idx, arg) in args.iter().enumerate() {
        let sql_type = match arg.sql_type() {
            Some(ty) => ty,
            None => match stmt.describe_param(idx) {
                Ok(param) => param.sql_type,
                Err(err) => return Err(error_with_cause(&*stmt, err)),
            },
        };
        if let Err(err) = stmt.bind_param(idx, sql_type, arg.clone()) {
            return Err(error_with_cause(&*stmt, err));
        }
    }

    match stmt.execute().await {
        Ok(()) => Ok(()),
        Err(err) => Err(error_with_cause(&*stmt, err)),
    }
}

/// Execute with `args` and take the first row.
pub(crate) async fn fetch_one(stmt: &mut StmtHandle, args: &[Value]) -> Result<QueryRow> {
    execute_args(stmt, args).await?;
    let Some(values) = stmt.fetch_current().map(<[Value]>::to_vec) else {
        return Err(RowNotFound.into());
    };
    let row = Row::new(stmt.columns().clone(), values);
    Ok(QueryRow::new(row, stmt.row_count(), stmt.stmt_type()))
}

pub(crate) async fn free(mut stmt: StmtHandle) -> Result<()> {
    match stmt.free().await {
        Ok(()) => Ok(()),
        Err(err) => Err(error_with_cause(&stmt, err)),
    }
}

/// Give `stmt` back to the cache, or free it.
pub(crate) async fn release(cache: &StmtCache, query: &str, stmt: StmtHandle, reusable: bool) -> Result<()> {
    match release_now(cache, query, stmt, reusable) {
        Some(stmt) => free(stmt).await,
        None => Ok(()),
    }
}

/// Cache `stmt` without waiting, returns it back when it must be freed.
pub(crate) fn release_now(
    cache: &StmtCache,
    query: &str,
    mut stmt: StmtHandle,
    reusable: bool,
) -> Option<StmtHandle> {
    if !reusable || !cache.reuses(query) || stmt.is_closed() {
        return Some(stmt);
    }
    stmt.execute_clean();
    cache.put(query, stmt)
}

/// Free `stmt` in the background.
pub(crate) fn free_later(stmt: StmtHandle) {
    spawn_detached(async move {
        free(stmt).await.ok();
    });
}

pub(crate) fn spawn_detached<F>(task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(task);
        }
        Err(_) => {
            logged!(warn, "dropped outside of a tokio runtime, server resources are kept until disconnect");
        }
    }
}
