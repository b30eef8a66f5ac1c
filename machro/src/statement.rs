//! Explicitly prepared statement.
use crate::{
    Result, Value,
    conn::{execute_args, fetch_one, free, free_later},
    error::StatusError,
    handle::StmtHandle,
    pool::query_head,
    protocol::ColumnDesc,
    result::{ExecResult, QueryRow, Rows},
};

/// A statement prepared once by [`Conn::prepare`][crate::Conn::prepare]
/// and executed any number of times.
///
/// The statement belongs to this value, it is never shared with the
/// connection statement cache.
#[derive(Debug)]
pub struct PreparedStmt {
    stmt: Option<StmtHandle>,
    head: String,
}

impl PreparedStmt {
    pub(crate) fn new(stmt: StmtHandle) -> PreparedStmt {
        Self { head: query_head(stmt.sql()), stmt: Some(stmt) }
    }

    fn stmt(&mut self) -> Result<&mut StmtHandle> {
        match self.stmt.as_mut() {
            Some(stmt) => Ok(stmt),
            None => Err(StatusError::client("statement closed").into()),
        }
    }

    /// Prepared sql text, empty once closed.
    pub fn sql(&self) -> &str {
        self.stmt.as_ref().map(StmtHandle::sql).unwrap_or_default()
    }

    pub fn num_params(&self) -> usize {
        self.stmt.as_ref().map(StmtHandle::num_params).unwrap_or_default()
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        match &self.stmt {
            Some(stmt) => stmt.columns(),
            None => &[],
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stmt.is_none()
    }

    /// Execute with `args`, buffered rows are discarded.
    pub async fn exec(&mut self, args: &[Value]) -> Result<ExecResult> {
        let head = self.head.clone();
        let stmt = self.stmt()?;
        let result = execute_args(stmt, args).await;
        stmt.execute_clean();
        result?;
        Ok(ExecResult::new(stmt.stmt_type(), stmt.row_count(), &head))
    }

    /// Execute with `args` and iterate its rows.
    pub async fn query(&mut self, args: &[Value]) -> Result<Rows<'_>> {
        let stmt = self.stmt()?;
        execute_args(stmt, args).await?;
        Ok(Rows::prepared(stmt))
    }

    /// Execute with `args` and return its first row.
    pub async fn query_row(&mut self, args: &[Value]) -> Result<QueryRow> {
        let stmt = self.stmt()?;
        let result = fetch_one(stmt, args).await;
        stmt.execute_clean();
        result
    }

    /// Free the server statement, subsequent calls are no-op.
    pub async fn close(&mut self) -> Result<()> {
        match self.stmt.take() {
            Some(stmt) => free(stmt).await,
            None => Ok(()),
        }
    }
}

impl Drop for PreparedStmt {
    fn drop(&mut self) {
        if let Some(stmt) = self.stmt.take() {
            free_later(stmt);
        }
    }
}
