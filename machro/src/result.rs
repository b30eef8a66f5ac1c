//! Statement outcomes.
//!
//! - [`ExecResult`]
//! - [`QueryRow`]
//! - [`Rows`]
use std::{
    borrow::Cow,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use crate::{
    Error, Result,
    conn::{StmtCache, free_later, release, release_now},
    handle::StmtHandle,
    pool::query_head,
    protocol::{ColumnDesc, StmtType},
    row::{DecodeError, FromRow, Index, Decode, Row},
};

/// Outcome of [`Conn::exec`][crate::Conn::exec].
#[derive(Clone, Debug)]
pub struct ExecResult {
    message: String,
    rows_affected: i64,
    stmt_type: StmtType,
}

impl ExecResult {
    pub(crate) fn new(stmt_type: StmtType, rows_affected: i64, head: &str) -> ExecResult {
        Self { message: rows_message(stmt_type, head, rows_affected), rows_affected, stmt_type }
    }

    /// Human readable outcome, e.g. `a row inserted.`
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    pub fn stmt_type(&self) -> StmtType {
        self.stmt_type
    }
}

/// First row of a query.
#[derive(Debug)]
pub struct QueryRow {
    row: Row,
    rows_affected: i64,
    stmt_type: StmtType,
}

impl QueryRow {
    pub(crate) fn new(row: Row, rows_affected: i64, stmt_type: StmtType) -> QueryRow {
        Self { row, rows_affected, stmt_type }
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn into_row(self) -> Row {
        self.row
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        self.row.columns()
    }

    pub fn values(&self) -> &[crate::Value] {
        self.row.values()
    }

    pub fn try_get<I: Index, R: Decode>(&self, idx: I) -> Result<R, DecodeError> {
        self.row.try_get(idx)
    }

    pub fn decode<D: FromRow>(self) -> Result<D, DecodeError> {
        self.row.decode()
    }

    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    pub fn stmt_type(&self) -> StmtType {
        self.stmt_type
    }

    pub fn message(&self) -> String {
        row_message(self.stmt_type, self.rows_affected)
    }
}

enum Slot<'a> {
    Pooled {
        stmt: StmtHandle,
        cache: Arc<StmtCache>,
        query: String,
    },
    Prepared(&'a mut StmtHandle),
    Closed,
}

/// Rows of an executed statement.
///
/// Rows are buffered when the statement executes, iterating does not touch
/// the network. Closing gives the statement back, dropping does the same in
/// the background.
pub struct Rows<'a> {
    slot: Slot<'a>,
    columns: Arc<[ColumnDesc]>,
    rows_affected: i64,
    stmt_type: StmtType,
    head: String,
    err: Option<Error>,
}

impl<'a> Rows<'a> {
    pub(crate) fn pooled(stmt: StmtHandle, cache: Arc<StmtCache>, query: String) -> Rows<'static> {
        Rows {
            columns: stmt.columns().clone(),
            rows_affected: stmt.row_count(),
            stmt_type: stmt.stmt_type(),
            head: query_head(&query),
            err: None,
            slot: Slot::Pooled { stmt, cache, query },
        }
    }

    pub(crate) fn prepared(stmt: &'a mut StmtHandle) -> Rows<'a> {
        Rows {
            columns: stmt.columns().clone(),
            rows_affected: stmt.row_count(),
            stmt_type: stmt.stmt_type(),
            head: query_head(stmt.sql()),
            err: None,
            slot: Slot::Prepared(stmt),
        }
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    pub fn stmt_type(&self) -> StmtType {
        self.stmt_type
    }

    pub fn message(&self) -> String {
        rows_message(self.stmt_type, &self.head, self.rows_affected)
    }

    /// Returns `true` if the statement is an open `SELECT`.
    pub fn is_fetchable(&self) -> bool {
        !matches!(self.slot, Slot::Closed) && self.head == "SELECT"
    }

    /// Next buffered row.
    pub fn next(&mut self) -> Option<Row> {
        let stmt = match &mut self.slot {
            Slot::Pooled { stmt, .. } => stmt,
            Slot::Prepared(stmt) => &mut **stmt,
            Slot::Closed => return None,
        };
        let values = stmt.fetch_current()?.to_vec();
        Some(Row::new(self.columns.clone(), values))
    }

    /// Next row decoded as `D`.
    ///
    /// A decode failure ends the iteration, see [`err`][Rows::err].
    pub fn next_as<D: FromRow>(&mut self) -> Option<D> {
        match self.next()?.decode() {
            Ok(ok) => Some(ok),
            Err(err) => {
                self.err = Some(err.into());
                None
            }
        }
    }

    /// Error that ended the iteration.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Give the statement back, subsequent [`next`][Rows::next] returns [`None`].
    pub async fn close(mut self) -> Result<()> {
        match std::mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Pooled { stmt, cache, query } => release(&cache, &query, stmt, true).await,
            Slot::Prepared(stmt) => {
                stmt.execute_clean();
                Ok(())
            }
            Slot::Closed => Ok(()),
        }
    }
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Pooled { stmt, cache, query } => {
                if let Some(stmt) = release_now(&cache, &query, stmt, true) {
                    free_later(stmt);
                }
            }
            Slot::Prepared(stmt) => stmt.execute_clean(),
            Slot::Closed => {}
        }
    }
}

impl futures_core::Stream for Rows<'_> {
    type Item = Row;

    fn poll_next(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().next())
    }
}

impl std::fmt::Debug for Rows<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.columns)
            .field("rows_affected", &self.rows_affected)
            .field("stmt_type", &self.stmt_type)
            .finish()
    }
}

// ===== Messages =====

fn canned(head: &str) -> Option<&'static str> {
    match head {
        "CREATE" => Some("Created successfully."),
        "DROP" => Some("Dropped successfully."),
        "TRUNCATE" => Some("Truncated successfully."),
        "ALTER" => Some("Altered successfully."),
        "CONNECT" => Some("Connected successfully."),
        _ => None,
    }
}

fn count_phrase(count: i64) -> Cow<'static, str> {
    match count {
        0 => "no rows".into(),
        1 => "a row".into(),
        n => format!("{} rows", grouped(n)).into(),
    }
}

/// Decimal with `,` every three digits.
fn grouped(n: i64) -> String {
    let mut buf = itoa::Buffer::new();
    let digits = buf.format(n.unsigned_abs());
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Message of an executed statement, `head` is the first sql keyword.
pub(crate) fn rows_message(stmt_type: StmtType, head: &str, count: i64) -> String {
    let verb = match stmt_type {
        ty if ty.is_ddl() => return canned(head).unwrap_or("executed.").into(),
        ty if ty.is_alter_system() => return canned(head).unwrap_or("system altered.").into(),
        ty if ty.is_select() => "selected.",
        ty if ty.is_insert() => "inserted.",
        ty if ty.is_delete() => "deleted.",
        ty if ty.is_insert_select() => "inserted from select.",
        ty if ty.is_update() => "updated.",
        ty if ty.is_exec_rollup() => return "rollup executed.".into(),
        StmtType(n) => return format!("executed ({n})."),
    };
    format!("{} {verb}", count_phrase(count))
}

/// Message of a single row query.
pub(crate) fn row_message(stmt_type: StmtType, count: i64) -> String {
    let rows = match count {
        1 => "a row".into(),
        n if n > 1 => count_phrase(n),
        _ => "no rows".into(),
    };
    match stmt_type {
        ty if ty.is_select() => format!("{rows} selected."),
        ty if ty.is_insert() => format!("{rows} inserted."),
        ty if ty.is_update() => format!("{rows} updated."),
        ty if ty.is_delete() => format!("{rows} deleted."),
        ty if ty.is_insert_select() => format!("{rows} inserted from select."),
        ty if ty.is_alter_system() => "system altered.".into(),
        ty if ty.is_ddl() => "ok.".into(),
        StmtType(n) => format!("ok.({n})"),
    }
}
