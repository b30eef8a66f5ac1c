use std::{collections::BTreeMap, sync::Arc};

use super::{ConnHandle, append::AppendState};
use crate::{
    Result, Value,
    bind::{self, BoundParam},
    common::{logged, verbose},
    error::StatusError,
    protocol::{ColumnDesc, ParamDesc, SqlType, StmtResponse, StmtType},
};

/// Parameter index is one byte on the wire, 1 based.
const MAX_PARAM: usize = u8::MAX as usize;

/// A statement slot of a connection.
///
/// The server side statement is released by [`free`][StmtHandle::free],
/// dropping the handle without it leaks the statement id until disconnect.
#[derive(Debug)]
pub struct StmtHandle {
    pub(super) conn: ConnHandle,
    pub(super) id: u32,
    closed: bool,
    prepared: bool,
    sql: String,
    stmt_type: StmtType,
    row_count: i64,
    columns: Arc<[ColumnDesc]>,
    params: Vec<ParamDesc>,
    bound: BTreeMap<usize, BoundParam>,
    rows: Vec<Vec<Value>>,
    pos: usize,
    current: Option<usize>,
    pub(super) app: Option<AppendState>,
    pub(super) last_err: Option<StatusError>,
}

impl StmtHandle {
    pub(super) fn new(conn: ConnHandle, id: u32) -> StmtHandle {
        Self {
            conn,
            id,
            closed: false,
            prepared: false,
            sql: String::new(),
            stmt_type: StmtType::UNKNOWN,
            row_count: 0,
            columns: Arc::from([]),
            params: vec![],
            bound: BTreeMap::new(),
            rows: vec![],
            pos: 0,
            current: None,
            app: None,
            last_err: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn connection(&self) -> &ConnHandle {
        &self.conn
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Last error of an operation on this statement.
    pub fn error(&self) -> Option<StatusError> {
        self.last_err.clone()
    }

    /// Record the outcome on this statement and its connection.
    pub(super) fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        self.last_err = result.as_ref().err().map(crate::Error::status);
        self.conn.record(&result);
        result
    }

    /// Record a client error on this statement only.
    pub(super) fn reject<T>(&mut self, message: &'static str) -> Result<T> {
        let err = StatusError::client(message);
        self.last_err = Some(err.clone());
        Err(err.into())
    }

    fn ensure_open(&mut self) -> Result<()> {
        match self.closed || self.conn.is_closed() {
            true => self.reject("statement closed"),
            false => Ok(()),
        }
    }

    /// Release the server statement and its id, subsequent calls are no-op.
    ///
    /// The id is only reused when the server confirmed the release.
    pub async fn free(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        verbose!(id = self.id, "Free statement");

        let native = self.conn.native();
        let result = native.free(self.id).await;
        match &result {
            Ok(()) => native.release_stmt_id(self.id),
            Err(_err) => {
                logged!(warn, "failed to free statement {}: {_err}", self.id);
            }
        }
        self.settle(result)
    }

    // ===== Execution =====

    pub async fn prepare(&mut self, sql: &str) -> Result<()> {
        self.ensure_open()?;
        let result = self.conn.native().prepare(self.id, sql).await;
        let res = self.settle(result)?;

        self.prepared = true;
        self.sql = sql.to_owned();
        self.stmt_type = res.stmt_type;
        self.row_count = res.row_count;
        self.columns = res.columns.into();
        self.params = res.params;
        self.reset_rows(vec![]);
        Ok(())
    }

    /// Execute the prepared statement with the bound parameters.
    ///
    /// Parameters never bound are sent as null strings.
    pub async fn execute(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.prepared {
            return self.reject("statement is not prepared");
        }

        let count = match self.params.len() {
            0 => self.bound.keys().next_back().map(|e| e + 1).unwrap_or_default(),
            n => n,
        };
        let params = (0..count)
            .map(|i| self.bound.get(&i).cloned().unwrap_or_else(BoundParam::null))
            .collect::<Vec<_>>();

        let result = match bind::encode_params(&params) {
            Ok(payload) => {
                let native = self.conn.native();
                native.execute(self.id, &self.sql, &self.columns, &payload).await
            }
            Err(err) => Err(err.into()),
        };
        let res = self.settle(result)?;
        self.apply(res, false);
        Ok(())
    }

    /// Execute sql text without prepare.
    pub async fn exec_direct(&mut self, sql: &str) -> Result<()> {
        self.ensure_open()?;
        let result = self.conn.native().exec_direct(self.id, sql).await;
        let res = self.settle(result)?;

        self.prepared = false;
        self.sql = sql.to_owned();
        self.params = res.params.clone();
        self.apply(res, true);
        Ok(())
    }

    fn apply(&mut self, res: StmtResponse, replace_columns: bool) {
        self.stmt_type = res.stmt_type;
        self.row_count = res.row_count;
        if replace_columns || !res.columns.is_empty() {
            self.columns = res.columns.into();
        }
        self.reset_rows(res.rows);
    }

    fn reset_rows(&mut self, rows: Vec<Vec<Value>>) {
        self.rows = rows;
        self.pos = 0;
        self.current = None;
    }

    /// Drop buffered rows so the statement can be executed again.
    pub fn execute_clean(&mut self) {
        self.reset_rows(vec![]);
    }

    // ===== Parameters =====

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn describe_param(&mut self, idx: usize) -> Result<ParamDesc> {
        match self.params.get(idx) {
            Some(param) => Ok(*param),
            None => self.reject("invalid parameter index"),
        }
    }

    /// Bind a 0 based parameter, [`Value::Null`] binds null.
    pub fn bind_param(&mut self, idx: usize, sql_type: SqlType, value: impl Into<Value>) -> Result<()> {
        if idx >= MAX_PARAM {
            return self.reject("invalid parameter index");
        }
        self.bound.insert(idx, BoundParam::new(sql_type, value));
        self.last_err = None;
        Ok(())
    }

    // ===== Result =====

    pub fn row_count(&self) -> i64 {
        self.row_count
    }

    /// Statement class, inferred from the sql text when the server did not tell.
    pub fn stmt_type(&self) -> StmtType {
        match self.stmt_type {
            StmtType::UNKNOWN => StmtType::infer(&self.sql),
            ty => ty,
        }
    }

    pub fn num_result_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn describe_col(&mut self, idx: usize) -> Result<&ColumnDesc> {
        if idx >= self.columns.len() {
            return self.reject("invalid column index");
        }
        Ok(&self.columns[idx])
    }

    pub fn columns(&self) -> &Arc<[ColumnDesc]> {
        &self.columns
    }

    /// Advance to the next buffered row, returns `false` past the last one.
    pub fn fetch(&mut self) -> bool {
        if self.pos >= self.rows.len() {
            self.current = None;
            return false;
        }
        self.current = Some(self.pos);
        self.pos += 1;
        true
    }

    /// Advance and return the new current row.
    pub fn fetch_current(&mut self) -> Option<&[Value]> {
        match self.fetch() {
            true => self.current_row(),
            false => None,
        }
    }

    pub fn current_row(&self) -> Option<&[Value]> {
        self.current.and_then(|i| self.rows.get(i)).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        connection::mock::{self, MockServer},
        handle::Env,
        protocol::{CmdType, MarshalWriter, Packet, Status, proto, unit},
    };
    use bytes::Bytes;

    fn select_reply(p: &Packet) -> Vec<Bytes> {
        let word = |ty: CmdType| (ty.0 as u64) << 56;
        match p.protocol {
            proto::PREPARE => {
                let mut w = mock::ok(p);
                w.add_string(unit::COL_NAME, "ID")
                    .add_u64(unit::COL_TYPE, word(CmdType::INT32))
                    .add_u64(unit::PARAM_TYPE, word(CmdType::INT32))
                    .add_i32(unit::STMT_TYPE, 512);
                vec![w.finish()]
            }
            proto::EXECUTE => {
                let mut w = MarshalWriter::new(p.protocol, p.stmt_id);
                w.add_binary(unit::FETCH_VALUE, &[0, 0, 0, 7])
                    .add_binary(unit::FETCH_VALUE, &[0, 0, 0, 8])
                    .add_u64(unit::RESULT, Status::Last.to_wire());
                vec![w.finish()]
            }
            _ => mock::default_reply(p),
        }
    }

    #[tokio::test]
    async fn prepare_bind_execute_fetch() {
        let server = MockServer::start(select_reply).await;
        let conn = Env::new().connect(&server.conn_string()).await.unwrap();
        let mut stmt = conn.alloc_stmt().unwrap();

        let err = stmt.execute().await.unwrap_err();
        assert_eq!(err.to_string(), "statement is not prepared");
        assert_eq!(stmt.error().unwrap().message(), "statement is not prepared");

        stmt.prepare("SELECT ID FROM T WHERE ID > ?").await.unwrap();
        assert!(stmt.error().is_none());
        assert_eq!(stmt.num_params(), 1);
        assert_eq!(stmt.describe_param(0).unwrap().sql_type, SqlType::Int32);
        assert!(stmt.describe_param(1).is_err());
        assert_eq!(stmt.num_result_cols(), 1);
        assert_eq!(stmt.describe_col(0).unwrap().name, "ID");
        assert!(stmt.describe_col(4).is_err());

        stmt.bind_param(0, SqlType::Int32, 5).unwrap();
        stmt.execute().await.unwrap();
        assert_eq!(stmt.row_count(), 2);
        assert!(stmt.stmt_type().is_select());

        assert_eq!(stmt.fetch_current(), Some(&[Value::Int32(7)][..]));
        assert!(stmt.fetch());
        assert_eq!(stmt.current_row(), Some(&[Value::Int32(8)][..]));
        assert!(!stmt.fetch());
        assert!(stmt.current_row().is_none());

        stmt.execute_clean();
        assert!(!stmt.fetch());

        let execute = server.packets().into_iter().find(|e| e.protocol == proto::EXECUTE).unwrap();
        let units = crate::protocol::Units::collect(execute.body).unwrap();
        let params = &units.first(unit::EXEC_PARAM).unwrap().data;
        assert_eq!(&params[..2], &[0, 1]);
        assert_eq!(&params[13..17], &[0, 0, 0, 5]);

        stmt.free().await.unwrap();
        stmt.free().await.unwrap();
        assert_eq!(server.count(proto::FREE), 1);
        assert!(stmt.prepare("SELECT 1").await.is_err());
    }

    #[tokio::test]
    async fn unbound_params_are_null() {
        let server = MockServer::start(mock::default_reply).await;
        let conn = Env::new().connect(&server.conn_string()).await.unwrap();
        let mut stmt = conn.alloc_stmt().unwrap();

        stmt.prepare("INSERT INTO T VALUES (?, ?)").await.unwrap();
        assert_eq!(stmt.num_params(), 2);
        stmt.bind_param(1, SqlType::Int64, 9i64).unwrap();
        assert!(stmt.bind_param(300, SqlType::Int64, 9i64).is_err());
        stmt.execute().await.unwrap();
        assert_eq!(stmt.row_count(), 1);
        assert_eq!(stmt.stmt_type(), StmtType::INSERT);

        let execute = server.packets().into_iter().find(|e| e.protocol == proto::EXECUTE).unwrap();
        let units = crate::protocol::Units::collect(execute.body).unwrap();
        let params = &units.first(unit::EXEC_PARAM).unwrap().data;
        assert_eq!(&params[..2], &[0, 2]);
        // null string slot, zero length
        assert_eq!(&params[2..13], &[1, 1, CmdType::VARCHAR.0, 0, 0, 0, 0, 0, 0, 0, 0]);

        stmt.exec_direct("CREATE TABLE X (V INTEGER)").await.unwrap();
        assert!(stmt.stmt_type().is_ddl());
        assert_eq!(stmt.num_params(), 0);
    }
}
