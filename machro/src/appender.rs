//! Bulk row ingestion into log and tag tables.
use std::{borrow::Cow, fmt};

use crate::{
    Conn, Result, Value,
    common::verbose,
    conn::spawn_detached,
    error::StatusError,
    handle::{AppendCount, StmtHandle, error_with_cause},
};

const DEFAULT_DATABASE: &str = "MACHBASEDB";

const ARRIVAL_TIME: &str = "_ARRIVAL_TIME";

const MOUNT_SQL: &str = "select BACKUP_TBSID from V$STORAGE_MOUNT_DATABASES where MOUNTDB = ?";

const DESCRIBE_SQL: &str = "SELECT j.ID as TABLE_ID, j.TYPE as TABLE_TYPE, j.FLAG as TABLE_FLAG, \
    j.COLCOUNT as TABLE_COLCOUNT from M$SYS_USERS u, M$SYS_TABLES j \
    where u.NAME = ? and j.USER_ID = u.USER_ID and j.DATABASE_ID = ? and j.NAME = ?";

const COLUMNS_SQL: &str = "select name, type, length, id, flag from M$SYS_COLUMNS \
    where table_id = ? and database_id = ? order by id";

/// Server table kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableType {
    Log,
    Fixed,
    Volatile,
    Lookup,
    KeyValue,
    Tag,
    Undefined(i32),
}

impl TableType {
    pub fn from_code(code: i32) -> TableType {
        match code {
            0 => Self::Log,
            1 => Self::Fixed,
            3 => Self::Volatile,
            4 => Self::Lookup,
            5 => Self::KeyValue,
            6 => Self::Tag,
            n => Self::Undefined(n),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Log => 0,
            Self::Fixed => 1,
            Self::Volatile => 3,
            Self::Lookup => 4,
            Self::KeyValue => 5,
            Self::Tag => 6,
            Self::Undefined(n) => n,
        }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log => f.write_str("LogTable"),
            Self::Fixed => f.write_str("FixedTable"),
            Self::Volatile => f.write_str("VolatileTable"),
            Self::Lookup => f.write_str("LookupTable"),
            Self::KeyValue => f.write_str("KeyValueTable"),
            Self::Tag => f.write_str("TagTable"),
            Self::Undefined(n) => write!(f, "UndefinedTable-{n}"),
        }
    }
}

/// A table column as recorded in the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    /// Catalog type code.
    pub kind: i32,
    pub length: i64,
    pub id: i64,
    pub flag: i64,
}

/// Split `db.user.table`, `user.table` or `table`, uppercased.
fn split_table_name(name: &str, user: &str) -> (String, String, String) {
    let name = name.to_ascii_uppercase();
    let parts = name.split('.').collect::<Vec<_>>();
    match parts.as_slice() {
        [db, user, table] => (db.to_string(), user.to_string(), table.to_string()),
        [user, table] => (DEFAULT_DATABASE.into(), user.to_string(), table.to_string()),
        _ => (DEFAULT_DATABASE.into(), user.to_ascii_uppercase(), name.clone()),
    }
}

impl Conn {
    /// Open an [`Appender`] on a log or tag table.
    pub async fn appender(&self, table: &str) -> Result<Appender> {
        self.appender_with(table, 0).await
    }

    /// Open an [`Appender`] that checks for server errors every
    /// `error_check` rows, `0` never checks before close.
    pub async fn appender_with(&self, table_name: &str, error_check: u32) -> Result<Appender> {
        let (db, user, table) = split_table_name(table_name, self.user());
        let user = match user.is_empty() {
            true => self.user().to_owned(),
            false => user,
        };

        let mut db_id = -1i32;
        if !db.is_empty() && db != DEFAULT_DATABASE {
            let row = self.query_row(MOUNT_SQL, &[db.into()]).await?;
            db_id = row.try_get(0)?;
        }

        let args = [Value::from(user), Value::Int32(db_id), Value::from(table.clone())];
        let row = match self.query_row(DESCRIBE_SQL, &args).await {
            Ok(ok) => ok,
            Err(err) if err.is_row_not_found() => {
                let msg = format!("table '{table_name}' does not exist");
                return Err(StatusError::client(msg).into());
            }
            Err(err) => return Err(err),
        };
        let table_id: i64 = row.try_get(0)?;
        let table_type = TableType::from_code(row.try_get(1)?);
        if !matches!(table_type, TableType::Log | TableType::Tag) {
            let msg = format!("{table_type} '{table_name}' doesn't support append");
            return Err(StatusError::client(msg).into());
        }

        let mut columns = vec![];
        let mut rows = self.query(COLUMNS_SQL, &[Value::Int64(table_id), Value::Int32(db_id)]).await?;
        while let Some(row) = rows.next() {
            let col = TableColumn {
                name: row.try_get(0)?,
                kind: row.try_get(1)?,
                length: row.try_get(2)?,
                id: row.try_get(3)?,
                flag: row.try_get(4)?,
            };
            if col.name.starts_with('_') && (table_type != TableType::Log || col.name != ARRIVAL_TIME) {
                continue;
            }
            columns.push(col);
        }
        rows.close().await?;

        let mut stmt = self.alloc()?;
        if let Err(err) = stmt.append_open(&table, error_check).await {
            let err = error_with_cause(&stmt, err);
            stmt.free().await.ok();
            return Err(err);
        }
        verbose!(table = %table, columns = columns.len(), "Appender opened");

        Ok(Appender {
            names: columns.iter().map(|e| e.name.clone()).collect(),
            stmt: Some(stmt),
            table_name: table_name.to_ascii_uppercase(),
            table_type,
            columns,
            inputs: vec![],
            formats: vec![],
            count: AppendCount::default(),
        })
    }
}

/// Streams rows into a table until closed.
///
/// Rows are batched on the connection, [`close`][Appender::close] returns
/// how many rows the server accepted and rejected. Dropping without close
/// closes in the background.
#[derive(Debug)]
pub struct Appender {
    stmt: Option<StmtHandle>,
    table_name: String,
    table_type: TableType,
    columns: Vec<TableColumn>,
    names: Vec<String>,
    /// Column index of every input value.
    inputs: Vec<usize>,
    formats: Vec<String>,
    count: AppendCount,
}

impl Appender {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn table_type(&self) -> TableType {
        self.table_type
    }

    pub fn columns(&self) -> &[TableColumn] {
        &self.columns
    }

    pub fn is_closed(&self) -> bool {
        self.stmt.is_none()
    }

    /// Values of each row follow `columns` order, other columns are null.
    ///
    /// An empty list restores the table order.
    pub fn with_input_columns<S: AsRef<str>>(mut self, columns: &[S]) -> Result<Self> {
        let mut inputs = Vec::with_capacity(columns.len());
        for name in columns {
            let upper = name.as_ref().to_ascii_uppercase();
            match self.columns.iter().position(|e| e.name == upper) {
                Some(idx) => inputs.push(idx),
                None => {
                    let msg = format!("column '{}' not found in '{}'", name.as_ref(), self.table_name);
                    return Err(StatusError::client(msg).into());
                }
            }
        }
        self.inputs = inputs;
        Ok(self)
    }

    /// Value formats of the input columns, kept for callers.
    pub fn with_input_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.formats = formats.into_iter().map(Into::into).collect();
        self
    }

    pub fn input_formats(&self) -> &[String] {
        &self.formats
    }

    /// Append one row.
    ///
    /// On log tables, a row without `_ARRIVAL_TIME` lets the server stamp it.
    pub async fn append(&mut self, values: &[Value]) -> Result<()> {
        match self.table_type {
            TableType::Tag => self.append_row(values).await,
            TableType::Log if values.len() == self.columns.len() || !self.inputs.is_empty() => {
                self.append_row(values).await
            }
            TableType::Log => {
                let mut row = Vec::with_capacity(values.len() + 1);
                row.push(Value::Null);
                row.extend_from_slice(values);
                self.append_row(&row).await
            }
            _ => {
                let msg = format!("{} can not be appended", self.table_name);
                Err(StatusError::client(msg).into())
            }
        }
    }

    /// Append one row of a log table with an explicit arrival time.
    pub async fn append_log_time(&mut self, time: impl Into<Value>, values: &[Value]) -> Result<()> {
        if self.table_type != TableType::Log {
            let msg = format!("{} is not a log table, use append() instead", self.table_name);
            return Err(StatusError::client(msg).into());
        }
        let mut row = Vec::with_capacity(values.len() + 1);
        row.push(time.into());
        row.extend_from_slice(values);
        self.append_row(&row).await
    }

    async fn append_row(&mut self, values: &[Value]) -> Result<()> {
        if self.columns.is_empty() {
            let msg = format!("table '{}' has no columns", self.table_name);
            return Err(StatusError::client(msg).into());
        }

        let expect = match self.inputs.is_empty() {
            true => self.columns.len(),
            false => self.inputs.len(),
        };
        if expect != values.len() {
            let msg = format!(
                "value count mismatch of '{}' (expect {expect}, got {})",
                self.table_name,
                values.len()
            );
            return Err(StatusError::client(msg).into());
        }

        let row = match self.inputs.is_empty() {
            true => Cow::Borrowed(values),
            false => {
                let mut row = vec![Value::Null; self.columns.len()];
                for (value, &idx) in values.iter().zip(&self.inputs) {
                    row[idx] = value.clone();
                }
                Cow::Owned(row)
            }
        };

        let Some(stmt) = self.stmt.as_mut() else {
            return Err(StatusError::client("appender is closed").into());
        };
        match stmt.append_data(&self.names, &row).await {
            Ok(()) => Ok(()),
            Err(err) => Err(error_with_cause(&*stmt, err)),
        }
    }

    /// Send buffered rows now.
    pub async fn flush(&mut self) -> Result<()> {
        let Some(stmt) = self.stmt.as_mut() else {
            return Err(StatusError::client("appender is closed").into());
        };
        match stmt.append_flush().await {
            Ok(()) => Ok(()),
            Err(err) => Err(error_with_cause(&*stmt, err)),
        }
    }

    /// Close the append session and free its statement.
    ///
    /// The statement is freed even when closing fails, a free failure takes
    /// precedence. Subsequent calls return the same counters.
    pub async fn close(&mut self) -> (AppendCount, Result<()>) {
        let Some(mut stmt) = self.stmt.take() else {
            return (self.count, Ok(()));
        };

        let (count, result) = stmt.append_close().await;
        let result = result.map_err(|e| error_with_cause(&stmt, e));
        self.count = count;
        verbose!(success = count.success, fail = count.fail, "Appender closed");

        if let Err(err) = stmt.free().await {
            return (count, Err(error_with_cause(stmt.connection(), err)));
        }
        (count, result)
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        if let Some(mut stmt) = self.stmt.take() {
            spawn_detached(async move {
                let _ = stmt.append_close().await;
                stmt.free().await.ok();
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Auth, PoolConfig,
        connection::mock::{self, MockServer},
        protocol::{CmdType, MarshalWriter, Packet, Status, Units, proto, unit},
    };
    use bytes::Bytes;
    use std::{collections::HashMap, sync::Mutex};

    fn word(ty: CmdType) -> u64 {
        (ty.0 as u64) << 56
    }

    fn varchar(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    /// Catalog row of `M$SYS_COLUMNS`.
    fn column_row(name: &str, id: i64) -> Vec<u8> {
        let mut row = varchar(name);
        row.extend_from_slice(&8i32.to_be_bytes());
        row.extend_from_slice(&4i32.to_be_bytes());
        row.extend_from_slice(&id.to_be_bytes());
        row.extend_from_slice(&0i32.to_be_bytes());
        row
    }

    struct Catalog {
        /// `None` is a missing table.
        table_type: Option<i32>,
        columns: Vec<(&'static str, CmdType)>,
    }

    /// Answers the catalog queries and the append protocol of one table.
    fn catalog_server(catalog: Catalog) -> impl Fn(&Packet) -> Vec<Bytes> + Send + Sync + 'static {
        let sql = Mutex::new(HashMap::<u32, String>::new());
        let appended = Mutex::new(HashMap::<u32, u64>::new());

        move |p: &Packet| match p.protocol {
            proto::PREPARE => {
                let text = Units::collect(p.body.clone()).unwrap().string(unit::STATEMENT);
                let mut w = mock::ok(p);
                if text.contains("M$SYS_TABLES") {
                    for (name, ty) in [
                        ("TABLE_ID", CmdType::INT64),
                        ("TABLE_TYPE", CmdType::INT32),
                        ("TABLE_FLAG", CmdType::INT32),
                        ("TABLE_COLCOUNT", CmdType::INT32),
                    ] {
                        w.add_string(unit::COL_NAME, name).add_u64(unit::COL_TYPE, word(ty));
                    }
                    w.add_u64(unit::PARAM_TYPE, word(CmdType::VARCHAR))
                        .add_u64(unit::PARAM_TYPE, word(CmdType::INT32))
                        .add_u64(unit::PARAM_TYPE, word(CmdType::VARCHAR));
                } else {
                    for (name, ty) in [
                        ("NAME", CmdType::VARCHAR),
                        ("TYPE", CmdType::INT32),
                        ("LENGTH", CmdType::INT32),
                        ("ID", CmdType::INT64),
                        ("FLAG", CmdType::INT32),
                    ] {
                        w.add_string(unit::COL_NAME, name).add_u64(unit::COL_TYPE, word(ty));
                    }
                    w.add_u64(unit::PARAM_TYPE, word(CmdType::INT64))
                        .add_u64(unit::PARAM_TYPE, word(CmdType::INT32));
                }
                w.add_i32(unit::STMT_TYPE, 512);
                sql.lock().unwrap().insert(p.stmt_id, text);
                vec![w.finish()]
            }
            proto::EXECUTE => {
                let text = sql.lock().unwrap().get(&p.stmt_id).cloned().unwrap_or_default();
                let mut w = MarshalWriter::new(p.protocol, p.stmt_id);
                if text.contains("M$SYS_TABLES") {
                    if let Some(ty) = catalog.table_type {
                        let mut row = 7i64.to_be_bytes().to_vec();
                        row.extend_from_slice(&ty.to_be_bytes());
                        row.extend_from_slice(&0i32.to_be_bytes());
                        row.extend_from_slice(&(catalog.columns.len() as i32).to_be_bytes());
                        w.add_binary(unit::FETCH_VALUE, &row);
                    }
                } else {
                    for (id, (name, _)) in catalog.columns.iter().enumerate() {
                        w.add_binary(unit::FETCH_VALUE, &column_row(name, id as i64));
                    }
                }
                w.add_u64(unit::RESULT, Status::Last.to_wire());
                vec![w.finish()]
            }
            proto::APPEND_OPEN => {
                let mut w = mock::ok(p);
                for (name, ty) in &catalog.columns {
                    let word = match *ty {
                        CmdType::VARCHAR => word(*ty) | 20 << 28,
                        ty => word(ty),
                    };
                    w.add_string(unit::COL_NAME, name).add_u64(unit::COL_TYPE, word);
                }
                vec![w.finish()]
            }
            proto::APPEND_DATA => {
                let rows = Units::collect(p.body.clone()).unwrap().all(unit::ROWS).len();
                *appended.lock().unwrap().entry(p.stmt_id).or_default() += rows as u64;
                vec![]
            }
            proto::APPEND_CLOSE => {
                let mut w = MarshalWriter::new(p.protocol, p.stmt_id);
                w.add_u64(unit::RESULT, Status::Ok.to_wire())
                    .add_u64(unit::APPEND_SUCCESS, appended.lock().unwrap().remove(&p.stmt_id).unwrap_or(0))
                    .add_u64(unit::APPEND_FAILURE, 0);
                vec![w.finish()]
            }
            _ => mock::default_reply(p),
        }
    }

    async fn connect(server: &MockServer) -> Conn {
        let db = PoolConfig::new().port(server.port()).open();
        db.connect(Auth::password("sys", "manager")).await.unwrap()
    }

    #[test]
    fn table_names() {
        assert_eq!(
            split_table_name("mydb.bob.tag", "SYS"),
            ("MYDB".into(), "BOB".into(), "TAG".into())
        );
        assert_eq!(split_table_name("bob.tag", "SYS"), ("MACHBASEDB".into(), "BOB".into(), "TAG".into()));
        assert_eq!(split_table_name("tag", "sys"), ("MACHBASEDB".into(), "SYS".into(), "TAG".into()));
        assert_eq!(TableType::from_code(4).to_string(), "LookupTable");
        assert_eq!(TableType::from_code(9).to_string(), "UndefinedTable-9");
        assert_eq!(TableType::Tag.code(), 6);
    }

    #[tokio::test]
    async fn tag_table_bulk_append() {
        let server = MockServer::start(catalog_server(Catalog {
            table_type: Some(6),
            columns: vec![("NAME", CmdType::VARCHAR), ("TIME", CmdType::DATE), ("VALUE", CmdType::FLT64)],
        }))
        .await;
        let mut conn = connect(&server).await;

        let mut appender = conn.appender_with("tag", 1024).await.unwrap();
        assert_eq!(appender.table_name(), "TAG");
        assert_eq!(appender.table_type(), TableType::Tag);
        assert_eq!(appender.columns().len(), 3);

        for i in 0..2048i64 {
            let row = ["sensor-1".into(), Value::DateTime(i * 1_000_000), Value::Float64(i as f64)];
            appender.append(&row).await.unwrap();
        }
        let err = appender.append(&["short".into()]).await.unwrap_err();
        assert_eq!(err.to_string(), "value count mismatch of 'TAG' (expect 3, got 1)");

        let (count, result) = appender.close().await;
        result.unwrap();
        assert_eq!(count, AppendCount { success: 2048, fail: 0 });

        let (again, result) = appender.close().await;
        assert!(result.is_ok());
        assert_eq!(again, count);
        assert!(appender.is_closed());

        let err = appender.append(&["x".into(), Value::Null, Value::Null]).await.unwrap_err();
        assert_eq!(err.to_string(), "appender is closed");
        assert!(appender.flush().await.is_err());

        // the catalog statements are cached, the append one is freed
        assert_eq!(server.count(proto::FREE), 1);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn log_table_arrival_time() {
        let server = MockServer::start(catalog_server(Catalog {
            table_type: Some(0),
            columns: vec![
                ("_ARRIVAL_TIME", CmdType::DATE),
                ("_RID", CmdType::INT64),
                ("NAME", CmdType::VARCHAR),
                ("V", CmdType::INT32),
            ],
        }))
        .await;
        let mut conn = connect(&server).await;

        let appender = conn.appender("sys.logs").await.unwrap();
        let names = appender.columns().iter().map(|e| e.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, [ARRIVAL_TIME, "NAME", "V"]);

        assert!(appender.with_input_columns(&["nope"]).is_err());

        let mut appender = conn.appender("sys.logs").await.unwrap();
        appender.append(&["a".into(), 1i32.into()]).await.unwrap();
        appender.append(&[Value::DateTime(5), "b".into(), 2i32.into()]).await.unwrap();
        appender.append_log_time(Value::DateTime(9), &["c".into(), 3i32.into()]).await.unwrap();

        let mut appender = appender.with_input_columns(&["v"]).unwrap();
        appender.append(&[4i32.into()]).await.unwrap();

        let (count, result) = appender.close().await;
        result.unwrap();
        assert_eq!(count.success, 4);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_tables() {
        let server = MockServer::start(catalog_server(Catalog {
            table_type: Some(4),
            columns: vec![("V", CmdType::INT32)],
        }))
        .await;
        let mut conn = connect(&server).await;
        let err = conn.appender("lk").await.unwrap_err();
        assert_eq!(err.to_string(), "LookupTable 'lk' doesn't support append");
        conn.close().await.unwrap();

        let server = MockServer::start(catalog_server(Catalog { table_type: None, columns: vec![] })).await;
        let mut conn = connect(&server).await;
        let err = conn.appender("missing").await.unwrap_err();
        assert_eq!(err.to_string(), "table 'missing' does not exist");
        assert_eq!(server.count(proto::APPEND_OPEN), 0);
        conn.close().await.unwrap();
    }
}
