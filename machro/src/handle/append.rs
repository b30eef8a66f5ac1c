use bytes::Bytes;
use std::time::{Duration, Instant};

use super::StmtHandle;
use crate::{
    Result, Value,
    append::{self, AppendBindings},
    bind::EncodeError,
    common::{logged, verbose},
    ext::Endian,
    protocol::ColumnDesc,
};

const MAX_ROWS: usize = 512;
const MAX_BYTES: usize = 512 * 1024;
const MAX_DELAY: Duration = Duration::from_millis(5);

/// Rows accepted and rejected by the server for one append session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppendCount {
    pub success: i64,
    pub fail: i64,
}

/// Buffered append session of a statement.
#[derive(Debug)]
pub(crate) struct AppendState {
    table: String,
    err_check: u32,
    columns: Vec<ColumnDesc>,
    bindings: Option<AppendBindings>,
    added: u64,
    sent: i64,
    fail: i64,
    pending: Vec<Bytes>,
    pending_bytes: usize,
    first_queued: Option<Instant>,
    max_delay: Duration,
}

impl AppendState {
    fn local_count(&self) -> AppendCount {
        AppendCount { success: (self.sent - self.fail).max(0), fail: self.fail }
    }

    fn encode<S: AsRef<str>>(&mut self, names: &[S], args: &[Value], endian: Endian) -> Result<Bytes, EncodeError> {
        let bindings = match self.bindings.take() {
            Some(bindings) => bindings,
            None => AppendBindings::resolve(&self.columns, names)?,
        };
        let row = append::encode_row(&self.columns, &bindings, args, endian);
        self.bindings = Some(bindings);
        row
    }

    fn should_flush(&self, check: bool) -> bool {
        check
            || self.pending.len() >= MAX_ROWS
            || self.pending_bytes >= MAX_BYTES
            || self.first_queued.is_some_and(|e| e.elapsed() >= self.max_delay)
    }
}

impl StmtHandle {
    /// Start appending into `table`.
    ///
    /// With `err_check > 0`, every `err_check`-th row flushes and reads back a
    /// server response if one is ready.
    pub async fn append_open(&mut self, table: &str, err_check: u32) -> Result<()> {
        if self.is_closed() || self.conn.is_closed() {
            return self.reject("statement closed");
        }

        let result = self.conn.native().append_open(self.id, table).await;
        let res = self.settle(result)?;
        verbose!(id = self.id, table, columns = res.columns.len(), "Append opened");

        self.app = Some(AppendState {
            table: table.to_owned(),
            err_check,
            columns: res.columns,
            bindings: None,
            added: 0,
            sent: 0,
            fail: 0,
            pending: Vec::with_capacity(MAX_ROWS),
            pending_bytes: 0,
            first_queued: None,
            max_delay: MAX_DELAY,
        });
        Ok(())
    }

    /// Columns reported by the server on append open.
    pub fn append_columns(&self) -> Option<&[ColumnDesc]> {
        self.app.as_ref().map(|e| e.columns.as_slice())
    }

    pub fn append_table(&self) -> Option<&str> {
        self.app.as_ref().map(|e| e.table.as_str())
    }

    /// Queue one row, `names[i]` is the column of `args[i]`.
    ///
    /// Column names are resolved on the first row and kept for the session.
    pub async fn append_data<S: AsRef<str>>(&mut self, names: &[S], args: &[Value]) -> Result<()> {
        if self.is_closed() || self.conn.is_closed() {
            return self.reject("statement closed");
        }
        if self.app.is_none() {
            return self.reject("append not opened");
        }
        if names.len() != args.len() {
            return self.reject("append argument mismatch");
        }

        let endian = self.conn.native().endian();
        let Some(app) = self.app.as_mut() else {
            return Ok(());
        };
        let row = match app.encode(names, args, endian) {
            Ok(row) => row,
            Err(err) => {
                app.fail += 1;
                return self.settle(Err(err.into()));
            }
        };

        app.added += 1;
        if app.pending.is_empty() {
            app.first_queued = Some(Instant::now());
        }
        app.pending_bytes += row.len();
        app.pending.push(row);

        let check = app.err_check > 0 && app.added % u64::from(app.err_check) == 0;
        if app.should_flush(check) {
            self.flush_append(check).await?;
        }
        Ok(())
    }

    /// Send every pending row.
    async fn flush_append(&mut self, check: bool) -> Result<()> {
        let Some(app) = self.app.as_mut() else {
            return Ok(());
        };
        if app.pending.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut app.pending);
        app.pending_bytes = 0;
        app.first_queued = None;

        let result = self.conn.native().append_data(self.id, &pending, check).await;
        let count = pending.len() as i64;

        if let Some(app) = self.app.as_mut() {
            match &result {
                Ok(()) => app.sent += count,
                Err(_err) => {
                    logged!(warn, "append flush of {count} rows failed: {_err}");
                    app.fail += count;
                }
            }
            // keep the allocation for the next batch
            app.pending = pending;
            app.pending.clear();
        }

        self.settle(result)
    }

    /// Send pending rows without waiting for the server.
    pub async fn append_flush(&mut self) -> Result<()> {
        if self.app.is_none() || self.conn.is_closed() {
            return Ok(());
        }
        self.flush_append(false).await
    }

    /// Flush, then close the append session.
    ///
    /// The counters are always returned, on failure they are the local view
    /// of rows sent minus rows failed.
    pub async fn append_close(&mut self) -> (AppendCount, Result<()>) {
        if self.app.is_none() {
            return (AppendCount::default(), Ok(()));
        }

        if let Err(err) = self.flush_append(false).await {
            return (self.local_count(), Err(err));
        }

        let result = self.conn.native().append_close(self.id).await;
        match self.settle(result) {
            Ok((success, fail)) => {
                self.app = None;
                verbose!(id = self.id, success, fail, "Append closed");
                (AppendCount { success, fail }, Ok(()))
            }
            Err(err) => (self.local_count(), Err(err)),
        }
    }

    fn local_count(&self) -> AppendCount {
        self.app.as_ref().map(AppendState::local_count).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        connection::mock::{self, MockServer},
        handle::Env,
        protocol::{CmdType, MarshalWriter, Packet, Status, Units, proto, unit},
    };

    fn append_reply(p: &Packet) -> Vec<Bytes> {
        let word = |ty: CmdType| (ty.0 as u64) << 56;
        match p.protocol {
            proto::APPEND_OPEN => {
                let mut w = mock::ok(p);
                w.add_string(unit::COL_NAME, "_ARRIVAL_TIME")
                    .add_u64(unit::COL_TYPE, word(CmdType::DATE))
                    .add_string(unit::COL_NAME, "NAME")
                    .add_u64(unit::COL_TYPE, word(CmdType::VARCHAR) | 20 << 28)
                    .add_string(unit::COL_NAME, "V")
                    .add_u64(unit::COL_TYPE, word(CmdType::INT32));
                vec![w.finish()]
            }
            proto::APPEND_CLOSE => {
                let mut w = MarshalWriter::new(p.protocol, p.stmt_id);
                w.add_u64(unit::RESULT, Status::Ok.to_wire())
                    .add_u64(unit::APPEND_SUCCESS, 3)
                    .add_u64(unit::APPEND_FAILURE, 0);
                vec![w.finish()]
            }
            _ => mock::default_reply(p),
        }
    }

    /// Row count of every append data request, in order.
    fn batches(server: &MockServer) -> Vec<usize> {
        server
            .packets()
            .into_iter()
            .filter(|e| e.protocol == proto::APPEND_DATA)
            .map(|e| Units::collect(e.body).unwrap().all(unit::ROWS).len())
            .collect()
    }

    async fn open_tag(server: &MockServer) -> StmtHandle {
        let conn = Env::new().connect(&server.conn_string()).await.unwrap();
        let mut stmt = conn.alloc_stmt().unwrap();
        stmt.append_open("TAG", 0).await.unwrap();
        stmt
    }

    fn pending(stmt: &StmtHandle) -> usize {
        stmt.app.as_ref().unwrap().pending.len()
    }

    fn sent_rows(server: &MockServer) -> Vec<Bytes> {
        server
            .packets()
            .into_iter()
            .filter(|e| e.protocol == proto::APPEND_DATA)
            .flat_map(|e| Units::collect(e.body).unwrap().all(unit::ROWS).to_vec())
            .map(|e| e.data)
            .collect()
    }

    #[tokio::test]
    async fn buffered_until_close() {
        let server = MockServer::start(append_reply).await;
        let conn = Env::new().connect(&server.conn_string()).await.unwrap();
        let mut stmt = conn.alloc_stmt().unwrap();

        let err = stmt.append_data(&["V"], &[Value::Int32(1)]).await.unwrap_err();
        assert_eq!(err.to_string(), "append not opened");

        stmt.append_open("TAG", 0).await.unwrap();
        assert_eq!(stmt.append_columns().unwrap().len(), 3);
        assert_eq!(stmt.append_table(), Some("TAG"));

        let names = ["NAME", "V"];
        let err = stmt.append_data(&names, &[Value::Null]).await.unwrap_err();
        assert_eq!(err.to_string(), "append argument mismatch");

        stmt.append_data(&names, &["alice".into(), Value::Null]).await.unwrap();
        stmt.append_data(&names, &["bob".into(), 2i32.into()]).await.unwrap();

        // rejected by the encoder, counted as failed
        let err = stmt.append_data(&names, &["carol".into(), "x".into()]).await.unwrap_err();
        assert!(err.to_string().starts_with("append column V"));
        assert_eq!(conn.error().unwrap().code(), 0);

        let (count, result) = stmt.append_close().await;
        result.unwrap();
        assert_eq!(count, AppendCount { success: 3, fail: 0 });

        let rows = sent_rows(&server);
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][..6], &[0, 1, 0, 0, 0, 0x20]);

        let (count, result) = stmt.append_close().await;
        assert!(result.is_ok());
        assert_eq!(count, AppendCount::default());
    }

    #[tokio::test]
    async fn error_check_flushes_every_interval() {
        let server = MockServer::start(append_reply).await;
        let conn = Env::new().connect(&server.conn_string()).await.unwrap();
        let mut stmt = conn.alloc_stmt().unwrap();
        stmt.append_open("TAG", 2).await.unwrap();

        let names = ["NAME", "V"];
        for i in 0..5 {
            stmt.append_data(&names, &["n".into(), Value::Int32(i)]).await.unwrap();
        }
        stmt.append_flush().await.unwrap();
        stmt.append_flush().await.unwrap();

        let (count, result) = stmt.append_close().await;
        result.unwrap();
        assert_eq!(count.success, 3);
        assert!(server.count(proto::APPEND_DATA) >= 3);
        assert_eq!(sent_rows(&server).len(), 5);
        assert!(stmt.append_columns().is_none());
    }

    #[tokio::test]
    async fn flush_on_row_limit() {
        let server = MockServer::start(append_reply).await;
        let mut stmt = open_tag(&server).await;
        stmt.app.as_mut().unwrap().max_delay = Duration::from_secs(60);

        let names = ["NAME", "V"];
        for i in 0..513 {
            stmt.append_data(&names, &["n".into(), Value::Int32(i)]).await.unwrap();
        }
        assert_eq!(pending(&stmt), 1);
        assert_eq!(stmt.app.as_ref().unwrap().sent, 512);

        let (_, result) = stmt.append_close().await;
        result.unwrap();
        assert_eq!(batches(&server), [512, 1]);
    }

    #[tokio::test]
    async fn flush_on_byte_limit() {
        let server = MockServer::start(append_reply).await;
        let mut stmt = open_tag(&server).await;
        stmt.app.as_mut().unwrap().max_delay = Duration::from_secs(60);

        // 64 rows of 8 KiB reach 512 KiB
        let name = "x".repeat(8 * 1024);
        let names = ["NAME", "V"];
        for i in 0..70 {
            stmt.append_data(&names, &[name.clone().into(), Value::Int32(i)]).await.unwrap();
        }
        assert_eq!(pending(&stmt), 6);

        let (_, result) = stmt.append_close().await;
        result.unwrap();
        assert_eq!(batches(&server), [64, 6]);
    }

    #[tokio::test]
    async fn flush_on_queued_age() {
        let server = MockServer::start(append_reply).await;
        let mut stmt = open_tag(&server).await;

        let names = ["NAME", "V"];
        stmt.append_data(&names, &["a".into(), Value::Int32(1)]).await.unwrap();
        assert_eq!(pending(&stmt), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        stmt.append_data(&names, &["b".into(), Value::Int32(2)]).await.unwrap();
        assert_eq!(pending(&stmt), 0);

        stmt.append_data(&names, &["c".into(), Value::Int32(3)]).await.unwrap();
        assert_eq!(pending(&stmt), 1);

        let (_, result) = stmt.append_close().await;
        result.unwrap();
        assert_eq!(batches(&server), [2, 1]);
    }
}
