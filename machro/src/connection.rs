//! Native Machbase connection.
use bytes::Bytes;
use std::{
    io,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream},
    sync::Mutex as IoMutex,
    time::timeout,
};

use crate::{
    Result,
    common::{logged, verbose},
    error::StatusError,
    ext::Endian,
    net::Socket,
    protocol::{
        self, ColumnDesc, HANDSHAKE, HANDSHAKE_READY, MarshalWriter, Packet, ProtocolError,
        Session, StmtResponse, packet::read_packet, proto, unit,
    },
    value::Value,
};

mod config;
mod stmt_id;

#[cfg(test)]
pub(crate) mod mock;

pub use config::{Config, ParseError};
pub(crate) use config::{DEFAULT_HOST, DEFAULT_PORT};
pub use stmt_id::MAX_STMT;

use stmt_id::StmtIds;

const READ_BUFFER: usize = 128 * 1024;
const WRITE_BUFFER: usize = 128 * 1024;

/// Longest wait for an optional append data response.
const APPEND_PEEK: Duration = Duration::from_millis(5);

/// A single native protocol connection.
///
/// Every request and response pair is serialized by one lock around the byte
/// stream, so a connection can be shared between tasks.
#[derive(Debug)]
pub struct Connection {
    io: IoMutex<BufStream<Socket>>,
    ids: Mutex<StmtIds>,
    session: Session,
    config: Config,
    closed: AtomicBool,
    broken: AtomicBool,
}

impl Connection {
    /// Try every endpoint in order, returns the first established session.
    pub async fn connect_with(config: Config) -> Result<Connection> {
        let mut last_err = None;

        let endpoints: Vec<(String, u16)> =
            config.endpoints().map(|(host, port)| (host.to_owned(), port)).collect();

        for (host, port) in endpoints {
            verbose!(host, port, "Connect");

            let dial = Self::dial(&host, port, &config);
            let result = match timeout(config.connect_timeout, dial).await {
                Ok(result) => result,
                Err(_) => Err(timed_out("connect timeout").into()),
            };

            match result {
                Ok((io, session)) => {
                    verbose!(session_id = session.session_id, "Connected");
                    return Ok(Self {
                        io: IoMutex::new(io),
                        ids: Mutex::new(StmtIds::default()),
                        session,
                        config,
                        closed: AtomicBool::new(false),
                        broken: AtomicBool::new(false),
                    });
                }
                Err(err) => {
                    logged!(warn, "failed to connect {host}:{port}: {err}");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| StatusError::client("connect failed").into()))
    }

    async fn dial(host: &str, port: u16, config: &Config) -> Result<(BufStream<Socket>, Session)> {
        let socket = Socket::connect_tcp(host, port).await?;
        let ip = socket.local_ip().to_string();
        let mut io = BufStream::with_capacity(READ_BUFFER, WRITE_BUFFER, socket);

        io.write_all(HANDSHAKE).await?;
        io.flush().await?;

        let mut reply = [0u8; 9];
        io.read_exact(&mut reply).await?;
        if &reply != HANDSHAKE_READY {
            return Err(ProtocolError::Handshake(reply).into());
        }

        let mut w = MarshalWriter::new(proto::CONNECT, 0);
        w.add_u64(unit::VERSION, protocol::protocol_version())
            .add_string(unit::CLIENT_ID, "CLI")
            .add_string(unit::DATABASE_ID, "data")
            .add_string(unit::USER_ID, &config.user)
            .add_string(unit::PASSWORD, &config.pass)
            .add_u64(unit::TIMEOUT, config.query_timeout.as_secs())
            .add_u32(unit::SHC, 0)
            .add_string(unit::IP, &ip);

        io.write_all(&w.finish()).await?;
        io.flush().await?;

        let packet = read_packet(&mut io).await?;
        if packet.protocol != proto::CONNECT {
            return Err(ProtocolError::unexpected(proto::CONNECT, packet.protocol).into());
        }

        let session = protocol::parse_connect(packet.body)?;
        Ok((io, session))
    }

    pub fn session_id(&self) -> u64 {
        self.session.session_id
    }

    /// Byte order of append rows.
    pub fn endian(&self) -> Endian {
        self.session.endian
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns `true` if the connection was closed, or its byte stream broke.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.broken.load(Ordering::Acquire)
    }

    /// Shutdown the socket, subsequent calls are no-op.
    pub async fn close(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        verbose!(session_id = self.session.session_id, "Closed");
        io.shutdown().await?;
        Ok(())
    }

    // ===== Statement id =====

    pub(crate) fn alloc_stmt_id(&self) -> Result<u32> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        Ok(ids.alloc()?)
    }

    pub(crate) fn release_stmt_id(&self, id: u32) {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.release(id);
    }

    // ===== Dispatch =====

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StatusError::client("connection closed").into());
        }
        Ok(())
    }

    /// Mark the connection broken when the error leaves the stream unusable.
    fn checked<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                logged!(error, "connection broken: {err}");
                self.broken.store(true, Ordering::Release);
            }
        }
        result
    }

    async fn deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        match timeout(self.config.query_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(timed_out("i/o timeout").into()),
        }
    }

    async fn write(&self, io: &mut BufStream<Socket>, wire: &[u8]) -> Result<()> {
        self.deadline(async {
            io.write_all(wire).await?;
            io.flush().await
        })
        .await
    }

    async fn read(&self, io: &mut BufStream<Socket>) -> Result<Packet> {
        match timeout(self.config.query_timeout, read_packet(io)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out("i/o timeout").into()),
        }
    }

    /// Write a request, then read exactly one response of the same protocol.
    async fn round_trip(&self, protocol: u8, wire: Bytes) -> Result<Bytes> {
        self.ensure_open()?;
        let mut io = self.io.lock().await;
        let exchange = Exchange::start(&self.broken);

        let result: Result<Bytes> = async {
            self.write(&mut io, &wire).await?;
            let packet = self.read(&mut io).await?;
            if packet.protocol != protocol {
                return Err(ProtocolError::unexpected(protocol, packet.protocol).into());
            }
            Ok(packet.body)
        }
        .await;

        exchange.finish();
        self.checked(result)
    }

    /// Write a request without waiting for any response.
    async fn send_only(&self, wire: Bytes) -> Result<()> {
        self.ensure_open()?;
        let mut io = self.io.lock().await;
        let exchange = Exchange::start(&self.broken);
        let result = self.write(&mut io, &wire).await;
        exchange.finish();
        self.checked(result)
    }

    /// Write a request, then read a response only if one arrive within `wait`.
    async fn send_optional(&self, protocol: u8, wire: Bytes, wait: Duration) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let mut io = self.io.lock().await;
        let exchange = Exchange::start(&self.broken);

        let result: Result<Option<Bytes>> = async {
            self.write(&mut io, &wire).await?;

            // `fill_buf` keeps the bytes buffered, waiting is cancel safe
            let ready = timeout(wait, async { io.fill_buf().await.map(|e| !e.is_empty()) }).await;
            match ready {
                Err(_) => return Ok(None),
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(Err(err)) => return Err(err.into()),
            }

            let packet = self.read(&mut io).await?;
            if packet.protocol != protocol {
                return Err(ProtocolError::unexpected(protocol, packet.protocol).into());
            }
            Ok(Some(packet.body))
        }
        .await;

        exchange.finish();
        self.checked(result)
    }

    // ===== Statement =====

    /// Execute sql text directly, draining every fetch chunk.
    pub(crate) async fn exec_direct(&self, id: u32, sql: &str) -> Result<StmtResponse> {
        verbose!(id, "ExecDirect");
        let mut w = MarshalWriter::new(proto::EXEC_DIRECT, id);
        w.add_string(unit::DIRECT_STATEMENT, sql).add_u64(unit::PID, id.into());

        let body = self.round_trip(proto::EXEC_DIRECT, w.finish()).await?;
        let res = protocol::parse_stmt(body, sql, &[])?;
        self.drain(id, res).await
    }

    pub(crate) async fn prepare(&self, id: u32, sql: &str) -> Result<StmtResponse> {
        verbose!(id, "Prepare");
        let mut w = MarshalWriter::new(proto::PREPARE, id);
        w.add_u64(unit::PID, id.into()).add_string(unit::STATEMENT, sql);

        let body = self.round_trip(proto::PREPARE, w.finish()).await?;
        protocol::parse_stmt(body, sql, &[])
    }

    /// Execute a prepared statement with encoded parameters.
    ///
    /// `columns` from the prepare response are used to decode rows when the
    /// execute response carries none.
    pub(crate) async fn execute(
        &self,
        id: u32,
        sql: &str,
        columns: &[ColumnDesc],
        params: &Bytes,
    ) -> Result<StmtResponse> {
        verbose!(id, "Execute");
        let mut w = MarshalWriter::new(proto::EXECUTE, id);
        w.add_u64(unit::PID, id.into()).add_i64(unit::FETCH_ROWS, self.config.fetch_rows);
        if !params.is_empty() {
            w.add_binary(unit::EXEC_PARAM, params);
        }

        let body = self.round_trip(proto::EXECUTE, w.finish()).await?;
        let res = protocol::parse_stmt(body, sql, columns)?;
        self.drain(id, res).await
    }

    async fn drain(&self, id: u32, mut res: StmtResponse) -> Result<StmtResponse> {
        if res.columns.is_empty() {
            return Ok(res);
        }
        if !res.last {
            let rows = self.fetch(id, &res.columns).await?;
            res.rows.extend(rows);
            res.last = true;
        }
        res.row_count = res.rows.len() as i64;
        Ok(res)
    }

    /// Fetch chunks until the last one.
    pub(crate) async fn fetch(&self, id: u32, columns: &[ColumnDesc]) -> Result<Vec<Vec<Value>>> {
        let mut rows = vec![];
        loop {
            let mut w = MarshalWriter::new(proto::FETCH, id);
            w.add_u32(unit::FETCH_ID, id).add_i64(unit::FETCH_ROWS, self.config.fetch_rows);

            let body = self.round_trip(proto::FETCH, w.finish()).await?;
            let chunk = protocol::parse_fetch(body, columns)?;
            verbose!(id, rows = chunk.rows.len(), last = chunk.last, "Fetched");

            let empty = chunk.rows.is_empty();
            rows.extend(chunk.rows);

            if chunk.last || chunk.exhausted || empty {
                break;
            }
        }
        Ok(rows)
    }

    /// Release the server side statement.
    ///
    /// A response of another protocol is ignored, the statement is gone either way.
    pub(crate) async fn free(&self, id: u32) -> Result<()> {
        verbose!(id, "Free");
        let mut w = MarshalWriter::new(proto::FREE, id);
        w.add_u64(unit::FREE_ID, id.into());

        match self.round_trip(proto::FREE, w.finish()).await {
            Ok(body) => protocol::parse_free(body),
            Err(err) if err.is_unexpected_protocol() => Ok(()),
            Err(err) => Err(err),
        }
    }

    // ===== Append =====

    /// Open append on `table`, returns the server column metadata.
    pub(crate) async fn append_open(&self, id: u32, table: &str) -> Result<StmtResponse> {
        verbose!(id, "AppendOpen");
        let mut w = MarshalWriter::new(proto::APPEND_OPEN, id);
        w.add_u64(unit::PID, id.into())
            .add_string(unit::TABLE, table)
            .add_u64(unit::EXEC_ENDIAN, 0);

        let body = self.round_trip(proto::APPEND_OPEN, w.finish()).await?;
        protocol::parse_stmt(body, &format!("APPEND {table}"), &[])
    }

    /// Send encoded rows.
    ///
    /// With `check`, a response arriving within a few milliseconds is parsed,
    /// a late one is consumed by [`append_close`][Self::append_close].
    pub(crate) async fn append_data(&self, id: u32, rows: &[Bytes], check: bool) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut w = MarshalWriter::with_adds(proto::APPEND_DATA, id, (id & 0xffff) as u16);
        for row in rows.iter().filter(|e| !e.is_empty()) {
            w.add_binary(unit::ROWS, row);
        }
        verbose!(id, rows = rows.len(), check, "AppendData");

        if !check {
            return self.send_only(w.finish()).await;
        }

        let wait = APPEND_PEEK.min(self.config.query_timeout);
        match self.send_optional(proto::APPEND_DATA, w.finish(), wait).await? {
            Some(body) if !body.is_empty() => protocol::parse_append_data(body),
            _ => Ok(()),
        }
    }

    /// Close append, returns the server `(success, fail)` counters.
    ///
    /// Pending append data responses are consumed first.
    pub(crate) async fn append_close(&self, id: u32) -> Result<(i64, i64)> {
        verbose!(id, "AppendClose");
        self.ensure_open()?;

        let mut w = MarshalWriter::new(proto::APPEND_CLOSE, id);
        w.add_u64(unit::PID, id.into());
        let wire = w.finish();

        let mut io = self.io.lock().await;
        let exchange = Exchange::start(&self.broken);
        let result: Result<(i64, i64)> = async {
            self.write(&mut io, &wire).await?;
            loop {
                let packet = self.read(&mut io).await?;
                match packet.protocol {
                    proto::APPEND_DATA => protocol::parse_append_data(packet.body)?,
                    proto::APPEND_CLOSE => return protocol::parse_append_close(packet.body),
                    found => return Err(ProtocolError::unexpected(proto::APPEND_CLOSE, found).into()),
                }
            }
        }
        .await;

        exchange.finish();
        self.checked(result)
    }
}

/// Marks the connection broken when dropped before [`finish`][Exchange::finish].
///
/// A request future dropped between its write and its read leaves the reply
/// on the socket, the next request would read it as its own.
struct Exchange<'a> {
    broken: &'a AtomicBool,
    done: bool,
}

impl<'a> Exchange<'a> {
    fn start(broken: &'a AtomicBool) -> Exchange<'a> {
        Self { broken, done: false }
    }

    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.done {
            logged!(error, "connection broken: request canceled mid exchange");
            self.broken.store(true, Ordering::Release);
        }
    }
}

fn timed_out(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, msg)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{CmdType, Status, StmtType};
    use mock::MockServer;

    fn int32_word() -> u64 {
        (CmdType::INT32.0 as u64) << 56
    }

    #[tokio::test]
    async fn handshake_connect_and_select() {
        let server = MockServer::start(|p| match p.protocol {
            proto::EXEC_DIRECT => {
                let mut w = MarshalWriter::new(p.protocol, p.stmt_id);
                w.add_string(unit::COL_NAME, "1")
                    .add_u64(unit::COL_TYPE, int32_word())
                    .add_binary(unit::FETCH_VALUE, &[0, 0, 0, 1])
                    .add_u64(unit::RESULT, Status::Last.to_wire());
                vec![w.finish()]
            }
            _ => mock::default_reply(p),
        })
        .await;

        let conn = Connection::connect_with(server.config().user("SYS").password("MANAGER"))
            .await
            .unwrap();
        assert_eq!(conn.session_id(), mock::SESSION_ID);
        assert_eq!(conn.endian(), Endian::Little);

        let id = conn.alloc_stmt_id().unwrap();
        let res = conn.exec_direct(id, "SELECT 1 FROM DUAL").await.unwrap();
        assert_eq!(res.rows, vec![vec![Value::Int32(1)]]);
        assert_eq!(res.row_count, 1);
        assert_eq!(res.stmt_type, StmtType::SELECT);

        let connect = server.packets().into_iter().next().unwrap();
        let units = protocol::Units::collect(connect.body).unwrap();
        assert_eq!(units.first(unit::VERSION).unwrap().as_u64(), Some((4 << 48) | 2));
        assert_eq!(units.string(unit::CLIENT_ID), "CLI");
        assert_eq!(units.string(unit::DATABASE_ID), "data");
        assert_eq!(units.string(unit::USER_ID), "SYS");
        assert_eq!(units.string(unit::PASSWORD), "MANAGER");
        assert_eq!(units.first(unit::TIMEOUT).unwrap().as_u64(), Some(60));
        assert_eq!(units.string(unit::IP), "127.0.0.1");

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        let err = conn.free(id).await.unwrap_err();
        assert_eq!(err.to_string(), "connection closed");
    }

    #[tokio::test]
    async fn fetch_until_last_chunk() {
        let server = MockServer::start(|p| match p.protocol {
            proto::EXECUTE => {
                let mut w = MarshalWriter::new(p.protocol, p.stmt_id);
                w.add_u64(unit::RESULT, Status::Ok.to_wire())
                    .add_binary(unit::FETCH_VALUE, &[0, 0, 0, 1]);
                vec![w.finish()]
            }
            proto::FETCH => {
                let mut w = MarshalWriter::new(p.protocol, p.stmt_id);
                w.add_binary(unit::FETCH_VALUE, &[0, 0, 0, 2])
                    .add_u64(unit::RESULT, Status::Last.to_wire());
                vec![w.finish()]
            }
            _ => mock::default_reply(p),
        })
        .await;

        let conn = Connection::connect_with(server.config()).await.unwrap();
        let columns = [ColumnDesc::new("V".into(), int32_word())];
        let res = conn.execute(3, "SELECT V FROM T", &columns, &Bytes::new()).await.unwrap();

        assert_eq!(res.rows, vec![vec![Value::Int32(1)], vec![Value::Int32(2)]]);
        assert_eq!(server.protocols(), [proto::CONNECT, proto::EXECUTE, proto::FETCH]);
    }

    #[tokio::test]
    async fn endpoint_fallback() {
        let server = MockServer::start(mock::default_reply).await;
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = unused.local_addr().unwrap().port();
        drop(unused);

        let config = Config::parse(&format!(
            "SERVER=127.0.0.1;PORT_NO={dead};ALTERNATIVE_SERVERS=127.0.0.1:{}",
            server.port()
        ))
        .unwrap();
        let conn = Connection::connect_with(config).await.unwrap();
        assert_eq!(conn.session_id(), mock::SESSION_ID);

        let config = Config::parse(&format!("PORT_NO={dead}")).unwrap();
        let err = Connection::connect_with(config).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn unexpected_protocol_and_free() {
        let server = MockServer::start(|p| match p.protocol {
            proto::PREPARE | proto::FREE => {
                let mut w = MarshalWriter::new(proto::FETCH, p.stmt_id);
                w.add_u64(unit::RESULT, Status::Ok.to_wire());
                vec![w.finish()]
            }
            _ => mock::default_reply(p),
        })
        .await;

        let conn = Connection::connect_with(server.config()).await.unwrap();
        let err = conn.prepare(0, "SELECT 1").await.unwrap_err();
        assert_eq!(err.to_string(), "unexpected protocol 9 expected 6");
        assert!(!conn.is_closed());

        conn.free(0).await.unwrap();
    }

    #[tokio::test]
    async fn canceled_request_breaks_connection() {
        let server = MockServer::start(mock::default_reply).await;
        let conn = Connection::connect_with(server.config()).await.unwrap();

        server.delay_replies(Duration::from_millis(200));
        let slow = timeout(Duration::from_millis(50), conn.prepare(0, "SELECT 1")).await;
        assert!(slow.is_err());
        assert!(conn.is_closed());

        // the late reply must never be read as the reply of another request
        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = conn.prepare(1, "SELECT 2").await.unwrap_err();
        assert_eq!(err.to_string(), "connection closed");
        assert_eq!(server.count(proto::PREPARE), 1);
    }

    #[tokio::test]
    async fn append_close_drains_data_responses() {
        let server = MockServer::start(|p| match p.protocol {
            proto::APPEND_CLOSE => {
                let data = |_| {
                    let mut w = MarshalWriter::new(proto::APPEND_DATA, p.stmt_id);
                    w.add_u64(unit::RESULT, Status::Ok.to_wire());
                    w.finish()
                };
                let mut w = MarshalWriter::new(proto::APPEND_CLOSE, p.stmt_id);
                w.add_u64(unit::RESULT, Status::Ok.to_wire())
                    .add_u64(unit::APPEND_SUCCESS, 2)
                    .add_u64(unit::APPEND_FAILURE, 0);
                vec![data(0), data(1), w.finish()]
            }
            _ => mock::default_reply(p),
        })
        .await;

        let conn = Connection::connect_with(server.config()).await.unwrap();
        let rows = [Bytes::from_static(&[0, 1]), Bytes::new(), Bytes::from_static(&[0, 2])];
        conn.append_data(5, &rows, false).await.unwrap();
        conn.append_data(5, &rows, true).await.unwrap();
        assert_eq!(conn.append_close(5).await.unwrap(), (2, 0));

        let packets = server.packets();
        let data = &packets[1];
        assert_eq!(data.adds, 5);
        assert_eq!(protocol::Units::collect(data.body.clone()).unwrap().all(unit::ROWS).len(), 2);
    }
}
