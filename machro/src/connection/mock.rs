//! In process server speaking the native protocol, for tests.
use bytes::Bytes;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufStream},
    net::TcpListener,
};

use super::Config;
use crate::protocol::{
    HANDSHAKE, HANDSHAKE_READY, MarshalWriter, Packet, Status, packet::read_packet, proto, unit,
};

pub const SESSION_ID: u64 = 0x51;

type Handler = dyn Fn(&Packet) -> Vec<Bytes> + Send + Sync;

/// Accepts any number of connections, answers connect itself and every other
/// request with the handler replies, in order.
pub struct MockServer {
    port: u16,
    packets: Arc<Mutex<Vec<Packet>>>,
    delay: Arc<Mutex<Duration>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> MockServer
    where
        F: Fn(&Packet) -> Vec<Bytes> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let packets = Arc::new(Mutex::new(vec![]));
        let handler: Arc<Handler> = Arc::new(handler);

        let delay = Arc::new(Mutex::new(Duration::ZERO));

        let seen = packets.clone();
        let wait = delay.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let io = BufStream::new(tcp);
                tokio::spawn(serve(io, handler.clone(), seen.clone(), wait.clone()));
            }
        });

        MockServer { port, packets, delay }
    }

    /// Hold every subsequent reply for `delay`.
    pub fn delay_replies(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn conn_string(&self) -> String {
        format!("SERVER=127.0.0.1;PORT_NO={};UID=sys;PWD=manager;CONNTYPE=1", self.port)
    }

    pub fn config(&self) -> Config {
        Config::parse(&self.conn_string()).unwrap()
    }

    /// Every received request, connect included.
    pub fn packets(&self) -> Vec<Packet> {
        self.packets.lock().unwrap().clone()
    }

    pub fn protocols(&self) -> Vec<u8> {
        self.packets().iter().map(|e| e.protocol).collect()
    }

    pub fn count(&self, protocol: u8) -> usize {
        self.packets().iter().filter(|e| e.protocol == protocol).count()
    }
}

async fn serve(
    mut io: BufStream<tokio::net::TcpStream>,
    handler: Arc<Handler>,
    seen: Arc<Mutex<Vec<Packet>>>,
    delay: Arc<Mutex<Duration>>,
) {
    let mut hello = [0u8; 9];
    if io.read_exact(&mut hello).await.is_err() || &hello != HANDSHAKE {
        return;
    }
    if io.write_all(HANDSHAKE_READY).await.is_err() || io.flush().await.is_err() {
        return;
    }

    while let Ok(packet) = read_packet(&mut io).await {
        seen.lock().unwrap().push(packet.clone());

        let replies = match packet.protocol {
            proto::CONNECT => {
                let mut w = MarshalWriter::new(proto::CONNECT, 0);
                w.add_u64(unit::RESULT, Status::Ok.to_wire())
                    .add_u64(unit::SESSION_ID, SESSION_ID)
                    .add_u32(unit::ENDIAN, 0);
                vec![w.finish()]
            }
            _ => handler(&packet),
        };

        let wait = *delay.lock().unwrap();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        for reply in replies {
            if io.write_all(&reply).await.is_err() {
                return;
            }
        }
        if io.flush().await.is_err() {
            return;
        }
    }
}

/// Successful reply of the request protocol.
pub fn ok(packet: &Packet) -> MarshalWriter {
    let mut w = MarshalWriter::new(packet.protocol, packet.stmt_id);
    w.add_u64(unit::RESULT, Status::Ok.to_wire());
    w
}

/// Minimal successful reply, no reply for append data.
pub fn default_reply(packet: &Packet) -> Vec<Bytes> {
    let mut w = MarshalWriter::new(packet.protocol, packet.stmt_id);
    match packet.protocol {
        proto::APPEND_DATA | proto::DISCONNECT => return vec![],
        proto::EXECUTE => {
            w.add_u64(unit::RESULT, Status::Ok.to_wire()).add_u64(unit::ROWS, 1);
        }
        proto::EXEC_DIRECT | proto::FETCH => {
            w.add_u64(unit::RESULT, Status::Last.to_wire()).add_u64(unit::ROWS, 0);
        }
        proto::APPEND_CLOSE => {
            w.add_u64(unit::RESULT, Status::Ok.to_wire())
                .add_u64(unit::APPEND_SUCCESS, 0)
                .add_u64(unit::APPEND_FAILURE, 0);
        }
        _ => {
            w.add_u64(unit::RESULT, Status::Ok.to_wire());
        }
    }
    vec![w.finish()]
}
