//! 连接层
//!
//! 命令只依赖 [`Peer`] 这一抽象: 能够发送一帧消息并报告是否成功。
//! [`TcpConnection`] 以换行分隔的JSON在TCP上传输,
//! [`MemoryPeer`] 则用于进程内连接。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::errors::SawResult;
use crate::protocol::Frame;

/// 连接描述符, 在一个进程内对每个存活的连接唯一
pub type ConnectionId = u64;

pub trait Peer: Send + Sync {
    /// 发送一帧消息, 返回是否已交给传输层
    fn send(&self, frame: Frame) -> bool;

    fn connection_id(&self) -> ConnectionId;

    fn address(&self) -> &str;

    /// 主动关闭连接
    fn close(&self) {}
}

/// 从连接上读到的事件
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// 一行已解析的JSON, 无法解析的行以 `Value::Null` 送达
    Message(Value),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub connection: ConnectionId,
    pub event: InboundEvent,
}

/// TCP连接
pub struct TcpConnection {
    id: ConnectionId,
    address: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

impl TcpConnection {
    /// 拆分连接并启动读写任务, 读到的消息投递到 `inbound`
    pub fn spawn(
        stream: TcpStream,
        id: ConnectionId,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> SawResult<Arc<TcpConnection>> {
        let address = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(id, writer, outbound_rx));
        tokio::spawn(read_loop(id, reader, inbound));

        debug!(connection = id, address = %address, "连接已建立");
        Ok(Arc::new(Self {
            id,
            address,
            outbound: Mutex::new(Some(outbound_tx)),
        }))
    }
}

impl Peer for TcpConnection {
    fn send(&self, frame: Frame) -> bool {
        match self.outbound.lock().as_ref() {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn close(&self) {
        // 丢弃发送端后写任务会关闭写半边
        self.outbound.lock().take();
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        let mut line = match frame.encode() {
            Ok(line) => line,
            Err(e) => {
                error!(connection = id, "消息编码失败: {}", e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(connection = id, "写入连接失败: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    id: ConnectionId,
    reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let value = serde_json::from_str::<Value>(&line).unwrap_or_else(|e| {
                    warn!(connection = id, "无法解析的消息: {}", e);
                    Value::Null
                });
                let event = Inbound {
                    connection: id,
                    event: InboundEvent::Message(value),
                };
                if inbound.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(connection = id, "读取连接失败: {}", e);
                break;
            }
        }
    }
    let _ = inbound.send(Inbound {
        connection: id,
        event: InboundEvent::Closed,
    });
}

/// 进程内连接, 发出的帧进入一个通道
pub struct MemoryPeer {
    id: ConnectionId,
    address: String,
    outbound: mpsc::UnboundedSender<Frame>,
    failing: AtomicBool,
    closed: AtomicBool,
    sent: AtomicUsize,
}

impl MemoryPeer {
    pub fn new(
        id: ConnectionId,
        address: impl Into<String>,
    ) -> (Arc<MemoryPeer>, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id,
            address: address.into(),
            outbound,
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: AtomicUsize::new(0),
        });
        (peer, receiver)
    }

    /// 打开后所有发送都会失败
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 成功交付的帧数
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl Peer for MemoryPeer {
    fn send(&self, frame: Frame) -> bool {
        if self.failing.load(Ordering::SeqCst) || self.is_closed() {
            return false;
        }
        let delivered = self.outbound.send(frame).is_ok();
        if delivered {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
        delivered
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Signal;
    use tokio::net::TcpListener;

    #[test]
    fn test_memory_peer_counts_and_fails() {
        let (peer, mut frames) = MemoryPeer::new(3, "memory");
        assert!(peer.send(Frame::Signal(Signal::Hello)));
        assert_eq!(peer.sent_count(), 1);
        assert_eq!(frames.try_recv().unwrap(), Frame::Signal(Signal::Hello));

        peer.set_failing(true);
        assert!(!peer.send(Frame::Signal(Signal::Bye)));
        peer.set_failing(false);
        peer.close();
        assert!(!peer.send(Frame::Signal(Signal::Bye)));
        assert_eq!(peer.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_tcp_connection_exchanges_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpConnection::spawn(stream, 1, server_tx).unwrap()
        });

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let stream = TcpStream::connect(address).await.unwrap();
        let client = TcpConnection::spawn(stream, 2, client_tx).unwrap();
        let server = accept.await.unwrap();

        assert!(server.send(Frame::Signal(Signal::Hello)));
        let received = client_rx.recv().await.unwrap();
        assert_eq!(received.connection, 2);
        assert_eq!(
            received.event,
            InboundEvent::Message(Value::String("HELLO".to_string()))
        );

        client.close();
        let closed = server_rx.recv().await.unwrap();
        assert_eq!(closed.event, InboundEvent::Closed);
        assert!(!client.send(Frame::Signal(Signal::Bye)));
    }
}
