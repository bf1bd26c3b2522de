use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use taskq_core::SchedulerResult;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 单帧最大长度
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// 通道上发生的事件，投递给拥有该通道的事件循环
#[derive(Debug)]
pub enum ConnectionEvent<M> {
    Message {
        connection_id: ConnectionId,
        message: M,
    },
    Closed {
        connection_id: ConnectionId,
    },
}

/// 通道发送端
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// 把一帧交给写任务，通道已关闭时返回 false
    pub fn send(&self, frame: String) -> bool {
        !self.cancel.is_cancelled() && self.outbound.send(frame).is_ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }

    /// 不经过传输层的通道，帧直接进入返回的接收端
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                outbound,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }
}

/// 在传输层上启动读写任务
///
/// 读任务把每一帧交给 `decode`，解码失败的帧记录日志后丢弃；
/// 任一方向结束都会关闭整个通道，并投递一次 [`ConnectionEvent::Closed`]。
pub fn spawn_connection<M, F>(
    transport: BoxedTransport,
    events: mpsc::UnboundedSender<ConnectionEvent<M>>,
    decode: F,
) -> ConnectionHandle
where
    M: Send + 'static,
    F: Fn(&str) -> SchedulerResult<M> + Send + 'static,
{
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let cancel = CancellationToken::new();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let (read_half, write_half) = tokio::io::split(transport);
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
    );
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
    );

    let write_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_cancel.cancelled() => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = writer.send(frame).await {
                            warn!("通道 {} 写入失败: {}", id, e);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = SinkExt::<String>::close(&mut writer).await;
        write_cancel.cancel();
    });

    let read_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = read_cancel.cancelled() => break,
                frame = reader.next() => match frame {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode(&line) {
                            Ok(message) => {
                                let event = ConnectionEvent::Message { connection_id: id, message };
                                if events.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("通道 {} 丢弃无法解析的消息: {}", id, e),
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("通道 {} 丢弃超长消息", id);
                    }
                    Some(Err(e)) => {
                        debug!("通道 {} 读取失败: {}", id, e);
                        break;
                    }
                    None => break,
                },
            }
        }
        read_cancel.cancel();
        let _ = events.send(ConnectionEvent::Closed { connection_id: id });
        debug!("通道 {} 已关闭", id);
    });

    ConnectionHandle {
        id,
        outbound,
        cancel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskq_core::SchedulerError;

    fn decode(line: &str) -> SchedulerResult<u32> {
        line.parse()
            .map_err(|_| SchedulerError::Protocol(format!("not a number: {line}")))
    }

    #[tokio::test]
    async fn test_frames_delivered_in_order_and_bad_frames_dropped() {
        let (left, right) = tokio::io::duplex(1024);
        let (left_tx, mut left_rx) = mpsc::unbounded_channel();
        let (right_tx, mut right_rx) = mpsc::unbounded_channel();

        let left = spawn_connection(Box::new(left), left_tx, decode);
        let right = spawn_connection(Box::new(right), right_tx, decode);

        assert!(left.send("1".to_string()));
        assert!(left.send("garbage".to_string()));
        assert!(left.send("2".to_string()));

        for expected in [1, 2] {
            match right_rx.recv().await {
                Some(ConnectionEvent::Message { message, .. }) => assert_eq!(message, expected),
                other => panic!("Expected message, got {other:?}"),
            }
        }

        right.close();
        match right_rx.recv().await {
            Some(ConnectionEvent::Closed { connection_id }) => assert_eq!(connection_id, right.id()),
            other => panic!("Expected Closed, got {other:?}"),
        }
        match left_rx.recv().await {
            Some(ConnectionEvent::Closed { connection_id }) => assert_eq!(connection_id, left.id()),
            other => panic!("Expected Closed, got {other:?}"),
        }
        assert!(!right.send("3".to_string()));
    }

    #[tokio::test]
    async fn test_detached_handle() {
        let (handle, mut rx) = ConnectionHandle::detached();
        assert!(handle.send("hello".to_string()));
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        handle.close();
        assert!(!handle.send("again".to_string()));
    }
}
