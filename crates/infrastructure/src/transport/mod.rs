//! 协调器与工作进程之间的消息总线
//!
//! 每条通道承载按行分帧的 JSON 文本。同一通道上的消息按发送顺序送达。
//! 通道可以是 TCP 连接，也可以是进程内的双工管道，两者走同一套分帧逻辑。

pub mod connection;
pub mod endpoint;

pub use connection::{
    spawn_connection, BoxedTransport, ConnectionEvent, ConnectionHandle, ConnectionId, Transport,
    MAX_FRAME_LENGTH,
};
pub use endpoint::{local_endpoint, Endpoint, IncomingConnections, LocalEndpoint, TcpAcceptor};
