#![deny(unsafe_code)]
#![doc = r#"
# spark-mq

## 定位（Why）
- 消息队列套接字的会话层：客户端按固定间隔重试拨号，服务端监听并接受对端，
  握手成功的连接登记到有序注册表，所有连接的入站消息汇入同一条流；
- 线格式与握手委托给可替换的协议引擎（[`SessionFactory`]），默认提供遵循 ZMTP 3.1 的
  [`ZmtpSessionFactory`]，支持 NULL 与 PLAIN 机制。

## 结构（How）
- [`Socket`]：唯一的调用入口，角色在构造时固定；
- [`SocketConfig`]：可从 TOML 加载的运行参数（重试、入站容量、发送策略、握手超时、帧上限、元数据、PLAIN 凭据）；
- [`CallContext`]：为拨号、接受与握手附加取消与截止；
- [`SocketError`] / [`BindError`] / [`DeliveryError`]：调用级、绑定级与消息级三层错误。

## 使用示例（What）
```no_run
use spark_mq::{Mechanism, Socket};

# async fn demo() -> Result<(), Box<dyn std::error::Error>> {
let server = Socket::server(Mechanism::Null);
let addr = server.listen("tcp://127.0.0.1:0").await?;
let endpoint = addr.to_endpoint();

let client = Socket::client(Mechanism::Null);
let (connected, accepted) = tokio::join!(client.connect(&endpoint), server.accept());
connected?;
accepted?;

client.send(b"ping").await?;
let message = server.recv().await?;
assert_eq!(message.payload().as_ref(), b"ping");

client.close().await?;
server.close().await?;
# Ok(())
# }
```

## 注意事项（Trade-offs）
- 入站流有容量上限，消费者过慢时扇入任务挂起并停止读取传输层，压力经 TCP 流控回传给对端；
- 本库不安装任何 `tracing` 订阅者，日志输出由宿主程序决定。
"#]

pub mod config;
pub mod contract;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod session;
pub mod socket;
pub mod transport;
pub mod zmtp;

mod util;

pub use config::{PlainCredentials, RetryPolicy, SendPolicy, SocketConfig};
pub use contract::{CallContext, CallContextBuilder, Cancellation, Deadline};
pub use endpoint::{Endpoint, Scheme, TransportAddr};
pub use error::{BindError, DeliveryError, ErrorCategory, OperationKind, SocketError};
pub use message::{Message, MessageKind};
pub use session::{
    HandshakeOutcome, HandshakeParams, Mechanism, Metadata, ProtocolSession, SessionFactory,
    SessionReader, SessionWriter, SocketType,
};
pub use socket::{Role, Socket, SocketBuilder};
pub use transport::TransportStream;
pub use zmtp::ZmtpSessionFactory;
