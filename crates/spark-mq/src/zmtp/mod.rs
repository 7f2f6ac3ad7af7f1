//! # zmtp 模块说明
//!
//! ## 意图（Why）
//! - 套接字层把握手与成帧委托给外部协议引擎；为了让两个 [`Socket`](crate::Socket) 开箱即可通过环回互通，
//!   这里提供一个遵循 ZMTP 3.1 线格式的参考引擎；
//! - 它只是 [`SessionFactory`] 的一个实现，套接字核心不依赖其中任何细节。
//!
//! ## 契约（What）
//! - 支持 NULL 与 PLAIN 机制；PLAIN 服务端配置了凭据时逐字节校验，未配置时接受任意凭据；
//! - CURVE 在发送任何字节之前即以握手失败拒绝；
//! - 握手阶段校验 `Socket-Type` 兼容性（CLIENT 只与 SERVER 配对），不兼容时先回送 ERROR 再失败；
//! - 握手完成后，数据帧产出 [`MessageKind::Data`](crate::MessageKind::Data)，命令帧产出
//!   [`MessageKind::Command`](crate::MessageKind::Command)，均不做解释。
//!
//! ## 注意事项（Trade-offs）
//! - CLIENT/SERVER 不允许多段消息；收到带 MORE 标志的数据帧时产出一条携带接收错误的消息并继续读取，
//!   不会中断连接；
//! - 单帧上限由 `max_frame_size` 控制，超过上限视为致命协议错误。

mod command;
mod frame;
mod greeting;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::{
    config::{DEFAULT_MAX_FRAME_SIZE, PlainCredentials},
    error::{self, DeliveryError, SocketError, handshake_error, map_io_error},
    message::Message,
    session::{
        HandshakeOutcome, HandshakeParams, Mechanism, Metadata, ProtocolSession, SessionFactory,
        SessionReader, SessionWriter, SocketType,
    },
    transport::{BoxedReader, BoxedWriter, TransportStream},
};

use command::{Command, SOCKET_TYPE_PROPERTY};
use greeting::{GREETING_LEN, Greeting};

const MULTIPART_CODE: &str = "spark.mq.session.multipart_rejected";

/// 内置 ZMTP 引擎的会话工厂。
#[derive(Clone, Debug)]
pub struct ZmtpSessionFactory {
    max_frame_size: u64,
}

impl ZmtpSessionFactory {
    pub fn new(max_frame_size: u64) -> Self {
        Self { max_frame_size }
    }
}

impl Default for ZmtpSessionFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl SessionFactory for ZmtpSessionFactory {
    fn open(&self, transport: TransportStream) -> Box<dyn ProtocolSession> {
        let (reader, writer) = transport.into_split();
        Box::new(ZmtpSession {
            reader: BufReader::new(reader),
            writer,
            max_frame_size: self.max_frame_size,
        })
    }
}

struct ZmtpSession {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    max_frame_size: u64,
}

impl ZmtpSession {
    async fn write_raw(&mut self, raw: &[u8]) -> Result<(), SocketError> {
        self.writer
            .write_all(raw)
            .await
            .map_err(|err| map_io_error(error::HANDSHAKE, err))?;
        self.writer
            .flush()
            .await
            .map_err(|err| map_io_error(error::HANDSHAKE, err))
    }

    async fn write_command(&mut self, command: BytesMut) -> Result<(), SocketError> {
        let mut framed = BytesMut::new();
        frame::encode(true, false, &command, &mut framed);
        self.write_raw(&framed).await
    }

    async fn read_command(&mut self) -> Result<Command, SocketError> {
        let frame = frame::read_frame(&mut self.reader, self.max_frame_size)
            .await?
            .ok_or_else(|| SocketError::handshake("peer closed the connection during handshake"))?;
        if !frame.command {
            return Err(SocketError::handshake(
                "peer sent a data frame before completing the handshake",
            ));
        }
        let command = command::decode(frame.body)?;
        trace!(command = %command.name_lossy(), "handshake command received");
        Ok(command)
    }

    /// 读取期望的命令；对端回送 ERROR 时把原因带入握手失败。
    async fn expect_command(&mut self, expected: &str) -> Result<Command, SocketError> {
        let command = self.read_command().await?;
        if command.is(expected) {
            return Ok(command);
        }
        if command.is(command::ERROR) {
            return Err(SocketError::handshake(format!(
                "peer rejected the handshake: {}",
                command::decode_error(command.body)
            )));
        }
        Err(SocketError::handshake(format!(
            "expected {expected}, peer sent {}",
            command.name_lossy()
        )))
    }

    async fn reject(&mut self, reason: String) -> SocketError {
        if let Err(err) = self.write_command(command::encode_error(&reason)).await {
            debug!(error = %err, "failed to deliver ERROR command to peer");
        }
        SocketError::handshake(reason)
    }

    fn metadata_command(
        name: &str,
        socket_type: SocketType,
        metadata: &Metadata,
    ) -> Result<BytesMut, SocketError> {
        let properties = std::iter::once((SOCKET_TYPE_PROPERTY, socket_type.as_str().as_bytes()))
            .chain(
                metadata
                    .iter()
                    .filter(|(name, _)| name.as_str() != SOCKET_TYPE_PROPERTY)
                    .map(|(name, value)| (name.as_str(), &value[..])),
            );
        let body = command::encode_properties(properties)?;
        Ok(command::encode(name, &body))
    }

    /// 校验对端在 READY/INITIATE 中声明的套接字类型。
    async fn accept_peer_metadata(
        &mut self,
        own: SocketType,
        body: Bytes,
    ) -> Result<HandshakeOutcome, SocketError> {
        let peer_metadata = command::decode_properties(body)?;
        let Some(raw_type) = peer_metadata.get(SOCKET_TYPE_PROPERTY) else {
            return Err(self
                .reject("missing Socket-Type property".to_owned())
                .await);
        };
        let Some(peer_socket_type) = SocketType::from_wire(raw_type) else {
            let reason = format!(
                "unsupported peer socket type `{}`",
                String::from_utf8_lossy(raw_type)
            );
            return Err(self.reject(reason).await);
        };
        if !own.is_compatible_with(peer_socket_type) {
            let reason = format!("{own} socket cannot talk to a {peer_socket_type} socket");
            return Err(self.reject(reason).await);
        }
        Ok(HandshakeOutcome {
            peer_socket_type,
            peer_metadata,
        })
    }

    async fn null_handshake(
        &mut self,
        params: &HandshakeParams<'_>,
    ) -> Result<HandshakeOutcome, SocketError> {
        let ready = Self::metadata_command(command::READY, params.socket_type, params.metadata)?;
        self.write_command(ready).await?;
        let peer_ready = self.expect_command(command::READY).await?;
        self.accept_peer_metadata(params.socket_type, peer_ready.body)
            .await
    }

    async fn plain_client_handshake(
        &mut self,
        params: &HandshakeParams<'_>,
    ) -> Result<HandshakeOutcome, SocketError> {
        let (username, password) = params
            .credentials
            .map(|c| (c.username.as_str(), c.password.as_str()))
            .unwrap_or(("", ""));
        self.write_command(command::encode_hello(username, password)?)
            .await?;
        self.expect_command(command::WELCOME).await?;

        let initiate =
            Self::metadata_command(command::INITIATE, params.socket_type, params.metadata)?;
        self.write_command(initiate).await?;
        let ready = self.expect_command(command::READY).await?;
        self.accept_peer_metadata(params.socket_type, ready.body)
            .await
    }

    async fn plain_server_handshake(
        &mut self,
        params: &HandshakeParams<'_>,
    ) -> Result<HandshakeOutcome, SocketError> {
        let hello = self.expect_command(command::HELLO).await?;
        let (username, password) = command::decode_hello(hello.body)?;
        if let Some(expected) = params.credentials
            && !credentials_match(expected, &username, &password)
        {
            return Err(self.reject("invalid credentials".to_owned()).await);
        }
        self.write_command(command::encode(command::WELCOME, &[]))
            .await?;

        let initiate = self.expect_command(command::INITIATE).await?;
        let outcome = self
            .accept_peer_metadata(params.socket_type, initiate.body)
            .await?;
        let ready = Self::metadata_command(command::READY, params.socket_type, params.metadata)?;
        self.write_command(ready).await?;
        Ok(outcome)
    }

    /// 交换问候并按机制完成握手；由 `prepare` 统一归类失败。
    async fn negotiate(
        &mut self,
        params: &HandshakeParams<'_>,
    ) -> Result<HandshakeOutcome, SocketError> {
        if params.mechanism == Mechanism::Curve {
            return Err(SocketError::handshake(
                "CURVE mechanism is not supported by the built-in ZMTP session",
            ));
        }

        let ours = Greeting::new(params.mechanism, params.as_server);
        self.write_raw(&ours.encode()).await?;
        let mut raw = [0u8; GREETING_LEN];
        self.reader
            .read_exact(&mut raw)
            .await
            .map_err(|err| map_io_error(error::HANDSHAKE, err))?;
        let peer = Greeting::decode(&raw)?;
        debug!(
            mechanism = %peer.mechanism,
            version = ?peer.version,
            peer_as_server = peer.as_server,
            "peer greeting received"
        );

        if peer.mechanism != params.mechanism {
            return Err(SocketError::handshake(format!(
                "mechanism mismatch: local {}, peer {}",
                params.mechanism, peer.mechanism
            )));
        }

        match params.mechanism {
            Mechanism::Null => self.null_handshake(params).await,
            Mechanism::Plain if peer.as_server == params.as_server => Err(SocketError::handshake(
                "PLAIN requires exactly one peer to act as server",
            )),
            Mechanism::Plain if params.as_server => self.plain_server_handshake(params).await,
            Mechanism::Plain => self.plain_client_handshake(params).await,
            Mechanism::Curve => Err(SocketError::handshake("CURVE mechanism is not supported")),
        }
    }
}

fn credentials_match(expected: &PlainCredentials, username: &[u8], password: &[u8]) -> bool {
    expected.username.as_bytes() == username && expected.password.as_bytes() == password
}

#[async_trait]
impl ProtocolSession for ZmtpSession {
    async fn prepare(
        &mut self,
        params: &HandshakeParams<'_>,
    ) -> Result<HandshakeOutcome, SocketError> {
        self.negotiate(params).await.map_err(handshake_error)
    }

    fn into_split(self: Box<Self>) -> (Box<dyn SessionReader>, Box<dyn SessionWriter>) {
        let session = *self;
        (
            Box::new(ZmtpReader {
                reader: session.reader,
                max_frame_size: session.max_frame_size,
            }),
            Box::new(ZmtpWriter {
                writer: session.writer,
                shut_down: false,
            }),
        )
    }
}

struct ZmtpReader {
    reader: BufReader<BoxedReader>,
    max_frame_size: u64,
}

#[async_trait]
impl SessionReader for ZmtpReader {
    async fn read_message(&mut self) -> Result<Option<Message>, SocketError> {
        let Some(frame) = frame::read_frame(&mut self.reader, self.max_frame_size).await? else {
            return Ok(None);
        };
        if frame.command {
            return Ok(Some(Message::command(frame.body)));
        }
        if frame.more {
            return Ok(Some(Message::failed(DeliveryError::new(
                MULTIPART_CODE,
                "multipart messages are not allowed on CLIENT/SERVER sockets",
            ))));
        }
        Ok(Some(Message::data(frame.body)))
    }
}

struct ZmtpWriter {
    writer: BoxedWriter,
    shut_down: bool,
}

#[async_trait]
impl SessionWriter for ZmtpWriter {
    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), SocketError> {
        if self.shut_down {
            return Err(SocketError::Closed);
        }
        let mut framed = BytesMut::with_capacity(payload.len() + 9);
        frame::encode(false, false, payload, &mut framed);
        self.writer
            .write_all(&framed)
            .await
            .map_err(|err| map_io_error(error::WRITE, err))?;
        self.writer
            .flush()
            .await
            .map_err(|err| map_io_error(error::WRITE, err))
    }

    async fn shutdown(&mut self) -> Result<(), SocketError> {
        if std::mem::replace(&mut self.shut_down, true) {
            return Ok(());
        }
        match self.writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(map_io_error(error::SHUTDOWN, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::transport::{TransportListener, dial};

    async fn transport_pair() -> (TransportStream, TransportStream) {
        let listener = TransportListener::bind(&Endpoint::parse("tcp://127.0.0.1:0").expect("ep"))
            .await
            .expect("bind");
        let target = Endpoint::parse(&listener.local_addr().to_endpoint()).expect("target");
        let (client, server) = tokio::join!(dial(&target), listener.accept());
        (client.expect("dial"), server.expect("accept"))
    }

    struct Side<'a> {
        mechanism: Mechanism,
        socket_type: SocketType,
        as_server: bool,
        credentials: Option<&'a PlainCredentials>,
    }

    async fn handshake(
        client: Side<'_>,
        server: Side<'_>,
    ) -> (
        Result<(HandshakeOutcome, Box<dyn ProtocolSession>), SocketError>,
        Result<(HandshakeOutcome, Box<dyn ProtocolSession>), SocketError>,
    ) {
        let factory = ZmtpSessionFactory::default();
        let (client_stream, server_stream) = transport_pair().await;
        let metadata = Metadata::new();
        let mut client_session = factory.open(client_stream);
        let mut server_session = factory.open(server_stream);

        let client_params = HandshakeParams {
            mechanism: client.mechanism,
            socket_type: client.socket_type,
            as_server: client.as_server,
            metadata: &metadata,
            credentials: client.credentials,
        };
        let server_params = HandshakeParams {
            mechanism: server.mechanism,
            socket_type: server.socket_type,
            as_server: server.as_server,
            metadata: &metadata,
            credentials: server.credentials,
        };
        let (c, s) = tokio::join!(
            client_session.prepare(&client_params),
            server_session.prepare(&server_params)
        );
        (
            c.map(|outcome| (outcome, client_session)),
            s.map(|outcome| (outcome, server_session)),
        )
    }

    fn side<'a>(mechanism: Mechanism, socket_type: SocketType, as_server: bool) -> Side<'a> {
        Side {
            mechanism,
            socket_type,
            as_server,
            credentials: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn null_handshake_exchanges_socket_types_then_frames() {
        let (client, server) = handshake(
            side(Mechanism::Null, SocketType::Client, false),
            side(Mechanism::Null, SocketType::Server, true),
        )
        .await;
        let (client_outcome, client_session) = client.expect("client handshake");
        let (server_outcome, server_session) = server.expect("server handshake");
        assert_eq!(client_outcome.peer_socket_type, SocketType::Server);
        assert_eq!(server_outcome.peer_socket_type, SocketType::Client);

        let (_, mut writer) = client_session.into_split();
        let (mut reader, _) = server_session.into_split();
        writer.send_frame(b"hello").await.expect("send");
        let message = reader
            .read_message()
            .await
            .expect("read")
            .expect("one message");
        assert_eq!(message.payload().as_ref(), b"hello");

        writer.shutdown().await.expect("shutdown");
        writer.shutdown().await.expect("second shutdown is a no-op");
        assert!(reader.read_message().await.expect("clean eof").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn incompatible_socket_types_are_rejected() {
        let (client, server) = handshake(
            side(Mechanism::Null, SocketType::Client, false),
            side(Mechanism::Null, SocketType::Client, true),
        )
        .await;
        assert!(matches!(client, Err(SocketError::Handshake { .. })));
        assert!(matches!(server, Err(SocketError::Handshake { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mechanism_mismatch_fails_both_sides() {
        let (client, server) = handshake(
            side(Mechanism::Plain, SocketType::Client, false),
            side(Mechanism::Null, SocketType::Server, true),
        )
        .await;
        let err = client.err().expect("client must fail");
        assert!(err.to_string().contains("mechanism mismatch"));
        assert!(server.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plain_handshake_checks_credentials() {
        let expected = PlainCredentials::new("admin", "secret");
        let wrong = PlainCredentials::new("admin", "guess");

        let (client, server) = handshake(
            Side {
                credentials: Some(&expected),
                ..side(Mechanism::Plain, SocketType::Client, false)
            },
            Side {
                credentials: Some(&expected),
                ..side(Mechanism::Plain, SocketType::Server, true)
            },
        )
        .await;
        assert!(client.is_ok(), "matching credentials: {:?}", client.err());
        assert!(server.is_ok(), "matching credentials: {:?}", server.err());

        let (client, server) = handshake(
            Side {
                credentials: Some(&wrong),
                ..side(Mechanism::Plain, SocketType::Client, false)
            },
            Side {
                credentials: Some(&expected),
                ..side(Mechanism::Plain, SocketType::Server, true)
            },
        )
        .await;
        let client_err = client.err().expect("client must be rejected");
        assert!(client_err.to_string().contains("invalid credentials"));
        assert!(server.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn curve_is_rejected_without_touching_the_wire() {
        let factory = ZmtpSessionFactory::default();
        let (client_stream, _server_stream) = transport_pair().await;
        let metadata = Metadata::new();
        let mut session = factory.open(client_stream);
        let err = session
            .prepare(&HandshakeParams {
                mechanism: Mechanism::Curve,
                socket_type: SocketType::Client,
                as_server: false,
                metadata: &metadata,
                credentials: None,
            })
            .await
            .expect_err("curve unsupported");
        assert!(err.to_string().contains("CURVE"));
    }

    /// 让对端写出 `script` 后关闭写方向，本端以 NULL 客户端身份握手。
    async fn handshake_against_script(script: Vec<u8>) -> SocketError {
        let (client_stream, server_stream) = transport_pair().await;
        let (_peer_reader, mut peer_writer) = server_stream.into_split();
        peer_writer.write_all(&script).await.expect("scripted bytes");
        peer_writer.shutdown().await.expect("peer half-close");

        let metadata = Metadata::new();
        let mut session = ZmtpSessionFactory::default().open(client_stream);
        session
            .prepare(&HandshakeParams {
                mechanism: Mechanism::Null,
                socket_type: SocketType::Client,
                as_server: false,
                metadata: &metadata,
                credentials: None,
            })
            .await
            .expect_err("peer went away mid-handshake")
    }

    fn assert_handshake_with_io_source(err: &SocketError) {
        use std::error::Error as _;

        assert!(matches!(err, SocketError::Handshake { .. }), "{err:?}");
        let source = err.source().expect("io error kept as source");
        assert!(source.downcast_ref::<std::io::Error>().is_some(), "{source:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn peer_closing_inside_the_greeting_is_a_handshake_failure() {
        let partial = Greeting::new(Mechanism::Null, true).encode()[..10].to_vec();
        let err = handshake_against_script(partial).await;
        assert_handshake_with_io_source(&err);
        assert_eq!(err.code(), error::HANDSHAKE.code);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn peer_closing_inside_a_handshake_frame_is_a_handshake_failure() {
        let mut script = Greeting::new(Mechanism::Null, true).encode().to_vec();
        // 命令帧声明 20 字节，只给 5 字节。
        script.extend_from_slice(&[0x04, 20]);
        script.extend_from_slice(b"\x05READ");
        let err = handshake_against_script(script).await;
        assert_handshake_with_io_source(&err);
    }
}
