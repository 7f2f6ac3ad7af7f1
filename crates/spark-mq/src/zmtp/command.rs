use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::SocketError;
use crate::session::Metadata;

pub(crate) const READY: &str = "READY";
pub(crate) const ERROR: &str = "ERROR";
pub(crate) const HELLO: &str = "HELLO";
pub(crate) const WELCOME: &str = "WELCOME";
pub(crate) const INITIATE: &str = "INITIATE";

pub(crate) const SOCKET_TYPE_PROPERTY: &str = "Socket-Type";

/// 解码后的命令：名称 + 命令体。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Command {
    pub(crate) name: Bytes,
    pub(crate) body: Bytes,
}

impl Command {
    pub(crate) fn is(&self, name: &str) -> bool {
        self.name.as_ref() == name.as_bytes()
    }

    pub(crate) fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// 编码命令帧体：1 字节名称长度 + 名称 + 命令体。
pub(crate) fn encode(name: &str, body: &[u8]) -> BytesMut {
    let mut dst = BytesMut::with_capacity(1 + name.len() + body.len());
    dst.put_u8(name.len() as u8);
    dst.put_slice(name.as_bytes());
    dst.put_slice(body);
    dst
}

pub(crate) fn decode(mut frame: Bytes) -> Result<Command, SocketError> {
    if frame.is_empty() {
        return Err(SocketError::protocol("empty command frame"));
    }
    let name_len = usize::from(frame.get_u8());
    if name_len == 0 || frame.len() < name_len {
        return Err(SocketError::protocol("truncated command name"));
    }
    let name = frame.split_to(name_len);
    Ok(Command { name, body: frame })
}

/// 编码元数据属性：`name-len(1) name value-len(4, BE) value`。
pub(crate) fn encode_properties<'a>(
    properties: impl IntoIterator<Item = (&'a str, &'a [u8])>,
) -> Result<BytesMut, SocketError> {
    let mut dst = BytesMut::new();
    for (name, value) in properties {
        let name_len = u8::try_from(name.len())
            .map_err(|_| SocketError::protocol(format!("property name `{name}` is too long")))?;
        if name_len == 0 {
            return Err(SocketError::protocol("empty property name"));
        }
        let value_len = u32::try_from(value.len())
            .map_err(|_| SocketError::protocol(format!("property `{name}` value is too long")))?;
        dst.put_u8(name_len);
        dst.put_slice(name.as_bytes());
        dst.put_u32(value_len);
        dst.put_slice(value);
    }
    Ok(dst)
}

pub(crate) fn decode_properties(mut body: Bytes) -> Result<Metadata, SocketError> {
    let mut metadata = Metadata::new();
    while body.has_remaining() {
        let name_len = usize::from(body.get_u8());
        if name_len == 0 || body.remaining() < name_len + 4 {
            return Err(SocketError::protocol("truncated property name"));
        }
        let name = body.split_to(name_len);
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| SocketError::protocol("property name is not valid UTF-8"))?;
        let value_len = body.get_u32() as usize;
        if body.remaining() < value_len {
            return Err(SocketError::protocol(format!(
                "truncated value for property `{name}`"
            )));
        }
        metadata.insert(name, body.split_to(value_len));
    }
    Ok(metadata)
}

/// ERROR 命令体：1 字节长度 + 原因。
pub(crate) fn encode_error(reason: &str) -> BytesMut {
    let reason = &reason.as_bytes()[..reason.len().min(u8::MAX as usize)];
    let mut body = BytesMut::with_capacity(1 + reason.len());
    body.put_u8(reason.len() as u8);
    body.put_slice(reason);
    encode(ERROR, &body)
}

pub(crate) fn decode_error(mut body: Bytes) -> String {
    if body.is_empty() {
        return String::new();
    }
    let len = usize::from(body.get_u8()).min(body.len());
    String::from_utf8_lossy(&body[..len]).into_owned()
}

/// HELLO 命令体：用户名与密码，各自带 1 字节长度前缀。
pub(crate) fn encode_hello(username: &str, password: &str) -> Result<BytesMut, SocketError> {
    let username_len = u8::try_from(username.len())
        .map_err(|_| SocketError::handshake("PLAIN username longer than 255 bytes"))?;
    let password_len = u8::try_from(password.len())
        .map_err(|_| SocketError::handshake("PLAIN password longer than 255 bytes"))?;
    let mut body = BytesMut::with_capacity(2 + username.len() + password.len());
    body.put_u8(username_len);
    body.put_slice(username.as_bytes());
    body.put_u8(password_len);
    body.put_slice(password.as_bytes());
    Ok(encode(HELLO, &body))
}

pub(crate) fn decode_hello(mut body: Bytes) -> Result<(Bytes, Bytes), SocketError> {
    let mut field = |what: &'static str| -> Result<Bytes, SocketError> {
        if !body.has_remaining() {
            return Err(SocketError::protocol(format!("HELLO is missing {what}")));
        }
        let len = usize::from(body.get_u8());
        if body.remaining() < len {
            return Err(SocketError::protocol(format!("HELLO {what} is truncated")));
        }
        Ok(body.split_to(len))
    };
    let username = field("username")?;
    let password = field("password")?;
    Ok((username, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_properties_survive_encoding() {
        let encoded = encode_properties([
            (SOCKET_TYPE_PROPERTY, b"CLIENT".as_slice()),
            ("Identity", b"".as_slice()),
        ])
        .expect("encodable");
        let command = decode(encode(READY, &encoded).freeze()).expect("command");
        assert!(command.is(READY));

        let metadata = decode_properties(command.body).expect("properties");
        assert_eq!(
            metadata.get(SOCKET_TYPE_PROPERTY),
            Some(&Bytes::from_static(b"CLIENT"))
        );
        assert_eq!(metadata.get("Identity"), Some(&Bytes::new()));
    }

    #[test]
    fn truncated_properties_are_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u8(4);
        raw.put_slice(b"Name");
        raw.put_u32(10);
        raw.put_slice(b"short");
        assert!(decode_properties(raw.freeze()).is_err());
    }

    #[test]
    fn error_reason_is_readable() {
        let command = decode(encode_error("invalid credentials").freeze()).expect("command");
        assert!(command.is(ERROR));
        assert_eq!(decode_error(command.body), "invalid credentials");
    }

    #[test]
    fn hello_carries_credentials() {
        let command = decode(encode_hello("admin", "secret").expect("hello").freeze())
            .expect("command");
        let (username, password) = decode_hello(command.body).expect("fields");
        assert_eq!(username.as_ref(), b"admin");
        assert_eq!(password.as_ref(), b"secret");
    }
}
