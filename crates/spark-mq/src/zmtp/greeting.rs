use crate::error::SocketError;
use crate::session::Mechanism;

pub(crate) const GREETING_LEN: usize = 64;

const SIGNATURE_HEAD: u8 = 0xFF;
const SIGNATURE_TAIL: u8 = 0x7F;
const VERSION_MAJOR: u8 = 3;
const VERSION_MINOR: u8 = 1;
const MECHANISM_OFFSET: usize = 12;
const MECHANISM_LEN: usize = 20;
const AS_SERVER_OFFSET: usize = MECHANISM_OFFSET + MECHANISM_LEN;

/// 64 字节问候：签名、版本、机制名、as-server 标志与填充。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Greeting {
    pub(crate) version: (u8, u8),
    pub(crate) mechanism: Mechanism,
    pub(crate) as_server: bool,
}

impl Greeting {
    pub(crate) fn new(mechanism: Mechanism, as_server: bool) -> Self {
        Self {
            version: (VERSION_MAJOR, VERSION_MINOR),
            mechanism,
            as_server,
        }
    }

    pub(crate) fn encode(&self) -> [u8; GREETING_LEN] {
        let mut raw = [0u8; GREETING_LEN];
        raw[0] = SIGNATURE_HEAD;
        raw[9] = SIGNATURE_TAIL;
        raw[10] = self.version.0;
        raw[11] = self.version.1;
        let name = self.mechanism.as_str().as_bytes();
        raw[MECHANISM_OFFSET..MECHANISM_OFFSET + name.len()].copy_from_slice(name);
        raw[AS_SERVER_OFFSET] = u8::from(self.as_server);
        raw
    }

    pub(crate) fn decode(raw: &[u8; GREETING_LEN]) -> Result<Self, SocketError> {
        if raw[0] != SIGNATURE_HEAD || raw[9] != SIGNATURE_TAIL {
            return Err(SocketError::handshake("peer greeting has an invalid signature"));
        }
        let version = (raw[10], raw[11]);
        if version.0 < VERSION_MAJOR {
            return Err(SocketError::handshake(format!(
                "peer speaks protocol {}.{}, at least {VERSION_MAJOR}.0 is required",
                version.0, version.1
            )));
        }

        let field = &raw[MECHANISM_OFFSET..AS_SERVER_OFFSET];
        let name_end = field.iter().position(|b| *b == 0).unwrap_or(MECHANISM_LEN);
        let mechanism = Mechanism::from_wire(&field[..name_end]).ok_or_else(|| {
            SocketError::handshake(format!(
                "peer requested unknown mechanism `{}`",
                String::from_utf8_lossy(&field[..name_end])
            ))
        })?;

        Ok(Self {
            version,
            mechanism,
            as_server: raw[AS_SERVER_OFFSET] == 1,
        })
    }
}
