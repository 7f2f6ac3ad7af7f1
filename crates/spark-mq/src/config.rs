//! # config 模块说明
//!
//! ## 意图（Why）
//! - 把重试节奏、入站队列容量、发送目标策略等运行参数集中到一个可从 TOML 加载的结构里，
//!   部署时无需改代码即可调整；
//! - 所有时长在文件中以毫秒整数表示，避免引入额外的时长解析格式。
//!
//! ## 契约（What）
//! - [`SocketConfig::validate`] 保证 `retry_interval > 0`、`inbound_capacity > 0`、`max_frame_size > 0`；
//! - 未出现的字段取 [`SocketConfig::default`] 的值；出现未知字段视为配置错误。
//!
//! ```toml
//! retry_interval_ms = 250
//! max_dial_attempts = 20
//! inbound_capacity = 1000
//! send_policy = "round-robin"
//! handshake_timeout_ms = 5000
//! max_frame_size = 1048576
//!
//! [metadata]
//! Identity = "worker-7"
//!
//! [plain]
//! username = "admin"
//! password = "secret"
//! ```

use std::{collections::BTreeMap, fmt, num::NonZeroU32, path::Path, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Deserializer};

use crate::{error::SocketError, session::Metadata};

/// 默认重试间隔。
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(250);
/// 默认入站队列容量。
pub const DEFAULT_INBOUND_CAPACITY: usize = 1000;
/// 默认单帧上限。
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// `send` 的目标选择策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SendPolicy {
    /// 始终发往最早注册的连接。
    #[default]
    FirstOnly,
    /// 按注册顺序轮转。
    RoundRobin,
}

/// 拨号重试策略。
///
/// `max_attempts = None` 表示无限重试，直到成功或被 [`CallContext`](crate::contract::CallContext) 打断。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
    max_attempts: Option<NonZeroU32>,
}

impl RetryPolicy {
    pub fn new(interval: Duration) -> Result<Self, SocketError> {
        if interval.is_zero() {
            return Err(SocketError::Config("retry interval must be positive".into()));
        }
        Ok(Self {
            interval,
            max_attempts: None,
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<NonZeroU32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> Option<NonZeroU32> {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
        }
    }
}

/// PLAIN 机制凭据。
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlainCredentials {
    pub username: String,
    pub password: String,
}

impl PlainCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for PlainCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// 套接字运行参数。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    #[serde(rename = "retry_interval_ms", deserialize_with = "millis")]
    pub retry_interval: Duration,
    pub max_dial_attempts: Option<NonZeroU32>,
    pub inbound_capacity: usize,
    pub send_policy: SendPolicy,
    #[serde(rename = "handshake_timeout_ms", deserialize_with = "optional_millis")]
    pub handshake_timeout: Option<Duration>,
    pub max_frame_size: u64,
    #[serde(deserialize_with = "metadata_table")]
    pub metadata: Metadata,
    pub plain: Option<PlainCredentials>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_dial_attempts: None,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            send_policy: SendPolicy::default(),
            handshake_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            metadata: Metadata::new(),
            plain: None,
        }
    }
}

impl SocketConfig {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, SocketError> {
        let config: SocketConfig =
            toml::from_str(raw).map_err(|err| SocketError::Config(err.to_string().into()))?;
        config.validate()?;
        Ok(config)
    }

    /// 读取 TOML 文件并校验。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SocketError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            SocketError::Config(format!("cannot read {}: {err}", path.display()).into())
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), SocketError> {
        if self.retry_interval.is_zero() {
            return Err(SocketError::Config(
                "retry_interval_ms must be positive".into(),
            ));
        }
        if self.inbound_capacity == 0 {
            return Err(SocketError::Config(
                "inbound_capacity must be positive".into(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(SocketError::Config("max_frame_size must be positive".into()));
        }
        Ok(())
    }

    /// 由配置派生拨号重试策略。
    pub fn retry_policy(&self) -> Result<RetryPolicy, SocketError> {
        Ok(RetryPolicy::new(self.retry_interval)?.with_max_attempts(self.max_dial_attempts))
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn optional_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(|value| value.map(Duration::from_millis))
}

fn metadata_table<'de, D>(deserializer: D) -> Result<Metadata, D::Error>
where
    D: Deserializer<'de>,
{
    let table = BTreeMap::<String, String>::deserialize(deserializer)?;
    Ok(table
        .into_iter()
        .map(|(name, value)| (name, Bytes::from(value)))
        .collect())
}
