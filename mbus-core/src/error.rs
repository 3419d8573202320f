//! 消息总线统一错误定义
//!
//! 聚焦配置、序列化、订阅注册、处理器与传输层的最小必要集合，
//! 便于在拓扑与传输实现中统一转换为 `BrokerError`。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BrokerError {
    // --- 配置 ---
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
    #[error("event type not registered: type={type_name}")]
    NotRegistered { type_name: &'static str },
    #[error("event type already registered: type={type_name}")]
    AlreadyRegistered { type_name: &'static str },

    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    // --- 订阅与处理 ---
    #[error("subscription registration failed: queue={queue}, reason={reason}")]
    SubscriptionRegistration { queue: String, reason: String },
    #[error("event handler error: queue={queue}, reason={reason}")]
    Handler { queue: String, reason: String },

    // --- 传输 ---
    #[error("transport error: {reason}")]
    Transport { reason: String },
    #[error("broker is not connected")]
    NotConnected,
}

impl BrokerError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// 是否属于配置类错误（缺失描述符、非法模式等），此类错误同步返回给调用方
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::NotRegistered { .. } | Self::AlreadyRegistered { .. }
        )
    }

    /// 是否属于序列化类错误
    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::Serde { .. } | Self::Serialization { .. })
    }
}

/// 统一 Result 类型别名
pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<toml::de::Error> for BrokerError {
    fn from(err: toml::de::Error) -> Self {
        BrokerError::Configuration {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(BrokerError::configuration("bad").is_configuration());
        assert!(BrokerError::NotRegistered { type_name: "X" }.is_configuration());
        assert!(!BrokerError::NotConnected.is_configuration());

        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = BrokerError::from(serde_err);
        assert!(err.is_serialization());
        assert!(err.to_string().starts_with("serialization error"));
    }
}
