//! 负载编解码（Serializer）
//!
//! 在 JSON 结构（`serde_json::Value`）与传输字节之间转换。
//! 反序列化失败对该条消息是致命的：错误会上抛至拓扑层，由其决定死信/重试。
//!
use crate::error::BrokerResult as Result;
use serde_json::Value;
use std::fmt::Debug;

pub trait Serializer: Send + Sync + Debug {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

/// 默认 JSON 文本编解码
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
