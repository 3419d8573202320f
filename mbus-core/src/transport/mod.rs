//! 传输能力（Transport）
//!
//! 具体消息中间件客户端被抽象为一组能力：声明交换机/队列、绑定、发布、消费与确认。
//! 拓扑层（`ReliableTopology`）仅依赖该协议，可对接任意主题路由型中间件。
//!
//! 连接与通道在每个代理实例内为进程级单例；发布与消费调用按传输自身约定可并发使用。
//!
#[cfg(feature = "inmemory")]
mod inmemory;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryTransport;

use crate::error::BrokerResult as Result;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::time::Duration;

/// 传输元数据：随消息流转的重试计数、调度延迟与优先级
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub retry_count: u32,
    pub delay: Duration,
    pub priority: u8,
}

#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
}

/// 投递给消费者的消息
#[derive(Clone, Debug)]
pub struct Delivery {
    /// 传输分配的投递标识，用于 ack/nack
    pub tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    /// 支持按消息延迟调度的主题交换机
    DelayedTopic,
    Fanout,
}

/// 死信目标：被 nack（不重入队）的消息转发到该交换机
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    /// 覆盖原路由键；为空时保留原路由键
    pub routing_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub dead_letter: Option<DeadLetter>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            dead_letter: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// 最大未确认消息数
    pub prefetch: u16,
    pub priority: Option<i32>,
}

/// 'static 生命周期的投递流，便于在 tokio::spawn 中消费
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// 发布消息；返回传输是否接受（不代表已被消费）
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<bool>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// 否定确认；`requeue = false` 时若队列配置了死信则转入死信目标，否则丢弃
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;
}
