//! 主题路由消息代理基础库（mbus-core）
//!
//! 在主题路由型消息中间件之上提供带作用域的发布/订阅与可靠重试：
//! - 命名规范化与资源名称（`naming`）
//! - 退避策略（`retry`）与负载编解码（`serializer`）
//! - 事件描述符与类型注册表（`event`）、订阅声明（`subscription`）
//! - 订阅模式解析与主题匹配（`pattern`）
//! - 抽象的 bind/emit 协议（`broker`）
//! - 基于死信与延迟交换机的重试拓扑（`topology`）
//! - 传输能力与内存实现（`transport`）
//!
//! 典型用法：
//! 1. 以 `BrokerOptions::builder()` 或 `BrokerConfig` 构建配置；
//! 2. 为负载类型派生 `MessageEvent` 并在 `EventRegistry` 中注册；
//! 3. 以 `ReliableTopology` 包装传输，构建 `MessageBroker` 并 `connect`；
//! 4. `register_all` 绑定订阅，`emit` 发布事件，结束时 `disconnect`。
//!
pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod naming;
pub mod pattern;
pub mod retry;
pub mod serializer;
pub mod subscription;
pub mod topology;
pub mod transport;

pub use broker::{
    EmitRequest, EmitTarget, EventHandler, MessageBroker, MessageContext, RegistrationReport,
    Subscriber, Topology, handler_fn,
};
pub use config::{BrokerConfig, BrokerOptions, ConnectionConfig};
pub use error::{BrokerError, BrokerResult};
pub use event::{EmitOptions, EventDescriptor, EventKey, EventRegistry, MessageEvent};
pub use retry::RetryStrategy;
pub use subscription::{EventIdentifier, SubscriptionRequest};
pub use topology::ReliableTopology;

// 允许在本 crate 内部通过 ::mbus_core 进行自引用，
// 以便派生宏在本 crate 的单元测试中也能解析到 ::mbus_core 路径。
extern crate self as mbus_core;
