//! 订阅声明（SubscriptionRequest）
//!
//! 每个处理器在启动期构建一次，驱动长期存在的队列与绑定直到关闭。
//!
use crate::event::{EventKey, MessageEvent};
use bon::Builder;

/// 事件标识：字面模式或已注册的事件类型
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventIdentifier {
    Pattern(String),
    Typed(EventKey),
}

impl EventIdentifier {
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::Pattern(pattern.into())
    }

    pub fn typed<T: MessageEvent>() -> Self {
        Self::Typed(EventKey::of::<T>())
    }

    pub fn is_typed(&self) -> bool {
        matches!(self, Self::Typed(_))
    }
}

impl From<&str> for EventIdentifier {
    fn from(value: &str) -> Self {
        Self::Pattern(value.to_string())
    }
}

impl From<String> for EventIdentifier {
    fn from(value: String) -> Self {
        Self::Pattern(value)
    }
}

impl From<EventKey> for EventIdentifier {
    fn from(value: EventKey) -> Self {
        Self::Typed(value)
    }
}

#[derive(Builder, Clone, Debug)]
pub struct SubscriptionRequest {
    /// 调用方推导的默认队列名（如 `Service/method`），未设置 `queue` 时使用
    #[builder(into)]
    name: String,
    /// 订阅的事件
    #[builder(with = |events: impl IntoIterator<Item = impl Into<EventIdentifier>>| {
        events.into_iter().map(Into::into).collect()
    })]
    events: Vec<EventIdentifier>,
    /// 自定义队列名
    #[builder(into)]
    queue: Option<String>,
    /// 最大并发未确认消息数，缺省继承 `BrokerOptions::default_prefetch`
    prefetch: Option<u16>,
    /// 消费者优先级
    priority: Option<i32>,
    /// 为 true 时不记录处理器错误日志（错误仍会触发重试）
    #[builder(default)]
    suppress_errors: bool,
    /// 额外监听的作用域，默认作用域始终生效
    #[builder(default)]
    scopes: Vec<String>,
    /// 为 true 时仅匹配字面模式，不追加多层通配后缀
    #[builder(default)]
    exact: bool,
}

impl SubscriptionRequest {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &[EventIdentifier] {
        &self.events
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// 实际使用的队列名：显式覆盖优先，否则为默认名
    pub fn queue_name(&self) -> &str {
        self.queue.as_deref().unwrap_or(&self.name)
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.prefetch
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    pub fn suppress_errors(&self) -> bool {
        self.suppress_errors
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn exact(&self) -> bool {
        self.exact
    }

    /// 人类可读的事件列表，用于日志
    pub fn describe_events(&self) -> String {
        self.events
            .iter()
            .map(|e| match e {
                EventIdentifier::Pattern(p) => p.clone(),
                EventIdentifier::Typed(k) => k.type_name().to_string(),
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}
