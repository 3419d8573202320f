//! 消息事件描述与注册表
//!
//! - `EmitOptions`：发布选项（延迟、优先级、作用域），支持逐层覆盖合并；
//! - `EventDescriptor`：事件类型的路由片段与默认发布选项；
//! - `MessageEvent`：可由 `#[derive(MessageEvent)]` 生成的静态描述符；
//! - `EventRegistry`：启动期显式注册的 `TypeId -> EventDescriptor` 映射，
//!   未注册的类型在 emit/bind 时返回配置错误。
//!
use crate::error::{BrokerError, BrokerResult as Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::{TypeId, type_name};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmitOptions {
    /// 消费前的调度延迟，默认 0
    pub delay: Option<Duration>,
    /// 消息优先级，默认 0
    pub priority: Option<u8>,
    /// 发布到的作用域，缺省时使用 `BrokerOptions::default_scope`
    pub scope: Option<String>,
}

impl EmitOptions {
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// 以 `overrides` 中已设置的字段覆盖当前值
    pub fn merged(&self, overrides: &EmitOptions) -> EmitOptions {
        EmitOptions {
            delay: overrides.delay.or(self.delay),
            priority: overrides.priority.or(self.priority),
            scope: overrides.scope.clone().or_else(|| self.scope.clone()),
        }
    }
}

/// 事件类型的静态描述：有序路由片段 + 默认发布选项
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventDescriptor {
    route: Vec<String>,
    options: EmitOptions,
}

impl EventDescriptor {
    pub fn new<I, S>(route: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            route: route.into_iter().map(Into::into).collect(),
            options: EmitOptions::default(),
        }
    }

    /// 派生子事件：追加路由片段，继承父级默认选项
    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut route = self.route.clone();
        route.extend(segments.into_iter().map(Into::into));
        Self {
            route,
            options: self.options.clone(),
        }
    }

    pub fn with_options(mut self, options: EmitOptions) -> Self {
        self.options = self.options.merged(&options);
        self
    }

    pub fn route(&self) -> &[String] {
        &self.route
    }

    pub fn options(&self) -> &EmitOptions {
        &self.options
    }

    /// 以分隔符拼接路由片段
    pub fn route_pattern(&self, delimiter: &str) -> String {
        self.route.join(delimiter)
    }
}

/// 携带静态描述符的事件负载类型
pub trait MessageEvent: Send + Sync + 'static {
    fn descriptor() -> EventDescriptor;
}

/// 事件类型键
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl EventKey {
    pub fn of<T: 'static + ?Sized>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// 显式注册的事件描述符表
/// - 一个类型只能对应一个描述符，重复注册报错
/// - 查找失败返回 `BrokerError::NotRegistered`
#[derive(Debug, Default)]
pub struct EventRegistry {
    descriptors: DashMap<TypeId, Arc<EventDescriptor>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册派生了 `MessageEvent` 的类型
    pub fn register<T: MessageEvent>(&self) -> Result<()> {
        self.register_with::<T>(T::descriptor())
    }

    /// 为任意类型注册手写描述符
    pub fn register_with<T: 'static>(&self, descriptor: EventDescriptor) -> Result<()> {
        let key = EventKey::of::<T>();
        if descriptor.route.is_empty() || descriptor.route.iter().any(|s| s.is_empty()) {
            return Err(BrokerError::configuration(format!(
                "event {} has an empty route segment",
                key.type_name
            )));
        }

        match self.descriptors.entry(key.type_id) {
            Entry::Occupied(_) => Err(BrokerError::AlreadyRegistered {
                type_name: key.type_name,
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(descriptor));
                Ok(())
            }
        }
    }

    pub fn descriptor_of(&self, key: &EventKey) -> Result<Arc<EventDescriptor>> {
        self.descriptors
            .get(&key.type_id)
            .map(|d| d.value().clone())
            .ok_or(BrokerError::NotRegistered {
                type_name: key.type_name,
            })
    }

    pub fn contains(&self, key: &EventKey) -> bool {
        self.descriptors.contains_key(&key.type_id)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
