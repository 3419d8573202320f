//! 消息代理（MessageBroker）
//!
//! 抽象的 bind/emit 协议，负责：
//! - 订阅：解析主题模式、计算队列名称、包装处理器（解码 → 类型化 → 回调）后交给拓扑层；
//! - 发布：解析路由与选项（调用点选项覆盖类型默认值）、序列化负载、计算路由键后交给拓扑层；
//! - 批量注册：逐个订阅注册，单个失败仅记录日志，不影响其他订阅。
//!
//! 具体的交换机/队列/重试拓扑由 `Topology` 实现（参见 `ReliableTopology`）。
//!
use crate::config::BrokerOptions;
use crate::error::{BrokerError, BrokerResult as Result};
use crate::event::{EmitOptions, EventKey, EventRegistry};
use crate::pattern::{PatternResolver, validate_scope};
use crate::serializer::Serializer;
use crate::subscription::SubscriptionRequest;
use crate::topology::RESERVED_NAMES;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// 类型擦除后的处理器：原始字节 + 重试次数
pub type RawHandler = Arc<dyn Fn(Vec<u8>, u32) -> HandlerFuture + Send + Sync>;

/// 拓扑协议：由具体传输拓扑实现
#[async_trait]
pub trait Topology: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// 为一个订阅声明队列与绑定并开始消费
    async fn init_listener(
        &self,
        name_tag: &str,
        patterns: &[String],
        request: &SubscriptionRequest,
        handler: RawHandler,
    ) -> Result<()>;

    /// 发布已编码的消息；返回传输是否接受
    async fn emit_message_event(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        options: &EmitOptions,
    ) -> Result<bool>;
}

/// 处理器上下文：订阅声明与当前重试次数
#[derive(Clone, Debug)]
pub struct MessageContext {
    subscription: Arc<SubscriptionRequest>,
    retries: u32,
}

impl MessageContext {
    pub fn subscription(&self) -> &SubscriptionRequest {
        &self.subscription
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// 事件处理器：`E` 为负载类型，未类型化订阅可使用 `serde_json::Value`
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    async fn handle(&self, event: E, ctx: MessageContext) -> anyhow::Result<()>;
}

/// 闭包处理器适配
pub struct FnHandler<F>(F);

pub fn handler_fn<E, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(E, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for FnHandler<F>
where
    E: Send + 'static,
    F: Fn(E, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: E, ctx: MessageContext) -> anyhow::Result<()> {
        (self.0)(event, ctx).await
    }
}

type HandlerFactory = Box<dyn FnOnce(Arc<dyn Serializer>, Arc<SubscriptionRequest>) -> RawHandler + Send>;

/// 订阅声明与处理器的组合，由应用装配后交给 `register_all`
pub struct Subscriber {
    request: SubscriptionRequest,
    factory: HandlerFactory,
}

impl Subscriber {
    pub fn new<E, H>(request: SubscriptionRequest, handler: Arc<H>) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        H: EventHandler<E> + 'static,
    {
        let factory: HandlerFactory = Box::new(move |serializer, subscription| {
            wrap_handler::<E, H>(handler, serializer, subscription)
        });
        Self { request, factory }
    }

    pub fn request(&self) -> &SubscriptionRequest {
        &self.request
    }
}

// 解码 → 类型化 → 回调；处理器错误按 suppress_errors 记录后上抛给拓扑层
fn wrap_handler<E, H>(
    handler: Arc<H>,
    serializer: Arc<dyn Serializer>,
    subscription: Arc<SubscriptionRequest>,
) -> RawHandler
where
    E: DeserializeOwned + Send + 'static,
    H: EventHandler<E> + 'static,
{
    Arc::new(move |body: Vec<u8>, retries: u32| -> HandlerFuture {
        let handler = handler.clone();
        let serializer = serializer.clone();
        let subscription = subscription.clone();

        Box::pin(async move {
            let decoded = serializer.deserialize(&body)?;
            let event: E = serde_json::from_value(decoded)?;

            let queue = subscription.queue_name().to_string();
            let suppress = subscription.suppress_errors();
            let ctx = MessageContext {
                subscription,
                retries,
            };

            handler.handle(event, ctx).await.map_err(|e| {
                if !suppress {
                    error!(queue = %queue, retries, error = %e, "event handler failed");
                }
                BrokerError::Handler {
                    queue,
                    reason: e.to_string(),
                }
            })
        })
    })
}

/// 单个订阅的注册结果
#[derive(Debug)]
pub struct RegistrationReport {
    pub name: String,
    pub queue: String,
    pub result: Result<()>,
}

impl RegistrationReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EmitTarget {
    Route(String),
    Event(EventKey),
}

/// 一次发布请求：{路由或事件类型, 负载, 调用点选项}
#[derive(Clone, Debug)]
pub struct EmitRequest {
    target: EmitTarget,
    payload: Value,
    options: EmitOptions,
}

impl EmitRequest {
    /// 以显式路由发布任意可序列化负载
    pub fn route<P: Serialize + ?Sized>(route: impl Into<String>, payload: &P) -> Result<Self> {
        Ok(Self {
            target: EmitTarget::Route(route.into()),
            payload: serde_json::to_value(payload)?,
            options: EmitOptions::default(),
        })
    }

    /// 发布已注册类型的事件实例，路由与默认选项取自其描述符
    pub fn event<T: Serialize + 'static>(event: &T) -> Result<Self> {
        Ok(Self {
            target: EmitTarget::Event(EventKey::of::<T>()),
            payload: serde_json::to_value(event)?,
            options: EmitOptions::default(),
        })
    }

    pub fn with_options(mut self, options: EmitOptions) -> Self {
        self.options = options;
        self
    }

    pub fn delay(mut self, delay: std::time::Duration) -> Self {
        self.options.delay = Some(delay);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.options.priority = Some(priority);
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.options.scope = Some(scope.into());
        self
    }

    pub fn target(&self) -> &EmitTarget {
        &self.target
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn options(&self) -> &EmitOptions {
        &self.options
    }
}

pub struct MessageBroker<T> {
    options: Arc<BrokerOptions>,
    registry: Arc<EventRegistry>,
    topology: T,
}

impl<T: Topology> MessageBroker<T> {
    pub fn new(options: Arc<BrokerOptions>, registry: Arc<EventRegistry>, topology: T) -> Self {
        Self {
            options,
            registry,
            topology,
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn topology(&self) -> &T {
        &self.topology
    }

    pub async fn connect(&self) -> Result<()> {
        self.topology.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.topology.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.topology.is_connected()
    }

    /// 订阅主题模式（不做拓扑声明）
    pub fn resolve_patterns(&self, request: &SubscriptionRequest) -> Result<Vec<String>> {
        PatternResolver::new(&self.options, &self.registry).resolve(request)
    }

    /// 订阅队列的名称：项目 + 命名空间 + (显式队列名 | 默认名)
    pub fn name_tag(&self, request: &SubscriptionRequest) -> Result<String> {
        let queue = request.queue_name();
        if queue.is_empty()
            || queue.contains(self.options.wildcard())
            || queue.contains(self.options.multi_level_wildcard())
        {
            return Err(BrokerError::configuration(format!(
                "invalid queue name: {queue:?}"
            )));
        }
        let names = self.options.name_builder();
        let tag = names.name_tag(&[queue]);
        if RESERVED_NAMES.iter().any(|r| names.name_tag(&[r]) == tag) {
            return Err(BrokerError::configuration(format!(
                "queue name {queue:?} is reserved"
            )));
        }
        Ok(tag)
    }

    pub async fn bind<E, H>(&self, request: SubscriptionRequest, handler: Arc<H>) -> Result<()>
    where
        E: DeserializeOwned + Send + 'static,
        H: EventHandler<E> + 'static,
    {
        self.bind_subscriber(Subscriber::new(request, handler)).await
    }

    pub async fn bind_subscriber(&self, subscriber: Subscriber) -> Result<()> {
        let Subscriber { request, factory } = subscriber;

        let patterns = self.resolve_patterns(&request)?;
        let name_tag = self.name_tag(&request)?;

        let request = Arc::new(request);
        let handler = factory(self.options.serializer().clone(), request.clone());

        self.topology
            .init_listener(&name_tag, &patterns, &request, handler)
            .await
            .map_err(|e| match e {
                e @ BrokerError::SubscriptionRegistration { .. } => e,
                other => BrokerError::SubscriptionRegistration {
                    queue: name_tag.clone(),
                    reason: other.to_string(),
                },
            })?;

        info!(
            queue = %name_tag,
            events = %request.describe_events(),
            patterns = %patterns.join("|"),
            "subscription initialized"
        );
        Ok(())
    }

    /// 逐个注册订阅；单个失败记录日志并继续
    pub async fn register_all(&self, subscribers: Vec<Subscriber>) -> Vec<RegistrationReport> {
        let mut reports = Vec::with_capacity(subscribers.len());

        for subscriber in subscribers {
            let name = subscriber.request().name().to_string();
            let queue = subscriber.request().queue_name().to_string();
            let result = self.bind_subscriber(subscriber).await;

            if let Err(e) = &result {
                error!(subscriber = %name, queue = %queue, error = %e, "subscription registration failed");
            }
            reports.push(RegistrationReport {
                name,
                queue,
                result,
            });
        }

        reports
    }

    /// 计算发布路由键与生效选项
    pub fn resolve_emit(&self, request: &EmitRequest) -> Result<(String, EmitOptions)> {
        let delimiter = self.options.delimiter();
        let (route, options) = match &request.target {
            EmitTarget::Route(route) => (route.clone(), request.options.clone()),
            EmitTarget::Event(key) => {
                let descriptor = self.registry.descriptor_of(key)?;
                (
                    descriptor.route_pattern(delimiter),
                    descriptor.options().merged(&request.options),
                )
            }
        };

        let malformed = route.is_empty()
            || route.split(delimiter).any(|s| {
                s.is_empty()
                    || s == self.options.wildcard()
                    || s == self.options.multi_level_wildcard()
            });
        if malformed {
            return Err(BrokerError::configuration(format!(
                "malformed emit route: {route:?}"
            )));
        }

        let scope = options
            .scope
            .as_deref()
            .unwrap_or(self.options.default_scope());
        validate_scope(&self.options, scope)?;

        let key = self.options.name_builder().routing_key(scope, &route);
        Ok((key, options))
    }

    /// 发布事件；返回传输是否接受发布（不代表已被消费）
    pub async fn emit(&self, request: EmitRequest) -> Result<bool> {
        let (key, options) = self.resolve_emit(&request)?;
        let body = self.options.serializer().serialize(&request.payload)?;

        if !self.topology.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        self.topology.emit_message_event(&key, body, &options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDescriptor, MessageEvent};
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UserCreated {
        user_id: String,
    }

    impl MessageEvent for UserCreated {
        fn descriptor() -> EventDescriptor {
            EventDescriptor::new(["user", "created"])
                .with_options(EmitOptions::default().priority(5).scope("user"))
        }
    }

    #[derive(Default)]
    struct RecordingTopology {
        connected: AtomicBool,
        fail_queue: Option<String>,
        listeners: Mutex<Vec<(String, Vec<String>, RawHandler)>>,
        emitted: Mutex<Vec<(String, Vec<u8>, EmitOptions)>>,
    }

    #[async_trait]
    impl Topology for RecordingTopology {
        async fn connect(&self) -> Result<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn init_listener(
            &self,
            name_tag: &str,
            patterns: &[String],
            _request: &SubscriptionRequest,
            handler: RawHandler,
        ) -> Result<()> {
            if self.fail_queue.as_deref() == Some(name_tag) {
                return Err(BrokerError::transport("declare failed"));
            }
            self.listeners
                .lock()
                .unwrap()
                .push((name_tag.to_string(), patterns.to_vec(), handler));
            Ok(())
        }
        async fn emit_message_event(
            &self,
            routing_key: &str,
            body: Vec<u8>,
            options: &EmitOptions,
        ) -> Result<bool> {
            self.emitted
                .lock()
                .unwrap()
                .push((routing_key.to_string(), body, options.clone()));
            Ok(true)
        }
    }

    fn broker(topology: RecordingTopology) -> MessageBroker<RecordingTopology> {
        let options = BrokerOptions::builder()
            .project_name("myBroker")
            .namespace("userService")
            .build();
        let registry = EventRegistry::new();
        registry.register::<UserCreated>().unwrap();
        MessageBroker::new(Arc::new(options), Arc::new(registry), topology)
    }

    #[tokio::test]
    async fn typed_emit_uses_descriptor_route_and_merges_options() {
        let b = broker(RecordingTopology::default());
        b.connect().await.unwrap();

        let event = UserCreated {
            user_id: "u-1".into(),
        };
        let accepted = b
            .emit(EmitRequest::event(&event).unwrap().priority(9))
            .await
            .unwrap();
        assert!(accepted);

        let emitted = b.topology().emitted.lock().unwrap();
        let (key, body, options) = &emitted[0];
        assert_eq!(key, "user.user.created");
        assert_eq!(options.priority, Some(9));
        assert_eq!(options.scope.as_deref(), Some("user"));
        let decoded: UserCreated = serde_json::from_slice(body).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn route_emit_defaults_to_default_scope_and_normalizes() {
        let b = broker(RecordingTopology::default());
        b.connect().await.unwrap();

        let req = EmitRequest::route("userAccount.created", &serde_json::json!({"a": 1}))
            .unwrap()
            .delay(Duration::from_secs(5));
        assert!(b.emit(req).await.unwrap());

        let emitted = b.topology().emitted.lock().unwrap();
        assert_eq!(emitted[0].0, "default.user-account.created");
        assert_eq!(emitted[0].2.delay, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn emit_errors_are_synchronous() {
        let b = broker(RecordingTopology::default());

        #[derive(Serialize)]
        struct Unregistered;
        b.connect().await.unwrap();
        let err = b
            .emit(EmitRequest::event(&Unregistered).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_configuration());

        let err = b
            .emit(EmitRequest::route("user.**", &1).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_configuration());

        b.disconnect().await.unwrap();
        let err = b
            .emit(EmitRequest::route("x", &1).unwrap().priority(10).delay(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
        assert!(b.topology().emitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bind_computes_name_tag_and_wraps_typed_handler() {
        let b = broker(RecordingTopology::default());
        b.connect().await.unwrap();

        let seen: Arc<Mutex<Vec<(UserCreated, u32)>>> = Arc::default();
        let sink = seen.clone();
        let handler = Arc::new(handler_fn(move |event: UserCreated, ctx: MessageContext| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push((event, ctx.retries()));
                Ok(())
            }
        }));

        let req = SubscriptionRequest::builder()
            .name("AppService/handleCreatedUser")
            .events([crate::subscription::EventIdentifier::typed::<UserCreated>()])
            .exact(true)
            .build();
        b.bind(req, handler).await.unwrap();

        let raw = {
            let listeners = b.topology().listeners.lock().unwrap();
            let (name, patterns, raw) = &listeners[0];
            assert_eq!(name, "my-broker.user-service.app-service/handle-created-user");
            assert_eq!(patterns, &["default.user.created"]);
            raw.clone()
        };

        raw(br#"{"user_id":"u-7"}"#.to_vec(), 2).await.unwrap();
        assert_eq!(
            seen.lock().unwrap()[0],
            (
                UserCreated {
                    user_id: "u-7".into()
                },
                2
            )
        );

        // 无法类型化的负载按序列化错误上抛
        let err = raw(br#"{"other":1}"#.to_vec(), 0).await.unwrap_err();
        assert!(err.is_serialization());
        let err = raw(b"not json".to_vec(), 0).await.unwrap_err();
        assert!(err.is_serialization());
    }

    #[tokio::test]
    async fn handler_error_is_reraised_as_handler_error() {
        let b = broker(RecordingTopology::default());
        b.connect().await.unwrap();

        let handler = Arc::new(handler_fn(|_event: Value, _ctx: MessageContext| async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        }));
        let req = SubscriptionRequest::builder()
            .name("h")
            .events(["user.created"])
            .suppress_errors(true)
            .build();
        b.bind(req, handler).await.unwrap();

        let raw = b.topology().listeners.lock().unwrap()[0].2.clone();
        match raw(b"{}".to_vec(), 0).await {
            Err(BrokerError::Handler { queue, reason }) => {
                assert_eq!(queue, "h");
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_all_isolates_failures() {
        let topology = RecordingTopology {
            fail_queue: Some("my-broker.user-service.broken".into()),
            ..Default::default()
        };
        let b = broker(topology);
        b.connect().await.unwrap();

        let ok = |name: &str| {
            Subscriber::new(
                SubscriptionRequest::builder()
                    .name(name)
                    .events(["user.created"])
                    .build(),
                Arc::new(handler_fn(|_e: Value, _c: MessageContext| async { anyhow::Ok(()) })),
            )
        };
        let bad_pattern = Subscriber::new(
            SubscriptionRequest::builder().name("bad").events([""]).build(),
            Arc::new(handler_fn(|_e: Value, _c: MessageContext| async { anyhow::Ok(()) })),
        );

        let reports = b
            .register_all(vec![ok("first"), ok("broken"), bad_pattern, ok("last")])
            .await;
        let outcome: Vec<(String, bool)> = reports.iter().map(|r| (r.name.clone(), r.is_ok())).collect();
        assert_eq!(
            outcome,
            [
                ("first".to_string(), true),
                ("broken".to_string(), false),
                ("bad".to_string(), false),
                ("last".to_string(), true),
            ]
        );
        assert!(matches!(
            reports[1].result,
            Err(BrokerError::SubscriptionRegistration { .. })
        ));
        assert!(reports[2].result.as_ref().unwrap_err().is_configuration());
        assert_eq!(b.topology().listeners.lock().unwrap().len(), 2);
    }

    #[test]
    fn reserved_queue_names_are_rejected() {
        let b = broker(RecordingTopology::default());
        for queue in ["retries", "dead-letters", "messages", "deadLetters"] {
            let req = SubscriptionRequest::builder()
                .name("AppService/handle")
                .events(["user.created"])
                .queue(queue)
                .build();
            assert!(b.name_tag(&req).unwrap_err().is_configuration(), "{queue:?}");
        }

        let req = SubscriptionRequest::builder()
            .name("retries-audit")
            .events(["user.created"])
            .build();
        assert_eq!(
            b.name_tag(&req).unwrap(),
            "my-broker.user-service.retries-audit"
        );
    }
}
