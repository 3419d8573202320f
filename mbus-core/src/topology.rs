//! 可靠拓扑（ReliableTopology）
//!
//! 在任意 `Transport` 上实现带退避重试的至少一次投递：
//!
//! ```text
//!  emit ──► [messages: 延迟主题交换机] ──pattern / retry-key──► [订阅队列] ──► handler
//!                 ▲                                                 │ nack（不重入队）
//!                 │ 重新发布（原路由键 = retry-key，                  ▼ 死信（路由键改写为 retry-key）
//!                 │  delay = RetryStrategy(n)，retry_count = n + 1）  [retries: 扇出交换机]
//!                 │                                                 │
//!                 └────────────── 重试消费者 ◄── [retries 队列] ◄────┘
//! ```
//!
//! - 每个订阅一个持久队列，以每个模式及其专属 retry-key 绑定到消息交换机；
//!   死信路由键为该 retry-key，保证重试消息只回到原队列；
//! - 重试消费者以固定并发运行，仅在重新发布成功后确认，失败则拒绝且不重入队；
//! - 设置 `max_retries` 时，达到上限的消息转入永久死信队列；
//! - 处理成功才确认，任何错误（处理器异常或解码失败）均 nack 进入死信。
//!
use crate::broker::{RawHandler, Topology};
use crate::config::BrokerOptions;
use crate::error::{BrokerError, BrokerResult as Result};
use crate::event::EmitOptions;
use crate::pattern::RESERVED_PREFIX;
use crate::subscription::SubscriptionRequest;
use crate::transport::{
    ConsumeOptions, DeadLetter, Delivery, DeliveryStream, ExchangeKind, MessageHeaders,
    OutgoingMessage, QueueOptions, Transport,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use futures_util::future::join_all;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 拓扑中共享资源的名称
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyNames {
    /// 消息交换机（延迟主题）
    pub messages: String,
    /// 重试交换机（扇出）与重试队列
    pub retries: String,
    /// 永久死信交换机与队列
    pub dead_letters: String,
}

/// 共享资源占用的名称，订阅队列不得使用
pub(crate) const RESERVED_NAMES: [&str; 3] = [MESSAGES, RETRIES, DEAD_LETTERS];

const MESSAGES: &str = "messages";
const RETRIES: &str = "retries";
const DEAD_LETTERS: &str = "dead-letters";

impl TopologyNames {
    pub fn from_options(options: &BrokerOptions) -> Self {
        let names = options.name_builder();
        Self {
            messages: names.name_tag(&[MESSAGES]),
            retries: names.name_tag(&[RETRIES]),
            dead_letters: names.name_tag(&[DEAD_LETTERS]),
        }
    }
}

pub struct ReliableTopology<T> {
    transport: Arc<T>,
    options: Arc<BrokerOptions>,
    names: TopologyNames,
    token: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport + 'static> ReliableTopology<T> {
    pub fn new(transport: Arc<T>, options: Arc<BrokerOptions>) -> Self {
        Self {
            transport,
            names: TopologyNames::from_options(&options),
            options,
            token: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn names(&self) -> &TopologyNames {
        &self.names
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// 订阅队列专属的重试路由键
    pub fn retry_key(&self, name_tag: &str) -> String {
        format!("{RESERVED_PREFIX}retry{}{name_tag}", self.options.delimiter())
    }

    async fn declare_shared(&self) -> Result<()> {
        let t = &self.transport;
        t.declare_exchange(&self.names.retries, ExchangeKind::Fanout).await?;
        t.declare_exchange(&self.names.messages, ExchangeKind::DelayedTopic)
            .await?;

        t.declare_queue(&self.names.retries, QueueOptions::default())
            .await?;
        t.bind_queue(
            &self.names.retries,
            &self.names.retries,
            self.options.wildcard(),
        )
        .await?;

        if self.options.max_retries().is_some() {
            t.declare_exchange(&self.names.dead_letters, ExchangeKind::Fanout)
                .await?;
            t.declare_queue(&self.names.dead_letters, QueueOptions::default())
                .await?;
            t.bind_queue(
                &self.names.dead_letters,
                &self.names.dead_letters,
                self.options.wildcard(),
            )
            .await?;
        }
        Ok(())
    }

    async fn start_retry_loop(&self) -> Result<()> {
        let concurrency = self.options.retry_concurrency().max(1);
        let stream = self
            .transport
            .consume(
                &self.names.retries,
                ConsumeOptions {
                    prefetch: u16::try_from(concurrency).unwrap_or(u16::MAX),
                    priority: None,
                },
            )
            .await?;

        let retry = Arc::new(RetryLoop {
            transport: self.transport.clone(),
            options: self.options.clone(),
            names: self.names.clone(),
        });
        self.spawn_consumer(stream, concurrency, move |delivery| {
            let retry = retry.clone();
            async move { retry.reschedule(delivery).await }
        });
        Ok(())
    }

    fn spawn_consumer<F, Fut>(&self, stream: DeliveryStream, concurrency: usize, on_delivery: F)
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = lock(&self.token).clone();
        let handle = tokio::spawn(async move {
            let on_delivery = &on_delivery;
            // 取消后不再拉取新消息，在途处理自然完成
            stream
                .take_until(token.cancelled_owned())
                .for_each_concurrent(Some(concurrency), |item| async move {
                    match item {
                        Ok(delivery) => on_delivery(delivery).await,
                        Err(e) => warn!(error = %e, "delivery stream error"),
                    }
                })
                .await;
        });
        lock(&self.tasks).push(handle);
    }
}

struct RetryLoop<T> {
    transport: Arc<T>,
    options: Arc<BrokerOptions>,
    names: TopologyNames,
}

impl<T: Transport> RetryLoop<T> {
    async fn reschedule(&self, delivery: Delivery) {
        let retries = delivery.headers.retry_count;

        if let Some(max) = self.options.max_retries() {
            if retries >= max {
                self.park(delivery, max).await;
                return;
            }
        }

        let delay = self.options.retry_strategy().delay(retries);
        let message = OutgoingMessage {
            body: delivery.body.clone(),
            headers: MessageHeaders {
                retry_count: retries.saturating_add(1),
                delay,
                priority: delivery.headers.priority,
            },
        };

        let published = self
            .transport
            .publish(&self.names.messages, &delivery.routing_key, message)
            .await;

        match published {
            Ok(true) => {
                debug!(routing_key = %delivery.routing_key, retries, delay_ms = delay.as_millis() as u64, "message rescheduled");
                if let Err(e) = self.transport.ack(&delivery).await {
                    warn!(error = %e, "failed to ack rescheduled message");
                }
            }
            outcome => {
                let reason = match outcome {
                    Err(e) => e.to_string(),
                    _ => "publish rejected by transport".to_string(),
                };
                warn!(routing_key = %delivery.routing_key, retries, reason = %reason, "reschedule failed, dropping message");
                if let Err(e) = self.transport.nack(&delivery, false).await {
                    warn!(error = %e, "failed to reject message");
                }
            }
        }
    }

    async fn park(&self, delivery: Delivery, max: u32) {
        let message = OutgoingMessage {
            body: delivery.body.clone(),
            headers: delivery.headers.clone(),
        };
        let parked = self
            .transport
            .publish(&self.names.dead_letters, &delivery.routing_key, message)
            .await;

        match parked {
            Ok(true) => {
                warn!(routing_key = %delivery.routing_key, max_retries = max, "retry limit reached, message dead-lettered");
                if let Err(e) = self.transport.ack(&delivery).await {
                    warn!(error = %e, "failed to ack dead-lettered message");
                }
            }
            _ => {
                warn!(routing_key = %delivery.routing_key, max_retries = max, "retry limit reached and dead-letter publish failed, dropping message");
                if let Err(e) = self.transport.nack(&delivery, false).await {
                    warn!(error = %e, "failed to reject message");
                }
            }
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> Topology for ReliableTopology<T> {
    async fn connect(&self) -> Result<()> {
        *lock(&self.token) = CancellationToken::new();

        self.transport.connect().await?;
        self.declare_shared().await?;
        self.start_retry_loop().await?;

        info!(
            messages = %self.names.messages,
            retries = %self.names.retries,
            "message broker connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        lock(&self.token).cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let timeout = self.options.shutdown_timeout();
        if tokio::time::timeout(timeout, join_all(tasks)).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "in-flight handlers did not drain in time, aborting");
            for a in aborts {
                a.abort();
            }
        }

        self.transport.close().await?;
        info!("message broker disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn init_listener(
        &self,
        name_tag: &str,
        patterns: &[String],
        request: &SubscriptionRequest,
        handler: RawHandler,
    ) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let t = &self.transport;
        let retry_key = self.retry_key(name_tag);

        t.declare_queue(
            name_tag,
            QueueOptions {
                durable: true,
                dead_letter: Some(DeadLetter {
                    exchange: self.names.retries.clone(),
                    routing_key: Some(retry_key.clone()),
                }),
            },
        )
        .await?;

        t.bind_queue(name_tag, &self.names.messages, &retry_key)
            .await?;
        for pattern in patterns {
            t.bind_queue(name_tag, &self.names.messages, pattern).await?;
        }

        let prefetch = request
            .prefetch()
            .unwrap_or(self.options.default_prefetch())
            .max(1);
        let stream = t
            .consume(
                name_tag,
                ConsumeOptions {
                    prefetch,
                    priority: request.priority(),
                },
            )
            .await?;

        let transport = self.transport.clone();
        let queue = name_tag.to_string();
        self.spawn_consumer(stream, usize::from(prefetch), move |delivery| {
            let transport = transport.clone();
            let handler = handler.clone();
            let queue = queue.clone();
            async move {
                // 处理器 panic 视同处理失败，走 nack → 重试流程，不中断该订阅的消费
                let outcome = AssertUnwindSafe(handler(delivery.body.clone(), delivery.headers.retry_count))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let reason = panic_reason(panic.as_ref());
                        error!(queue = %queue, retries = delivery.headers.retry_count, reason = %reason, "event handler panicked");
                        Err(BrokerError::Handler {
                            queue: queue.clone(),
                            reason,
                        })
                    });
                let settled = match outcome {
                    Ok(()) => transport.ack(&delivery).await,
                    Err(e) => {
                        if !matches!(e, BrokerError::Handler { .. }) {
                            warn!(queue = %queue, error = %e, "message rejected");
                        }
                        transport.nack(&delivery, false).await
                    }
                };
                if let Err(e) = settled {
                    warn!(queue = %queue, error = %e, "failed to settle delivery");
                }
            }
        });

        Ok(())
    }

    async fn emit_message_event(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        options: &EmitOptions,
    ) -> Result<bool> {
        let message = OutgoingMessage {
            body,
            headers: MessageHeaders {
                retry_count: 0,
                delay: options.delay.unwrap_or(Duration::ZERO),
                priority: options.priority.unwrap_or(0),
            },
        };
        self.transport
            .publish(&self.names.messages, routing_key, message)
            .await
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
