//! 内存版传输（InMemoryTransport）
//!
//! 在进程内模拟主题路由型中间件，满足 `Transport` 协议：
//! - 主题/扇出交换机，主题匹配使用可配置的通配符（`TopicMatcher`）；
//! - `DelayedTopic` 交换机按消息头中的延迟调度投递；
//! - 队列按优先级出队，同优先级保持发布顺序；
//! - `nack(requeue = false)` 按队列的死信配置转发，可覆盖路由键；
//! - 关闭后发布返回 `false`，未确认消息回到队列，消费流结束。
//!
//! 典型用途：测试环境、示例与本地开发。
//!
use super::{
    ConsumeOptions, Delivery, DeliveryStream, ExchangeKind, MessageHeaders, OutgoingMessage,
    QueueOptions, Transport,
};
use crate::error::{BrokerError, BrokerResult as Result};
use crate::pattern::TopicMatcher;
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    matcher: TopicMatcher,
    connected: AtomicBool,
    next_tag: AtomicU64,
    next_seq: AtomicU64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

struct Exchange {
    kind: ExchangeKind,
    /// (routing pattern, queue)
    bindings: Vec<(String, String)>,
}

struct Queue {
    options: QueueOptions,
    ready: BinaryHeap<Pending>,
    unacked: HashMap<u64, Delivery>,
    notify: Arc<Notify>,
}

struct Pending {
    seq: u64,
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    headers: MessageHeaders,
}

// 高优先级先出；同优先级按 seq 先进先出
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.headers
            .priority
            .cmp(&other.headers.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Pending {}

impl InMemoryTransport {
    /// 使用指定的主题语法（需与代理的分隔符/通配符一致）
    pub fn new(matcher: TopicMatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                matcher,
                connected: AtomicBool::new(false),
                next_tag: AtomicU64::new(1),
                next_seq: AtomicU64::new(0),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// 队列中待投递（未被消费者取走）的消息数
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.inner.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// 队列中已投递但未确认的消息数
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.inner.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    /// 某交换机上的绑定模式
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.inner
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(TopicMatcher::default())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // 锁内不执行用户代码，中毒时沿用内部状态
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 按交换机类型路由到匹配的队列；无匹配时静默丢弃
    ///
    /// 连接关闭后不再入队，包括关闭前已接受、尚在延迟中的消息。
    fn route(&self, exchange: &str, routing_key: &str, body: Vec<u8>, headers: MessageHeaders) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.lock();
        let Some(ex) = state.exchanges.get(exchange) else {
            return false;
        };

        let mut targets: Vec<String> = Vec::new();
        for (pattern, queue) in &ex.bindings {
            let hit = match ex.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic | ExchangeKind::DelayedTopic => {
                    self.matcher.matches(pattern, routing_key)
                }
            };
            if hit && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push(Pending {
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    headers: headers.clone(),
                });
                queue.notify.notify_waiters();
            }
        }
        true
    }

    fn take_next(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.lock();
        let q = state.queues.get_mut(queue)?;
        let pending = q.ready.pop()?;
        let delivery = Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            queue: queue.to_string(),
            exchange: pending.exchange,
            routing_key: pending.routing_key,
            body: pending.body,
            headers: pending.headers,
        };
        q.unacked.insert(delivery.tag, delivery.clone());
        Some(delivery)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> Result<()> {
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.connected.store(false, Ordering::SeqCst);

        // 与真实中间件一致：通道关闭时未确认消息重新入队
        let mut state = self.inner.lock();
        for queue in state.queues.values_mut() {
            let unacked: Vec<Delivery> = queue.unacked.drain().map(|(_, d)| d).collect();
            for d in unacked {
                queue.ready.push(Pending {
                    seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
                    exchange: d.exchange,
                    routing_key: d.routing_key,
                    body: d.body,
                    headers: d.headers,
                });
            }
            queue.notify.notify_waiters();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.inner.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::transport(format!(
                "exchange {name} already declared as {:?}",
                existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.inner.lock();
        match state.queues.get(name) {
            Some(existing) if existing.options != options => Err(BrokerError::transport(
                format!("queue {name} already declared with different options"),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    Queue {
                        options,
                        ready: BinaryHeap::new(),
                        unacked: HashMap::new(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.inner.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::transport(format!("queue {queue} not declared")));
        }
        let Some(ex) = state.exchanges.get_mut(exchange) else {
            return Err(BrokerError::transport(format!(
                "exchange {exchange} not declared"
            )));
        };
        let binding = (routing_key.to_string(), queue.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<bool> {
        if !self.is_connected() {
            return Ok(false);
        }

        let kind = match self.inner.lock().exchanges.get(exchange) {
            Some(ex) => ex.kind,
            None => return Ok(false),
        };

        let OutgoingMessage { body, headers } = message;
        if kind == ExchangeKind::DelayedTopic && !headers.delay.is_zero() {
            let inner = self.inner.clone();
            let exchange = exchange.to_string();
            let routing_key = routing_key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(headers.delay).await;
                inner.route(&exchange, &routing_key, body, headers);
            });
            return Ok(true);
        }

        Ok(self.inner.route(exchange, routing_key, body, headers))
    }

    async fn consume(&self, queue: &str, _options: ConsumeOptions) -> Result<DeliveryStream> {
        self.ensure_connected()?;
        let notify = match self.inner.lock().queues.get(queue) {
            Some(q) => q.notify.clone(),
            None => {
                return Err(BrokerError::transport(format!("queue {queue} not declared")));
            }
        };

        let seed = (self.inner.clone(), queue.to_string(), notify);
        let stream = futures_util::stream::unfold(seed, |(inner, queue, notify)| async move {
            loop {
                // 先创建 Notified 再检查状态，避免丢失唤醒
                let waker = notify.clone();
                let notified = waker.notified();
                if !inner.connected.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(delivery) = inner.take_next(&queue) {
                    return Some((Ok(delivery), (inner, queue, notify)));
                }
                notified.await;
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.inner.lock();
        let removed = state
            .queues
            .get_mut(&delivery.queue)
            .and_then(|q| q.unacked.remove(&delivery.tag));
        match removed {
            Some(_) => Ok(()),
            None => Err(BrokerError::transport(format!(
                "unknown delivery tag {}",
                delivery.tag
            ))),
        }
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let dead_letter = {
            let mut state = self.inner.lock();
            let Some(queue) = state.queues.get_mut(&delivery.queue) else {
                return Err(BrokerError::transport(format!(
                    "queue {} not declared",
                    delivery.queue
                )));
            };
            let Some(d) = queue.unacked.remove(&delivery.tag) else {
                return Err(BrokerError::transport(format!(
                    "unknown delivery tag {}",
                    delivery.tag
                )));
            };

            if requeue {
                queue.ready.push(Pending {
                    seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
                    exchange: d.exchange,
                    routing_key: d.routing_key,
                    body: d.body,
                    headers: d.headers,
                });
                queue.notify.notify_waiters();
                return Ok(());
            }

            queue.options.dead_letter.clone().map(|dl| (dl, d))
        };

        if let Some((dl, d)) = dead_letter {
            let routing_key = dl.routing_key.unwrap_or(d.routing_key);
            self.inner.route(&dl.exchange, &routing_key, d.body, d.headers);
        }
        Ok(())
    }
}
