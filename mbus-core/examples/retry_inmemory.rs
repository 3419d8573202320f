/// 可靠拓扑（内存版）示例
/// 展示 emit -> 订阅队列 -> handler 失败 -> 死信 -> 重试队列 -> 延迟重投 的闭环
use anyhow::Result as AnyResult;
use mbus_core::transport::InMemoryTransport;
use mbus_core::{
    BrokerOptions, EmitRequest, EventRegistry, MessageBroker, MessageContext, ReliableTopology,
    RetryStrategy, SubscriptionRequest, handler_fn,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    amount: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> AnyResult<()> {
    let options = Arc::new(
        BrokerOptions::builder()
            .project_name("shop")
            .namespace("billing")
            .retry_strategy(RetryStrategy::steps([
                Duration::from_millis(100),
                Duration::from_millis(300),
            ]))
            .max_retries(3)
            .build(),
    );

    let transport = Arc::new(InMemoryTransport::default());
    let topology = ReliableTopology::new(transport.clone(), options.clone());
    let broker = MessageBroker::new(options, Arc::new(EventRegistry::new()), topology);
    broker.connect().await?;

    // 前两次失败，第三次成功
    let handler = Arc::new(handler_fn(|event: OrderPlaced, ctx: MessageContext| async move {
        println!(
            "[{}] charge {} ({}), retries = {}",
            ctx.subscription().name(),
            event.order_id,
            event.amount,
            ctx.retries()
        );
        if ctx.retries() < 2 {
            Err(anyhow::anyhow!("payment gateway unavailable"))
        } else {
            Ok(())
        }
    }));

    broker
        .bind(
            SubscriptionRequest::builder()
                .name("BillingService/chargeOrder")
                .events(["order.placed"])
                .suppress_errors(true)
                .build(),
            handler,
        )
        .await?;

    broker
        .emit(EmitRequest::route(
            "order.placed",
            &OrderPlaced {
                order_id: "o-1001".into(),
                amount: 4200,
            },
        )?)
        .await?;

    tokio::time::sleep(Duration::from_secs(1)).await;

    let dead_letters = broker.topology().names().dead_letters.clone();
    println!(
        "dead-lettered: {}",
        transport.ready_count(&dead_letters).unwrap_or_default()
    );

    broker.disconnect().await?;
    Ok(())
}
