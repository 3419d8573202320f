use anyhow::Result as AnyResult;
use async_trait::async_trait;
use mbus_core::pattern::TopicMatcher;
use mbus_core::transport::InMemoryTransport;
use mbus_core::{
    BrokerConfig, EmitRequest, EventHandler, EventIdentifier, EventRegistry, MessageBroker,
    MessageContext, ReliableTopology, Subscriber, SubscriptionRequest, handler_fn,
};
use mbus_macros::MessageEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = r#"
project_name = "demoShop"
namespace = "userService"
max_retries = 5

[retry]
kind = "constant"
delay_ms = 500
"#;

#[derive(Debug, Clone, Serialize, Deserialize, MessageEvent)]
#[message_event(route = "user", scope = "user")]
struct UserEvent {
    user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, MessageEvent)]
#[message_event(parent = UserEvent, route = "created", priority = 10)]
struct UserCreatedEvent {
    user_id: String,
    email: String,
}

/// 欢迎邮件：前两次投递模拟失败，演示退避重投
#[derive(Default)]
struct WelcomeMailer {
    attempts: AtomicU32,
}

#[async_trait]
impl EventHandler<UserCreatedEvent> for WelcomeMailer {
    async fn handle(&self, event: UserCreatedEvent, ctx: MessageContext) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            anyhow::bail!("smtp relay busy (attempt {attempt})");
        }
        info!(user = %event.user_id, email = %event.email, retries = ctx.retries(), "welcome mail sent");
        Ok(())
    }
}

fn load_config() -> AnyResult<BrokerConfig> {
    let raw = match std::env::var("MBUS_CONFIG") {
        Ok(path) => std::fs::read_to_string(path)?,
        Err(_) => DEFAULT_CONFIG.to_string(),
    };
    Ok(BrokerConfig::from_toml_str(&raw)?)
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = load_config()?;
    info!(broker_url = %config.connection.url(), "configured broker, served by in-memory transport");
    let options = Arc::new(config.into_options());

    let registry = Arc::new(EventRegistry::new());
    registry.register::<UserEvent>()?;
    registry.register::<UserCreatedEvent>()?;

    let transport = InMemoryTransport::new(TopicMatcher::from_options(&options));
    let topology = ReliableTopology::new(Arc::new(transport), options.clone());
    let broker = MessageBroker::new(options, registry, topology);
    broker.connect().await?;

    let audit = handler_fn(|event: serde_json::Value, ctx: MessageContext| async move {
        info!(subscriber = ctx.subscription().name(), payload = %event, "audit");
        anyhow::Ok(())
    });

    let reports = broker
        .register_all(vec![
            Subscriber::new(
                SubscriptionRequest::builder()
                    .name("WelcomeMailer/handleUserCreated")
                    .events([EventIdentifier::typed::<UserCreatedEvent>()])
                    .scopes(vec!["user".into()])
                    .exact(true)
                    .build(),
                Arc::new(WelcomeMailer::default()),
            ),
            Subscriber::new(
                SubscriptionRequest::builder()
                    .name("AuditLog/handleAllUser")
                    .events([EventIdentifier::typed::<UserEvent>()])
                    .scopes(vec!["user".into()])
                    .build(),
                Arc::new(audit),
            ),
        ])
        .await;
    for report in reports.iter().filter(|r| !r.is_ok()) {
        warn!(subscriber = %report.name, "subscriber not registered");
    }

    let accepted = broker
        .emit(EmitRequest::event(&UserCreatedEvent {
            user_id: "u-42".into(),
            email: "u42@example.com".into(),
        })?)
        .await?;
    info!(accepted, "user created event emitted");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(3)) => {}
    }

    broker.disconnect().await?;
    Ok(())
}
