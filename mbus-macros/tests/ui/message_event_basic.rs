use mbus_core::event::{EventRegistry, MessageEvent};
use mbus_macros::MessageEvent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, MessageEvent)]
#[message_event(route = "user", scope = "user")]
struct UserEvent {
    user_id: String,
}

#[derive(Debug, Serialize, Deserialize, MessageEvent)]
#[message_event(parent = UserEvent, route = "created")]
#[message_event(delay = 60000, priority = 10)]
struct UserCreatedEvent {
    user_id: String,
}

#[derive(Debug, Serialize, Deserialize, MessageEvent)]
#[message_event(route = ["order", "placed"])]
struct OrderPlaced;

fn main() {
    let d = UserCreatedEvent::descriptor();
    assert_eq!(d.route(), ["user".to_string(), "created".to_string()]);
    assert_eq!(d.options().scope.as_deref(), Some("user"));
    assert_eq!(d.options().priority, Some(10));

    let registry = EventRegistry::new();
    registry.register::<UserCreatedEvent>().unwrap();
    registry.register::<OrderPlaced>().unwrap();
    assert_eq!(OrderPlaced::descriptor().route_pattern("."), "order.placed");
}
