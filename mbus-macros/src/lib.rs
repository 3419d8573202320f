//! mbus 过程宏
//!
//! - `#[derive(MessageEvent)]`：为负载类型生成静态事件描述符
//!
mod message_event;

use proc_macro::TokenStream;

/// 事件描述符派生宏
/// - 生成 `::mbus_core::event::MessageEvent` 实现（`descriptor()`）
/// - `#[message_event(route = "created")]` 或 `route = ["user", "created"]`：路由片段
/// - `parent = Type`：继承父事件的路由与默认选项，并在其后追加本级路由
/// - `scope = "..."`, `delay = <毫秒>`, `priority = <0..=255>`：默认发布选项
/// - 可出现多个 `#[message_event(...)]`，同一键不得重复
#[proc_macro_derive(MessageEvent, attributes(message_event))]
pub fn derive_message_event(input: TokenStream) -> TokenStream {
    message_event::expand(input)
}
