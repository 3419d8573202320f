//! 名称与路由键构建（NameKeyBuilder）
//!
//! 由 {项目, 命名空间, 作用域, 路由} 确定性地拼接层级名称，
//! 并统一转换为 kebab-case，保证不同调用方的命名习惯得到一致的键。
//!

/// 将驼峰命名转换为 kebab-case：在 ASCII 小写字母/数字与随后的 ASCII 大写字母之间插入 `-`，
/// 再整体转小写（含非 ASCII 字母）
///
/// 通配符与分隔符原样保留，例如 `user.*` 仍为 `user.*`。
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev: Option<char> = None;

    for c in input.chars() {
        if let Some(p) = prev {
            if (p.is_ascii_lowercase() || p.is_ascii_digit()) && c.is_ascii_uppercase() {
                out.push('-');
            }
        }
        out.extend(c.to_lowercase());
        prev = Some(c);
    }

    out
}

#[derive(Clone, Debug)]
pub struct NameKeyBuilder {
    project: String,
    namespace: Option<String>,
    delimiter: String,
    name_delimiter: String,
}

impl NameKeyBuilder {
    pub fn new(
        project: impl Into<String>,
        namespace: Option<String>,
        delimiter: impl Into<String>,
        name_delimiter: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            namespace,
            delimiter: delimiter.into(),
            name_delimiter: name_delimiter.into(),
        }
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn name_delimiter(&self) -> &str {
        &self.name_delimiter
    }

    /// 以路由分隔符拼接非空片段（不做规范化）
    pub fn join<S: AsRef<str>>(&self, segments: &[S]) -> String {
        join_non_empty(segments, &self.delimiter)
    }

    /// 资源名称：项目 + 命名空间 + 用途，按名称分隔符拼接并规范化
    pub fn name_tag<S: AsRef<str>>(&self, names: &[S]) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(names.len() + 2);
        parts.push(&self.project);
        if let Some(ns) = &self.namespace {
            parts.push(ns);
        }
        parts.extend(names.iter().map(AsRef::as_ref));
        normalize(&join_non_empty(&parts, &self.name_delimiter))
    }

    /// 发布路由键：`scope.route`（规范化）
    pub fn routing_key(&self, scope: &str, route: &str) -> String {
        normalize(&self.join(&[scope, route]))
    }
}

fn join_non_empty<S: AsRef<str>>(segments: &[S], delimiter: &str) -> String {
    segments
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(delimiter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_camel_and_pascal_case() {
        assert_eq!(normalize("userCreated"), "user-created");
        assert_eq!(normalize("UserService/handleCreatedUser"), "user-service/handle-created-user");
        assert_eq!(normalize("order2Shipped"), "order2-shipped");
        assert_eq!(normalize("already-kebab.case"), "already-kebab.case");
        assert_eq!(normalize("user.**"), "user.**");
        // 连续大写不拆分
        assert_eq!(normalize("HTTPServer"), "httpserver");
    }

    #[test]
    fn normalize_lowercases_non_ascii_letters() {
        assert_eq!(normalize("Ünit.Created"), "ünit.created");
        assert_eq!(normalize("Ünit.Created"), normalize("ünit.created"));
        assert_eq!(normalize("ÄrgerÖffnet"), "ärgeröffnet");
    }

    #[test]
    fn name_tag_skips_missing_namespace() {
        let b = NameKeyBuilder::new("myBroker", None, ".", ".");
        assert_eq!(b.name_tag(&["messages"]), "my-broker.messages");

        let b = NameKeyBuilder::new("myBroker", Some("userService".into()), ".", "/");
        assert_eq!(
            b.name_tag(&["AppService/handleCreatedUser"]),
            "my-broker/user-service/app-service/handle-created-user"
        );
    }

    #[test]
    fn routing_key_is_scope_then_route() {
        let b = NameKeyBuilder::new("p", None, ".", ".");
        assert_eq!(b.routing_key("default", "userCreated"), "default.user-created");
        assert_eq!(b.routing_key("Billing", "invoice.paid"), "billing.invoice.paid");
        assert_eq!(b.join(&["a", "", "b"]), "a.b");
    }
}
