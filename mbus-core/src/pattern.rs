//! 主题模式解析（PatternResolver）与匹配（TopicMatcher）
//!
//! 将订阅声明展开为需要绑定的扁平主题模式集合：
//! 1. 作用域集合 = {默认作用域} ∪ 显式作用域（去重，默认作用域始终在首位）；
//! 2. 字面标识直接作为模式，类型标识取注册描述符的路由拼接；
//! 3. 每个模式与每个作用域交叉为 `scope.pattern`；
//! 4. 非 exact 订阅为每个基础模式追加 `pattern.<多层通配符>`，以匹配其后代；
//! 5. 全部规范化并按出现顺序去重。
//!
use crate::config::BrokerOptions;
use crate::error::{BrokerError, BrokerResult as Result};
use crate::event::EventRegistry;
use crate::naming::normalize;
use crate::subscription::{EventIdentifier, SubscriptionRequest};

pub struct PatternResolver<'a> {
    options: &'a BrokerOptions,
    registry: &'a EventRegistry,
}

impl<'a> PatternResolver<'a> {
    pub fn new(options: &'a BrokerOptions, registry: &'a EventRegistry) -> Self {
        Self { options, registry }
    }

    pub fn resolve(&self, request: &SubscriptionRequest) -> Result<Vec<String>> {
        let delimiter = self.options.delimiter();
        let scopes = self.scopes(request)?;

        if request.events().is_empty() {
            return Err(BrokerError::configuration(format!(
                "subscription {} declares no events",
                request.name()
            )));
        }

        let mut base = Vec::with_capacity(request.events().len() * scopes.len());
        for event in request.events() {
            let pattern = self.event_pattern(event)?;
            for scope in &scopes {
                base.push(format!("{scope}{delimiter}{pattern}"));
            }
        }

        let mut patterns = base.clone();
        if !request.exact() {
            let wildcard = self.options.multi_level_wildcard();
            patterns.extend(base.iter().map(|p| format!("{p}{delimiter}{wildcard}")));
        }

        let mut out: Vec<String> = Vec::with_capacity(patterns.len());
        for p in patterns.iter().map(|p| normalize(p)) {
            if !out.contains(&p) {
                out.push(p);
            }
        }
        Ok(out)
    }

    /// 单个事件标识对应的基础模式（不含作用域）
    pub fn event_pattern(&self, event: &EventIdentifier) -> Result<String> {
        let pattern = match event {
            EventIdentifier::Pattern(p) => p.clone(),
            EventIdentifier::Typed(key) => self
                .registry
                .descriptor_of(key)?
                .route_pattern(self.options.delimiter()),
        };

        let delimiter = self.options.delimiter();
        if pattern.is_empty() || pattern.split(delimiter).any(str::is_empty) {
            return Err(BrokerError::configuration(format!(
                "malformed event pattern: {pattern:?}"
            )));
        }
        Ok(pattern)
    }

    fn scopes(&self, request: &SubscriptionRequest) -> Result<Vec<String>> {
        let mut scopes = vec![self.options.default_scope().to_string()];
        for scope in request.scopes() {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        for scope in &scopes {
            validate_scope(self.options, scope)?;
        }
        Ok(scopes)
    }
}

/// 作用域必须是单个非空、无通配符的片段
pub(crate) fn validate_scope(options: &BrokerOptions, scope: &str) -> Result<()> {
    let invalid = scope.is_empty()
        || scope.contains(options.delimiter())
        || scope.contains(options.wildcard())
        || scope.contains(options.multi_level_wildcard())
        || scope.starts_with(RESERVED_PREFIX);
    if invalid {
        return Err(BrokerError::configuration(format!(
            "invalid scope: {scope:?}"
        )));
    }
    Ok(())
}

/// 拓扑内部保留的首片段前缀，业务作用域不得使用
pub(crate) const RESERVED_PREFIX: char = '~';

/// 主题匹配：单层通配符匹配恰好一个片段，多层通配符匹配零个或多个片段
#[derive(Clone, Debug)]
pub struct TopicMatcher {
    delimiter: String,
    wildcard: String,
    multi_level_wildcard: String,
}

impl TopicMatcher {
    pub fn new(
        delimiter: impl Into<String>,
        wildcard: impl Into<String>,
        multi_level_wildcard: impl Into<String>,
    ) -> Self {
        Self {
            delimiter: delimiter.into(),
            wildcard: wildcard.into(),
            multi_level_wildcard: multi_level_wildcard.into(),
        }
    }

    /// AMQP 风格：`*` / `#`
    pub fn amqp() -> Self {
        Self::new(".", "*", "#")
    }

    pub fn from_options(options: &BrokerOptions) -> Self {
        Self::new(
            options.delimiter(),
            options.wildcard(),
            options.multi_level_wildcard(),
        )
    }

    pub fn matches(&self, pattern: &str, key: &str) -> bool {
        let pattern: Vec<&str> = pattern.split(self.delimiter.as_str()).collect();
        let key: Vec<&str> = key.split(self.delimiter.as_str()).collect();
        self.match_segments(&pattern, &key)
    }

    fn match_segments(&self, pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((head, rest)) if *head == self.multi_level_wildcard => {
                (0..=key.len()).any(|skip| self.match_segments(rest, &key[skip..]))
            }
            Some((head, rest)) => match key.split_first() {
                Some((k, key_rest)) if *head == self.wildcard || head == k => {
                    self.match_segments(rest, key_rest)
                }
                _ => false,
            },
        }
    }
}

impl Default for TopicMatcher {
    fn default() -> Self {
        Self::new(".", "*", "**")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDescriptor, EventKey, MessageEvent};

    struct UserCreated;
    impl MessageEvent for UserCreated {
        fn descriptor() -> EventDescriptor {
            EventDescriptor::new(["user", "created"])
        }
    }

    fn options() -> BrokerOptions {
        BrokerOptions::builder().project_name("shop").build()
    }

    #[test]
    fn scoped_subscription_yields_default_and_explicit_scope() {
        let opts = options();
        let registry = EventRegistry::new();
        let req = SubscriptionRequest::builder()
            .name("h")
            .events(["user.created"])
            .scopes(vec!["user".into()])
            .exact(true)
            .build();

        let patterns = PatternResolver::new(&opts, &registry).resolve(&req).unwrap();
        assert_eq!(patterns, ["default.user.created", "user.user.created"]);
    }

    #[test]
    fn non_exact_adds_multi_level_suffix_for_every_base_pattern() {
        let opts = options();
        let registry = EventRegistry::new();
        let req = SubscriptionRequest::builder()
            .name("h")
            .events(["user.created", "order"])
            .scopes(vec!["user".into(), "default".into()])
            .build();

        let patterns = PatternResolver::new(&opts, &registry).resolve(&req).unwrap();
        let base = [
            "default.user.created",
            "user.user.created",
            "default.order",
            "user.order",
        ];
        assert_eq!(patterns.len(), base.len() * 2);
        for p in base {
            assert!(patterns.contains(&p.to_string()));
            assert!(patterns.contains(&format!("{p}.**")));
        }
    }

    #[test]
    fn typed_identifier_uses_registered_route_and_normalizes() {
        let opts = options();
        let registry = EventRegistry::new();
        registry
            .register_with::<UserCreated>(EventDescriptor::new(["userAccount", "created"]))
            .unwrap();
        let req = SubscriptionRequest::builder()
            .name("h")
            .events([EventIdentifier::typed::<UserCreated>()])
            .exact(true)
            .build();

        let patterns = PatternResolver::new(&opts, &registry).resolve(&req).unwrap();
        assert_eq!(patterns, ["default.user-account.created"]);
    }

    #[test]
    fn unregistered_type_is_configuration_error() {
        let opts = options();
        let registry = EventRegistry::new();
        let req = SubscriptionRequest::builder()
            .name("h")
            .events([EventKey::of::<UserCreated>()])
            .build();

        let err = PatternResolver::new(&opts, &registry).resolve(&req).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn malformed_patterns_and_scopes_are_rejected() {
        let opts = options();
        let registry = EventRegistry::new();
        let resolver = PatternResolver::new(&opts, &registry);

        for bad in ["", "user..created", ".user"] {
            let req = SubscriptionRequest::builder().name("h").events([bad]).build();
            assert!(resolver.resolve(&req).unwrap_err().is_configuration(), "{bad:?}");
        }

        for bad in ["", "a.b", "*", "~retry"] {
            let req = SubscriptionRequest::builder()
                .name("h")
                .events(["user"])
                .scopes(vec![bad.to_string()])
                .build();
            assert!(resolver.resolve(&req).unwrap_err().is_configuration(), "{bad:?}");
        }

        let req = SubscriptionRequest::builder()
            .name("h")
            .events(Vec::<EventIdentifier>::new())
            .build();
        assert!(resolver.resolve(&req).unwrap_err().is_configuration());
    }

    #[test]
    fn matcher_single_and_multi_level() {
        let m = TopicMatcher::default();
        assert!(m.matches("default.user.created", "default.user.created"));
        assert!(!m.matches("default.user.created", "default.user.created.v2"));
        assert!(m.matches("default.user.created.**", "default.user.created.v2.eu"));
        assert!(m.matches("default.user.**", "default.user"));
        assert!(m.matches("default.*.created", "default.order.created"));
        assert!(!m.matches("default.*.created", "default.created"));
        assert!(m.matches("**", "anything.at.all"));
        assert!(!m.matches("user.user.created", "default.user.created"));

        let amqp = TopicMatcher::amqp();
        assert!(amqp.matches("user.#", "user.created"));
        assert!(!amqp.matches("user.**", "user.created"));
    }
}
