//! 重试退避策略（RetryStrategy）
//!
//! 纯函数：`retries -> delay`。在重试循环中对失败消息重新调度时内联调用。
//! 所有时间单位为毫秒；策略应单调不减（由调用方保证，不做强制校验）。
//!
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SECOND: u64 = 1000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// 每次重试固定延迟
    Constant { delay_ms: u64 },
    /// clamp(retries * pitch, min, max)
    Linear { pitch_ms: u64, min_ms: u64, max_ms: u64 },
    /// clamp(base^retries * exponent, min, max)
    Cube {
        exponent_ms: u64,
        base: u64,
        min_ms: u64,
        max_ms: u64,
    },
    /// 按次数查表，超出表长时取最后一项；空表恒为 0
    Steps { steps_ms: Vec<u64> },
}

impl RetryStrategy {
    pub fn constant(delay: Duration) -> Self {
        Self::Constant {
            delay_ms: duration_ms(delay),
        }
    }

    pub fn linear(pitch: Duration, min: Duration, max: Duration) -> Self {
        Self::Linear {
            pitch_ms: duration_ms(pitch),
            min_ms: duration_ms(min),
            max_ms: duration_ms(max),
        }
    }

    pub fn cube(exponent: Duration, base: u64, min: Duration, max: Duration) -> Self {
        Self::Cube {
            exponent_ms: duration_ms(exponent),
            base,
            min_ms: duration_ms(min),
            max_ms: duration_ms(max),
        }
    }

    pub fn steps(steps: impl IntoIterator<Item = Duration>) -> Self {
        Self::Steps {
            steps_ms: steps.into_iter().map(duration_ms).collect(),
        }
    }

    /// 默认常量策略：5 分钟
    pub fn default_constant() -> Self {
        Self::Constant {
            delay_ms: 5 * MINUTE,
        }
    }

    /// 默认线性策略：步长 5 分钟，区间 [500ms, 6h]
    pub fn default_linear() -> Self {
        Self::Linear {
            pitch_ms: 5 * MINUTE,
            min_ms: 500,
            max_ms: 6 * HOUR,
        }
    }

    /// 默认立方策略：3^n * 1000ms，区间 [500ms, 6h]
    pub fn default_cube() -> Self {
        Self::Cube {
            exponent_ms: SECOND,
            base: 3,
            min_ms: 500,
            max_ms: 6 * HOUR,
        }
    }

    /// 默认阶梯：1s, 5s, 30s, 3m, 10m, 1h, 6h
    pub fn default_steps() -> Self {
        Self::Steps {
            steps_ms: vec![
                SECOND,
                5 * SECOND,
                30 * SECOND,
                3 * MINUTE,
                10 * MINUTE,
                HOUR,
                6 * HOUR,
            ],
        }
    }

    /// 计算第 `retries` 次重试的延迟
    pub fn delay(&self, retries: u32) -> Duration {
        Duration::from_millis(self.delay_ms(retries))
    }

    pub fn delay_ms(&self, retries: u32) -> u64 {
        match self {
            Self::Constant { delay_ms } => *delay_ms,
            Self::Linear {
                pitch_ms,
                min_ms,
                max_ms,
            } => clamp(u64::from(retries).saturating_mul(*pitch_ms), *min_ms, *max_ms),
            Self::Cube {
                exponent_ms,
                base,
                min_ms,
                max_ms,
            } => clamp(
                base.saturating_pow(retries).saturating_mul(*exponent_ms),
                *min_ms,
                *max_ms,
            ),
            Self::Steps { steps_ms } => match steps_ms.last() {
                None => 0,
                Some(last) => steps_ms
                    .get(retries as usize)
                    .copied()
                    .unwrap_or(*last),
            },
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::default_cube()
    }
}

// 与 max(min, min(value, max)) 一致：min > max 时以 min 为准
fn clamp(value: u64, min: u64, max: u64) -> u64 {
    min.max(value.min(max))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_default_matches_closed_form_and_is_monotonic() {
        let s = RetryStrategy::default();
        let mut prev = 0;
        for n in 0..40u32 {
            let expected = 3u64
                .saturating_pow(n)
                .saturating_mul(1000)
                .clamp(500, 21_600_000);
            let got = s.delay_ms(n);
            assert_eq!(got, expected, "retries={n}");
            assert!(got >= prev);
            prev = got;
        }
        assert_eq!(s.delay(0), Duration::from_secs(1));
        assert_eq!(s.delay(2), Duration::from_secs(9));
        assert_eq!(s.delay(u32::MAX), Duration::from_millis(21_600_000));
    }

    #[test]
    fn linear_clamps_both_ends() {
        let s = RetryStrategy::linear(
            Duration::from_secs(1),
            Duration::from_millis(500),
            Duration::from_secs(3),
        );
        assert_eq!(s.delay_ms(0), 500);
        assert_eq!(s.delay_ms(2), 2000);
        assert_eq!(s.delay_ms(10), 3000);
    }

    #[test]
    fn constant_ignores_retries() {
        let s = RetryStrategy::constant(Duration::from_secs(1));
        assert_eq!(s.delay_ms(0), 1000);
        assert_eq!(s.delay_ms(99), 1000);
        assert_eq!(RetryStrategy::default_constant().delay_ms(3), 300_000);
    }

    #[test]
    fn steps_lookup_clamps_to_last_entry() {
        let s = RetryStrategy::default_steps();
        assert_eq!(s.delay_ms(0), 1000);
        assert_eq!(s.delay_ms(3), 180_000);
        assert_eq!(s.delay_ms(6), 21_600_000);
        assert_eq!(s.delay_ms(7), 21_600_000);
        assert_eq!(s.delay_ms(1000), 21_600_000);
    }

    #[test]
    fn empty_steps_are_zero() {
        let s = RetryStrategy::steps(Vec::new());
        for n in [0, 1, 5, u32::MAX] {
            assert_eq!(s.delay(n), Duration::ZERO);
        }
    }

    #[test]
    fn deserializes_from_tagged_config() {
        let s: RetryStrategy =
            serde_json::from_str(r#"{"kind":"constant","delay_ms":1000}"#).unwrap();
        assert_eq!(s, RetryStrategy::constant(Duration::from_secs(1)));
    }
}
