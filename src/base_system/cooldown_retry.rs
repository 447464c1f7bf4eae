//! 冷却/退避重试策略。
//!
//! 页面级重试使用指数退避（带抖动，封顶），429 时由调度器触发池级冷却。

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::context::Config;

/// 第 `attempt` 次失败（从 1 开始）之后应等待多久。
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

pub type SharedBackoff = Arc<dyn BackoffPolicy>;

#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    jitter_ratio: f64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter_ratio: 0.25,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            Duration::from_millis(cfg.min_wait_time),
            Duration::from_millis(cfg.max_wait_time),
        )
    }

    /// 抖动比例，限制在 [0, 1]，保证随 attempt 单调不减。
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    fn raw(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << shift).min(self.cap)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw(attempt);
        let jitter = raw.mul_f64(self.jitter_ratio * jitter_unit());
        (raw + jitter).min(self.cap)
    }
}

/// 429 冷却时长：优先服务端给的 Retry-After，否则用默认值，最终不超过上限。
pub fn cooldown_for(retry_after: Option<Duration>, default: Duration, cap: Duration) -> Duration {
    retry_after
        .filter(|d| !d.is_zero())
        .unwrap_or(default)
        .min(cap)
}

// 不引入 rand，用时间纳秒做一个 [0, 1) 的抖动。
fn jitter_unit() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1000) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(700))
            .with_jitter(0.0);
        let delays: Vec<_> = (1..=5).map(|a| backoff.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 700, 700]);
    }

    #[test]
    fn jittered_delays_never_decrease() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(2))
            .with_jitter(1.0);
        for _ in 0..50 {
            let mut last = Duration::ZERO;
            for attempt in 1..12 {
                let d = backoff.delay(attempt);
                assert!(d >= last, "attempt {attempt}: {d:?} < {last:?}");
                assert!(d <= Duration::from_secs(2));
                last = d;
            }
        }
    }

    #[test]
    fn closures_act_as_policies() {
        let policy: SharedBackoff = Arc::new(|attempt: u32| Duration::from_millis(u64::from(attempt)));
        assert_eq!(policy.delay(3), Duration::from_millis(3));
    }

    #[test]
    fn cooldown_prefers_retry_after_within_cap() {
        let default = Duration::from_secs(5);
        let cap = Duration::from_secs(30);
        assert_eq!(cooldown_for(None, default, cap), default);
        assert_eq!(
            cooldown_for(Some(Duration::from_secs(2)), default, cap),
            Duration::from_secs(2)
        );
        assert_eq!(cooldown_for(Some(Duration::from_secs(600)), default, cap), cap);
        assert_eq!(cooldown_for(Some(Duration::ZERO), default, cap), default);
    }
}
