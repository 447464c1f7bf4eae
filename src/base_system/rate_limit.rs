//! 令牌桶限速与池级冷却闸门。
//!
//! 所有出站请求（解析、探测、图片下载）都先从同一个令牌桶取令牌；
//! 429 触发的冷却对整个下载池生效，直到到期前 worker 不会再发请求。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::context::Config;

/// 时间源，测试里可以换成手动推进的时钟。
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self::with_clock(capacity, refill_per_sec, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: u32, refill_per_sec: f64, clock: Arc<dyn Clock>) -> Self {
        let capacity = f64::from(capacity.max(1));
        let now = clock.now();
        Self {
            capacity,
            refill_per_sec: if refill_per_sec > 0.0 { refill_per_sec } else { 1.0 },
            clock,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.burst, cfg.requests_per_second)
    }

    /// 测试或离线场景用：几乎不限速。
    pub fn unlimited() -> Self {
        Self::new(u32::MAX / 2, 1.0e9)
    }

    /// 尝试取一个令牌；不够时返回还需等待的时长。
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - state.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_per_sec))
    }

    /// 阻塞直到拿到令牌。
    pub fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            self.clock.sleep(wait.max(Duration::from_millis(1)));
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

/// 池级冷却：到期前所有 worker 在 `wait` 里等待。
pub struct PoolCooldown {
    clock: Arc<dyn Clock>,
    until: Mutex<Option<Instant>>,
}

impl Default for PoolCooldown {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl PoolCooldown {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            until: Mutex::new(None),
        }
    }

    /// 开启（或延长）冷却；已有更晚的截止时间时保持不变。
    pub fn trigger(&self, duration: Duration) -> Instant {
        let deadline = self.clock.now() + duration;
        let mut until = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        match *until {
            Some(existing) if existing >= deadline => existing,
            _ => {
                *until = Some(deadline);
                deadline
            }
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        let mut until = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = (*until)?;
        let now = self.clock.now();
        if deadline <= now {
            *until = None;
            return None;
        }
        Some(deadline - now)
    }

    pub fn wait(&self) {
        while let Some(left) = self.remaining() {
            self.clock.sleep(left);
        }
    }

    /// 同 `wait`，每睡 `slice` 检查一次取消标记；被取消时返回 false。
    pub fn wait_or_cancel(&self, cancel: &AtomicBool, slice: Duration) -> bool {
        while let Some(left) = self.remaining() {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            self.clock.sleep(left.min(slice));
        }
        !cancel.load(Ordering::Relaxed)
    }
}
