//! 重试策略：显式退避表
//!
//! 第 n 次尝试失败后等待 backoff[n-1]；表用尽即停止。尝试总数 = backoff.len() + 1。

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    /// 默认 3 次尝试
    fn default() -> Self {
        Self::from_millis(&[500, 1500])
    }
}

impl RetryPolicy {
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self { backoff }
    }

    pub fn from_millis(table: &[u64]) -> Self {
        Self::new(table.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    /// 不重试
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn max_attempts(&self) -> u32 {
        self.backoff.len() as u32 + 1
    }

    /// 截断退避表，使总尝试次数不超过 max_attempts（至少 1 次）
    pub fn capped(mut self, max_attempts: Option<u32>) -> Self {
        if let Some(max) = max_attempts {
            let keep = usize::try_from(max.max(1) - 1).unwrap_or(0);
            self.backoff.truncate(keep);
        }
        self
    }

    /// 第 attempt 次（从 1 开始）失败后的等待时间；None 表示不再重试
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        let idx = usize::try_from(attempt).ok()?.checked_sub(1)?;
        self.backoff.get(idx).copied()
    }
}
