//! 网关调用统计：每个工具的调用数、成功数、按失败类型计数、重试次数、缓存命中与延迟分位数

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

use crate::core::FailureKind;

/// 每个工具保留的延迟样本数
const MAX_SAMPLES: usize = 1024;

#[derive(Debug, Default)]
struct Counters {
    calls: u64,
    successes: u64,
    failures: BTreeMap<&'static str, u64>,
    retries: u64,
    cache_hits: u64,
    latencies_ms: VecDeque<f64>,
}

/// 单个工具的统计快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStatsSnapshot {
    pub tool: String,
    pub calls: u64,
    pub successes: u64,
    pub failures: BTreeMap<String, u64>,
    pub retries: u64,
    pub cache_hits: u64,
    pub success_rate: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Default)]
pub struct ToolStats {
    inner: Mutex<HashMap<String, Counters>>,
}

impl ToolStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次调用；failure 为 None 表示成功
    pub fn record(
        &self,
        tool: &str,
        failure: Option<FailureKind>,
        attempts: u32,
        cache_hit: bool,
        latency_ms: f64,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let c = inner.entry(tool.to_string()).or_default();
        c.calls += 1;
        match failure {
            None => c.successes += 1,
            Some(kind) => *c.failures.entry(kind.as_str()).or_insert(0) += 1,
        }
        c.retries += u64::from(attempts.saturating_sub(1));
        if cache_hit {
            c.cache_hits += 1;
        }
        if c.latencies_ms.len() == MAX_SAMPLES {
            c.latencies_ms.pop_front();
        }
        c.latencies_ms.push_back(latency_ms);
    }

    pub fn snapshot(&self, tool: &str) -> Option<ToolStatsSnapshot> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(tool).map(|c| to_snapshot(tool, c))
    }

    /// 全部工具，按名称排序
    pub fn snapshot_all(&self) -> Vec<ToolStatsSnapshot> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ToolStatsSnapshot> = inner.iter().map(|(t, c)| to_snapshot(t, c)).collect();
        out.sort_by(|a, b| a.tool.cmp(&b.tool));
        out
    }
}

fn to_snapshot(tool: &str, c: &Counters) -> ToolStatsSnapshot {
    let mut sorted: Vec<f64> = c.latencies_ms.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    ToolStatsSnapshot {
        tool: tool.to_string(),
        calls: c.calls,
        successes: c.successes,
        failures: c.failures.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        retries: c.retries,
        cache_hits: c.cache_hits,
        success_rate: if c.calls == 0 { 0.0 } else { c.successes as f64 / c.calls as f64 },
        p50_ms: percentile(&sorted, 50.0),
        p95_ms: percentile(&sorted, 95.0),
    }
}

/// 线性插值分位数；输入需已排序
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
    }
}
