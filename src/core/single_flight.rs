//! 单飞（single-flight）
//!
//! 同一个 key 的并发调用合并为一次执行：第一个调用方登记共享 future，后来者等待同一个结果。
//! 结果完成后由任意一个完成的调用方移除登记（按指针比较，避免误删新一轮的登记）。
//! 所有调用方都放弃等待时，登记保留，下一个调用方会继续驱动同一个 future。

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt, Shared};

pub struct SingleFlight<K, V>
where
    V: Clone,
{
    inflight: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
    executions: Arc<AtomicU64>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    V: Clone,
{
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            executions: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 执行或加入同 key 的在途调用；只有登记者的 fut 会被驱动，其余调用方的 fut 直接丢弃
    pub async fn run<F>(&self, key: K, fut: F) -> V
    where
        F: Future<Output = V> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let executions = Arc::clone(&self.executions);
                    let shared = async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        fut.await
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };

        let out = shared.clone().await;

        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if inflight.get(&key).is_some_and(|cur| cur.ptr_eq(&shared)) {
            inflight.remove(&key);
        }
        out
    }

    /// 实际执行次数（测试 / 统计用）
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }
}
