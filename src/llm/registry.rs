//! Provider 注册表
//!
//! 启动时按配置顺序注册；每个 Provider 附带进程级共享的健康状态：
//! 累计失败计数与「最近失败」序号，均为原子量，并发更新无需加锁。

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::llm::Provider;

/// 已注册的 Provider：原始顺序（rank）+ 健康状态
pub struct RegisteredProvider {
    provider: Arc<dyn Provider>,
    rank: usize,
    /// 累计失败次数；成功后清零
    failures: AtomicU32,
    /// 最近一次失败时的全局序号；0 表示从未失败
    last_failure: AtomicU64,
    /// 注册表共享的失败序号时钟
    clock: Arc<AtomicU64>,
}

impl RegisteredProvider {
    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        self.provider.clone()
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn last_failure(&self) -> u64 {
        self.last_failure.load(Ordering::Relaxed)
    }

    /// 记录一次失败，返回递增后的累计次数
    pub fn record_failure(&self) -> u32 {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure.store(stamp, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }
}

/// 健康快照（可观测性）
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub rank: usize,
    pub failures: u32,
    pub last_failure: u64,
}

/// 有序 Provider 集合
#[derive(Default)]
pub struct ProviderRegistry {
    entries: Vec<Arc<RegisteredProvider>>,
    clock: Arc<AtomicU64>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加注册；rank 即注册顺序
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let rank = self.entries.len();
        tracing::info!(provider = %provider.name(), rank, "provider registered");
        self.entries.push(Arc::new(RegisteredProvider {
            provider,
            rank,
            failures: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
            clock: self.clock.clone(),
        }));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredProvider>> {
        self.entries.iter().find(|e| e.name() == name).cloned()
    }

    /// 注册顺序；若指定 preferred 且已注册，则将其移到最前
    pub fn ordered(&self, preferred: Option<&str>) -> Vec<Arc<RegisteredProvider>> {
        let mut list = self.entries.clone();
        if let Some(name) = preferred {
            match list.iter().position(|e| e.name() == name) {
                Some(idx) => {
                    let entry = list.remove(idx);
                    list.insert(0, entry);
                }
                None => tracing::warn!(preferred = %name, "preferred provider not registered"),
            }
        }
        list
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        self.entries
            .iter()
            .map(|e| ProviderHealth {
                name: e.name().to_string(),
                rank: e.rank(),
                failures: e.failures(),
                last_failure: e.last_failure(),
            })
            .collect()
    }

    /// 并发探测所有 Provider 的可用性（/health 使用）
    pub async fn availability(&self) -> Vec<(String, bool)> {
        let probes = self.entries.iter().map(|e| async move {
            (e.name().to_string(), e.provider.is_available().await)
        });
        futures_util::future::join_all(probes).await
    }
}

/// 在 candidates 中选出替代 current 的 Provider：最久未失败者优先，平局按注册顺序
pub fn least_recently_failed(
    candidates: &[Arc<RegisteredProvider>],
    current: &str,
) -> Option<Arc<RegisteredProvider>> {
    candidates
        .iter()
        .filter(|e| e.name() != current)
        .min_by_key(|e| (e.last_failure(), e.rank()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;

    fn registry(names: &[&str]) -> ProviderRegistry {
        let mut r = ProviderRegistry::new();
        for n in names {
            r.register(Arc::new(MockProvider::named(*n)));
        }
        r
    }

    #[test]
    fn test_ordered_with_preferred() {
        let r = registry(&["a", "b", "c"]);
        let names: Vec<String> = r.ordered(Some("c")).iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        let names: Vec<String> = r.ordered(Some("zzz")).iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_least_recently_failed_prefers_never_failed() {
        let r = registry(&["a", "b", "c"]);
        let list = r.ordered(None);
        list[1].record_failure();
        let pick = least_recently_failed(&list, "a").unwrap();
        assert_eq!(pick.name(), "c");
    }

    #[test]
    fn test_least_recently_failed_tie_break_by_rank() {
        let r = registry(&["a", "b", "c"]);
        let list = r.ordered(None);
        let pick = least_recently_failed(&list, "a").unwrap();
        assert_eq!(pick.name(), "b");
        list[2].record_failure();
        list[1].record_failure();
        // c 比 b 更早失败
        let pick = least_recently_failed(&list, "a").unwrap();
        assert_eq!(pick.name(), "c");
    }

    #[test]
    fn test_failure_counter_resets_on_success() {
        let r = registry(&["a"]);
        let a = r.get("a").unwrap();
        assert_eq!(a.record_failure(), 1);
        assert_eq!(a.record_failure(), 2);
        a.record_success();
        assert_eq!(a.failures(), 0);
        assert_eq!(r.health()[0].failures, 0);
    }

    #[tokio::test]
    async fn test_availability_probes_every_provider() {
        let offline = Arc::new(crate::llm::ScriptedProvider::new("offline"));
        offline.set_available(false);
        let mut r = ProviderRegistry::new();
        r.register(Arc::new(MockProvider::named("online")));
        r.register(offline);
        assert_eq!(
            r.availability().await,
            vec![("online".to_string(), true), ("offline".to_string(), false)]
        );
    }
}
