//! 远程会话的通道标识空间。

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use spark_engine::Capability;

use crate::protocol::ChannelTarget;

/// 同一物理连接上 `(路径, 能力)` 到通道标识的双向映射。
///
/// # 教案式说明
/// - **意图 (Why)**：多个远程视图共享一条连接，每个视图占用一个逻辑通道；
/// - **契约 (What)**：同一目标总是得到同一标识，标识从 1 开始递增，`0` 留给会话通道头；
///   故障转移后标识保持不变，只需在新连接上重新发送完整通道头；
/// - **风险 (Trade-offs)**：标识从不回收，长期运行的客户端访问大量不同路径时映射只增不减。
#[derive(Debug)]
pub struct CidSpace {
    by_target: DashMap<ChannelTarget, u64>,
    by_cid: DashMap<u64, ChannelTarget>,
    next: AtomicU64,
}

impl CidSpace {
    pub fn new() -> Self {
        Self {
            by_target: DashMap::new(),
            by_cid: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    pub fn acquire(&self, csp: &str, capability: Capability) -> u64 {
        let target = ChannelTarget::new(csp, capability);
        *self
            .by_target
            .entry(target.clone())
            .or_insert_with(|| {
                let cid = self.next.fetch_add(1, Ordering::Relaxed);
                self.by_cid.insert(cid, target);
                cid
            })
            .value()
    }

    pub fn lookup(&self, cid: u64) -> Option<ChannelTarget> {
        self.by_cid.get(&cid).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.by_cid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cid.is_empty()
    }
}

impl Default for CidSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn same_target_same_cid_under_contention() {
        let space = Arc::new(CidSpace::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let space = space.clone();
                std::thread::spawn(move || space.acquire("/prices", Capability::KeyValueStore))
            })
            .collect();
        let cids: Vec<u64> = handles
            .into_iter()
            .map(|handle| handle.join().expect("线程正常结束"))
            .collect();
        assert!(cids.iter().all(|cid| *cid == cids[0]));
        assert_ne!(cids[0], 0);

        let other = space.acquire("/prices", Capability::ObjectSubscription);
        assert_ne!(other, cids[0], "不同能力占用不同通道");
        assert_eq!(space.len(), 2);
        assert_eq!(
            space.lookup(other),
            Some(ChannelTarget::new("/prices", Capability::ObjectSubscription))
        );
        assert_eq!(space.lookup(99), None);
    }
}
