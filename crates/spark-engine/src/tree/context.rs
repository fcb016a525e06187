use std::fmt;

use crate::query::FilterCache;
use crate::server::SubHandlerRegistry;

/// 整棵资产树共享的注册表，由根节点创建并被所有后代引用。
///
/// - **意图 (Why)**：子处理器构造器与过滤器缓存都是树级资源，显式挂在树上而不是进程级全局变量，
///   多棵树（例如测试中的两台主机）互不干扰；
/// - **契约 (What)**：`new` 预置内建子处理器（终止、心跳）；两个注册表都可并发读写。
pub struct TreeContext {
    sub_handlers: SubHandlerRegistry,
    filters: FilterCache,
}

impl TreeContext {
    pub fn new() -> Self {
        Self {
            sub_handlers: SubHandlerRegistry::with_defaults(),
            filters: FilterCache::new(),
        }
    }

    pub fn sub_handlers(&self) -> &SubHandlerRegistry {
        &self.sub_handlers
    }

    pub fn filters(&self) -> &FilterCache {
        &self.filters
    }
}

impl Default for TreeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TreeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeContext")
            .field("sub_handlers", &self.sub_handlers)
            .field("filters", &self.filters)
            .finish()
    }
}
