//! 视图规则：叶子工厂与包装工厂。

use std::fmt;
use std::sync::Arc;

use super::capability::{Capability, View};
use crate::error::{EngineError, Result};
use crate::tree::{Asset, RequestContext};

/// 直接构造视图的工厂。
pub type LeafFactory = Arc<dyn Fn(&RequestContext, &Arc<Asset>) -> Result<View> + Send + Sync>;

/// 基于同一资产上另一能力构造视图的工厂。
pub type WrappingFactory =
    Arc<dyn Fn(&RequestContext, &Arc<Asset>, View) -> Result<View> + Send + Sync>;

#[derive(Clone)]
pub enum ViewFactory {
    Leaf(LeafFactory),
    Wrapping {
        underlying: Capability,
        factory: WrappingFactory,
    },
}

/// 注册在某个资产上的视图规则，对该资产及其全部后代生效。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 解析时从请求资产向上查找，离得最近的祖先规则胜出；
///   - 同一资产上同一能力的多条规则，最后注册的一条胜出；
///   - 包装规则先在请求资产上解析 `underlying`，再把结果交给工厂；
/// - **风险 (Trade-offs)**：包装链形成环会导致无限递归，注册方负责避免 `A -> B -> A`。
#[derive(Clone)]
pub struct ViewRule {
    capability: Capability,
    description: Arc<str>,
    factory: ViewFactory,
}

impl ViewRule {
    pub fn leaf<F>(capability: Capability, description: &str, factory: F) -> Self
    where
        F: Fn(&RequestContext, &Arc<Asset>) -> Result<View> + Send + Sync + 'static,
    {
        Self {
            capability,
            description: Arc::from(description),
            factory: ViewFactory::Leaf(Arc::new(factory)),
        }
    }

    pub fn wrapping<F>(
        capability: Capability,
        description: &str,
        underlying: Capability,
        factory: F,
    ) -> Self
    where
        F: Fn(&RequestContext, &Arc<Asset>, View) -> Result<View> + Send + Sync + 'static,
    {
        Self {
            capability,
            description: Arc::from(description),
            factory: ViewFactory::Wrapping {
                underlying,
                factory: Arc::new(factory),
            },
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn factory(&self) -> &ViewFactory {
        &self.factory
    }

    /// 在 `asset` 上执行规则，产出的视图能力必须与规则声明一致。
    pub(crate) fn create(&self, rc: &RequestContext, asset: &Arc<Asset>) -> Result<View> {
        let view = match &self.factory {
            ViewFactory::Leaf(factory) => factory(rc, asset)?,
            ViewFactory::Wrapping {
                underlying,
                factory,
            } => {
                let inner = asset.acquire_view(*underlying)?;
                factory(rc, asset, inner)?
            }
        };
        if view.capability() != self.capability {
            return Err(EngineError::ViewTypeMismatch {
                path: asset.full_name().to_owned(),
                expected: self.capability,
            });
        }
        Ok(view)
    }
}

impl fmt::Debug for ViewRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.factory {
            ViewFactory::Leaf(_) => "leaf".to_owned(),
            ViewFactory::Wrapping { underlying, .. } => format!("wrapping {underlying}"),
        };
        f.debug_struct("ViewRule")
            .field("capability", &self.capability)
            .field("description", &self.description)
            .field("kind", &kind)
            .finish()
    }
}
