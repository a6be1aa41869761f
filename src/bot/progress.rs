//! 进度估算：DOCUMENTS / RANKING_DOCUMENTS 事件的装饰性百分比
//!
//! 可插拔实现，测试用固定值替换随机值。

use rand::Rng;

/// 进度估算器
pub trait ProgressEstimator: Send + Sync {
    /// 检索阶段的进度文本
    fn retrieving(&self) -> String;
    /// 排序阶段的进度文本
    fn ranking(&self) -> String;
}

/// 随机进度：检索 40–59%，排序 80–94%
#[derive(Debug, Default)]
pub struct RandomProgress;

impl ProgressEstimator for RandomProgress {
    fn retrieving(&self) -> String {
        format!("{}%", rand::thread_rng().gen_range(40..60))
    }

    fn ranking(&self) -> String {
        format!("{}%", rand::thread_rng().gen_range(80..95))
    }
}

/// 固定进度（测试用）
#[derive(Debug)]
pub struct FixedProgress {
    pub retrieving: u8,
    pub ranking: u8,
}

impl Default for FixedProgress {
    fn default() -> Self {
        Self {
            retrieving: 50,
            ranking: 90,
        }
    }
}

impl ProgressEstimator for FixedProgress {
    fn retrieving(&self) -> String {
        format!("{}%", self.retrieving)
    }

    fn ranking(&self) -> String {
        format!("{}%", self.ranking)
    }
}
