//! 单轮调用预算
//!
//! 模型调用与工具调用各消耗一个单位；超限时拒绝且不修改计数。每轮开始时新建。

use serde::Serialize;

/// consume 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    Ok,
    Exceeded,
}

/// 单轮调用预算：不变量 used_calls <= max_calls_per_turn
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallBudget {
    max_calls_per_turn: usize,
    used_calls: usize,
}

impl CallBudget {
    pub fn new(max_calls_per_turn: usize) -> Self {
        Self {
            max_calls_per_turn,
            used_calls: 0,
        }
    }

    /// 尝试占用一个单位；已满时返回 Exceeded，状态不变
    pub fn consume(&mut self) -> BudgetVerdict {
        if self.used_calls >= self.max_calls_per_turn {
            return BudgetVerdict::Exceeded;
        }
        self.used_calls += 1;
        BudgetVerdict::Ok
    }

    pub fn used(&self) -> usize {
        self.used_calls
    }

    pub fn max(&self) -> usize {
        self.max_calls_per_turn
    }

    pub fn remaining(&self) -> usize {
        self.max_calls_per_turn.saturating_sub(self.used_calls)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}
