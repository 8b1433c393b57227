//! 任务监管：根取消令牌 + 每个任务的子令牌
//!
//! 关闭时取消根令牌，所有运行中的任务随之收到取消信号。

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct TaskSupervisor {
    root: CancellationToken,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为单个任务创建子令牌
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// 取消全部任务
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }
}
