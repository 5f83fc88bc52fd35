// complete 前的汇合点
//
// 普通模式统计“part 完成”信号，智能上传统计“part 已提交”信号，
// 达到 part 总数后放行。重复信号只计一次

use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::Notify;
use tracing::debug;

/// 统计的信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// part 的所有分片都已上传
    PartsDone,
    /// part 已提交
    PartsCommitted,
}

/// complete 汇合点
#[derive(Debug)]
pub struct CompletionGate {
    mode: GateMode,
    total: usize,
    signalled: Mutex<HashSet<u32>>,
    notify: Notify,
}

impl CompletionGate {
    pub fn new(mode: GateMode, total: usize) -> Self {
        Self {
            mode,
            total,
            signalled: Mutex::new(HashSet::with_capacity(total)),
            notify: Notify::new(),
        }
    }

    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// 记录一个 part 的信号
    ///
    /// # 返回
    /// 是否为该 part 的首次信号
    pub fn signal(&self, part: u32) -> bool {
        let (inserted, count) = {
            let mut signalled = self.signalled.lock();
            let inserted = signalled.insert(part);
            (inserted, signalled.len())
        };

        if inserted {
            debug!("part {} 已就绪 ({}/{}, {:?})", part, count, self.total, self.mode);
            if count >= self.total {
                self.notify.notify_waiters();
            }
        }
        inserted
    }

    /// 是否所有 part 都已就绪
    pub fn is_open(&self) -> bool {
        self.signalled.lock().len() >= self.total
    }

    /// 尚未就绪的 part 数量
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.signalled.lock().len())
    }

    /// 等待所有 part 就绪
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}
