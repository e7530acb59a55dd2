//! Worker 容量
//!
//! 上限和占用数放在同一个原子字里：高 32 位是上限，低 32 位是占用中的槽位数。
//! 申请槽位和修改上限都通过 compare_exchange 完成，因此
//! - 申请成功时一定满足 占用数 < 上限
//! - 下调上限不会收回已占用的槽位，只会阻止新的申请
//! - 释放槽位只减少占用数，可用数永远不会超过上限

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

const IN_FLIGHT_MASK: u64 = 0xFFFF_FFFF;

fn pack(limit: u32, in_flight: u32) -> u64 {
    ((limit as u64) << 32) | in_flight as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, (word & IN_FLIGHT_MASK) as u32)
}

fn clamp_limit(limit: usize) -> u32 {
    u32::try_from(limit).unwrap_or(u32::MAX)
}

/// Worker 容量计数器
#[derive(Debug)]
pub struct WorkerCapacity {
    state: AtomicU64,
}

impl WorkerCapacity {
    pub fn new(limit: usize) -> Self {
        Self {
            state: AtomicU64::new(pack(clamp_limit(limit), 0)),
        }
    }

    /// 当前上限
    pub fn limit(&self) -> usize {
        unpack(self.state.load(Ordering::SeqCst)).0 as usize
    }

    /// 占用中的槽位数
    pub fn in_flight(&self) -> usize {
        unpack(self.state.load(Ordering::SeqCst)).1 as usize
    }

    /// 可用槽位数
    pub fn available(&self) -> usize {
        let (limit, in_flight) = unpack(self.state.load(Ordering::SeqCst));
        limit.saturating_sub(in_flight) as usize
    }

    /// 尝试占用一个槽位，不阻塞
    ///
    /// # 返回
    /// - `Some(SlotPermit)`: 成功占用，permit 析构时释放
    /// - `None`: 没有可用槽位
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotPermit> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let (limit, in_flight) = unpack(current);
            if in_flight >= limit {
                return None;
            }
            match self.state.compare_exchange(
                current,
                pack(limit, in_flight + 1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(SlotPermit {
                        capacity: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// 直接设置新的上限，返回旧上限
    ///
    /// 占用数保持不变；若新上限低于占用数，可用数为 0，直到足够多的槽位被释放。
    pub fn set_limit(&self, new_limit: usize) -> usize {
        let new_limit = clamp_limit(new_limit);
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let (old_limit, in_flight) = unpack(current);
            match self.state.compare_exchange(
                current,
                pack(new_limit, in_flight),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return old_limit as usize,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let (limit, in_flight) = unpack(current);
            if in_flight == 0 {
                error!("槽位计数异常: 释放时占用数已为 0");
                return;
            }
            match self.state.compare_exchange(
                current,
                pack(limit, in_flight - 1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// 已占用的槽位（RAII，析构时释放一次）
#[derive(Debug)]
pub struct SlotPermit {
    capacity: Arc<WorkerCapacity>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.capacity.release();
    }
}
