// 控制面
//
// type = 99 的消息把 worker 上限直接设为新值（不是增减）。
// 已占用的槽位不受影响，下调只阻止新的申请。

use super::capacity::WorkerCapacity;
use crate::error::ControlError;
use crate::transport::{ClientId, Envelope};
use std::sync::Arc;
use tracing::info;

/// 修改 worker 上限的指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlDirective {
    pub sender: ClientId,
    pub new_limit: usize,
}

impl ControlDirective {
    /// 解析控制消息
    ///
    /// 0 合法（暂停所有新的处理）；按有符号解释为负数或超过 `max_limit` 的值被拒绝。
    pub fn from_envelope(envelope: &Envelope, max_limit: usize) -> Result<Self, ControlError> {
        let raw = envelope.payload_size;
        if i64::try_from(raw).is_err() {
            return Err(ControlError::Negative(raw));
        }
        let new_limit = match usize::try_from(raw) {
            Ok(limit) if limit <= max_limit => limit,
            _ => {
                return Err(ControlError::AboveMaximum {
                    requested: raw,
                    max: max_limit,
                })
            }
        };
        Ok(Self {
            sender: envelope.client_id,
            new_limit,
        })
    }
}

/// 上限变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitChange {
    pub old: usize,
    pub new: usize,
}

#[derive(Debug)]
pub struct ControlPlane {
    capacity: Arc<WorkerCapacity>,
    max_limit: usize,
}

impl ControlPlane {
    pub fn new(capacity: Arc<WorkerCapacity>, max_limit: usize) -> Self {
        Self {
            capacity,
            max_limit,
        }
    }

    pub fn parse(&self, envelope: &Envelope) -> Result<ControlDirective, ControlError> {
        ControlDirective::from_envelope(envelope, self.max_limit)
    }

    /// 应用指令
    pub fn apply(&self, directive: &ControlDirective) -> LimitChange {
        let old = self.capacity.set_limit(directive.new_limit);
        info!(
            "worker 上限已更新: {} -> {} (sender={}, 占用中={})",
            old,
            directive.new_limit,
            directive.sender,
            self.capacity.in_flight()
        );
        LimitChange {
            old,
            new: directive.new_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limits() {
        let directive = ControlDirective::from_envelope(&Envelope::control(300, 8), 16).unwrap();
        assert_eq!(
            directive,
            ControlDirective {
                sender: 300,
                new_limit: 8
            }
        );

        assert_eq!(
            ControlDirective::from_envelope(&Envelope::control(300, 0), 16)
                .unwrap()
                .new_limit,
            0
        );
        assert_eq!(
            ControlDirective::from_envelope(&Envelope::control(300, 17), 16).unwrap_err(),
            ControlError::AboveMaximum {
                requested: 17,
                max: 16
            }
        );
        assert_eq!(
            ControlDirective::from_envelope(&Envelope::control(300, u64::MAX), 16).unwrap_err(),
            ControlError::Negative(u64::MAX)
        );
    }

    #[test]
    fn test_apply_overrides_limit() {
        let capacity = Arc::new(WorkerCapacity::new(5));
        let plane = ControlPlane::new(capacity.clone(), 64);
        let held = capacity.try_acquire().unwrap();

        let directive = plane.parse(&Envelope::control(300, 2)).unwrap();
        assert_eq!(plane.apply(&directive), LimitChange { old: 5, new: 2 });
        assert_eq!(capacity.limit(), 2);
        assert_eq!(capacity.available(), 1);

        let directive = plane.parse(&Envelope::control(300, 0)).unwrap();
        plane.apply(&directive);
        assert_eq!(capacity.available(), 0);
        assert!(capacity.try_acquire().is_none());

        drop(held);
        assert_eq!(capacity.in_flight(), 0);
        assert_eq!(capacity.available(), 0);
    }
}
