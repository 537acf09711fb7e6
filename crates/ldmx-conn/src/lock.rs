use core::fmt;
use ldmx_core::MessageId;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// 写锁的逻辑持有者标识。
///
/// - 普通请求以自己的关联 id 作为持有者；
/// - 认证交换使用保留的 [`LockOwner::BIND`]：多轮 SASL 的每一轮写入
///   都以同一持有者重入，整个交换期间其他写入者被排斥；
/// - 连接建立阶段的调用方可自取一个保留值（见 [`LockOwner::raw`]）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockOwner(i32);

impl LockOwner {
    /// 认证交换专用的连接级持有者。
    pub const BIND: LockOwner = LockOwner(i32::MIN);

    /// 以请求的关联 id 作为持有者。
    pub fn request(id: MessageId) -> Self {
        LockOwner(id.value())
    }

    /// 以调用方自选的原始值作为持有者（connect 等非请求场景）。
    pub fn raw(value: i32) -> Self {
        LockOwner(value)
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == LockOwner::BIND {
            write!(f, "bind")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Default)]
struct OwnerState {
    owner: Option<LockOwner>,
    count: u32,
}

/// 按持有者标识计数的可重入写锁。
///
/// # 设计背景（Why）
/// - 传输层写路径必须整帧互斥，否则并发写会产生撕裂帧；
/// - 多步认证需要在不放锁的情况下连续发出多帧（每轮新的关联 id），
///   因此互斥必须按“逻辑持有者”而非按调用点计数——同一持有者重入
///   仅递增计数，不阻塞。
///
/// # 实现逻辑（How）
/// - `parking_lot::Mutex` 保护 {持有者, 计数} 对，`tokio::sync::Notify`
///   承担等待——先注册唤醒再复查状态，避免丢失唤醒；
/// - 释放到零时广播唤醒所有排队者，各自重新竞争。
///
/// # 契约说明（What）
/// - **不变量**：任意时刻至多一个持有者；非持有者释放或空锁释放属于
///   编程错误，立即 panic（等价于信号量误用故障，不可恢复）；
/// - `force_release` 供放弃/排空路径使用：若指定持有者正持锁则清空全部
///   计数，否则静默无操作。
#[derive(Debug, Default)]
pub(crate) struct WriteLock {
    state: Mutex<OwnerState>,
    freed: Notify,
}

impl WriteLock {
    /// 以 `owner` 身份获取写锁；同一持有者重入立即返回。
    pub(crate) async fn acquire(&self, owner: LockOwner) {
        loop {
            if self.try_acquire(owner) {
                return;
            }
            let freed = self.freed.notified();
            // 注册唤醒后复查，防止释放发生在两步之间。
            if self.try_acquire(owner) {
                return;
            }
            freed.await;
        }
    }

    fn try_acquire(&self, owner: LockOwner) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(owner);
                state.count = 1;
                true
            }
            Some(current) if current == owner => {
                state.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// 释放一层持有；计数归零后锁空闲并唤醒排队者。
    ///
    /// # Panics
    /// 非持有者释放或锁本就空闲时 panic——这是不变量破坏，不是可恢复
    /// 错误。
    pub(crate) fn release(&self, owner: LockOwner) {
        let mut state = self.state.lock();
        match state.owner {
            Some(current) if current == owner => {
                state.count -= 1;
                if state.count == 0 {
                    state.owner = None;
                    drop(state);
                    self.freed.notify_waiters();
                }
            }
            Some(current) => {
                panic!("write lock released by {owner} while held by {current}")
            }
            None => panic!("write lock released by {owner} while free"),
        }
    }

    /// 若 `owner` 正持锁则清空其全部计数；返回是否发生了释放。
    pub(crate) fn force_release(&self, owner: LockOwner) -> bool {
        let mut state = self.state.lock();
        if state.owner == Some(owner) {
            state.owner = None;
            state.count = 0;
            drop(state);
            self.freed.notify_waiters();
            true
        } else {
            false
        }
    }

    /// 当前持有者（诊断用）。
    #[cfg(test)]
    pub(crate) fn holder(&self) -> Option<LockOwner> {
        self.state.lock().owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn reentrant_acquire_never_blocks() {
        let lock = WriteLock::default();
        let owner = LockOwner::raw(7);
        lock.acquire(owner).await;
        lock.acquire(owner).await;
        assert_eq!(lock.holder(), Some(owner));
        lock.release(owner);
        assert_eq!(lock.holder(), Some(owner), "重入计数未归零前锁应保持");
        lock.release(owner);
        assert_eq!(lock.holder(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn contending_owner_waits_for_release() {
        let lock = Arc::new(WriteLock::default());
        let first = LockOwner::raw(1);
        let second = LockOwner::raw(2);
        lock.acquire(first).await;

        let contender = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                lock.acquire(second).await;
                lock.release(second);
            })
        };
        // 持锁期间竞争者不得完成。
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        lock.release(first);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("竞争者应在释放后获得锁")
            .expect("竞争任务不应 panic");
    }

    #[tokio::test]
    async fn force_release_clears_all_counts() {
        let lock = WriteLock::default();
        lock.acquire(LockOwner::BIND).await;
        lock.acquire(LockOwner::BIND).await;
        assert!(lock.force_release(LockOwner::BIND));
        assert_eq!(lock.holder(), None);
        // 非持有者的强制释放是无操作。
        assert!(!lock.force_release(LockOwner::raw(9)));
    }

    #[test]
    #[should_panic(expected = "while free")]
    fn release_when_free_is_a_fault() {
        let lock = WriteLock::default();
        lock.release(LockOwner::raw(3));
    }

    #[tokio::test]
    #[should_panic(expected = "while held by")]
    async fn release_by_non_owner_is_a_fault() {
        let lock = WriteLock::default();
        lock.acquire(LockOwner::raw(1)).await;
        lock.release(LockOwner::raw(2));
    }
}
