use ldmx_core::{Envelope, EngineError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// 回复队列中的一项：正常回复，或排空/超时路径注入的合成故障。
#[derive(Clone, Debug)]
pub(crate) enum ReplyItem {
    Reply(Envelope),
    Fault(EngineError),
}

/// 单个在途请求的有序回复缓冲。
///
/// # 设计背景（Why）
/// - 读者循环按线缆顺序投递，调用方按自己的节奏消费；两端速率解耦
///   需要一个线程安全的有序缓冲；
/// - 读者路径的故障无法同步返回给任何调用方，因此队列同时承载
///   [`ReplyItem::Fault`]——阻塞中的等待者会以显式错误醒来而不是永久
///   挂起。
///
/// # 实现逻辑（How）
/// - `parking_lot::Mutex<VecDeque>` 承载条目；入队方完成后通过
///   [`Notify::notify_waiters`] 广播，消费方以“先注册唤醒、再复查队列”
///   的循环消费，不丢唤醒也不空转；
/// - 队列自身不关心完成/放弃状态，排空判定由持有它的
///   [`PendingRequest`](crate::PendingRequest) 结合自身标志完成。
///
/// # 契约说明（What）
/// - **不变量**：条目出队顺序与入队顺序一致（FIFO）；
/// - 多生产者（读者 + 放弃路径）与多消费者并发安全。
#[derive(Debug, Default)]
pub(crate) struct ReplyQueue {
    items: Mutex<VecDeque<ReplyItem>>,
    ready: Notify,
}

impl ReplyQueue {
    pub(crate) fn push_reply(&self, envelope: Envelope) {
        self.items.lock().push_back(ReplyItem::Reply(envelope));
        self.ready.notify_waiters();
    }

    pub(crate) fn push_fault(&self, fault: EngineError) {
        self.items.lock().push_back(ReplyItem::Fault(fault));
        self.ready.notify_waiters();
    }

    pub(crate) fn try_pop(&self) -> Option<ReplyItem> {
        self.items.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// 注册一次唤醒。必须在检查队列**之前**调用返回的 future 才能保证
    /// 不丢失入队通知。
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.ready.notified()
    }

    /// 唤醒所有等待者而不入队任何条目，供状态翻转（完成/放弃）使用。
    pub(crate) fn wake_all(&self) {
        self.ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ldmx_core::MessageId;
    use proptest::prelude::*;

    fn envelope(id: i32, seq: u8) -> Envelope {
        Envelope::new(MessageId(id), 0x64, Bytes::from(vec![seq]))
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = ReplyQueue::default();
        queue.push_reply(envelope(1, 0));
        queue.push_fault(EngineError::TlsNegotiation {
            detail: "x".into(),
        });
        queue.push_reply(envelope(1, 1));

        assert!(matches!(queue.try_pop(), Some(ReplyItem::Reply(env)) if env.body[0] == 0));
        assert!(matches!(queue.try_pop(), Some(ReplyItem::Fault(_))));
        assert!(matches!(queue.try_pop(), Some(ReplyItem::Reply(env)) if env.body[0] == 1));
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn waiter_wakes_on_push() {
        let queue = std::sync::Arc::new(ReplyQueue::default());
        let consumer = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move {
                loop {
                    let wakeup = queue.notified();
                    if let Some(item) = queue.try_pop() {
                        return item;
                    }
                    wakeup.await;
                }
            })
        };
        tokio::task::yield_now().await;
        queue.push_reply(envelope(9, 42));
        let item = tokio::time::timeout(std::time::Duration::from_secs(1), consumer)
            .await
            .expect("消费者应被入队唤醒")
            .expect("消费任务不应 panic");
        assert!(matches!(item, ReplyItem::Reply(env) if env.message_id == MessageId(9)));
    }

    proptest! {
        /// 任意交错的入队/出队序列下，出队顺序必须是入队顺序的前缀。
        #[test]
        fn interleaved_pops_respect_fifo(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let queue = ReplyQueue::default();
            let mut pushed = 0u8;
            let mut popped = Vec::new();
            for push in ops {
                if push {
                    queue.push_reply(envelope(1, pushed));
                    pushed += 1;
                } else if let Some(ReplyItem::Reply(env)) = queue.try_pop() {
                    popped.push(env.body[0]);
                }
            }
            while let Some(ReplyItem::Reply(env)) = queue.try_pop() {
                popped.push(env.body[0]);
            }
            let expected: Vec<u8> = (0..pushed).collect();
            prop_assert_eq!(popped, expected);
        }
    }
}
