use crate::conn::Connection;
use crate::pending::{PendingRequest, SendOptions, Take};
use crate::queue::ReplyItem;
use ldmx_core::{Envelope, EngineError, MessageId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct GroupState {
    members: Vec<Arc<PendingRequest>>,
    cursor: usize,
}

/// 属于同一逻辑调用方的一组在途请求。
///
/// # 设计背景（Why）
/// - 一次同步调用或一个调用方可见的异步句柄往往同时等待多个请求
///   （例如并行搜索的多个分页）；请求组提供“任意成员有回复即返回”
///   与“等待指定成员”两种阻塞语义；
/// - `any_reply` 采用从上次服务成员的下一位开始的公平轮转，避免
///   话痨请求饿死低流量请求。
///
/// # 契约说明（What）
/// - **不变量**：一个 [`PendingRequest`] 任意时刻只属于一个请求组；
///   [`merge`](Self::merge) 转移所有权而非复制；
/// - 成员随请求完成并排空自动退出；请求组本身随调用方丢弃即可，
///   对连接而言成员关系是弱引用，无须强制清理。
#[derive(Debug, Default)]
pub struct RequestGroup {
    state: Mutex<GroupState>,
    wakeup: Arc<Notify>,
}

impl RequestGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 `conn` 上创建、登记并发出一个在途请求。
    ///
    /// 信封的关联 id 由调用方经
    /// [`Connection::next_message_id`](crate::Connection::next_message_id)
    /// 取得；保留 id `0` 不可用作请求。
    pub async fn send(
        &self,
        conn: &Connection,
        request: Envelope,
        options: SendOptions,
    ) -> Result<Arc<PendingRequest>, EngineError> {
        assert_ne!(
            request.message_id,
            MessageId::UNSOLICITED,
            "message id 0 is reserved for unsolicited notices"
        );
        let core = conn.core();
        let deadline = options.effective_deadline(&core.config);
        let pending = Arc::new(PendingRequest::new(
            request,
            deadline,
            options.auth,
            Arc::downgrade(core),
            Arc::clone(&self.wakeup),
        ));
        let id = pending.id();
        core.hosted.insert(id, Arc::clone(&pending));
        self.state.lock().members.push(Arc::clone(&pending));

        match pending.send().await {
            Ok(()) => Ok(pending),
            Err(err) => {
                core.hosted.remove(&id);
                self.state.lock().members.retain(|member| member.id() != id);
                Err(err)
            }
        }
    }

    /// 阻塞直到任意成员有可取的条目。
    ///
    /// - `Some(Ok(_))`：某成员的一条回复；
    /// - `Some(Err(_))`：某成员被注入的合成故障；
    /// - `None`：组内不再有存活成员。
    pub async fn any_reply(&self) -> Option<Result<Envelope, EngineError>> {
        loop {
            let wakeup = self.wakeup.notified();
            let (members, cursor) = {
                let state = self.state.lock();
                (state.members.clone(), state.cursor)
            };
            if members.is_empty() {
                return None;
            }
            let count = members.len();
            let mut served = None;
            // 公平轮转：从上次服务成员的下一位开始。
            for step in 1..=count {
                let index = (cursor + step) % count;
                let member = &members[index];
                match member.take_item() {
                    Take::Item(item) => {
                        served = Some((Arc::clone(member), item));
                        break;
                    }
                    Take::Finished => {
                        self.remove_member(member.id());
                    }
                    Take::Empty => {}
                }
            }
            if let Some((member, item)) = served {
                let mut state = self.state.lock();
                state.cursor = state
                    .members
                    .iter()
                    .position(|candidate| candidate.id() == member.id())
                    .unwrap_or(0);
                drop(state);
                if member.is_complete() && member.queue_is_empty() {
                    self.remove_member(member.id());
                }
                return Some(match item {
                    ReplyItem::Reply(envelope) => Ok(envelope),
                    ReplyItem::Fault(fault) => Err(fault),
                });
            }
            if self.state.lock().members.is_empty() {
                return None;
            }
            wakeup.await;
        }
    }

    /// 阻塞等待指定成员的下一条条目；成员不存在或已静默终结时返回
    /// `None`。
    pub async fn reply(&self, id: MessageId) -> Option<Result<Envelope, EngineError>> {
        loop {
            let wakeup = self.wakeup.notified();
            let member = {
                let state = self.state.lock();
                state
                    .members
                    .iter()
                    .find(|member| member.id() == id)
                    .cloned()
            };
            let Some(member) = member else {
                return None;
            };
            match member.take_item() {
                Take::Item(item) => {
                    if member.is_complete() && member.queue_is_empty() {
                        self.remove_member(id);
                    }
                    return Some(match item {
                        ReplyItem::Reply(envelope) => Ok(envelope),
                        ReplyItem::Fault(fault) => Err(fault),
                    });
                }
                Take::Finished => {
                    self.remove_member(id);
                    return None;
                }
                Take::Empty => wakeup.await,
            }
        }
    }

    /// 把 `other` 的全部成员转移到本组（所有权转移，不复制）。
    pub fn merge(&self, other: &RequestGroup) {
        if std::ptr::eq(self, other) {
            return;
        }
        let moved = {
            let mut state = other.state.lock();
            state.cursor = 0;
            std::mem::take(&mut state.members)
        };
        if moved.is_empty() {
            return;
        }
        for member in &moved {
            member.set_group_wakeup(Arc::clone(&self.wakeup));
        }
        self.state.lock().members.extend(moved);
        // 转入成员可能已有待取条目。
        self.wakeup.notify_waiters();
    }

    /// 放弃组内全部成员（逐个走连接级放弃，含线缆通知）。
    pub async fn abandon_all(&self, conn: &Connection) {
        let members = std::mem::take(&mut self.state.lock().members);
        for member in members {
            conn.core().abandon_request(member.id(), None, true).await;
        }
    }

    /// 当前成员数。
    pub fn len(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().members.is_empty()
    }

    fn remove_member(&self, id: MessageId) {
        self.state
            .lock()
            .members
            .retain(|member| member.id() != id);
    }
}
