use crate::conn::ConnectionCore;
use crate::lock::LockOwner;
use crate::queue::{ReplyItem, ReplyQueue};
use ldmx_core::{AuthDescriptor, ConnectionConfig, Envelope, EngineError, MessageId};
use parking_lot::Mutex;
use std::io;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// 认证交换的阶段：首轮（独占绑定交换）或多轮机制的后续轮次。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthPhase {
    Initial,
    Continuation,
}

/// 认证类请求携带的上下文：声明的身份与所处阶段。
#[derive(Clone, Debug)]
pub(crate) struct AuthContext {
    pub(crate) descriptor: AuthDescriptor,
    pub(crate) phase: AuthPhase,
}

/// 发送一个请求时的可选项。
///
/// 截止时长默认为连接配置的 `response_deadline`，可逐请求覆盖为
/// 明确时长或明确无界；认证类请求通过 [`bind`](Self::bind) /
/// [`bind_continuation`](Self::bind_continuation) 声明。
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    deadline: DeadlineRule,
    pub(crate) auth: Option<(AuthDescriptor, AuthPhase)>,
}

#[derive(Clone, Copy, Debug, Default)]
enum DeadlineRule {
    #[default]
    Default,
    Unbounded,
    After(Duration),
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 覆盖该请求的截止时长。
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = DeadlineRule::After(deadline);
        self
    }

    /// 明确声明该请求无截止时长。
    pub fn no_deadline(mut self) -> Self {
        self.deadline = DeadlineRule::Unbounded;
        self
    }

    /// 标记该请求为认证交换的首轮；成功的最终响应将把 `descriptor`
    /// 提交为连接级绑定状态。
    pub fn bind(mut self, descriptor: AuthDescriptor) -> Self {
        self.auth = Some((descriptor, AuthPhase::Initial));
        self
    }

    /// 标记该请求为进行中认证交换的后续轮次（多轮 SASL）。
    pub fn bind_continuation(mut self, descriptor: AuthDescriptor) -> Self {
        self.auth = Some((descriptor, AuthPhase::Continuation));
        self
    }

    pub(crate) fn effective_deadline(&self, config: &ConnectionConfig) -> Option<Duration> {
        match self.deadline {
            DeadlineRule::Default => config.response_deadline,
            DeadlineRule::Unbounded => None,
            DeadlineRule::After(deadline) => Some(deadline),
        }
    }
}

/// 从在途请求取走一项时的结果。
pub(crate) enum Take {
    Item(ReplyItem),
    Empty,
    Finished,
}

#[derive(Debug, Default)]
struct RequestState {
    completed: bool,
    accepting: bool,
    timer: Option<JoinHandle<()>>,
}

/// 一个在途请求的完整簿记：发出的信封、回复队列、完成/接收标志、
/// 可选截止计时器与认证上下文。
///
/// # 设计背景（Why）
/// - 读者循环与任意数量的调用方任务并发触碰同一请求：读者投递回复、
///   调用方读取或放弃、计时器到期注入超时——所有状态翻转集中在一把
///   短临界区互斥锁下，保证“完成后不再入队”“放弃后静默丢弃”这两条
///   不变量在竞态下仍然成立。
///
/// # 生命周期（Lifecycle）
/// - 随 `RequestGroup::send` 创建并同时登记进连接的在途表与请求组；
/// - 由读者（逐帧投递）与属主调用方（读取/放弃）并发推进；
/// - **排空后移除**：只有当请求已完成（或不再接收）且队列耗尽时，
///   才从连接的在途表摘除——绝不丢失已排队的回复。
///
/// # 契约说明（What）
/// - `completed` 置位后不再有回复入队；
/// - `accepting == false` 时连接层对迟到回复静默丢弃并计数，而非报错；
/// - 截止计时器与正常完成之间无竞态：两者都在状态锁下翻转标志并
///   取消对方。
#[derive(Debug)]
pub struct PendingRequest {
    request: Envelope,
    deadline: Option<Duration>,
    auth: Option<AuthContext>,
    conn: Weak<ConnectionCore>,
    queue: ReplyQueue,
    state: Mutex<RequestState>,
    sent: AtomicBool,
    group_wakeup: Mutex<std::sync::Arc<Notify>>,
}

pub(crate) enum PutOutcome {
    Delivered,
    DeliveredTerminal,
    Dropped,
}

impl PendingRequest {
    pub(crate) fn new(
        request: Envelope,
        deadline: Option<Duration>,
        auth: Option<(AuthDescriptor, AuthPhase)>,
        conn: Weak<ConnectionCore>,
        group_wakeup: std::sync::Arc<Notify>,
    ) -> Self {
        Self {
            request,
            deadline,
            auth: auth.map(|(descriptor, phase)| AuthContext { descriptor, phase }),
            conn,
            queue: ReplyQueue::default(),
            state: Mutex::new(RequestState {
                completed: false,
                accepting: true,
                timer: None,
            }),
            sent: AtomicBool::new(false),
            group_wakeup: Mutex::new(group_wakeup),
        }
    }

    /// 该请求的关联 id。
    pub fn id(&self) -> MessageId {
        self.request.message_id
    }

    /// 发出的信封（保留作上下文）。
    pub fn request(&self) -> &Envelope {
        &self.request
    }

    /// 请求是否已收到终结响应。
    pub fn is_complete(&self) -> bool {
        self.state.lock().completed
    }

    pub(crate) fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn queued_replies(&self) -> usize {
        self.queue.len()
    }

    fn lock_owner(&self) -> LockOwner {
        if self.auth.is_some() {
            LockOwner::BIND
        } else {
            LockOwner::request(self.id())
        }
    }

    fn closed_error() -> EngineError {
        EngineError::Communication {
            kind: io::ErrorKind::NotConnected,
            detail: "connection is closed".into(),
            after_server_shutdown: false,
        }
    }

    /// 把请求写上线缆并按需启动截止计时器。每实例至多执行一次。
    ///
    /// - 认证类请求以保留的绑定持有者取锁且写后**不释放**——锁由读者
    ///   在最终认证结果上释放，或由放弃路径强制释放；
    /// - abandon/unbind 类请求不会有响应，不启动计时器。
    pub(crate) async fn send(self: &std::sync::Arc<Self>) -> Result<(), EngineError> {
        if self.sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(core) = self.conn.upgrade() else {
            return Err(Self::closed_error());
        };

        if let Some(auth) = &self.auth {
            match auth.phase {
                AuthPhase::Initial => {
                    if core
                        .bind_active
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Err(EngineError::BindInFlight);
                    }
                }
                AuthPhase::Continuation => {
                    // 后续轮次沿用已在途的交换；标志保持置位。
                    core.bind_active.store(true, Ordering::Release);
                }
            }
        }

        let retain = self.auth.is_some();
        if let Err(err) = core
            .write_envelope(&self.request, self.lock_owner(), retain)
            .await
        {
            if self.auth.is_some() {
                // 任一轮次的认证写失败都终结本次交换：写锁已在失败路径
                // 被强制释放，交换标志必须同步清零，否则后续的初始绑定
                // 会被一个已不存在的交换挡住。
                core.bind_active.store(false, Ordering::Release);
            }
            return Err(err);
        }

        if let Some(deadline) = self.deadline {
            if !core.codec.is_fire_and_forget(&self.request) {
                let conn = self.conn.clone();
                let id = self.id();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    if let Some(core) = conn.upgrade() {
                        core.abandon_request(
                            id,
                            Some(EngineError::Timeout {
                                id,
                                elapsed: deadline,
                            }),
                            true,
                        )
                        .await;
                    }
                });
                let mut state = self.state.lock();
                if state.completed || !state.accepting {
                    // 回复抢先于计时器安装到达。
                    handle.abort();
                } else {
                    state.timer = Some(handle);
                }
            }
        }
        Ok(())
    }

    /// 读者专用：投递一条入站回复。
    ///
    /// 终结响应会置位完成标志、取消计时器，并在认证请求上完成连接级
    /// 收尾（释放写锁、成功时提交绑定状态）；标志翻转与入队在同一临界
    /// 区内完成，放弃之后不可能再有条目入队。
    pub(crate) fn put_reply(&self, envelope: Envelope) -> PutOutcome {
        let Some(core) = self.conn.upgrade() else {
            return PutOutcome::Dropped;
        };
        let terminal = core.codec.is_terminal(&envelope);
        let auth_outcome = if terminal && self.auth.is_some() {
            core.codec.auth_outcome(&envelope)
        } else {
            None
        };

        {
            let mut state = self.state.lock();
            if state.completed || !state.accepting {
                return PutOutcome::Dropped;
            }
            if terminal {
                state.completed = true;
                state.accepting = false;
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
            }
            self.queue.push_reply(envelope);
        }

        if terminal {
            if let Some(auth) = &self.auth {
                core.finalize_auth(auth, auth_outcome);
            }
        }
        self.group_wakeup.lock().notify_waiters();
        if terminal {
            PutOutcome::DeliveredTerminal
        } else {
            PutOutcome::Delivered
        }
    }

    /// 本地放弃：标记不再接收、取消计时器，必要时释放写锁并注入合成
    /// 故障，唤醒所有等待者。幂等；可与读者投递终结回复并发调用。
    pub(crate) fn abandon_local(&self, fault: Option<EngineError>) {
        let (was_completed, was_accepting) = {
            let mut state = self.state.lock();
            let snapshot = (state.completed, state.accepting);
            state.accepting = false;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if !snapshot.0 && snapshot.1 {
                if let Some(fault) = fault {
                    self.queue.push_fault(fault);
                }
            }
            snapshot
        };

        if !was_completed && was_accepting {
            if let Some(core) = self.conn.upgrade() {
                core.write_lock.force_release(self.lock_owner());
                if self.auth.is_some() {
                    core.bind_active.store(false, Ordering::Release);
                }
            }
        }
        self.queue.wake_all();
        self.group_wakeup.lock().notify_waiters();
    }

    /// 取走一项（若有）；当请求终结且排空时顺带从连接在途表摘除。
    pub(crate) fn take_item(&self) -> Take {
        if let Some(item) = self.queue.try_pop() {
            self.maybe_unhost();
            Take::Item(item)
        } else if self.is_done() {
            self.maybe_unhost();
            Take::Finished
        } else {
            Take::Empty
        }
    }

    fn is_done(&self) -> bool {
        let state = self.state.lock();
        state.completed || !state.accepting
    }

    fn maybe_unhost(&self) {
        if self.is_done() && self.queue.is_empty() {
            if let Some(core) = self.conn.upgrade() {
                core.hosted.remove(&self.id());
            }
        }
    }

    /// 阻塞等待下一条回复。
    ///
    /// - `Ok(Some(_))`：正常回复（可能是中间条目，也可能是终结响应）；
    /// - `Ok(None)`：请求已终结且队列耗尽（含被静默放弃的情况）；
    /// - `Err(_)`：排空/超时路径注入的合成故障。
    pub async fn wait_for_reply(&self) -> Result<Option<Envelope>, EngineError> {
        loop {
            let wakeup = self.queue.notified();
            match self.take_item() {
                Take::Item(ReplyItem::Reply(envelope)) => return Ok(Some(envelope)),
                Take::Item(ReplyItem::Fault(fault)) => return Err(fault),
                Take::Finished => return Ok(None),
                Take::Empty => wakeup.await,
            }
        }
    }

    /// 非阻塞读取；`None` 表示当前没有可取的条目。
    pub fn try_reply(&self) -> Option<Result<Envelope, EngineError>> {
        match self.take_item() {
            Take::Item(ReplyItem::Reply(envelope)) => Some(Ok(envelope)),
            Take::Item(ReplyItem::Fault(fault)) => Some(Err(fault)),
            Take::Finished | Take::Empty => None,
        }
    }

    pub(crate) fn set_group_wakeup(&self, wakeup: std::sync::Arc<Notify>) {
        *self.group_wakeup.lock() = wakeup;
    }

    /// 测试辅助：绕过编解码分类，直接把一条非终结回复入队。
    #[cfg(test)]
    pub(crate) fn put_reply_for_test(&self, envelope: Envelope) {
        {
            let state = self.state.lock();
            if state.completed || !state.accepting {
                return;
            }
            self.queue.push_reply(envelope);
        }
        self.group_wakeup.lock().notify_waiters();
    }
}
