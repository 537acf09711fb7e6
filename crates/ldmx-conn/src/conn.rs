use crate::lock::{LockOwner, WriteLock};
use crate::pending::PendingRequest;
use crate::reader::{ReaderStatus, StopRule, run_reader};
use crate::transport::Transport;
use dashmap::DashMap;
use ldmx_core::{
    AuthOutcome, BindState, ConnectionConfig, Dialer, Envelope, EngineError, FrameCodec,
    ListenerId, MessageId, TlsUpgrader, UnsolicitedListener,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_rustls::client::TlsStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// 认证交换期间传递给 put_reply 的上下文别名（内部使用）。
pub(crate) use crate::pending::AuthContext;

/// 连接内部共享状态。`Connection` 是它的轻量句柄；读者任务、在途请求
/// 与计时器各自持有 `Arc`/`Weak` 引用。
pub(crate) struct ConnectionCore {
    pub(crate) codec: Arc<dyn FrameCodec>,
    pub(crate) config: ConnectionConfig,
    dialer: Arc<dyn Dialer>,
    endpoint: Mutex<Option<(String, u16)>>,
    pub(crate) write_lock: WriteLock,
    writer: AsyncMutex<Option<WriteHalf<Transport>>>,
    pub(crate) hosted: DashMap<MessageId, Arc<PendingRequest>>,
    bind_state: Mutex<BindState>,
    pub(crate) bind_active: AtomicBool,
    pub(crate) stop_tx: watch::Sender<StopRule>,
    pub(crate) status_tx: watch::Sender<ReaderStatus>,
    reader_handle: AsyncMutex<Option<JoinHandle<crate::reader::ReaderExit>>>,
    listeners: Mutex<HashMap<ListenerId, Arc<dyn UnsolicitedListener>>>,
    listener_seq: AtomicU64,
    next_id: AtomicI32,
    pub(crate) server_shutdown_seen: AtomicBool,
    shutting_down: AtomicBool,
    connected: AtomicBool,
    secure: AtomicBool,
    pub(crate) dropped_replies: AtomicU64,
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("endpoint", &*self.endpoint.lock())
            .field("connected", &self.connected.load(Ordering::Acquire))
            .field("hosted", &self.hosted.len())
            .finish_non_exhaustive()
    }
}

/// 面向目录访问协议的客户端连接：唯一的套接字属主。
///
/// # 设计动机（Why）
/// - **单读者**：一条连接上任意数量的逻辑请求并发在途，入站帧只能由
///   唯一的后台读者顺序解码并按关联 id 路由，否则既无法保证逐请求的
///   有序投递，也无法保证跨请求的线缆相对顺序；
/// - **计数写锁**：出站帧必须整帧互斥；多步认证还要求同一逻辑持有者
///   连续多写不放锁（见 [`LockOwner`]）；
/// - **中途换壳**：STARTTLS 在不丢任何已排队回复的前提下暂停读者、
///   替换底层流、重启读者。
///
/// # 状态机（Lifecycle）
/// - 创建即断开；[`connect`](Connection::connect) 建立套接字并启动读者；
/// - [`shutdown`](Connection::shutdown)（调用方断开、读者检测到致命
///   故障、服务器停机）排空所有在途请求、尽力发送 unbind、关闭套接字、
///   汇合读者，之后可以重新 `connect`；
/// - 连接对调用方要么完全连通（读写流俱在）、要么完全断开——不存在
///   可观察的半开状态。
///
/// # 并发契约（What）
/// - 所有方法可从任意任务并发调用；
/// - `shutdown` 幂等，且从读者任务内部触发时自动跳过自我汇合，
///   永不死锁；
/// - 迟到回复（请求已完成/已放弃/未知 id）静默丢弃并计入
///   [`dropped_replies`](Connection::dropped_replies)。
#[derive(Clone, Debug)]
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    /// 以注入的编解码器、拨号器与配置构造一条未连接的连接。
    pub fn new(
        codec: Arc<dyn FrameCodec>,
        dialer: Arc<dyn Dialer>,
        config: ConnectionConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(StopRule::None);
        let (status_tx, _) = watch::channel(ReaderStatus::Idle);
        Self {
            core: Arc::new(ConnectionCore {
                codec,
                config,
                dialer,
                endpoint: Mutex::new(None),
                write_lock: WriteLock::default(),
                writer: AsyncMutex::new(None),
                hosted: DashMap::new(),
                bind_state: Mutex::new(BindState::Anonymous),
                bind_active: AtomicBool::new(false),
                stop_tx,
                status_tx,
                reader_handle: AsyncMutex::new(None),
                listeners: Mutex::new(HashMap::new()),
                listener_seq: AtomicU64::new(1),
                next_id: AtomicI32::new(1),
                server_shutdown_seen: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                secure: AtomicBool::new(false),
                dropped_replies: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    /// 建立套接字并启动唯一的后台读者；读者发出“运行中”信号后返回。
    ///
    /// 整个建立过程在 `lock_owner` 名下持有写锁，调用方据此可以把
    /// connect 与随后的绑定序列化为一个独占区间。已连接时幂等返回。
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        lock_owner: LockOwner,
    ) -> Result<(), EngineError> {
        self.core.write_lock.acquire(lock_owner).await;
        let result = self.core.connect_inner(host, port).await;
        self.core.write_lock.release(lock_owner);
        result
    }

    /// 在写锁保护下序列化并刷新一条出站信封。
    ///
    /// 锁持有者为信封自身的关联 id；认证交换应通过
    /// [`RequestGroup::send`](crate::RequestGroup::send) 走保留的绑定
    /// 持有者。失败返回 [`EngineError::Communication`]，其中
    /// `after_server_shutdown` 区分“服务器宣告停机之后的故障”。
    pub async fn write(&self, envelope: &Envelope) -> Result<(), EngineError> {
        self.core
            .write_envelope(envelope, LockOwner::request(envelope.message_id), false)
            .await
    }

    /// 放弃指定请求：移除并唤醒其等待者，尽力把 abandon 报文送上线缆，
    /// 释放该请求名下的写锁。
    pub async fn abandon(&self, id: MessageId) {
        self.core.abandon_request(id, None, true).await;
    }

    /// 幂等关闭：排空所有在途请求（向每名等待者投递 `fault`，若提供）、
    /// 尽力发送 unbind、关闭套接字并汇合读者。
    ///
    /// 从读者任务内部触发的关闭走独立入口，绝不自我汇合。
    pub async fn shutdown(&self, fault: Option<EngineError>) {
        self.core.shutdown_inner(fault, false).await;
    }

    /// 告知读者在投递完关联 id 为 `id` 的帧后暂停。
    ///
    /// STARTTLS 协商的一部分：必须在目标响应可能到达**之前**（即发送
    /// STARTTLS 请求之前）设置。
    pub fn pause_reader_after(&self, id: MessageId) {
        self.core.stop_tx.send_replace(StopRule::AfterId(id));
    }

    /// 把已暂停的连接升级为 TLS。
    ///
    /// 前置条件：写锁由调用方持有、没有带未读回复的在途请求、读者已被
    /// [`pause_reader_after`](Self::pause_reader_after) 告知暂停。握手
    /// 失败时套接字已不可恢复（处于未知协议状态），连接转为断开并返回
    /// [`EngineError::TlsNegotiation`]。
    pub async fn start_tls(&self, upgrader: &dyn TlsUpgrader) -> Result<(), EngineError> {
        let core = &self.core;
        for entry in core.hosted.iter() {
            if !entry.value().queue_is_empty() {
                return Err(EngineError::TlsNegotiation {
                    detail: format!(
                        "request {} still has {} undrained replies",
                        entry.key(),
                        entry.value().queued_replies()
                    ),
                });
            }
        }
        let transport = core.take_transport().await?;
        let (host, port) = core.endpoint_parts();
        match transport {
            Transport::Plain(tcp) => match upgrader.upgrade(tcp, &host).await {
                Ok(tls) => {
                    core.install_transport(Transport::Tls(Box::new(tls))).await;
                    debug!(target: "ldmx::conn", %host, port, "connection upgraded to TLS");
                    Ok(())
                }
                Err(err) => {
                    // 握手把套接字一并消耗；此处只能如实转为断开。
                    core.connected.store(false, Ordering::Release);
                    core.status_tx.send_replace(ReaderStatus::Stopped);
                    warn!(target: "ldmx::conn", %host, port, error = %err, "TLS upgrade failed");
                    Err(EngineError::TlsNegotiation {
                        detail: format!("handshake with {host}:{port} failed: {err}"),
                    })
                }
            },
            secured @ Transport::Tls(_) => {
                core.install_transport(secured).await;
                Err(EngineError::TlsNegotiation {
                    detail: "connection is already secured".into(),
                })
            }
        }
    }

    /// 把 TLS 连接降级回明文：设置绝对停止哨兵、汇合读者、有序终结
    /// TLS 会话后还原底层套接字、重启读者。
    ///
    /// 降级与服务端的对应动作必须并发执行：双方各自发送 close_notify
    /// 并读到对端的 close_notify 才会剥离外壳。
    pub async fn stop_tls(&self) -> Result<(), EngineError> {
        let core = &self.core;
        core.stop_tx.send_replace(StopRule::Now);
        let transport = core.take_transport().await?;
        match transport {
            Transport::Tls(tls) => match core.quiesce_tls(*tls).await {
                Ok(tcp) => {
                    core.install_transport(Transport::Plain(tcp)).await;
                    debug!(target: "ldmx::conn", "connection downgraded to plaintext");
                    Ok(())
                }
                Err(err) => {
                    // 会话终结半途而废，线缆状态不可知，连接如实转为断开。
                    core.connected.store(false, Ordering::Release);
                    core.secure.store(false, Ordering::Release);
                    core.status_tx.send_replace(ReaderStatus::Stopped);
                    warn!(target: "ldmx::conn", error = %err, "TLS downgrade failed");
                    Err(EngineError::TlsNegotiation {
                        detail: format!("session teardown failed: {err}"),
                    })
                }
            },
            plain @ Transport::Plain(_) => {
                core.install_transport(plain).await;
                Err(EngineError::TlsNegotiation {
                    detail: "connection is not secured".into(),
                })
            }
        }
    }

    /// 注册主动通知监听器，返回注销句柄。
    pub fn register_unsolicited_listener(
        &self,
        listener: Arc<dyn UnsolicitedListener>,
    ) -> ListenerId {
        let id = ListenerId(self.core.listener_seq.fetch_add(1, Ordering::AcqRel));
        self.core.listeners.lock().insert(id, listener);
        id
    }

    /// 注销监听器；返回是否确有该监听器。
    pub fn deregister_unsolicited_listener(&self, id: ListenerId) -> bool {
        self.core.listeners.lock().remove(&id).is_some()
    }

    /// 分配下一个关联 id。
    pub fn next_message_id(&self) -> MessageId {
        self.core.allocate_id()
    }

    pub fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::Acquire)
    }

    /// 当前是否处于 TLS 形态。
    pub fn is_secure(&self) -> bool {
        self.core.secure.load(Ordering::Acquire)
    }

    /// 当前连接级绑定状态。
    pub fn bind_state(&self) -> BindState {
        self.core.bind_state.lock().clone()
    }

    /// 因未知/已放弃关联 id 而被静默丢弃的回复计数。
    pub fn dropped_replies(&self) -> u64 {
        self.core.dropped_replies.load(Ordering::Acquire)
    }

    /// 当前在途请求数（诊断用）。
    pub fn outstanding_requests(&self) -> usize {
        self.core.hosted.len()
    }
}

impl ConnectionCore {
    pub(crate) fn allocate_id(&self) -> MessageId {
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::AcqRel);
            if raw > 0 {
                return MessageId(raw);
            }
            // 回绕进非正区间：0 保留给主动通知，负值与写锁的绑定持有者
            // 哨兵冲突；把计数器拉回 1 后重试（CAS 失败说明别的任务已
            // 推进，直接再取号即可）。
            let _ = self.next_id.compare_exchange(
                raw.wrapping_add(1),
                1,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    pub(crate) fn endpoint_parts(&self) -> (String, u16) {
        self.endpoint
            .lock()
            .clone()
            .unwrap_or_else(|| (String::new(), 0))
    }

    async fn connect_inner(self: &Arc<Self>, host: &str, port: u16) -> Result<(), EngineError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let stream = self
            .dialer
            .dial(host, port)
            .await
            .map_err(|err| EngineError::connect(host, port, &err))?;
        *self.endpoint.lock() = Some((host.to_owned(), port));
        self.server_shutdown_seen.store(false, Ordering::Release);
        self.shutting_down.store(false, Ordering::Release);
        self.dropped_replies.store(0, Ordering::Release);
        self.install_transport(Transport::Plain(stream)).await;
        self.connected.store(true, Ordering::Release);
        debug!(target: "ldmx::conn", %host, port, "connection established");
        Ok(())
    }

    /// 安装（或重新安装）底层流：拆分读写半部、复位哨兵、启动读者并
    /// 等待其“运行中”信号。唯一的读者启动入口，保证读者单例。
    pub(crate) async fn install_transport(self: &Arc<Self>, transport: Transport) {
        self.secure.store(transport.is_secure(), Ordering::Release);
        let (read_half, write_half) = tokio::io::split(transport);
        *self.writer.lock().await = Some(write_half);
        self.stop_tx.send_replace(StopRule::None);
        self.status_tx.send_replace(ReaderStatus::Idle);
        let mut status_rx = self.status_tx.subscribe();
        let handle = tokio::spawn(run_reader(
            Arc::clone(self),
            read_half,
            self.stop_tx.subscribe(),
        ));
        *self.reader_handle.lock().await = Some(handle);
        // 等待读者离开 Idle。就绪判据不能是“看到 Running”：立即故障的
        // 读者可能在本任务观察之前就推进到 Stopped，而 watch 只保留最新
        // 值；任何离开 Idle 的状态都证明读者已启动过。
        let _ = status_rx
            .wait_for(|status| !matches!(status, ReaderStatus::Idle))
            .await;
    }

    /// 汇合已暂停的读者并把读写半部重新合并为完整流，供 TLS 升级/降级
    /// 换壳。读者若因故障退场（无读半部可交还），返回协商错误。
    async fn take_transport(&self) -> Result<Transport, EngineError> {
        let handle = self.reader_handle.lock().await.take();
        let Some(handle) = handle else {
            return Err(EngineError::TlsNegotiation {
                detail: "reader is not running".into(),
            });
        };
        let exit = handle.await.map_err(|err| EngineError::TlsNegotiation {
            detail: format!("reader join failed: {err}"),
        })?;
        let Some(read_half) = exit.read_half else {
            return Err(EngineError::TlsNegotiation {
                detail: "reader terminated on a connection fault".into(),
            });
        };
        let write_half = self.writer.lock().await.take();
        let Some(write_half) = write_half else {
            return Err(EngineError::TlsNegotiation {
                detail: "write stream is gone".into(),
            });
        };
        Ok(Self::reunite(read_half, write_half))
    }

    fn reunite(read_half: ReadHalf<Transport>, write_half: WriteHalf<Transport>) -> Transport {
        // 读写半部来自同一次 split，unsplit 不会 panic。
        read_half.unsplit(write_half)
    }

    /// 有序终结 TLS 会话并取回明文套接字。
    ///
    /// 直接 `into_inner` 会把尚未被会话消费的 TLS 记录（典型如 TLS 1.3
    /// 的会话票据）留在字节流上，重启后的明文读者会把它们当作帧头解码。
    /// 因此先发送 close_notify，再读到对端的 close_notify——此刻线缆上
    /// 到本端为止的全部 TLS 记录都已被会话消费，套接字干净。读到的若是
    /// 应用数据，说明“换壳时线缆静默”的协议契约被破坏，按错误处理。
    async fn quiesce_tls(&self, mut tls: TlsStream<TcpStream>) -> io::Result<TcpStream> {
        let (_, session) = tls.get_mut();
        session.send_close_notify();
        tls.flush().await?;

        let mut scratch = [0u8; 256];
        let drain = async {
            match tls.read(&mut scratch).await? {
                0 => Ok(()),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected data while closing TLS session",
                )),
            }
        };
        match self.config.socket_timeout {
            Some(limit) => tokio::time::timeout(limit, drain)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer close_notify stalled"))??,
            None => drain.await?,
        }

        let (tcp, _session) = tls.into_inner();
        Ok(tcp)
    }

    /// 在 `owner` 名下序列化并刷新一条信封。
    ///
    /// `retain == true`（认证写入）时成功后继续持锁，由读者在最终认证
    /// 结果上释放；失败路径总是清空该持有者的全部计数。
    pub(crate) async fn write_envelope(
        &self,
        envelope: &Envelope,
        owner: LockOwner,
        retain: bool,
    ) -> Result<(), EngineError> {
        self.write_lock.acquire(owner).await;
        let result = self.write_flush(envelope).await;
        match &result {
            Ok(()) if retain => {}
            Ok(()) => self.write_lock.release(owner),
            Err(_) => {
                self.write_lock.force_release(owner);
            }
        }
        result
    }

    async fn write_flush(&self, envelope: &Envelope) -> Result<(), EngineError> {
        let bytes = self.codec.encode(envelope);
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(EngineError::Communication {
                kind: io::ErrorKind::NotConnected,
                detail: "connection is closed".into(),
                after_server_shutdown: self.server_shutdown_seen.load(Ordering::Acquire),
            });
        };
        let io_op = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        let outcome = match self.config.socket_timeout {
            Some(limit) => match tokio::time::timeout(limit, io_op).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write stalled")),
            },
            None => io_op.await,
        };
        outcome.map_err(|err| {
            EngineError::communication(&err, self.server_shutdown_seen.load(Ordering::Acquire))
        })
    }

    /// 移除并放弃一个在途请求；`wire == true` 时尽力把 abandon 报文送上
    /// 线缆（失败仅记录，不上抛）。超时计时器与调用方放弃共用此入口，
    /// DashMap 的移除保证二者至多一方生效。
    pub(crate) async fn abandon_request(
        &self,
        id: MessageId,
        fault: Option<EngineError>,
        wire: bool,
    ) {
        let Some((_, pending)) = self.hosted.remove(&id) else {
            return;
        };
        pending.abandon_local(fault);
        if wire && self.connected.load(Ordering::Acquire) {
            let envelope = self.codec.abandon_request(self.allocate_id(), id);
            let owner = LockOwner::request(envelope.message_id);
            if let Err(err) = self.write_envelope(&envelope, owner, false).await {
                debug!(target: "ldmx::conn", %id, error = %err, "best-effort abandon write failed");
            }
        }
    }

    /// 认证交换的连接级收尾，由读者在终结认证响应上调用。
    ///
    /// - 中间结果：写锁与交换标志保持原状；
    /// - 最终成功：提交绑定状态，随后释放写锁；
    /// - 最终失败（或编解码器无法分类）：仅释放写锁。
    pub(crate) fn finalize_auth(&self, auth: &AuthContext, outcome: Option<AuthOutcome>) {
        match outcome {
            Some(AuthOutcome::InProgress) => {}
            Some(AuthOutcome::Success) => {
                *self.bind_state.lock() = BindState::Bound(auth.descriptor.clone());
                self.write_lock.force_release(LockOwner::BIND);
                self.bind_active.store(false, Ordering::Release);
                debug!(
                    target: "ldmx::conn",
                    principal = %auth.descriptor.principal,
                    "bind state committed"
                );
            }
            Some(AuthOutcome::Failure) | None => {
                self.write_lock.force_release(LockOwner::BIND);
                self.bind_active.store(false, Ordering::Release);
            }
        }
    }

    /// 读者专用：把一条已解码信封路由给在途请求或主动通知路径。
    /// 同步执行，保证读者循环严格顺序处理线缆。
    pub(crate) fn route_envelope(self: &Arc<Self>, envelope: Envelope) {
        let id = envelope.message_id;
        let pending = self.hosted.get(&id).map(|entry| Arc::clone(entry.value()));
        if let Some(pending) = pending {
            match pending.put_reply(envelope) {
                crate::pending::PutOutcome::Dropped => {
                    self.dropped_replies.fetch_add(1, Ordering::AcqRel);
                    trace!(target: "ldmx::conn", %id, "late reply dropped");
                }
                crate::pending::PutOutcome::DeliveredTerminal => {
                    trace!(target: "ldmx::conn", %id, "terminal reply delivered");
                }
                crate::pending::PutOutcome::Delivered => {}
            }
        } else if id == MessageId::UNSOLICITED {
            if self.codec.is_unsolicited_shutdown(&envelope) {
                self.server_shutdown_seen.store(true, Ordering::Release);
                let (host, port) = self.endpoint_parts();
                warn!(target: "ldmx::conn", %host, port, "server announced shutdown");
            }
            let listeners: Vec<Arc<dyn UnsolicitedListener>> =
                self.listeners.lock().values().cloned().collect();
            // 每名监听器一个短生命周期任务：缓慢的应用处理器不拖读者。
            // 投递为 fire-and-forget，关闭不等待在途投递。
            for listener in listeners {
                let notice = envelope.clone();
                tokio::spawn(async move {
                    listener.on_notice(notice).await;
                });
            }
        } else {
            self.dropped_replies.fetch_add(1, Ordering::AcqRel);
            trace!(target: "ldmx::conn", %id, "reply for unknown id dropped");
        }
    }

    /// 关闭的唯一实现。`from_reader` 标记调用源自读者任务本身：
    /// 跳过自我汇合，句柄直接丢弃。
    pub(crate) async fn shutdown_inner(&self, fault: Option<EngineError>, from_reader: bool) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            // 已有关闭在进行；外部调用方等读者退场即可。
            if !from_reader {
                let handle = self.reader_handle.lock().await.take();
                if let Some(handle) = handle {
                    let _ = handle.await;
                }
            }
            return;
        }
        let (host, port) = self.endpoint_parts();
        debug!(
            target: "ldmx::conn",
            %host,
            port,
            outstanding = self.hosted.len(),
            from_reader,
            "shutting down connection"
        );

        // 排空：每名等待者以显式故障（或静默终结）醒来。
        let ids: Vec<MessageId> = self.hosted.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.hosted.remove(&id) {
                pending.abandon_local(fault.clone());
            }
        }
        self.bind_active.store(false, Ordering::Release);

        // 尽力而为的 unbind；失败只记录。
        let was_bound = self.bind_state.lock().is_bound();
        if was_bound {
            let envelope = self.codec.unbind_request(self.allocate_id());
            let owner = LockOwner::request(envelope.message_id);
            if let Err(err) = self.write_envelope(&envelope, owner, false).await {
                debug!(target: "ldmx::conn", error = %err, "best-effort unbind write failed");
            }
        }
        *self.bind_state.lock() = BindState::Anonymous;

        // 停止读者、丢弃写半部；读半部随读者退场一并释放。
        self.stop_tx.send_replace(StopRule::Now);
        {
            let mut writer = self.writer.lock().await;
            if let Some(write_half) = writer.as_mut() {
                let _ = write_half.shutdown().await;
            }
            *writer = None;
        }
        self.connected.store(false, Ordering::Release);
        self.secure.store(false, Ordering::Release);

        let handle = self.reader_handle.lock().await.take();
        if from_reader {
            drop(handle);
        } else if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!(target: "ldmx::conn", %host, port, "connection shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldmx_core::TcpDialer;
    use ldmx_testkit::TlvCodec;

    fn detached_connection() -> Connection {
        Connection::new(
            Arc::new(TlvCodec::new()),
            Arc::new(TcpDialer::default()),
            ConnectionConfig::default(),
        )
    }

    #[test]
    fn id_wraparound_skips_reserved_and_negative_values() {
        let conn = detached_connection();
        conn.core.next_id.store(i32::MAX, Ordering::Release);

        assert_eq!(conn.next_message_id(), MessageId(i32::MAX));
        // 回绕后不得出现 0（主动通知保留值）或负数（与绑定持有者哨兵
        // 冲突），而是回到正区间重新取号。
        let wrapped = conn.next_message_id();
        assert_eq!(wrapped, MessageId(1));
        assert_eq!(conn.next_message_id(), MessageId(2));
    }
}
