use crate::envelope::{Envelope, MessageId};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use tokio::io::AsyncRead;

/// 认证响应的结果分类，用于连接层决定写锁与绑定状态的去向。
///
/// - `InProgress`：多轮认证（如多步 SASL）的中间结果，写锁继续保持；
/// - `Success`：最终成功，连接提交新的绑定状态并释放写锁；
/// - `Failure`：最终失败，仅释放写锁。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    InProgress,
    Success,
    Failure,
}

/// 帧编解码器契约：引擎与 BER/ASN.1 协作方之间的唯一边界。
///
/// # 设计背景（Why）
/// - 引擎的读者循环按“标识 → 长度 → 报文体”三步从字节流直接取帧，
///   不假设任何缓冲边界；把三步拆成独立方法，既对应线缆语法的阶段性，
///   也允许实现方对“报文体迟迟不到”的场景单独施加 stall 约束。
/// - 分类钩子（终结性、主动停机通知、免收尾请求、认证结果）是引擎
///   读取报文语义的全部窗口；除此之外引擎不解释任何报文内容。
///
/// # 契约说明（What）
/// - **前置条件**：`decode_*` 三步必须按顺序对同一帧调用；引擎的单读者
///   循环保证不会并发解码两帧；
/// - **后置条件**：`encode` 输出的字节序列必须能被同一实现的 `decode_*`
///   还原（引擎不做校验，纯属实现方义务）；
/// - `abandon_request` / `unbind_request` 是引擎自身需要发出的两种管理
///   报文，由实现方代为构造，引擎不掌握其语法。
///
/// # 风险与考量（Trade-offs）
/// - 三步解码意味着编解码器不能在内部预读超过当前帧的字节，否则会
///   吞掉下一帧的前缀；实现方如需缓冲，必须以帧为边界。
#[async_trait]
pub trait FrameCodec: Send + Sync + 'static {
    /// 从流中解码一帧的标识部分，返回（操作标签, 关联 id）。
    ///
    /// 该调用允许在空闲连接上无限期挂起；引擎只对后续的长度与报文体
    /// 施加 stall 上界。
    async fn decode_identifier(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<(u8, MessageId)>;

    /// 解码帧长度。
    async fn decode_length(&self, stream: &mut (dyn AsyncRead + Send + Unpin))
    -> io::Result<usize>;

    /// 按 `length` 读出报文体并组装信封。
    async fn decode_body(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        tag: u8,
        message_id: MessageId,
        length: usize,
    ) -> io::Result<Envelope>;

    /// 把出站信封序列化为线缆字节。
    fn encode(&self, envelope: &Envelope) -> Bytes;

    /// 该响应是否终结其请求（相对于搜索条目等中间响应）。
    fn is_terminal(&self, envelope: &Envelope) -> bool;

    /// 该信封是否为众所周知的“服务器即将停机”主动通知。
    fn is_unsolicited_shutdown(&self, envelope: &Envelope) -> bool;

    /// 该请求是否不会收到响应（abandon / unbind 类），从而不应启动
    /// 截止计时器。
    fn is_fire_and_forget(&self, envelope: &Envelope) -> bool;

    /// 若信封是认证响应，给出其结果分类；否则返回 `None`。
    fn auth_outcome(&self, envelope: &Envelope) -> Option<AuthOutcome>;

    /// 构造针对 `target` 的 abandon 请求，使用引擎新分配的 `message_id`。
    fn abandon_request(&self, message_id: MessageId, target: MessageId) -> Envelope;

    /// 构造 unbind 请求，供连接关闭时尽力而为地通知服务器。
    fn unbind_request(&self, message_id: MessageId) -> Envelope;
}
