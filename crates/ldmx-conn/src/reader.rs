use crate::conn::ConnectionCore;
use crate::transport::Transport;
use ldmx_core::{Envelope, EngineError, FrameCodec, MessageId};
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::ReadHalf;
use tokio::sync::watch;
use tracing::{debug, warn};

/// 读者停止哨兵。
///
/// - `None`：正常运转；
/// - `AfterId(id)`：投递完该关联 id 的帧后暂停（STARTTLS 升级用）；
/// - `Now`：尽快暂停（TLS 降级与关闭用）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopRule {
    None,
    AfterId(MessageId),
    Now,
}

/// 读者生命周期信号，经 watch 通道广播；`connect` 以此等待读者就绪，
/// 取代“睡眠重查”的轮询。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReaderStatus {
    Idle,
    Running,
    Stopped,
}

/// 读者退出时交还的资产：计划内暂停时带回读半部供换壳复用，
/// 故障退场时为空。
pub(crate) struct ReaderExit {
    pub(crate) read_half: Option<ReadHalf<Transport>>,
}

/// 连接的唯一后台读者循环。
///
/// # 执行逻辑（How）
/// 1. 经 [`FrameCodec`] 按“标识 → 长度 → 报文体”从当前流顺序取帧，
///    任意时刻不并发解码两帧；
/// 2. 逐帧交给 [`ConnectionCore::route_envelope`]：命中在途请求则入队
///    （终结响应一并完成收尾），未命中且为保留 id 则走主动通知扇出，
///    否则计数丢弃；
/// 3. 每帧之后核对停止哨兵：`AfterId` 命中或 `Now` 生效即计划内暂停，
///    交还读半部；
/// 4. I/O 故障时：若 `Now` 哨兵已置位则视为预期中断（降级路径），
///    否则构造连接级故障并触发排空式关闭。
///
/// # 并发契约（What）
/// - 暂停等待经由 `select!` 监听哨兵通道完成，无轮询；哨兵在帧间隙
///    之外翻转时会放弃当前未完成的解码尝试，因此升级/降级协议要求
///    届时线缆静默（由调用方契约保证）。
pub(crate) async fn run_reader(
    core: Arc<ConnectionCore>,
    mut read_half: ReadHalf<Transport>,
    mut stop_rx: watch::Receiver<StopRule>,
) -> ReaderExit {
    core.status_tx.send_replace(ReaderStatus::Running);

    let fault: Option<io::Error> = loop {
        if matches!(*stop_rx.borrow_and_update(), StopRule::Now) {
            break None;
        }
        let decoded = tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    // 发送端随连接释放；按立即停止处理。
                    break None;
                }
                continue;
            }
            decoded = read_frame(
                core.codec.as_ref(),
                &mut read_half,
                core.config.socket_timeout,
            ) => decoded,
        };
        match decoded {
            Ok(envelope) => {
                let id = envelope.message_id;
                core.route_envelope(envelope);
                let pause = matches!(*stop_rx.borrow(), StopRule::AfterId(target) if target == id);
                if pause {
                    debug!(target: "ldmx::reader", %id, "reader pausing after sentinel frame");
                    break None;
                }
            }
            Err(err) => {
                if matches!(*stop_rx.borrow(), StopRule::Now) {
                    // 降级/关闭期间的预期中断，不算故障。
                    break None;
                }
                break Some(err);
            }
        }
    };

    match fault {
        None => {
            core.status_tx.send_replace(ReaderStatus::Stopped);
            debug!(target: "ldmx::reader", "reader paused");
            ReaderExit {
                read_half: Some(read_half),
            }
        }
        Some(err) => {
            let (host, port) = core.endpoint_parts();
            let fault = if core.server_shutdown_seen.load(Ordering::Acquire) {
                EngineError::ServerShutdown {
                    host: host.clone(),
                    port,
                }
            } else {
                EngineError::connection_lost(&host, port, err.to_string())
            };
            warn!(
                target: "ldmx::reader",
                %host,
                port,
                error = %err,
                "reader detected connection fault"
            );
            core.status_tx.send_replace(ReaderStatus::Stopped);
            drop(read_half);
            core.shutdown_inner(Some(fault), true).await;
            ReaderExit { read_half: None }
        }
    }
}

/// 从流中读出完整一帧。标识部分允许无限期等待（空闲连接不是错误）；
/// 标识之后的长度与报文体受 `stall` 上界约束。
async fn read_frame(
    codec: &dyn FrameCodec,
    read_half: &mut ReadHalf<Transport>,
    stall: Option<Duration>,
) -> io::Result<Envelope> {
    let (tag, id) = codec.decode_identifier(read_half).await?;
    let rest = async {
        let length = codec.decode_length(read_half).await?;
        codec.decode_body(read_half, tag, id, length).await
    };
    match stall {
        Some(limit) => tokio::time::timeout(limit, rest)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "frame body stalled"))?,
        None => rest.await,
    }
}
