use crate::envelope::Envelope;
use async_trait::async_trait;

/// 主动通知监听器注册后获得的句柄，用于注销。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// 服务器主动通知的监听器。
///
/// # 设计背景（Why）
/// - 主动通知（保留关联 id `0`）没有等待中的请求可路由，引擎将其扇出给
///   注册的监听器；每次投递在独立的短生命周期任务上执行，缓慢的应用
///   处理器不会拖住读者循环。
///
/// # 契约说明（What）
/// - `on_notice` 收到的信封为浅拷贝，可自由持有；
/// - 投递为 fire-and-forget：连接关闭不等待在途投递完成；
/// - 引擎在扇出前已同步完成停机通知的识别，监听器无须参与连接状态
///   管理。
#[async_trait]
pub trait UnsolicitedListener: Send + Sync + 'static {
    async fn on_notice(&self, notice: Envelope);
}
