use bytes::Bytes;
use core::fmt;

/// 协议级请求标识（关联 id），用于把响应路由回发起它的请求。
///
/// # 设计背景（Why）
/// - 目录访问协议在单条连接上并发承载多个逻辑请求，服务器以请求携带的
///   message id 标记每个响应；引擎据此完成解复用。
/// - 保留值 `0` 被协议指定给“主动通知”（无发起请求的服务器报文），
///   引擎对它走独立的通知扇出路径。
///
/// # 契约说明（What）
/// - **取值范围**：正常请求使用正数；`UNSOLICITED` 为保留值；
/// - **语义**：同一连接上在途请求的 id 必须互不相同，分配由
///   连接对象的原子计数器完成，调用方不应自行造号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i32);

impl MessageId {
    /// 服务器主动通知使用的保留关联 id。
    pub const UNSOLICITED: MessageId = MessageId(0);

    /// 返回底层整数值，供编解码器写入线缆。
    pub fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 一条已解码的协议报文单元（请求或响应）。
///
/// # 设计背景（Why）
/// - 引擎只负责“把字节送上线缆、把解码后的信封路由给正确的等待者”，
///   因此信封对报文体保持完全不透明：除关联 id、类型标签外不读任何字段。
/// - 报文体使用 [`Bytes`]，克隆为引用计数浅拷贝；主动通知需要向多名
///   监听器扇出同一信封，浅拷贝避免了逐监听器的堆复制。
///
/// # 契约说明（What）
/// - `message_id`：关联 id；响应沿用请求的 id，主动通知为保留值 `0`；
/// - `tag`：协议操作标签，终结性/通知判定等分类完全交由
///   [`FrameCodec`](crate::FrameCodec) 的钩子完成；
/// - `body`：未解释的报文体字节。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// 关联 id。
    pub message_id: MessageId,
    /// 协议操作标签。
    pub tag: u8,
    /// 不透明报文体。
    pub body: Bytes,
}

impl Envelope {
    /// 构造信封。引擎不校验 `body` 内容，合法性由编解码器负责。
    pub fn new(message_id: MessageId, tag: u8, body: Bytes) -> Self {
        Self {
            message_id,
            tag,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsolicited_id_is_zero() {
        assert_eq!(MessageId::UNSOLICITED.value(), 0);
        assert_eq!(MessageId(7).to_string(), "7");
    }

    #[test]
    fn envelope_clone_shares_body() {
        let env = Envelope::new(MessageId(1), 0x63, Bytes::from_static(b"abc"));
        let cloned = env.clone();
        assert_eq!(env, cloned);
        // Bytes 克隆共享底层存储。
        assert_eq!(env.body.as_ptr(), cloned.body.as_ptr());
    }
}
