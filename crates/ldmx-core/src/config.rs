use std::time::Duration;

/// 连接引擎的显式配置。
///
/// # 设计背景（Why）
/// - 协议版本、各类超时曾经常见的做法是进程级可变默认值；本引擎改为
///   构造期传入的只读结构，杜绝跨连接的隐式耦合。
///
/// # 契约说明（What）
/// - `socket_timeout`：单次读写停滞上界。写路径对整段“序列化 + 刷新”
///   生效；读路径仅约束一帧内部的停滞（标识字节之后），完全空闲的
///   连接不算超时；`None` 表示不设上界；
/// - `connect_timeout`：拨号上界，由默认拨号器消费；
/// - `response_deadline`：新请求的默认截止时长，`None` 表示无界；
///   单个请求可在发送时覆盖；
/// - `protocol_version`：随绑定请求上送的协议版本号，引擎本身不解释。
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub socket_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub response_deadline: Option<Duration>,
    pub protocol_version: u8,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            socket_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Some(Duration::from_secs(10)),
            response_deadline: None,
            protocol_version: 3,
        }
    }
}

impl ConnectionConfig {
    /// 覆盖读写停滞上界。
    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// 覆盖拨号上界。
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 覆盖默认响应截止时长。
    pub fn with_response_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.response_deadline = deadline;
        self
    }
}
