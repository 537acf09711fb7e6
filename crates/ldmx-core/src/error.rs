use crate::envelope::MessageId;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// `EngineError` 是连接引擎对外暴露的统一错误域。
///
/// # 设计背景（Why）
/// - 读者循环检测到的故障没有同步调用方可以返回，必须转化为错误值挂到
///   每个被排空的在途请求上；一个故障可能要唤醒 K 名等待者，因此全部
///   变体可克隆。
/// - 底层 `io::Error` 不可克隆，按引擎惯例降维为 `io::ErrorKind` 加渲染
///   文本；需要完整错误链的场景应在拨号器或编解码器一侧记录。
///
/// # 契约说明（What）
/// - `Connect`：拨号/流建立失败，连接从未就绪；
/// - `Communication`：写路径 I/O 故障，同步返回给写入者；
///   `after_server_shutdown` 区分“服务器已宣告停机后的失败”与普通故障；
/// - `ConnectionLost`：读者在有在途请求时检测到的 I/O 故障，对连接终结；
/// - `ServerShutdown`：`ConnectionLost` 的特化，由保留停机通知触发；
/// - `Timeout`：客户端侧截止超时，调用方可重试；
/// - `TlsNegotiation`：STARTTLS 升级/降级失败；
/// - `BindInFlight`：已有绑定交换在途时又发起新的初始绑定（调用方错误，
///   可恢复）。
///
/// 写锁的“非持有者释放/重复释放”属于编程错误，不在本枚举中：它以
/// panic 形式立即暴露（见 `ldmx-conn` 的写锁实现）。
#[derive(Clone, Debug, Error)]
pub enum EngineError {
    #[error("connect to {host}:{port} failed: {detail}")]
    Connect {
        host: String,
        port: u16,
        kind: io::ErrorKind,
        detail: String,
    },

    #[error("write failed: {detail}")]
    Communication {
        kind: io::ErrorKind,
        detail: String,
        /// 故障发生前是否已经观察到服务器停机通知。
        after_server_shutdown: bool,
    },

    #[error("connection to {host}:{port} lost: {detail}")]
    ConnectionLost {
        host: String,
        port: u16,
        detail: String,
    },

    #[error("server {host}:{port} announced shutdown")]
    ServerShutdown { host: String, port: u16 },

    #[error("request {id} timed out after {elapsed:?}")]
    Timeout { id: MessageId, elapsed: Duration },

    #[error("TLS negotiation failed: {detail}")]
    TlsNegotiation { detail: String },

    #[error("another bind exchange is already in flight")]
    BindInFlight,
}

impl EngineError {
    /// 由拨号失败构造 `Connect`。
    pub fn connect(host: &str, port: u16, err: &io::Error) -> Self {
        EngineError::Connect {
            host: host.to_owned(),
            port,
            kind: err.kind(),
            detail: err.to_string(),
        }
    }

    /// 由写路径 I/O 故障构造 `Communication`。
    pub fn communication(err: &io::Error, after_server_shutdown: bool) -> Self {
        EngineError::Communication {
            kind: err.kind(),
            detail: err.to_string(),
            after_server_shutdown,
        }
    }

    /// 由读者检测到的故障构造 `ConnectionLost`。
    pub fn connection_lost(host: &str, port: u16, detail: impl Into<String>) -> Self {
        EngineError::ConnectionLost {
            host: host.to_owned(),
            port,
            detail: detail.into(),
        }
    }

    /// 该错误是否对连接终结（必须重连才能继续使用）。
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ConnectionLost { .. } | EngineError::ServerShutdown { .. }
        )
    }

    /// 该错误是否为客户端侧截止超时（调用方可重试）。
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_covers_reader_faults() {
        let lost = EngineError::connection_lost("ldap.example", 389, "eof");
        let shutdown = EngineError::ServerShutdown {
            host: "ldap.example".into(),
            port: 389,
        };
        let timeout = EngineError::Timeout {
            id: MessageId(3),
            elapsed: Duration::from_millis(50),
        };
        assert!(lost.is_connection_fatal());
        assert!(shutdown.is_connection_fatal());
        assert!(!timeout.is_connection_fatal());
        assert!(timeout.is_timeout());
    }

    #[test]
    fn communication_keeps_io_kind_and_clones() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err = EngineError::communication(&io_err, true);
        let cloned = err.clone();
        match cloned {
            EngineError::Communication {
                kind,
                after_server_shutdown,
                ..
            } => {
                assert_eq!(kind, io::ErrorKind::BrokenPipe);
                assert!(after_server_shutdown);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
