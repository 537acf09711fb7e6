use async_trait::async_trait;
use rustls_pki_types::ServerName;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// 套接字拨号抽象。
///
/// # 设计背景（Why）
/// - 连接对象不直接调用 `TcpStream::connect`，而是通过注入的拨号器建立
///   套接字：测试可以替换为受控实现，部署方可以叠加代理或地址族策略；
/// - 这同时取消了“进程级套接字工厂”一类的全局可变默认值——拨号器随
///   配置显式传入构造函数。
///
/// # 契约说明（What）
/// - **输入**：目标主机与端口；
/// - **输出**：已完成三次握手、开启 `TCP_NODELAY` 与否由实现方决定的流；
/// - **错误**：任何拨号失败以 `io::Error` 返回，连接层负责映射为
///   [`EngineError::Connect`](crate::EngineError::Connect)。
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// 默认拨号器：直接 TCP 连接，受可选的连接超时约束。
#[derive(Clone, Debug, Default)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let connect = TcpStream::connect((host, port));
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tcp connect timed out"))??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        debug!(target: "ldmx::dial", %host, port, "tcp stream established");
        Ok(stream)
    }
}

/// 在既有 TCP 流上执行 TLS 客户端握手的升级器，供 STARTTLS 使用。
///
/// # 设计背景（Why）
/// - STARTTLS 的要点是“中途升级”：连接已经建立并完成了明文协商，升级器
///   只负责在当前套接字上套一层加密，而不是重新拨号；
/// - 与拨号器一样按接口注入，测试可以提供信任自签证书的实现。
///
/// # 契约说明（What）
/// - **输入**：被升级的 `TcpStream` 与用于证书校验的主机名；
/// - **输出**：握手完成的客户端 TLS 流；
/// - **错误**：握手失败时底层流随 `io::Error` 一并丢弃——rustls 握手失败
///   后的套接字处于未知协议状态，不可回收复用。
#[async_trait]
pub trait TlsUpgrader: Send + Sync + 'static {
    async fn upgrade(&self, stream: TcpStream, host: &str) -> io::Result<TlsStream<TcpStream>>;
}

/// 基于 `tokio-rustls` 的默认升级器。
#[derive(Clone)]
pub struct RustlsUpgrader {
    connector: TlsConnector,
}

impl RustlsUpgrader {
    /// 以调用方准备好的客户端配置构造升级器。证书信任、ALPN 等策略
    /// 全部由 `config` 决定。
    pub fn new(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }
}

#[async_trait]
impl TlsUpgrader for RustlsUpgrader {
    async fn upgrade(&self, stream: TcpStream, host: &str) -> io::Result<TlsStream<TcpStream>> {
        let name = ServerName::try_from(host.to_owned())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let tls = self.connector.connect(name, stream).await?;
        debug!(target: "ldmx::dial", %host, "tls handshake completed");
        Ok(tls)
    }
}
