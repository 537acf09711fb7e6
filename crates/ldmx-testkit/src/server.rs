use crate::codec::{TlvCodec, frames};
use crate::tls::TlsIdentity;
use ldmx_core::{Envelope, FrameCodec};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// 桩服务器监听器：绑定随机端口，为每个入站连接产出一个
/// [`StubSession`]。
///
/// 桩服务器没有自己的协议状态机——测试脚本逐帧读写会话，按剧本
/// 应答或注入故障（半帧截断、静默、直接断开等）。
pub struct StubListener {
    listener: TcpListener,
}

impl StubListener {
    /// 在回环地址上绑定一个随机端口。
    pub async fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// 接受下一个入站连接。
    pub async fn accept(&self) -> io::Result<StubSession> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(target: "ldmx::testkit", %peer, "stub server accepted connection");
        Ok(StubSession {
            codec: TlvCodec::new(),
            stream: Some(SessionStream::Plain(stream)),
        })
    }
}

enum SessionStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SessionStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SessionStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// 桩服务器侧的单个会话。逐帧读写，支持按剧本在明文与 TLS 之间
/// 切换外壳。
pub struct StubSession {
    codec: TlvCodec,
    stream: Option<SessionStream>,
}

impl StubSession {
    fn stream_mut(&mut self) -> io::Result<&mut SessionStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session stream taken"))
    }

    /// 读出客户端发来的下一帧。
    pub async fn read_frame(&mut self) -> io::Result<Envelope> {
        let codec = self.codec;
        let stream = self.stream_mut()?;
        let (tag, id) = codec.decode_identifier(stream).await?;
        let length = codec.decode_length(stream).await?;
        codec.decode_body(stream, tag, id, length).await
    }

    /// 发送一帧完整响应。
    pub async fn send(&mut self, envelope: &Envelope) -> io::Result<()> {
        let wire = self.codec.encode(envelope);
        let stream = self.stream_mut()?;
        stream.write_all(&wire).await?;
        stream.flush().await
    }

    /// 只发送一帧的前若干字节，用于制造“报文体迟迟不到”的停滞场景。
    pub async fn send_truncated(&mut self, envelope: &Envelope, bytes: usize) -> io::Result<()> {
        let wire = self.codec.encode(envelope);
        let cut = bytes.min(wire.len());
        let stream = self.stream_mut()?;
        stream.write_all(&wire[..cut]).await?;
        stream.flush().await
    }

    /// 发送“服务器即将停机”主动通知（保留关联 id 0）。
    pub async fn send_unsolicited_shutdown(&mut self) -> io::Result<()> {
        self.send(&frames::shutdown_notice()).await
    }

    /// 在当前会话上完成服务端 TLS 握手。调用前线缆必须静默
    /// （客户端已暂停读者并等待握手）。
    pub async fn upgrade_tls(&mut self, identity: &TlsIdentity) -> io::Result<()> {
        let stream = self.stream.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "session stream taken")
        })?;
        let SessionStream::Plain(tcp) = stream else {
            self.stream = Some(stream);
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "session already secured",
            ));
        };
        let acceptor = TlsAcceptor::from(identity.server_config());
        let tls = acceptor.accept(tcp).await?;
        self.stream = Some(SessionStream::Tls(Box::new(tls)));
        Ok(())
    }

    /// 剥掉 TLS 外壳回到明文（不关闭底层 TCP 连接）。
    ///
    /// 与客户端的降级互为对端：双方各自发送 close_notify、读到对端的
    /// close_notify 后才剥离外壳，保证线缆上不残留任何 TLS 记录。两端
    /// 的降级调用必须并发执行。
    pub async fn downgrade_tls(&mut self) -> io::Result<()> {
        let stream = self.stream.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "session stream taken")
        })?;
        let SessionStream::Tls(mut tls) = stream else {
            self.stream = Some(stream);
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "session is not secured",
            ));
        };
        let (_, session) = tls.get_mut();
        session.send_close_notify();
        tls.flush().await?;
        let mut scratch = [0u8; 256];
        match tls.read(&mut scratch).await? {
            0 => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected data while closing TLS session",
                ));
            }
        }
        let (tcp, _connection) = tls.into_inner();
        self.stream = Some(SessionStream::Plain(tcp));
        Ok(())
    }

    /// 直接丢弃底层流，模拟服务器无预警断开。
    pub fn drop_connection(&mut self) {
        self.stream = None;
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.stream, Some(SessionStream::Tls(_)))
    }
}
