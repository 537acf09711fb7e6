use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use ldmx_core::{AuthOutcome, Envelope, FrameCodec, MessageId};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 测试线缆语法的操作标签。取值沿用目录访问协议的应用类标签号，
/// 便于抓包时肉眼对照。
pub mod tag {
    pub const BIND_REQUEST: u8 = 0x60;
    pub const BIND_RESULT: u8 = 0x61;
    pub const UNBIND_REQUEST: u8 = 0x42;
    pub const SEARCH_REQUEST: u8 = 0x63;
    pub const SEARCH_ENTRY: u8 = 0x64;
    pub const RESULT: u8 = 0x65;
    pub const ABANDON_REQUEST: u8 = 0x50;
    pub const EXTENDED_REQUEST: u8 = 0x77;
    pub const EXTENDED_RESPONSE: u8 = 0x78;
}

/// “服务器即将停机”主动通知的报文体前缀（众所周知的 OID）。
pub const SHUTDOWN_OID: &[u8] = b"1.3.6.1.4.1.1466.20036";

/// 绑定结果报文体首字节的结果码。
pub mod bind_code {
    pub const SUCCESS: u8 = 0x00;
    pub const IN_PROGRESS: u8 = 0x0e;
    pub const INVALID_CREDENTIALS: u8 = 0x31;
}

/// 单帧报文体长度上限。测试语法不需要大报文，超限一律视为流已损坏。
const MAX_BODY: usize = 1 << 20;

/// 极简 TLV 帧编解码器：`[tag:1][message_id:i32 BE][length:u32 BE][body]`。
///
/// 不是 BER——测试关心的是引擎的分帧、路由与分类行为，而非 ASN.1
/// 语法本身；定长头部让桩服务器与故障注入都能逐字节构造。
#[derive(Clone, Copy, Debug, Default)]
pub struct TlvCodec;

impl TlvCodec {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FrameCodec for TlvCodec {
    async fn decode_identifier(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<(u8, MessageId)> {
        let mut head = [0u8; 5];
        stream.read_exact(&mut head).await?;
        let id = i32::from_be_bytes([head[1], head[2], head[3], head[4]]);
        Ok((head[0], MessageId(id)))
    }

    async fn decode_length(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<usize> {
        let mut raw = [0u8; 4];
        stream.read_exact(&mut raw).await?;
        let length = u32::from_be_bytes(raw) as usize;
        if length > MAX_BODY {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame body length {length} exceeds limit"),
            ));
        }
        Ok(length)
    }

    async fn decode_body(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        tag: u8,
        message_id: MessageId,
        length: usize,
    ) -> io::Result<Envelope> {
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await?;
        Ok(Envelope::new(message_id, tag, Bytes::from(body)))
    }

    fn encode(&self, envelope: &Envelope) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + envelope.body.len());
        buf.put_u8(envelope.tag);
        buf.put_i32(envelope.message_id.value());
        buf.put_u32(envelope.body.len() as u32);
        buf.extend_from_slice(&envelope.body);
        buf.freeze()
    }

    fn is_terminal(&self, envelope: &Envelope) -> bool {
        matches!(
            envelope.tag,
            tag::BIND_RESULT | tag::RESULT | tag::EXTENDED_RESPONSE
        )
    }

    fn is_unsolicited_shutdown(&self, envelope: &Envelope) -> bool {
        envelope.message_id == MessageId::UNSOLICITED
            && envelope.tag == tag::EXTENDED_RESPONSE
            && envelope.body.starts_with(SHUTDOWN_OID)
    }

    fn is_fire_and_forget(&self, envelope: &Envelope) -> bool {
        matches!(envelope.tag, tag::ABANDON_REQUEST | tag::UNBIND_REQUEST)
    }

    fn auth_outcome(&self, envelope: &Envelope) -> Option<AuthOutcome> {
        if envelope.tag != tag::BIND_RESULT {
            return None;
        }
        Some(match envelope.body.first() {
            Some(&bind_code::SUCCESS) => AuthOutcome::Success,
            Some(&bind_code::IN_PROGRESS) => AuthOutcome::InProgress,
            _ => AuthOutcome::Failure,
        })
    }

    fn abandon_request(&self, message_id: MessageId, target: MessageId) -> Envelope {
        Envelope::new(
            message_id,
            tag::ABANDON_REQUEST,
            Bytes::copy_from_slice(&target.value().to_be_bytes()),
        )
    }

    fn unbind_request(&self, message_id: MessageId) -> Envelope {
        Envelope::new(message_id, tag::UNBIND_REQUEST, Bytes::new())
    }
}

/// 现成的信封构造器，测试与桩服务器共用。
pub mod frames {
    use super::*;

    pub fn bind_request(id: MessageId) -> Envelope {
        Envelope::new(id, tag::BIND_REQUEST, Bytes::new())
    }

    pub fn bind_success(id: MessageId) -> Envelope {
        Envelope::new(
            id,
            tag::BIND_RESULT,
            Bytes::from_static(&[bind_code::SUCCESS]),
        )
    }

    pub fn bind_in_progress(id: MessageId) -> Envelope {
        Envelope::new(
            id,
            tag::BIND_RESULT,
            Bytes::from_static(&[bind_code::IN_PROGRESS]),
        )
    }

    pub fn bind_failure(id: MessageId) -> Envelope {
        Envelope::new(
            id,
            tag::BIND_RESULT,
            Bytes::from_static(&[bind_code::INVALID_CREDENTIALS]),
        )
    }

    pub fn search_request(id: MessageId) -> Envelope {
        Envelope::new(id, tag::SEARCH_REQUEST, Bytes::new())
    }

    pub fn search_entry(id: MessageId, body: &[u8]) -> Envelope {
        Envelope::new(id, tag::SEARCH_ENTRY, Bytes::copy_from_slice(body))
    }

    pub fn result(id: MessageId) -> Envelope {
        Envelope::new(id, tag::RESULT, Bytes::new())
    }

    pub fn extended_request(id: MessageId) -> Envelope {
        Envelope::new(id, tag::EXTENDED_REQUEST, Bytes::new())
    }

    pub fn extended_response(id: MessageId) -> Envelope {
        Envelope::new(id, tag::EXTENDED_RESPONSE, Bytes::new())
    }

    /// 关联 id 为保留值 0 的停机主动通知。
    pub fn shutdown_notice() -> Envelope {
        Envelope::new(
            MessageId::UNSOLICITED,
            tag::EXTENDED_RESPONSE,
            Bytes::from_static(SHUTDOWN_OID),
        )
    }
}
