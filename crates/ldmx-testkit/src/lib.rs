#![doc = r#"
# ldmx-testkit

连接引擎的测试支撑件，只进测试依赖，不随库发布。

## 提供内容（What）
- [`TlvCodec`]：定长头部的极简帧编解码器，满足
  [`FrameCodec`](ldmx_core::FrameCodec) 契约；配套 [`frames`] 构造器；
- [`StubListener`] / [`StubSession`]：无协议状态机的桩服务器，测试脚本
  逐帧读写、按剧本应答或注入故障；
- [`TlsIdentity`]：自签发的成对 TLS 配置，STARTTLS 升级测试两端共用。

## 使用约定（How）
- 桩服务器不主动读写，任何线缆交互都由测试显式驱动；这让“线缆此刻
  静默”成为测试可以直接断言的事实，而非时序巧合。
"#]

mod codec;
mod server;
mod tls;

pub use codec::{SHUTDOWN_OID, TlvCodec, bind_code, frames, tag};
pub use server::{StubListener, StubSession};
pub use tls::TlsIdentity;
