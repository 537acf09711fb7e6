#![doc = r#"
# ldmx-core

## 设计动机（Why）
- **定位**：该 crate 定义 LDMX 客户端引擎的契约层——信封模型、帧编解码接口、
  拨号/TLS 升级抽象、配置结构与统一错误域。连接多路复用核心
  （`ldmx-conn`）只依赖这些契约，不关心目录协议报文的内部语义。
- **架构角色**：作为引擎与外部协作方（BER 编解码器、高层请求构造器）之间的
  边界层；协作方以 [`FrameCodec`] 的形式注入，引擎对报文体保持不透明。
- **设计理念**：强调“显式注入、无全局状态”——套接字工厂、协议版本与超时
  均通过 [`ConnectionConfig`] 与 [`Dialer`] 在构造期传入，不存在进程级可变
  默认值。

## 核心契约（What）
- **输入条件**：调用方必须在 Tokio 运行时中使用本契约的异步接口；
- **输出保障**：所有可观察故障合流为 [`EngineError`]，其变体可克隆，
  以便单个故障扇出给多名等待者；
- **前置约束**：[`FrameCodec`] 实现必须保证“逐帧顺序解码”——引擎的单读者
  循环依赖这一点维持按请求有序投递。

## 实现策略（How）
- 异步接缝统一使用 `async-trait`，保持对象安全；
- 报文体使用 `bytes::Bytes`，克隆为浅拷贝，便于主动通知扇出；
- TLS 升级封装 `rustls` + `tokio-rustls` 客户端握手。

## 风险与考量（Trade-offs）
- 错误变体以 `io::ErrorKind` + 渲染文本承载底层原因，换取 `Clone` 能力；
  若需要保留原始 `io::Error` 链，调用方应在拨号器/编解码器一侧自行记录。
"#]

mod auth;
mod codec;
mod config;
mod dialer;
mod envelope;
mod error;
mod listener;

pub use auth::{AuthDescriptor, BindState};
pub use codec::{AuthOutcome, FrameCodec};
pub use config::ConnectionConfig;
pub use dialer::{Dialer, RustlsUpgrader, TcpDialer, TlsUpgrader};
pub use envelope::{Envelope, MessageId};
pub use error::EngineError;
pub use listener::{ListenerId, UnsolicitedListener};
