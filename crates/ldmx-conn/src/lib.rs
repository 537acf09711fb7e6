#![doc = r#"
# ldmx-conn

## 设计动机（Why）
- **定位**：LDMX 客户端引擎的连接/多路复用核心。一条 TCP（可中途升级
  TLS）连接上并发承载任意数量的逻辑请求；本 crate 负责把出站信封序列
  化上线缆、把入站响应解复用回各自的等待者。
- **架构角色**：上层调用方（bind、search、modify 等构造器）是本引擎的
  消费者，不属于引擎；下层 BER 编解码以 [`FrameCodec`](ldmx_core::FrameCodec)
  契约注入。
- **正确性承诺**：任意数量调用方任务并发访问下保证——每连接至多一个
  活动读者；逐请求按线缆顺序投递；认证交换期间至多一个在途绑定；
  中途 STARTTLS 升级/降级、服务器主动停机、放弃与客户端超时都不丢失、
  不错投任何已排队的响应。

## 核心构件（What）
- [`Connection`]：套接字属主。唯一后台读者、计数写锁、TLS 升级/降级、
  主动通知扇出与关闭/排空协议；
- [`PendingRequest`]：单个在途请求的簿记（回复队列、完成/接收标志、
  截止计时器、认证上下文）；
- [`RequestGroup`]：同一逻辑调用方的请求集合，提供“任意成员/指定成员”
  的阻塞读取与公平轮转；
- 写锁按逻辑持有者计数可重入（见 [`LockOwner`]），多步 SASL 的多次写
  不与其他写入者交错。

## 实现策略（How）
- 完全构建在 Tokio 上：读者是一个 `tokio::spawn` 任务，暂停/停止经
  `watch` 哨兵通道协调（无轮询）；每个带截止的请求一个计时器任务；
  每次主动通知投递一个短生命周期任务；
- 读者路径的故障无法同步上抛，统一转化为挂在各在途请求上的
  [`EngineError`](ldmx_core::EngineError) 故障值，阻塞等待者以显式错误
  醒来而非永久挂起；
- 迟到回复（已完成/已放弃/未知 id）静默丢弃，暴露计数器供观测。

## 风险与考量（Trade-offs）
- 停止哨兵在帧中途翻转会放弃未完成的解码尝试；升级/降级协议要求届时
  线缆静默，这由调用方契约（先设哨兵、后发请求）保证；
- TLS 握手失败后套接字处于未知协议状态，无法按“备份套接字”恢复明文
  形态，连接如实转为断开。
"#]

mod conn;
mod group;
mod lock;
mod pending;
mod queue;
mod reader;
mod transport;

pub use conn::Connection;
pub use group::RequestGroup;
pub use lock::LockOwner;
pub use pending::{AuthPhase, PendingRequest, SendOptions};
