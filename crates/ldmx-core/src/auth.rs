/// 描述一次认证交换所声明的身份，用于在成功后记录连接级绑定状态。
///
/// 引擎不解析凭据本身；该结构只是连接状态机需要在“最终成功的认证响应”
/// 到来时提交的元数据。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthDescriptor {
    /// 认证机制名（如 `SIMPLE`、`EXTERNAL`、SASL 机制名）。
    pub mechanism: String,
    /// 声明的主体标识（DN 或机制定义的等价物）。
    pub principal: String,
}

impl AuthDescriptor {
    pub fn new(mechanism: impl Into<String>, principal: impl Into<String>) -> Self {
        Self {
            mechanism: mechanism.into(),
            principal: principal.into(),
        }
    }
}

/// 连接级绑定状态。
///
/// 不变量：仅在一次认证交换收到**最终**且**成功**的响应后才会从
/// `Anonymous` 迁移到 `Bound`；中间（in-progress）结果不触碰该状态。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BindState {
    #[default]
    Anonymous,
    Bound(AuthDescriptor),
}

impl BindState {
    /// 连接当前是否处于已认证状态。
    pub fn is_bound(&self) -> bool {
        matches!(self, BindState::Bound(_))
    }
}
