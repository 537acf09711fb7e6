use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;

/// 一套自签发的测试 TLS 身份：服务端证书与信任该证书的客户端配置
/// 成对生成，供 STARTTLS 升级测试两端共用。
///
/// 证书的主体备用名覆盖 `localhost` 与 `127.0.0.1`，测试按任一形式
/// 拨号都能通过主机名校验。
pub struct TlsIdentity {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
}

impl TlsIdentity {
    /// 生成一套新身份。仅用于测试，失败直接 panic。
    pub fn generate() -> Self {
        let certified =
            rcgen::generate_simple_self_signed(vec!["localhost".into(), "127.0.0.1".into()])
                .expect("生成自签证书");
        let cert: CertificateDer<'static> = certified.cert.der().clone();
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], PrivateKeyDer::Pkcs8(key))
            .expect("组装服务端 TLS 配置");

        let mut roots = RootCertStore::empty();
        roots.add(cert).expect("登记自签根证书");
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            server: Arc::new(server),
            client: Arc::new(client),
        }
    }

    /// 信任本身份的客户端配置，可直接喂给
    /// [`RustlsUpgrader`](ldmx_core::RustlsUpgrader)。
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client)
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server)
    }
}

impl Default for TlsIdentity {
    fn default() -> Self {
        Self::generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_builds_paired_configs() {
        // 能完整走通构造即证明进程内加密后端唯一、无歧义；
        // 两侧配置可直接喂给连接器/受理器。
        let identity = TlsIdentity::generate();
        let _ = tokio_rustls::TlsConnector::from(identity.client_config());
        let _ = tokio_rustls::TlsAcceptor::from(identity.server_config());
    }
}
