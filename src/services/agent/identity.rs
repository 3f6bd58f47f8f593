use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use super::config::AgentConfig;
use super::error::AgentError;

/// 解析完成的服务身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

/// 宿主应用注入的身份来源（名称、端口、地址）
pub trait ServiceInfoProvider: Send + Sync {
    fn service_info(&self) -> Option<ServiceIdentity>;
}

/// 通配地址集合，需替换为真实出口地址
const WILDCARD_HOSTS: [&str; 4] = ["0.0.0.0", "::", "*", "+"];

/// 按优先级解析服务身份：显式配置 > 注入的 provider > 平台自省。
/// 解析发生在构造之前，之后配置不可变。
pub fn resolve_identity(
    config: &AgentConfig,
    provider: Option<&dyn ServiceInfoProvider>,
) -> Result<ServiceIdentity, AgentError> {
    let provided = provider.and_then(|p| p.service_info());

    let service_name = config
        .service_name
        .clone()
        .or_else(|| provided.as_ref().map(|p| p.service_name.clone()))
        .or_else(executable_name)
        .ok_or_else(|| AgentError::Identity("service name is not configured".to_string()))?;

    if service_name.trim().is_empty() {
        return Err(AgentError::Identity(
            "service name must not be empty".to_string(),
        ));
    }

    let raw_host = config
        .host
        .clone()
        .or_else(|| provided.as_ref().map(|p| p.host.clone()))
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let host = substitute_wildcard_host(&raw_host);

    let port = config
        .port
        .or(provided.as_ref().map(|p| p.port))
        .ok_or_else(|| AgentError::Identity("listen port is not configured".to_string()))?;
    if port == 0 {
        return Err(AgentError::Identity("port must be non-zero".to_string()));
    }

    Ok(ServiceIdentity {
        service_name,
        host,
        port,
    })
}

/// 通配地址替换为第一个非环回 IPv4
pub fn substitute_wildcard_host(host: &str) -> String {
    if !WILDCARD_HOSTS.contains(&host) {
        return host.to_string();
    }
    match detect_local_ipv4() {
        Some(ip) => ip.to_string(),
        None => {
            tracing::warn!(
                configured_host = %host,
                "No non-loopback IPv4 detected, falling back to loopback"
            );
            "127.0.0.1".to_string()
        }
    }
}

/// 探测本机出口 IPv4。对公网地址发起 UDP connect 不产生流量，
/// 仅让内核选定路由后读取本端地址。
pub fn detect_local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

// 平台自省：用入口程序名充当服务名
fn executable_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}
