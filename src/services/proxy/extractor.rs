use super::error::ProxyError;

/// 解析后的转发目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub service_name: String,
    /// 去掉前缀和服务名后的剩余路径，始终以 / 开头
    pub forward_path: String,
}

/// 从请求路径解析转发目标。
/// 第一段必须是配置的代理前缀（大小写不敏感），第二段是服务名，
/// 剩余部分原样转发。
pub fn extract_route(path: &str, prefixes: &[String]) -> Result<RouteTarget, ProxyError> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(ProxyError::InvalidPath(
            "path must start with '/'".to_string(),
        ));
    }

    let trimmed = path.trim_start_matches('/');
    let mut segments = trimmed.splitn(3, '/');

    let prefix = segments.next().unwrap_or("");
    if !matches_prefix(prefix, prefixes) {
        return Err(ProxyError::InvalidPath(format!(
            "path segment '{}' is not a proxy prefix",
            prefix
        )));
    }

    let service_name = segments.next().unwrap_or("");
    if service_name.is_empty() {
        return Err(ProxyError::InvalidPath(
            "missing service name after proxy prefix".to_string(),
        ));
    }

    let rest = segments.next().unwrap_or("");
    let forward_path = format!("/{}", rest);

    Ok(RouteTarget {
        service_name: service_name.to_string(),
        forward_path,
    })
}

/// 路径是否落在代理命名空间内
pub fn is_proxy_path(path: &str, prefixes: &[String]) -> bool {
    let trimmed = path.trim_start_matches('/');
    let first = trimmed.split('/').next().unwrap_or("");
    matches_prefix(first, prefixes)
}

fn matches_prefix(segment: &str, prefixes: &[String]) -> bool {
    !segment.is_empty() && prefixes.iter().any(|p| p.eq_ignore_ascii_case(segment))
}
