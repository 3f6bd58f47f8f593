use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use uuid::Uuid;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const BAGGAGE_HEADER: &str = "baggage";

/// 生成 W3C 规范的 32 位小写十六进制 trace ID
fn generate_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 生成 16 位小写十六进制 span ID（取 UUID 的前 8 个字节）
fn generate_span_id() -> String {
    let uuid = Uuid::new_v4();
    uuid.as_bytes()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub fn is_valid_trace_id(trace_id: &str) -> bool {
    trace_id.len() == 32
        && trace_id.chars().all(|c| c.is_ascii_hexdigit())
        && trace_id.chars().any(|c| c != '0')
}

pub fn is_valid_span_id(span_id: &str) -> bool {
    span_id.len() == 16
        && span_id.chars().all(|c| c.is_ascii_hexdigit())
        && span_id.chars().any(|c| c != '0')
}

/// 跨跳传播的追踪上下文 (traceId, spanId, parentSpanId, flags, baggage)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub flags: u8,
    pub baggage: Vec<(String, String)>,
}

impl TraceContext {
    /// 新建根上下文
    pub fn new_root() -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            parent_span_id: None,
            flags: 0x01,
            baggage: Vec::new(),
        }
    }

    /// 派生子上下文：trace ID 不变，新 span ID，父 span 为当前 span
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: generate_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            flags: self.flags,
            baggage: self.baggage.clone(),
        }
    }

    /// 解析 traceparent 头。非法输入返回 None，调用方应创建新的根上下文。
    pub fn parse_traceparent(value: &str) -> Option<Self> {
        let pieces: Vec<&str> = value.trim().split('-').collect();
        if pieces.len() != 4 {
            return None;
        }
        if pieces[0].len() != 2 || !pieces[0].chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        if !is_valid_trace_id(pieces[1]) || !is_valid_span_id(pieces[2]) {
            return None;
        }
        let flags = u8::from_str_radix(pieces[3], 16).ok()?;

        Some(Self {
            trace_id: pieces[1].to_ascii_lowercase(),
            span_id: pieces[2].to_ascii_lowercase(),
            parent_span_id: None,
            flags,
            baggage: Vec::new(),
        })
    }

    /// 编码为 traceparent 头的值
    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, self.flags)
    }

    /// 从请求头提取上下文并派生子 span；缺失或非法时新建根上下文
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let incoming = headers
            .get(TRACEPARENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse_traceparent);

        let mut context = match incoming {
            Some(remote) => remote.child(),
            None => Self::new_root(),
        };

        if let Some(value) = headers.get(BAGGAGE_HEADER).and_then(|v| v.to_str().ok()) {
            context.baggage = parse_baggage(value);
        }

        context
    }

    /// 编码 baggage 头的值（值按 URL 编码）
    pub fn baggage_header(&self) -> Option<String> {
        if self.baggage.is_empty() {
            return None;
        }
        let encoded: Vec<String> = self
            .baggage
            .iter()
            .map(|(k, v)| format!("{}={}", k, percent_encode(v)))
            .collect();
        Some(encoded.join(","))
    }

    /// 注入到出站请求头
    pub fn inject(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.traceparent()) {
            headers.insert(TRACEPARENT_HEADER, value);
        }
        if let Some(baggage) = self.baggage_header() {
            if let Ok(value) = HeaderValue::from_str(&baggage) {
                headers.insert(BAGGAGE_HEADER, value);
            }
        }
    }
}

fn parse_baggage(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.trim();
            let raw = parts.next()?.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), percent_decode(raw)))
        })
        .collect()
}

// baggage 值只需要对分隔符和非可见字符做最小转义
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

tokio::task_local! {
    static CURRENT_TRACE: TraceContext;
}

/// 在给定追踪上下文下运行一个 future（任务级环境槽）。
/// 派生子任务时由调用方复制当前上下文传入。
pub async fn with_context<F>(context: TraceContext, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_TRACE.scope(context, fut).await
}

/// 读取当前任务的追踪上下文
pub fn current() -> Option<TraceContext> {
    CURRENT_TRACE.try_with(|c| c.clone()).ok()
}

/// 追踪数据出口。核心只负责写入，存储与查询是外部协作者。
pub trait TraceSink: Send + Sync {
    fn record_span(&self, context: &TraceContext, name: &str, duration: Duration, success: bool);
}

/// 默认实现：落到结构化日志
#[derive(Debug, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn record_span(&self, context: &TraceContext, name: &str, duration: Duration, success: bool) {
        tracing::debug!(
            trace_id = %context.trace_id,
            span_id = %context.span_id,
            parent_span_id = ?context.parent_span_id,
            span_name = %name,
            duration_ms = %duration.as_millis(),
            success = %success,
            "Span completed"
        );
    }
}
