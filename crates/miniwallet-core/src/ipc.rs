//! 宿主与区块链引擎之间的消息协议，以及桥接响应的处理规则。
//!
//! 协议形态：
//! - 以 JSON 序列化 [`EngineRequest`] / [`EngineReply`]，通过外部提供的进程边界通道传输
//! - 每条调用消息携带 `request_id` 用于请求-响应关联
//! - 调用载荷（payload）原样透传，宿主不解析业务内容
//!
//! 响应处理：
//! - 引擎响应可能带一层信封 `{"responseData": "<json 字符串>"}`，交付前只解包一层
//! - 无法解析的响应转换为 JSON-RPC 解析错误（-32700），仍交付给同一 `request_id`
//! - 交付给渲染端的文本会内嵌到脚本片段中，必须先转义
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::BridgeError;

/// JSON-RPC 解析错误码。
pub const PARSE_ERROR_CODE: i64 = -32700;

/// 引擎侧业务失败时使用的 JSON-RPC 错误码。
pub const ENGINE_ERROR_CODE: i64 = -32000;

/// 响应信封字段名。
pub const RESPONSE_DATA_FIELD: &str = "responseData";

/// 渲染端接收桥接响应的事件名。
pub const RESPONSE_EVENT: &str = "bridgeResponse";

/// 发往引擎的消息。
///
/// 序列化格式：
/// - 使用 `#[serde(tag = "type")]`，在 JSON 中通过 `type` 字段区分消息类型。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineRequest {
    /// 转发一次桥接调用。
    ///
    /// 参数：
    /// - `request_id`：调用方选择的关联 ID
    /// - `payload`：渲染端提交的原始 JSON 文本（不解析）
    Call { request_id: String, payload: String },
    /// 通知引擎切换为激活状态。
    Activate { engine_id: String },
}

/// 引擎回传的消息。
///
/// 异常处理：
/// - 业务失败通过 [`EngineReply::Failure`] 回传；`message` 不应包含敏感信息。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineReply {
    /// 调用成功，`body` 为原始响应文本（可能带信封）。
    Response { request_id: String, body: String },
    /// 调用失败。
    Failure {
        request_id: String,
        message: String,
        #[serde(default)]
        code: Option<i64>,
    },
}

impl EngineReply {
    /// 回复所关联的请求 ID。
    pub fn request_id(&self) -> &str {
        match self {
            EngineReply::Response { request_id, .. } | EngineReply::Failure { request_id, .. } => request_id,
        }
    }
}

/// 交付给渲染端的桥接响应。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub request_id: String,
    pub body: Value,
}

impl BridgeResponse {
    /// 由引擎回复构造响应。
    ///
    /// 规则：
    /// - `Response`：按 [`unwrap_response`] 解包；解析失败时生成 -32700 错误对象
    /// - `Failure`：生成 JSON-RPC 错误对象（缺省错误码 [`ENGINE_ERROR_CODE`]）
    pub fn from_reply(reply: EngineReply) -> Self {
        match reply {
            EngineReply::Response { request_id, body } => {
                let body = match unwrap_response(&body) {
                    Ok(value) => value,
                    Err(BridgeError::Parse(detail)) => parse_error_response(&request_id, &detail),
                    Err(other) => parse_error_response(&request_id, &other.to_string()),
                };
                Self { request_id, body }
            }
            EngineReply::Failure { request_id, message, code } => {
                let body = error_response(&request_id, code.unwrap_or(ENGINE_ERROR_CODE), &message);
                Self { request_id, body }
            }
        }
    }

    /// 渲染为可在渲染端执行的脚本片段。
    pub fn render_script(&self) -> String {
        render_response_script(&self.request_id, &self.body)
    }
}

/// 解析引擎响应文本，并按信封约定解包一层。
///
/// 规则：
/// - 顶层为对象且包含 `responseData`：
///   - `responseData` 为字符串时按 JSON 解析，否则直接使用
///   - 解包结果为对象时，外层的 `requestId`/`status` 在内层缺失时补入
/// - 其他情况原样返回
///
/// 异常处理：
/// - 顶层或 `responseData` 字符串无法解析时返回 [`BridgeError::Parse`]
pub fn unwrap_response(raw: &str) -> Result<Value, BridgeError> {
    let outer: Value = serde_json::from_str(raw).map_err(|e| BridgeError::Parse(e.to_string()))?;
    let Value::Object(mut outer_map) = outer else {
        return Ok(outer);
    };
    let Some(inner) = outer_map.remove(RESPONSE_DATA_FIELD) else {
        return Ok(Value::Object(outer_map));
    };
    let inner = match inner {
        Value::String(text) => serde_json::from_str::<Value>(&text).map_err(|e| BridgeError::Parse(e.to_string()))?,
        other => other,
    };
    match inner {
        Value::Object(inner_map) => Ok(Value::Object(merge_envelope_fields(inner_map, outer_map))),
        other => Ok(other),
    }
}

fn merge_envelope_fields(mut inner: Map<String, Value>, mut outer: Map<String, Value>) -> Map<String, Value> {
    for key in ["requestId", "status"] {
        if let Some(value) = outer.remove(key) {
            inner.entry(key).or_insert(value);
        }
    }
    inner
}

/// 生成 JSON-RPC 解析错误响应（-32700）。
pub fn parse_error_response(request_id: &str, detail: &str) -> Value {
    error_response(request_id, PARSE_ERROR_CODE, &format!("Parse error: {detail}"))
}

/// 生成 JSON-RPC 错误响应。
pub fn error_response(request_id: &str, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "error": { "code": code, "message": message },
    })
}

/// 转义文本，使其可安全嵌入脚本中的双引号字符串字面量。
///
/// 处理字符：反斜杠、双引号、换行、回车，以及 U+2028/U+2029。
pub fn escape_for_script(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            other => out.push(other),
        }
    }
    out
}

/// 生成向渲染端派发响应事件的脚本片段。
pub fn render_response_script(request_id: &str, body: &Value) -> String {
    format!(
        "window.dispatchEvent(new CustomEvent('{RESPONSE_EVENT}', {{ detail: {{ requestId: \"{}\", response: JSON.parse(\"{}\") }} }}));",
        escape_for_script(request_id),
        escape_for_script(&body.to_string())
    )
}
