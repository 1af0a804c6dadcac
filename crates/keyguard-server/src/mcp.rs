//! MCP (Model Context Protocol) server.
//!
//! Speaks JSON-RPC 2.0 over newline-delimited stdio and exposes the broker's
//! operations as MCP tools. Supports `initialize`, `ping`, `tools/list` and
//! `tools/call`; notifications (requests without an id) get no reply.
//!
//! Tool failures never become JSON-RPC errors. They come back as a normal
//! tool result with `isError: true`, so the calling agent sees the message.
//!
//! Targets MCP protocol revision `2024-11-05`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use keyguard_proxy::ProxyRequest;

use crate::error::BrokerError;
use crate::service::KeyGuard;

// ---------------------------------------------------------------------------
// MCP protocol version
// ---------------------------------------------------------------------------

/// The MCP protocol version this server implements.
const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// The server name reported during initialization.
const SERVER_NAME: &str = "keyguard-server";

/// The server version reported during initialization.
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// JSON-RPC types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Must be `"2.0"`.
    pub jsonrpc: String,
    /// Request identifier. Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    /// The method to invoke.
    pub method: String,
    /// Method parameters (defaults to `null` if absent).
    #[serde(default)]
    pub params: Value,
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Echoed from the request.
    pub id: Option<Value>,
    /// Present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

// Standard JSON-RPC error codes.
const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

impl JsonRpcResponse {
    /// Construct a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Construct an error response.
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MCP-specific types
// ---------------------------------------------------------------------------

/// An MCP tool definition returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's input parameters.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// The result of an MCP `tools/call` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// A single content block within an MCP tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl McpContent {
    /// Create a text content block.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            content_type: "text".into(),
            text: value.into(),
        }
    }
}

impl McpToolResult {
    /// Create a successful tool result with a single text block.
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::text(text)],
            is_error: None,
        }
    }

    /// Create an error tool result with a single text block.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::text(text)],
            is_error: Some(true),
        }
    }

    /// Whether this result reports a failure.
    pub fn is_error(&self) -> bool {
        self.is_error == Some(true)
    }
}

// ---------------------------------------------------------------------------
// Tool arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterKeyArgs {
    service: String,
    key: String,
    permissions: Vec<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScopeArgs {
    service: String,
    #[serde(default)]
    required_permissions: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListKeysArgs {
    #[serde(default)]
    service: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoveKeyArgs {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProxyRequestArgs {
    session_token: String,
    #[serde(flatten)]
    request: ProxyRequest,
}

#[derive(Debug, Deserialize)]
struct SmartProvisionArgs {
    prompt: String,
    #[serde(default)]
    master_key_id: Option<String>,
}

// ---------------------------------------------------------------------------
// McpServer
// ---------------------------------------------------------------------------

/// MCP protocol server exposing a [`KeyGuard`] broker as tools.
#[derive(Clone)]
pub struct McpServer {
    broker: Arc<KeyGuard>,
}

impl McpServer {
    /// Create a new MCP server backed by `broker`.
    pub fn new(broker: Arc<KeyGuard>) -> Self {
        Self { broker }
    }

    /// Serve newline-delimited JSON-RPC on stdin/stdout until stdin closes.
    pub async fn serve_stdio(&self) -> std::io::Result<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }

    /// Serve newline-delimited JSON-RPC from `reader` to `writer` until EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let Some(response) = self.handle_line(&line).await else {
                continue;
            };

            let mut out = match serde_json::to_vec(&response) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize response");
                    continue;
                }
            };
            out.push(b'\n');
            writer.write_all(&out).await?;
            writer.flush().await?;
        }

        tracing::info!("input closed, MCP server stopping");
        Ok(())
    }

    /// Handle one raw input line. Returns `None` for blank lines and
    /// notifications.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match serde_json::from_str::<JsonRpcRequest>(line) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => Some(JsonRpcResponse::error(
                None,
                PARSE_ERROR,
                format!("failed to parse JSON-RPC request: {e}"),
            )),
        }
    }

    /// Handle a single JSON-RPC request. Notifications yield `None`.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        tracing::debug!(method = %request.method, "MCP request received");

        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                request.id,
                INVALID_REQUEST,
                "jsonrpc must be \"2.0\"",
            ));
        }

        if request.id.is_none() {
            tracing::debug!(method = %request.method, "notification ignored");
            return None;
        }

        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.id),
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            "tools/list" => self.handle_tools_list(request.id),
            "tools/call" => self.handle_tools_call(request.id, request.params).await,
            other => {
                tracing::warn!(method = %other, "unknown MCP method");
                JsonRpcResponse::error(
                    request.id,
                    METHOD_NOT_FOUND,
                    format!("method not found: {other}"),
                )
            }
        };
        Some(response)
    }

    /// Handle the `initialize` handshake.
    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": SERVER_VERSION
                }
            }),
        )
    }

    fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        match serde_json::to_value(tool_definitions()) {
            Ok(tools) => JsonRpcResponse::success(id, json!({ "tools": tools })),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize tool list");
                JsonRpcResponse::error(id, INTERNAL_ERROR, "failed to serialize tool list")
            }
        }
    }

    async fn handle_tools_call(&self, id: Option<Value>, params: Value) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(
                id,
                INVALID_PARAMS,
                "missing required field `name` in params",
            );
        };

        let arguments = params
            .get("arguments")
            .cloned()
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| json!({}));

        let result = self.call_tool(name, arguments).await;
        match serde_json::to_value(&result) {
            Ok(v) => JsonRpcResponse::success(id, v),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize tool result");
                JsonRpcResponse::error(id, INTERNAL_ERROR, "failed to serialize tool result")
            }
        }
    }

    /// Run a tool, converting any failure into an error result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpToolResult {
        match self.dispatch(name, arguments).await {
            Ok(value) => {
                let text = match value {
                    Value::String(s) => s,
                    other => {
                        serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string())
                    }
                };
                McpToolResult::success(text)
            }
            Err(e) => {
                tracing::info!(tool = name, kind = e.kind(), error = %e, "tool call failed");
                McpToolResult::error(format!("Error ({}): {e}", e.kind()))
            }
        }
    }

    async fn dispatch(&self, name: &str, arguments: Value) -> Result<Value, BrokerError> {
        let broker = &self.broker;
        match name {
            "register_key" => {
                let args: RegisterKeyArgs = parse_args(name, arguments)?;
                let key = broker
                    .register_key(&args.service, &args.key, args.permissions, args.description)
                    .await?;
                to_json(&key)
            }
            "get_mapped_key" => {
                let args: ScopeArgs = parse_args(name, arguments)?;
                let key = broker
                    .get_mapped_key(&args.service, &args.required_permissions)
                    .await?;
                to_json(&key)
            }
            "list_services" => Ok(json!({ "services": broker.list_services().await })),
            "list_keys" => {
                let args: ListKeysArgs = parse_args(name, arguments)?;
                to_json(&broker.list_keys(args.service.as_deref()).await)
            }
            "remove_key" => {
                let args: RemoveKeyArgs = parse_args(name, arguments)?;
                to_json(&broker.remove_key(&args.id).await?)
            }
            "create_proxy_session" => {
                let args: ScopeArgs = parse_args(name, arguments)?;
                let grant = broker
                    .create_proxy_session(&args.service, args.required_permissions)
                    .await?;
                to_json(&grant)
            }
            "proxy_request" => {
                let args: ProxyRequestArgs = parse_args(name, arguments)?;
                let response = broker
                    .proxy_request(&args.session_token, args.request)
                    .await?;
                to_json(&response)
            }
            "smart_provision" => {
                let args: SmartProvisionArgs = parse_args(name, arguments)?;
                let outcome = broker
                    .smart_provision(&args.prompt, args.master_key_id.as_deref())
                    .await?;
                to_json(&outcome)
            }
            other => Err(BrokerError::Validation(format!("unknown tool: {other}"))),
        }
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, BrokerError> {
    serde_json::from_value(arguments)
        .map_err(|e| BrokerError::Validation(format!("invalid arguments for {tool}: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, BrokerError> {
    serde_json::to_value(value)
        .map_err(|e| BrokerError::Validation(format!("unserializable result: {e}")))
}

// ---------------------------------------------------------------------------
// Tool catalogue
// ---------------------------------------------------------------------------

fn string_array(description: &str) -> Value {
    json!({"type": "array", "items": {"type": "string"}, "description": description})
}

/// The tools this server exposes.
pub fn tool_definitions() -> Vec<McpToolDefinition> {
    let tool = |name: &str, description: &str, input_schema: Value| McpToolDefinition {
        name: name.into(),
        description: description.into(),
        input_schema,
    };

    vec![
        tool(
            "register_key",
            "Register a new service key with specific permissions",
            json!({
                "type": "object",
                "properties": {
                    "service": {"type": "string", "description": "Service provider name (e.g. openai, github)"},
                    "key": {"type": "string", "description": "The API key or token"},
                    "permissions": string_array("Permissions this key grants"),
                    "description": {"type": "string", "description": "Optional description"}
                },
                "required": ["service", "key", "permissions"]
            }),
        ),
        tool(
            "get_mapped_key",
            "Find the least-privileged key for a service that grants the required permissions. Returns key metadata, never the secret.",
            json!({
                "type": "object",
                "properties": {
                    "service": {"type": "string", "description": "Service provider name"},
                    "required_permissions": string_array("Permissions needed for the current task")
                },
                "required": ["service", "required_permissions"]
            }),
        ),
        tool(
            "list_services",
            "List all services currently managed by KeyGuard",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "list_keys",
            "List registered keys (without secrets), optionally for one service",
            json!({
                "type": "object",
                "properties": {
                    "service": {"type": "string", "description": "Only list keys for this service"}
                }
            }),
        ),
        tool(
            "remove_key",
            "Remove a registered key by id",
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string", "description": "Key id"}
                },
                "required": ["id"]
            }),
        ),
        tool(
            "create_proxy_session",
            "Issue a short-lived session token for the least-privileged key matching the required permissions",
            json!({
                "type": "object",
                "properties": {
                    "service": {"type": "string", "description": "Service provider name"},
                    "required_permissions": string_array("Permissions the session needs")
                },
                "required": ["service", "required_permissions"]
            }),
        ),
        tool(
            "proxy_request",
            "Make an authenticated HTTP request to the session's service. The real key is injected by KeyGuard.",
            json!({
                "type": "object",
                "properties": {
                    "session_token": {"type": "string", "description": "Token from create_proxy_session"},
                    "method": {"type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"]},
                    "path": {"type": "string", "description": "Path relative to the service API root, or an absolute URL"},
                    "body": {"description": "Request body; strings are sent raw, anything else as JSON"},
                    "headers": {"type": "object", "additionalProperties": {"type": "string"}}
                },
                "required": ["session_token", "method", "path"]
            }),
        ),
        tool(
            "smart_provision",
            "Describe the access an agent needs in plain language; KeyGuard mints a restricted key, issues a session and writes a skill file",
            json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string", "description": "What the agent needs to do"},
                    "master_key_id": {"type": "string", "description": "Key to provision from; defaults to the broadest key for the service"}
                },
                "required": ["prompt"]
            }),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use keyguard_proxy::{AuthRegistry, ProxyForwarder};
    use keyguard_vault::{CredentialStore, PolicyContext};

    fn server_at(project: &str) -> McpServer {
        let forwarder = ProxyForwarder::new(AuthRegistry::with_defaults()).unwrap();
        let broker = KeyGuard::new(CredentialStore::in_memory(), forwarder)
            .with_context(PolicyContext::for_project(project));
        McpServer::new(Arc::new(broker))
    }

    fn server() -> McpServer {
        server_at("/home/dev/app")
    }

    fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!(id)),
            method: method.into(),
            params,
        }
    }

    async fn call(server: &McpServer, name: &str, arguments: Value) -> McpToolResult {
        server.call_tool(name, arguments).await
    }

    #[tokio::test]
    async fn initialize_reports_protocol_version() {
        let resp = server()
            .handle_request(request(1, "initialize", json!({})))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(resp.id, Some(json!(1)));
    }

    #[tokio::test]
    async fn tools_list_names_every_tool() {
        let resp = server()
            .handle_request(request(2, "tools/list", Value::Null))
            .await
            .unwrap();
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec![
                "register_key",
                "get_mapped_key",
                "list_services",
                "list_keys",
                "remove_key",
                "create_proxy_session",
                "proxy_request",
                "smart_provision",
            ]
        );
        assert!(tools.iter().all(|t| t["inputSchema"]["type"] == "object"));
    }

    #[tokio::test]
    async fn unknown_method_is_rpc_error() {
        let resp = server()
            .handle_request(request(3, "resources/list", Value::Null))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let note = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: None,
            method: "notifications/initialized".into(),
            params: Value::Null,
        };
        assert!(server().handle_request(note).await.is_none());
    }

    #[tokio::test]
    async fn wrong_version_rejected() {
        let mut req = request(4, "ping", Value::Null);
        req.jsonrpc = "1.0".into();
        let resp = server().handle_request(req).await.unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn garbage_line_is_parse_error() {
        let resp = server().handle_line("{not json").await.unwrap();
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);
        assert!(server().handle_line("   ").await.is_none());
    }

    #[tokio::test]
    async fn tools_call_without_name_is_invalid_params() {
        let resp = server()
            .handle_request(request(5, "tools/call", json!({"arguments": {}})))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn register_then_map_hides_secret() {
        let s = server();
        let registered = call(
            &s,
            "register_key",
            json!({"service": "github", "key": "ghp_secret", "permissions": ["repo:read"]}),
        )
        .await;
        assert!(!registered.is_error());
        assert!(!registered.content[0].text.contains("ghp_secret"));

        let mapped = call(
            &s,
            "get_mapped_key",
            json!({"service": "github", "required_permissions": ["repo:read"]}),
        )
        .await;
        assert!(!mapped.is_error());
        let body: Value = serde_json::from_str(&mapped.content[0].text).unwrap();
        assert_eq!(body["service"], "github");
        assert_eq!(body["permissions"], json!(["repo:read"]));
        assert!(!mapped.content[0].text.contains("ghp_secret"));
    }

    #[tokio::test]
    async fn policy_denial_is_tool_error() {
        let s = server();
        call(
            &s,
            "register_key",
            json!({"service": "openai", "key": "sk", "permissions": ["production"]}),
        )
        .await;

        let result = call(
            &s,
            "get_mapped_key",
            json!({"service": "openai", "required_permissions": ["production"]}),
        )
        .await;
        assert!(result.is_error());
        assert!(result.content[0].text.contains("policy_denied"));
    }

    #[tokio::test]
    async fn no_matching_key_is_not_found() {
        let result = call(
            &server(),
            "get_mapped_key",
            json!({"service": "github", "required_permissions": ["repo:read"]}),
        )
        .await;
        assert!(result.is_error());
        assert!(result.content[0].text.contains("not_found"));
    }

    #[tokio::test]
    async fn missing_arguments_are_validation_errors() {
        let result = call(&server(), "register_key", json!({"service": "github"})).await;
        assert!(result.is_error());
        assert!(result.content[0].text.contains("validation"));
    }

    #[tokio::test]
    async fn unknown_tool_is_tool_error() {
        let result = call(&server(), "delete_everything", json!({})).await;
        assert!(result.is_error());
        assert!(result.content[0].text.contains("unknown tool"));
    }

    #[tokio::test]
    async fn smart_provision_disabled_without_parser() {
        let result = call(&server(), "smart_provision", json!({"prompt": "read R2"})).await;
        assert!(result.is_error());
        assert!(result.content[0].text.contains("unavailable"));
    }

    #[tokio::test]
    async fn list_services_and_keys() {
        let s = server();
        for (service, key) in [("github", "a"), ("openai", "b"), ("github", "c")] {
            call(
                &s,
                "register_key",
                json!({"service": service, "key": key, "permissions": []}),
            )
            .await;
        }

        let services = call(&s, "list_services", Value::Null).await;
        let body: Value = serde_json::from_str(&services.content[0].text).unwrap();
        assert_eq!(body["services"], json!(["github", "openai"]));

        let keys = call(&s, "list_keys", json!({"service": "github"})).await;
        let body: Value = serde_json::from_str(&keys.content[0].text).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn serve_answers_line_by_line() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
            "\n",
        );
        let mut output = Vec::new();
        server().serve(input.as_bytes(), &mut output).await.unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[1]["id"], 2);
        assert_eq!(lines[1]["result"], json!({}));
    }
}
