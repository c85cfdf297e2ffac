//! Types for the message-bus wire protocol. Editor clients, the desktop app,
//! and the host agent all speak these shapes as JSON text frames.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The version of the sidecar reported to clients.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// URL path of the bus WebSocket endpoint.
pub const SOCKET_ENDPOINT: &str = "/jsx-tool-socket";

/// A signed request frame from an editor client.
///
/// `signature` is base-64 IEEE-P1363 ECDSA-P256 over the canonical JSON of
/// the other fields; see [`crate::keys::canonical_request_bytes`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub event_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub message_id: String,
}

/// A response frame. There is no transport-level error channel: domain
/// failures ride inside `payload.response.{success,error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub event_response: String,
    pub message_id: String,
    pub payload: Value,
}

/// A spontaneous event pushed by the bus (or the desktop peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event_name: String,
    #[serde(default)]
    pub payload: Value,
}

/// Wrapper the bus sends to the host agent for host-side requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostForward {
    /// Always `"host_forward"`.
    pub event_name: String,
    pub request_uuid: String,
    pub workspace_dir: String,
    pub wrapped_request: RequestEnvelope,
}

/// The agent's answer to a [`HostForward`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostResponse {
    /// Always `"host_response"`.
    pub event_name: String,
    pub request_uuid: String,
    pub wrapped_response: ResponseEnvelope,
}

/// An event the agent asks the bus to fan out to editor clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostBroadcast {
    /// Always `"host_broadcast"`.
    pub event_name: String,
    pub wrapped_event: EventFrame,
}

/// Events the bus does not answer locally but relays to the host agent.
pub fn is_host_forwarded(event_name: &str) -> bool {
    matches!(
        event_name,
        "get_git_status"
            | "copy_to_clipboard"
            | "import_items"
            | "create_terminal_session"
            | "send_terminal_input"
            | "resize_terminal_session"
            | "get_terminal_logs"
            | "kill_terminal_session"
            | "run_terminal_command"
    )
}

/// The success-or-error shape nested under `payload.response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct OpResult<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> OpResult<T> {
    pub fn ok(data: T) -> Self {
        OpResult {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl ToString) -> Self {
        OpResult {
            success: false,
            data: None,
            error: Some(message.to_string()),
        }
    }
}

impl OpResult<()> {
    /// A success with no data, for write-style operations.
    pub fn done() -> Self {
        OpResult {
            success: true,
            data: None,
            error: None,
        }
    }
}

/// Payload for single-file operations: the echoed path plus the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse<T> {
    pub file_path: String,
    pub response: OpResult<T>,
}

/// Payload for directory operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirResponse<T> {
    pub dir_path: String,
    pub response: OpResult<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LsEntry {
    pub name: String,
    pub is_directory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitFileStatus {
    pub absolute_path: String,
    pub staged: bool,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusInfo {
    pub branch: Option<String>,
    pub head_commit: Option<String>,
    pub head_message: Option<String>,
    pub files: Vec<GitFileStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusPayload {
    pub is_git_repo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_info: Option<GitStatusInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub file_path: String,
    pub line_number: u64,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPayload {
    pub success: bool,
    pub results: Vec<SearchMatch>,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfoPayload {
    pub working_directory: String,
    pub node_modules_dir: String,
    pub additional_directories: Vec<String>,
    pub package_name: Option<String>,
    pub package_version: Option<String>,
    pub ws_url: String,
    pub server_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInfoPayload {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_protocol: String,
    pub server_host: String,
    pub server_port: u16,
    pub server_protocol: String,
    pub ws_url: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnixClientInfo {
    pub connected: bool,
    pub role: String,
    pub peer_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub key_ready: bool,
    pub server_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeType {
    Added,
    Removed,
    Changed,
}

/// One debounced filesystem change, as broadcast in `updated_project_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeEvent {
    #[serde(rename = "type")]
    pub change_type: FileChangeType,
    pub absolute_path: String,
}

// Request parameter shapes. Unknown events keep their params as raw JSON.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePathParams {
    pub file_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePathsParams {
    pub file_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileParams {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileManyParams {
    pub files: Vec<WriteFileParams>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirPathParams {
    pub dir_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirPathsParams {
    pub dir_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeParams {
    #[serde(default)]
    pub dir_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub case_sensitive: Option<bool>,
    pub whole_word: bool,
    pub fixed_strings: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub context_lines: Option<u32>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub pattern: String,
    #[serde(default)]
    pub options: SearchOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRegisteredParams {
    pub uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCounterParams {
    pub value: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInitParams {
    /// Unix epoch milliseconds; rejected when too far from the bus clock.
    pub timestamp: u64,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalParams {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTerminalInputParams {
    pub session_id: String,
    pub input: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeTerminalParams {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTerminalLogsParams {
    pub session_id: String,
    #[serde(default)]
    pub cursor: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTerminalCommandParams {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyToClipboardParams {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportItemsParams {
    pub items: Vec<ImportItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportItem {
    pub source_path: String,
    #[serde(default)]
    pub target_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSessionPayload {
    pub session_id: String,
    pub response: OpResult<()>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalLogChunk {
    pub seq: u64,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalLogsPayload {
    pub session_id: String,
    pub cursor: u64,
    pub logs: Vec<TerminalLogChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCommandPayload {
    pub output: String,
    pub exit_code: Option<i32>,
}
