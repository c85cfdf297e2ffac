//! The request dispatch table: `event_name` to handler, with params decoded
//! per event and every outcome folded into a payload.
//!
//! Handlers never bubble errors to the socket loop. A bad parameter set or a
//! failed filesystem call becomes `response.{success:false,error}` inside an
//! ordinary response envelope; only unknown events produce no response at
//! all (they are logged and dropped, matching the protocol rules).

use std::sync::Arc;

use hyper_tungstenite::tungstenite::Message;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::fs_gateway::FsGateway;

use super::{
    forward_to_host,
    interface::{
        is_host_forwarded, DirPathParams, DirPathsParams, EventFrame, FilePathParams,
        FilePathsParams, ProxyInfoPayload, RequestEnvelope, ResponseEnvelope, SearchParams,
        SetCounterParams, TreeParams, UnixClientInfo, WriteFileManyParams, WriteFileParams,
        SERVER_VERSION,
    },
    BusState,
};

pub(super) async fn dispatch(state: Arc<BusState>, connection_id: Uuid, envelope: RequestEnvelope) {
    if is_host_forwarded(&envelope.event_name) {
        forward_to_host(&state, connection_id, envelope);
        return;
    }

    let event_name = envelope.event_name.clone();
    let message_id = envelope.message_id.clone();

    let Some(payload) = handle_local(&state, envelope).await else {
        log::warn!("Unknown event '{}' ignored", event_name);
        return;
    };

    let response = ResponseEnvelope {
        event_response: event_name,
        message_id,
        payload,
    };

    match serde_json::to_string(&response) {
        Ok(serialized) => {
            state
                .registry
                .send_to(connection_id, Message::text(serialized));
        }
        Err(err) => log::error!(
            "Could not serialize '{}' response: {}",
            response.event_response,
            err
        ),
    }
}

/// Produces the payload for a locally-handled event, or `None` for an
/// unknown one.
async fn handle_local(state: &Arc<BusState>, envelope: RequestEnvelope) -> Option<Value> {
    let params = envelope.params;

    let payload = match envelope.event_name.as_str() {
        "read_file" => {
            with_gateway(state, params, |gateway, p: FilePathParams| {
                to_value(gateway.read_file(&p.file_path))
            })
            .await
        }
        "read_file_many" => {
            with_gateway(state, params, |gateway, p: FilePathsParams| {
                to_value(gateway.read_file_many(&p.file_paths))
            })
            .await
        }
        "write_file" => {
            with_gateway(state, params, |gateway, p: WriteFileParams| {
                to_value(gateway.write_file(&p.file_path, &p.content))
            })
            .await
        }
        "write_file_many" => {
            with_gateway(state, params, |gateway, p: WriteFileManyParams| {
                to_value(gateway.write_file_many(&p.files))
            })
            .await
        }
        "exists" => {
            with_gateway(state, params, |gateway, p: FilePathParams| {
                to_value(gateway.exists(&p.file_path))
            })
            .await
        }
        "exists_many" => {
            with_gateway(state, params, |gateway, p: FilePathsParams| {
                to_value(gateway.exists_many(&p.file_paths))
            })
            .await
        }
        "ls" => {
            with_gateway(state, params, |gateway, p: DirPathParams| {
                to_value(gateway.ls(&p.dir_path))
            })
            .await
        }
        "ls_many" => {
            with_gateway(state, params, |gateway, p: DirPathsParams| {
                to_value(gateway.ls_many(&p.dir_paths))
            })
            .await
        }
        "rm" => {
            with_gateway(state, params, |gateway, p: FilePathParams| {
                to_value(gateway.rm(&p.file_path))
            })
            .await
        }
        "rm_many" => {
            with_gateway(state, params, |gateway, p: FilePathsParams| {
                to_value(gateway.rm_many(&p.file_paths))
            })
            .await
        }
        "tree" => {
            with_gateway(state, params, |gateway, p: TreeParams| {
                to_value(gateway.tree(p.dir_path.as_deref()))
            })
            .await
        }
        "tree_many" => {
            with_gateway(state, params, |gateway, p: DirPathsParams| {
                to_value(gateway.tree_many(&p.dir_paths))
            })
            .await
        }
        "search" => {
            with_gateway(state, params, |gateway, p: SearchParams| {
                to_value(gateway.search(&p))
            })
            .await
        }
        "get_project_info" => {
            let gateway = Arc::clone(&state.gateway);
            run_blocking(move || to_value(gateway.project_info())).await
        }
        "get_prompt_rules" => {
            let gateway = Arc::clone(&state.gateway);
            run_blocking(move || to_value(gateway.prompt_rules())).await
        }
        "get_version" => json!({ "version": SERVER_VERSION }),
        "get_proxy_info" => {
            let config = state.config.read().unwrap();
            to_value(ProxyInfoPayload {
                proxy_host: config.proxy_host.clone(),
                proxy_port: config.proxy_port,
                proxy_protocol: config.proxy_protocol.to_string(),
                server_host: config.server_host.clone(),
                server_port: config.server_port,
                server_protocol: config.server_protocol.to_string(),
                ws_url: config.ws_url(),
                enabled: !config.no_proxy,
            })
        }
        "get_unix_client_info" => to_value(UnixClientInfo {
            connected: state.desktop.peer_count() > 0,
            role: state.desktop.role().as_str().to_owned(),
            peer_count: state.desktop.peer_count(),
        }),
        "set_should_modify_next_object_counter" => match parse::<SetCounterParams>(params) {
            Ok(p) => {
                state
                    .config
                    .write()
                    .unwrap()
                    .should_modify_next_object_counter = p.value;
                json!({ "response": { "success": true } })
            }
            Err(message) => param_error(message),
        },
        "open_file" | "open_element" => {
            // Fire-and-forget push to the desktop app.
            let frame = EventFrame {
                event_name: envelope.event_name.clone(),
                payload: params,
            };
            state
                .desktop
                .broadcast(&serde_json::to_value(frame).unwrap_or(Value::Null));
            json!({ "response": { "success": true } })
        }
        "lsp_request" => lang_payload(state, "jsonrpc", params).await,
        "open_files" => lang_payload(state, "init_open_files", params).await,
        "check_diagnostics" => lang_payload(state, "check_diagnostics", params).await,
        _ => return None,
    };

    Some(payload)
}

async fn lang_payload(state: &Arc<BusState>, kind: &str, params: Value) -> Value {
    match state.lang.request(kind, params).await {
        Ok(reply) => json!({ "response": { "success": true, "data": reply } }),
        Err(err) => json!({ "response": { "success": false, "error": err.to_string() } }),
    }
}

/// Decodes params and runs a gateway operation off the async loop.
async fn with_gateway<P, F>(state: &Arc<BusState>, params: Value, op: F) -> Value
where
    P: DeserializeOwned + Send + 'static,
    F: FnOnce(&FsGateway, P) -> Value + Send + 'static,
{
    let parsed: P = match parse(params) {
        Ok(parsed) => parsed,
        Err(message) => return param_error(message),
    };

    let gateway = Arc::clone(&state.gateway);
    run_blocking(move || op(&gateway, parsed)).await
}

async fn run_blocking(op: impl FnOnce() -> Value + Send + 'static) -> Value {
    match tokio::task::spawn_blocking(op).await {
        Ok(value) => value,
        Err(err) => json!({
            "response": { "success": false, "error": format!("Handler panicked: {}", err) },
        }),
    }
}

fn parse<P: DeserializeOwned>(params: Value) -> Result<P, String> {
    serde_json::from_value(params).map_err(|err| format!("Invalid params: {}", err))
}

fn param_error(message: String) -> Value {
    json!({ "response": { "success": false, "error": message } })
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
