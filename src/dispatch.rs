use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};

use crate::{
    now_iso, parse_request_id,
    services::{QueryRequest, QueryResult},
    AppState, BridgeError,
};

pub(crate) const MAX_HTML_CHARS: usize = 20_000;

const SUMMARIZE_INSTRUCTION: &str = "Summarize the following web page content concisely:";
const ASK_CONTEXT_PREFIX: &str = "Based on this web page content:\n";
const EXPLAIN_INSTRUCTION: &str = "Explain the following text or code snippet:\n";
const ANALYZE_NETWORK_INSTRUCTION: &str = "Analyze this network activity and identify what's \
     consuming the most resources. Provide insights on potential performance issues:";
const HTML_CONTEXT_PREFIX: &str = "Current HTML structure:\n";
const DOM_CHANGES_SCHEMA: &str = r#"Suggest specific DOM changes as a JSON array. Each change should have:
- "action": one of "setText", "setHTML", "setAttribute", "addClass", "removeClass", "setStyle", "remove"
- "selector": CSS selector for the target element
- For setText/setHTML: "value" with the new content
- For setAttribute: "attribute" and "value"
- For addClass/removeClass: "className"
- For setStyle: "property" and "value"

Example response format:
```json
[
  {"action": "setText", "selector": "h1.title", "value": "New Title"},
  {"action": "setStyle", "selector": ".sidebar", "property": "display", "value": "none"}
]
```

Respond with ONLY the JSON array, no other text."#;

const QUERY_ACTIONS: &[&str] = &[
    "summarize",
    "ask",
    "explain",
    "analyze_network",
    "suggest_dom_changes",
];

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SummarizeRequest {
    content: String,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AskRequest {
    question: String,
    content: String,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ExplainRequest {
    selection: String,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AnalyzeNetworkRequest {
    network_data: Option<Value>,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SuggestDomChangesRequest {
    html: String,
    request: String,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CancelRequest {
    target_request_id: Option<Value>,
}

/// Whether `action` runs the CLI and so belongs on its own task.
pub(crate) fn is_query_action(action: &str) -> bool {
    QUERY_ACTIONS.contains(&action)
}

/// Answers one decoded frame. Every failure becomes a `success: false`
/// response; nothing here can end the read loop.
pub(crate) async fn handle(state: &AppState, frame: Value) -> Value {
    let request_id = frame.get("requestId").cloned().unwrap_or(Value::Null);
    let action = frame
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match handle_action(state, &action, &request_id, &frame).await {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!(
                action = %action,
                request_id = %request_id,
                error = %error.message,
                "request failed"
            );
            failure(&request_id, &action, &error)
        }
    }
}

async fn handle_action(
    state: &AppState,
    action: &str,
    request_id: &Value,
    frame: &Value,
) -> Result<Value, BridgeError> {
    if !frame.is_object() {
        return Err(BridgeError::invalid_params("Invalid request payload"));
    }

    match action {
        "ping" => Ok(ping(state, request_id)),
        "cancel" => {
            let request: CancelRequest = parse_params(frame)?;
            let target = parse_request_id(request.target_request_id.as_ref()).ok_or_else(|| {
                BridgeError::invalid_params("targetRequestId must be a non-negative integer")
            })?;

            let cancelled = state.registry.cancel(target);
            let result = if cancelled {
                format!("Cancelled request {target}")
            } else {
                format!("No running query for request {target}")
            };

            Ok(json!({
                "requestId": request_id,
                "success": true,
                "action": action,
                "result": result,
                "cancelled": cancelled,
                "targetRequestId": target,
            }))
        }
        _ if is_query_action(action) => {
            let numeric_id = parse_request_id(Some(request_id)).ok_or_else(|| {
                BridgeError::invalid_params("requestId must be a non-negative integer")
            })?;
            let query = build_query(action, frame, numeric_id)?;
            let result = state.query.execute(query).await;
            query_response(request_id, action, result)
        }
        _ => Err(BridgeError::unknown_action(action)),
    }
}

/// Maps a query action's fields onto the prompt and context sent to the CLI.
pub(crate) fn build_query(
    action: &str,
    frame: &Value,
    request_id: u64,
) -> Result<QueryRequest, BridgeError> {
    let (prompt, context, model) = match action {
        "summarize" => {
            let request: SummarizeRequest = parse_params(frame)?;
            (
                SUMMARIZE_INSTRUCTION.to_string(),
                request.content,
                request.model,
            )
        }
        "ask" => {
            let request: AskRequest = parse_params(frame)?;
            (
                request.question,
                format!("{ASK_CONTEXT_PREFIX}{}", request.content),
                request.model,
            )
        }
        "explain" => {
            let request: ExplainRequest = parse_params(frame)?;
            (
                format!("{EXPLAIN_INSTRUCTION}{}", request.selection),
                String::new(),
                request.model,
            )
        }
        "analyze_network" => {
            let request: AnalyzeNetworkRequest = parse_params(frame)?;
            let network_data = match request.network_data {
                None | Some(Value::Null) => Value::Array(Vec::new()),
                Some(value) => value,
            };
            let context = serde_json::to_string_pretty(&network_data)
                .map_err(|error| BridgeError::server(&error.to_string()))?;
            (
                ANALYZE_NETWORK_INSTRUCTION.to_string(),
                context,
                request.model,
            )
        }
        "suggest_dom_changes" => {
            let request: SuggestDomChangesRequest = parse_params(frame)?;
            let html = truncate_chars(&request.html, MAX_HTML_CHARS);
            (
                format!("User request: {}\n\n{DOM_CHANGES_SCHEMA}", request.request),
                format!("{HTML_CONTEXT_PREFIX}{html}"),
                request.model,
            )
        }
        _ => return Err(BridgeError::unknown_action(action)),
    };

    Ok(QueryRequest {
        prompt,
        context,
        request_id,
        model,
    })
}

fn ping(state: &AppState, request_id: &Value) -> Value {
    let claude_path = state
        .locator
        .locate()
        .map(|path| path.to_string_lossy().to_string())
        .unwrap_or_else(|_| "not found".to_string());

    json!({
        "requestId": request_id,
        "success": true,
        "action": "ping",
        "result": "pong",
        "claudePath": claude_path,
        "defaultModel": state.config.default_model,
        "timeoutSecs": state.config.query_timeout.as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "at": now_iso(),
        "uptimeSec": state.started_at.elapsed().as_secs(),
    })
}

/// The executor's result with `result`/`success` aliased on top, plus
/// `error` on failure.
fn query_response(
    request_id: &Value,
    action: &str,
    result: QueryResult,
) -> Result<Value, BridgeError> {
    let mut body = match serde_json::to_value(&result) {
        Ok(Value::Object(body)) => body,
        Ok(_) => Map::new(),
        Err(error) => return Err(BridgeError::server(&error.to_string())),
    };

    body.insert("requestId".to_string(), request_id.clone());
    body.insert("action".to_string(), Value::String(action.to_string()));
    body.insert("success".to_string(), Value::Bool(result.success));
    body.insert("result".to_string(), Value::String(result.response.clone()));
    if !result.success {
        body.insert("error".to_string(), Value::String(result.response));
    }

    Ok(Value::Object(body))
}

pub(crate) fn failure(request_id: &Value, action: &str, error: &BridgeError) -> Value {
    json!({
        "requestId": request_id,
        "success": false,
        "action": action,
        "error": error.message,
        "errorCode": error.code,
    })
}

fn parse_params<T: DeserializeOwned>(frame: &Value) -> Result<T, BridgeError> {
    T::deserialize(frame).map_err(|error| BridgeError::invalid_params(&error.to_string()))
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
