//! Classification of Finance OS responses.
//!
//! Kept free of reqwest so the status/body rules can be tested directly.

use serde_json::Value;
use tabula_core::{AggregateSubmission, ApiError, FieldInfo, PollResponse, Record, TableInfo, TableSchema};

const PROCESSING_STATUSES: &[&str] = &["processing", "pending", "running", "queued", "in_progress"];
const FAILED_STATUSES: &[&str] = &["failed", "error", "failure"];
const COUNT_KEYS: &[&str] = &["total_count", "total", "count"];

/// Maps a non-success status to an [`ApiError`].
pub fn classify_status(status: u16, body: &str) -> ApiError {
    let message = error_message(body).unwrap_or_else(|| truncate(body, 300));
    match status {
        401 | 403 => ApiError::Unauthorized { status },
        500..=599 => ApiError::Server { status, message },
        _ => ApiError::Client { status, message },
    }
}

/// Extracts the `data` array from a `{data: [...]}` envelope.
pub fn parse_records(body: Value) -> Result<Vec<Record>, ApiError> {
    let data = match body {
        Value::Object(mut envelope) => envelope
            .remove("data")
            .ok_or_else(|| ApiError::Decode("response has no `data` field".into()))?,
        // Some deployments answer with a bare array.
        array @ Value::Array(_) => array,
        other => {
            return Err(ApiError::Decode(format!(
                "expected an object or array, got {}",
                type_name(&other)
            )));
        }
    };

    match data {
        Value::Array(rows) => rows
            .into_iter()
            .map(|row| match row {
                Value::Object(record) => Ok(record),
                other => Err(ApiError::Decode(format!(
                    "expected row objects, got {}",
                    type_name(&other)
                ))),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(ApiError::Decode(format!(
            "`data` is {}, expected an array",
            type_name(&other)
        ))),
    }
}

/// Reads the total row count from the envelope of a `limit: 1` data request.
pub fn parse_count(body: &Value) -> Result<u64, ApiError> {
    let sources = [Some(body), body.get("meta"), body.get("pagination")];
    for source in sources.into_iter().flatten() {
        for key in COUNT_KEYS {
            if let Some(count) = source.get(*key).and_then(as_count) {
                return Ok(count);
            }
        }
    }
    Err(ApiError::Decode(
        "response carries no total_count/total/count".into(),
    ))
}

/// Interprets the answer to an aggregation submit.
///
/// `location` is the `Location` header, if present. `table_root` is the
/// aggregate URL, used to build a poll URL from a bare task id.
pub fn parse_submission(
    status: u16,
    location: Option<&str>,
    body: &str,
    table_root: &str,
) -> Result<AggregateSubmission, ApiError> {
    let json: Option<Value> = serde_json::from_str(body).ok();

    if status == 202 {
        if let Some(location) = location.filter(|l| !l.trim().is_empty()) {
            return Ok(AggregateSubmission::Accepted {
                handle: location.trim().to_string(),
            });
        }
        if let Some(handle) = json.as_ref().and_then(|b| poll_handle(b, table_root)) {
            return Ok(AggregateSubmission::Accepted { handle });
        }
        return Err(ApiError::Decode(
            "202 Accepted without Location header or task id".into(),
        ));
    }

    if (200..300).contains(&status) {
        let body = json.ok_or_else(|| ApiError::Decode("aggregate body is not JSON".into()))?;
        if let Some(failure) = failure_of(&body) {
            return Ok(AggregateSubmission::Rejected {
                message: failure.0,
                field: failure.1,
            });
        }
        // 200 that still only carries a task reference
        if body.get("data").is_none() {
            if let Some(handle) = poll_handle(&body, table_root) {
                return Ok(AggregateSubmission::Accepted { handle });
            }
        }
        return parse_records(body).map(AggregateSubmission::Ready);
    }

    if matches!(status, 400 | 404 | 422) {
        let (message, field) = json
            .as_ref()
            .and_then(failure_of)
            .unwrap_or_else(|| (truncate(body, 300), None));
        return Ok(AggregateSubmission::Rejected { message, field });
    }

    Err(classify_status(status, body))
}

/// Interprets one poll answer.
pub fn parse_poll(status: u16, body: &str) -> Result<PollResponse, ApiError> {
    if status == 202 {
        return Ok(PollResponse::Processing);
    }
    if !(200..300).contains(&status) {
        return Err(classify_status(status, body));
    }

    let body: Value = serde_json::from_str(body)
        .map_err(|e| ApiError::Decode(format!("poll body is not JSON: {}", e)))?;

    if let Some(status) = body.get("status").and_then(Value::as_str) {
        let status = status.to_ascii_lowercase();
        if PROCESSING_STATUSES.contains(&status.as_str()) {
            return Ok(PollResponse::Processing);
        }
    }
    if let Some((message, field)) = failure_of(&body) {
        return Ok(PollResponse::Failed { message, field });
    }
    let mut body = body;
    if body.get("data").is_none() {
        // Finished tasks on some deployments report rows under `result`.
        if let Some(object) = body.as_object_mut() {
            if let Some(result) = object.remove("result") {
                object.insert("data".into(), result);
            }
        }
    }
    parse_records(body).map(PollResponse::Ready)
}

/// Reads the table listing (`{data: [...]}` or a bare array).
pub fn parse_tables(body: Value) -> Result<Vec<TableInfo>, ApiError> {
    let entries = match unwrap_data(body) {
        Value::Array(entries) => entries,
        Value::Null => Vec::new(),
        other => {
            return Err(ApiError::Decode(format!(
                "table listing is {}, expected an array",
                type_name(&other)
            )));
        }
    };

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let id = entry.get("id").and_then(id_text)?;
            Some(TableInfo {
                id,
                name: entry.get("name").and_then(Value::as_str).map(str::to_string),
                alias: entry.get("alias").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect())
}

/// Reads the column definitions of `table`.
pub fn parse_schema(table: &str, body: Value) -> Result<TableSchema, ApiError> {
    let schema = unwrap_data(body);
    if !schema.is_object() {
        return Err(ApiError::Decode(format!(
            "schema of table {} is {}, expected an object",
            table,
            type_name(&schema)
        )));
    }

    let fields = schema
        .get("fields")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(|field| {
                    Some(FieldInfo {
                        name: field.get("name").and_then(Value::as_str)?.to_string(),
                        field_type: field.get("type").and_then(Value::as_str).map(str::to_string),
                        alias: field.get("alias").and_then(Value::as_str).map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(TableSchema {
        table: table.to_string(),
        name: schema.get("name").and_then(Value::as_str).map(str::to_string),
        alias: schema.get("alias").and_then(Value::as_str).map(str::to_string),
        fields,
    })
}

/// Reads `{data: {values: [...]}}` from the distinct-values endpoint.
pub fn parse_distinct(body: Value) -> Result<Vec<Value>, ApiError> {
    match unwrap_data(body) {
        Value::Object(mut object) => match object.remove("values") {
            Some(Value::Array(values)) => Ok(values),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(ApiError::Decode(format!(
                "`values` is {}, expected an array",
                type_name(&other)
            ))),
        },
        Value::Array(values) => Ok(values),
        Value::Null => Ok(Vec::new()),
        other => Err(ApiError::Decode(format!(
            "distinct values are {}, expected an object",
            type_name(&other)
        ))),
    }
}

/// The `data` member of an envelope, or the body itself.
fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut envelope) if envelope.contains_key("data") => {
            envelope.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `Some((message, field))` when the body reports a failure.
fn failure_of(body: &Value) -> Option<(String, Option<String>)> {
    let failed_status = body
        .get("status")
        .and_then(Value::as_str)
        .map(|s| FAILED_STATUSES.contains(&s.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    let success_false = body.get("success").and_then(Value::as_bool) == Some(false);
    let has_error = body.get("error").is_some_and(|e| !e.is_null()) && body.get("data").is_none();

    if !(failed_status || success_false || has_error) {
        return None;
    }

    let message = ["error", "detail", "message"]
        .iter()
        .find_map(|key| body.get(*key).and_then(text_of))
        .unwrap_or_else(|| "aggregation failed".to_string());
    let field = body
        .get("field")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            body.get("error")
                .and_then(|e| e.get("field"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
    Some((message, field))
}

fn poll_handle(body: &Value, table_root: &str) -> Option<String> {
    if let Some(url) = body.get("poll_url").and_then(Value::as_str) {
        return Some(url.to_string());
    }
    let task_id = body.get("task_id").and_then(id_text)?;
    Some(format!("{}/{}", table_root.trim_end_matches('/'), task_id))
}

fn error_message(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    ["error", "detail", "message"]
        .iter()
        .find_map(|key| json.get(*key).and_then(text_of))
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        Value::Object(object) => object
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{}...", head)
    }
}
