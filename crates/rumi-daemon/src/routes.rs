// SPDX-License-Identifier: MIT OR Apache-2.0
//! Route handlers.
//!
//! Success bodies are endpoint-shaped; failures all use the uniform
//! `{"success": false, "error": "..."}` envelope via [`ApiError`].

use crate::error::ApiError;
use crate::flows::{truncate_result, DEFAULT_FLOW_TIMEOUT};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rumi_core::{ErrorKind, KernelError};
use rumi_exec::{CapabilityRequest, UnitMeta, UnitRef};
use rumi_store::{CasOutcome, Expectation};
use rumi_trust::TrustedEntry;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Handler = Result<Json<Value>, ApiError>;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

// ---------------------------------------------------------------------------
// Packs
// ---------------------------------------------------------------------------

pub async fn list_packs(State(state): State<Arc<AppState>>) -> Handler {
    let packs: Vec<Value> = state
        .approval
        .list_packs()
        .into_iter()
        .map(|r| json!({ "pack_id": r.pack_id, "status": r.status.as_str() }))
        .collect();
    Ok(Json(json!(packs)))
}

pub async fn scan_packs(State(state): State<Arc<AppState>>) -> Handler {
    let records = state.approval.scan_packs()?;
    Ok(Json(json!({
        "success": true,
        "count": records.len(),
        "packs": records
            .iter()
            .map(|r| json!({ "pack_id": r.pack_id, "status": r.status.as_str() }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct PackManifestStores {
    #[serde(default)]
    stores: Vec<Value>,
}

pub async fn approve_pack(
    State(state): State<Arc<AppState>>,
    Path(pack_id): Path<String>,
) -> Handler {
    let record = state.approval.approve(&pack_id)?;

    // Post-approval installers: declared stores and the egress socket.
    let manifest_path = state.packs_root.join(&pack_id).join("pack.json");
    if let Ok(raw) = std::fs::read_to_string(&manifest_path) {
        if let Ok(manifest) = serde_json::from_str::<PackManifestStores>(&raw) {
            let declared: Vec<String> = manifest
                .stores
                .iter()
                .filter_map(|entry| match entry {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(o) => o
                        .get("store_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                })
                .collect();
            if !declared.is_empty() {
                for result in state.stores.create_stores_for_pack(&pack_id, &declared) {
                    if !result.success {
                        tracing::warn!(
                            pack_id,
                            store_id = %result.store_id,
                            error = ?result.error,
                            "declared store creation failed"
                        );
                    }
                }
            }
        }
    }
    if let Err(e) = state.ensure_egress_socket(&pack_id) {
        tracing::warn!(pack_id, error = %e, "failed to start egress socket");
    }

    Ok(Json(json!({
        "success": true,
        "pack_id": record.pack_id,
        "status": record.status.as_str(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    reason: Option<String>,
}

pub async fn reject_pack(
    State(state): State<Arc<AppState>>,
    Path(pack_id): Path<String>,
    body: Option<Json<RejectBody>>,
) -> Handler {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "rejected by operator".to_string());
    let record = state.approval.reject(&pack_id, &reason)?;
    Ok(Json(json!({
        "success": true,
        "pack_id": record.pack_id,
        "status": record.status.as_str(),
    })))
}

pub async fn uninstall_pack(
    State(state): State<Arc<AppState>>,
    Path(pack_id): Path<String>,
) -> Handler {
    state.drop_egress_socket(&pack_id);
    state.importer.uninstall(&pack_id, &state.packs_root)?;
    state.approval.forget(&pack_id)?;
    Ok(Json(json!({ "success": true, "pack_id": pack_id })))
}

#[derive(Debug, Deserialize)]
pub struct ImportBody {
    path: String,
    #[serde(default)]
    notes: Option<String>,
}

pub async fn import_pack(State(state): State<Arc<AppState>>, Json(body): Json<ImportBody>) -> Handler {
    let result = state.importer.import_pack(
        std::path::Path::new(&body.path),
        body.notes.as_deref().unwrap_or(""),
        "api_user",
    )?;
    Ok(Json(json!({
        "success": true,
        "staging_id": result.staging_id,
        "pack_ids": result.pack_ids,
        "meta": result.meta,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ApplyBody {
    staging_id: String,
    #[serde(default)]
    mode: Option<String>,
}

pub async fn apply_pack(State(state): State<Arc<AppState>>, Json(body): Json<ApplyBody>) -> Handler {
    let overwrite = match body.mode.as_deref() {
        None | Some("install") => false,
        Some("overwrite") => true,
        Some(other) => {
            return Err(KernelError::invalid(format!("unknown apply mode: {other}")).into());
        }
    };
    let pack_ids = state
        .importer
        .apply(&body.staging_id, &state.packs_root, overwrite)?;
    // Newly applied packs enter the approval lifecycle as pending.
    state.approval.scan_packs()?;
    Ok(Json(json!({ "success": true, "pack_ids": pack_ids })))
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

pub async fn list_secrets(State(state): State<Arc<AppState>>) -> Handler {
    let keys = state.secrets.list_keys();
    Ok(Json(json!({ "keys": keys, "count": keys.len() })))
}

#[derive(Debug, Deserialize)]
pub struct SecretSetBody {
    key: String,
    value: String,
}

pub async fn set_secret(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SecretSetBody>,
) -> Handler {
    let result = state.secrets.set_secret(&body.key, &body.value, "api_user")?;
    Ok(Json(json!({ "success": true, "created": result.created })))
}

#[derive(Debug, Deserialize)]
pub struct SecretDeleteBody {
    key: String,
}

pub async fn delete_secret(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SecretDeleteBody>,
) -> Handler {
    state.secrets.delete_secret(&body.key, "api_user")?;
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

pub async fn list_stores(State(state): State<Arc<AppState>>) -> Handler {
    let stores = state.stores.list_stores()?;
    Ok(Json(json!({ "stores": stores, "count": stores.len() })))
}

#[derive(Debug, Deserialize)]
pub struct StoreCreateBody {
    store_id: String,
    #[serde(default)]
    root_path: Option<String>,
}

pub async fn create_store(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StoreCreateBody>,
) -> Handler {
    state
        .stores
        .create_store(&body.store_id, body.root_path.as_deref(), "api_user")?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct StoreDeleteBody {
    store_id: String,
    #[serde(default)]
    delete_files: bool,
}

pub async fn delete_store(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StoreDeleteBody>,
) -> Handler {
    state.stores.delete_store(&body.store_id, body.delete_files)?;
    Ok(Json(json!({ "success": true })))
}

/// Absent field → expect-missing; literal JSON null → expect stored null.
fn some_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct CasBody {
    store_id: String,
    key: String,
    #[serde(default, deserialize_with = "some_value")]
    expected_value: Option<Value>,
    new_value: Value,
}

pub async fn cas(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CasBody>,
) -> Result<Response, ApiError> {
    let expectation = Expectation::from_wire(body.expected_value);
    let stores = Arc::clone(&state.stores);
    let outcome = tokio::task::spawn_blocking(move || {
        stores.cas(&body.store_id, &body.key, expectation, &body.new_value)
    })
    .await
    .map_err(|_| ApiError::internal())??;

    match outcome {
        CasOutcome::Success => Ok(Json(json!({ "success": true })).into_response()),
        CasOutcome::Conflict { current_value } => Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "error": "Value mismatch (conflict)",
                "error_type": ErrorKind::Conflict.as_str(),
                "current_value": current_value,
            })),
        )
            .into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListKeysBody {
    store_id: String,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    cursor: Option<String>,
}

pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ListKeysBody>,
) -> Handler {
    let stores = Arc::clone(&state.stores);
    let result = tokio::task::spawn_blocking(move || {
        stores.list_keys(&body.store_id, &body.prefix, body.limit, body.cursor.as_deref())
    })
    .await
    .map_err(|_| ApiError::internal())??;
    let mut out = serde_json::to_value(&result).map_err(|_| ApiError::internal())?;
    out["success"] = json!(true);
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
pub struct BatchGetBody {
    store_id: String,
    keys: Vec<String>,
}

pub async fn batch_get(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchGetBody>,
) -> Handler {
    let stores = Arc::clone(&state.stores);
    let result = tokio::task::spawn_blocking(move || stores.batch_get(&body.store_id, &body.keys))
        .await
        .map_err(|_| ApiError::internal())??;
    let mut out = serde_json::to_value(&result).map_err(|_| ApiError::internal())?;
    out["success"] = json!(true);
    Ok(Json(out))
}

// ---------------------------------------------------------------------------
// Store sharing
// ---------------------------------------------------------------------------

pub async fn list_shared(State(state): State<Arc<AppState>>) -> Handler {
    let entries = state.sharing.list_shared_stores();
    Ok(Json(json!({ "entries": entries, "count": entries.len() })))
}

#[derive(Debug, Deserialize)]
pub struct SharingBody {
    provider_pack_id: String,
    consumer_pack_id: String,
    store_id: String,
}

pub async fn approve_sharing(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SharingBody>,
) -> Handler {
    state.sharing.approve_sharing(
        &body.provider_pack_id,
        &body.consumer_pack_id,
        &body.store_id,
        "api_user",
    )?;
    Ok(Json(json!({ "success": true })))
}

pub async fn revoke_sharing(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SharingBody>,
) -> Handler {
    state.sharing.revoke_sharing(
        &body.provider_pack_id,
        &body.consumer_pack_id,
        &body.store_id,
    )?;
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UnitsQuery {
    store_id: String,
}

pub async fn list_units(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UnitsQuery>,
) -> Handler {
    let store = state
        .stores
        .get_store(&query.store_id)?
        .ok_or_else(|| ApiError::not_found(format!("Store not found: {}", query.store_id)))?;
    let units = state.units.list_units(std::path::Path::new(&store.root_path));
    Ok(Json(json!({ "units": units, "count": units.len() })))
}

#[derive(Debug, Deserialize)]
pub struct UnitPublishBody {
    store_id: String,
    unit: UnitMeta,
}

pub async fn publish_unit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UnitPublishBody>,
) -> Handler {
    let store = state
        .stores
        .get_store(&body.store_id)?
        .ok_or_else(|| ApiError::not_found(format!("Store not found: {}", body.store_id)))?;
    let unit_dir = state
        .units
        .publish_unit(std::path::Path::new(&store.root_path), &body.unit)?;
    Ok(Json(json!({
        "success": true,
        "unit_dir": unit_dir.to_string_lossy(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct UnitExecuteBody {
    principal_id: String,
    unit_ref: UnitRef,
    mode: String,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    timeout_seconds: Option<f64>,
}

pub async fn execute_unit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UnitExecuteBody>,
) -> Handler {
    let result = state
        .unit_executor
        .execute(
            &body.principal_id,
            &body.unit_ref,
            &body.mode,
            &body.args.unwrap_or_else(|| json!({})),
            body.timeout_seconds.unwrap_or(60.0),
        )
        .await;
    Ok(Json(serde_json::to_value(&result).map_err(|_| ApiError::internal())?))
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CapabilityExecuteBody {
    principal_id: String,
    #[serde(flatten)]
    request: CapabilityRequest,
}

pub async fn execute_capability(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CapabilityExecuteBody>,
) -> Handler {
    let response = state
        .capability_executor
        .execute(&body.principal_id, body.request)
        .await;
    Ok(Json(serde_json::to_value(&response).map_err(|_| ApiError::internal())?))
}

// ---------------------------------------------------------------------------
// Privileges (grants)
// ---------------------------------------------------------------------------

pub async fn list_privileges(
    State(state): State<Arc<AppState>>,
    Path(permission_type): Path<String>,
) -> Handler {
    let grants = state.grants_for(&permission_type)?.list_grants();
    Ok(Json(json!({ "grants": grants, "count": grants.len() })))
}

#[derive(Debug, Deserialize)]
pub struct GrantBody {
    #[serde(default = "default_permission_type")]
    permission_type: String,
    principal_id: String,
    permission_id: String,
    #[serde(default)]
    config: Option<Map<String, Value>>,
}

fn default_permission_type() -> String {
    "capability".to_string()
}

pub async fn grant_privilege(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GrantBody>,
) -> Handler {
    state.grants_for(&body.permission_type)?.grant_permission(
        &body.principal_id,
        &body.permission_id,
        body.config.unwrap_or_default(),
    )?;
    Ok(Json(json!({ "success": true })))
}

pub async fn revoke_privilege(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GrantBody>,
) -> Handler {
    let revoked = state
        .grants_for(&body.permission_type)?
        .revoke_permission(&body.principal_id, &body.permission_id)?;
    if !revoked {
        return Err(ApiError::not_found("No such grant"));
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct PrincipalBody {
    #[serde(default = "default_permission_type")]
    permission_type: String,
    principal_id: String,
}

pub async fn revoke_all_privileges(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PrincipalBody>,
) -> Handler {
    let revoked = state
        .grants_for(&body.permission_type)?
        .revoke_all(&body.principal_id)?;
    if !revoked {
        return Err(ApiError::not_found("No grant for principal"));
    }
    Ok(Json(json!({ "success": true })))
}

pub async fn delete_grant(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PrincipalBody>,
) -> Handler {
    let deleted = state
        .grants_for(&body.permission_type)?
        .delete_grant(&body.principal_id)?;
    if !deleted {
        return Err(ApiError::not_found("No grant for principal"));
    }
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Trust
// ---------------------------------------------------------------------------

fn trust_store_for<'a>(
    state: &'a AppState,
    flavor: &str,
) -> Result<&'a Arc<rumi_trust::TrustStore>, ApiError> {
    match flavor {
        "units" => Ok(&state.unit_trust),
        "handlers" => Ok(&state.handler_trust),
        other => Err(ApiError::bad_request(format!("unknown trust flavor: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct TrustQuery {
    #[serde(default)]
    kind: Option<String>,
}

pub async fn list_trusted(
    State(state): State<Arc<AppState>>,
    Path(flavor): Path<String>,
    Query(query): Query<TrustQuery>,
) -> Handler {
    let entries = trust_store_for(&state, &flavor)?.list_trusted(query.kind.as_deref());
    Ok(Json(json!({ "trusted": entries, "count": entries.len() })))
}

pub async fn add_trusted(
    State(state): State<Arc<AppState>>,
    Path(flavor): Path<String>,
    Json(entry): Json<TrustedEntry>,
) -> Handler {
    trust_store_for(&state, &flavor)?.add_trust(entry)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct TrustRemoveBody {
    id: String,
    #[serde(default)]
    version: Option<String>,
}

pub async fn remove_trusted(
    State(state): State<Arc<AppState>>,
    Path(flavor): Path<String>,
    Json(body): Json<TrustRemoveBody>,
) -> Handler {
    let removed =
        trust_store_for(&state, &flavor)?.remove_trust(&body.id, body.version.as_deref())?;
    if !removed {
        return Err(ApiError::not_found("No such trust entry"));
    }
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct AuditQueryParams {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    pack_id: Option<String>,
    #[serde(default)]
    flow_id: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> Handler {
    let category = match params.category.as_deref() {
        None => None,
        Some(raw) => Some(
            serde_json::from_value(json!(raw))
                .map_err(|_| ApiError::bad_request(format!("unknown category: {raw}")))?,
        ),
    };
    let entries = state.audit.query(&rumi_audit::AuditQuery {
        category,
        start_date: params.start_date,
        end_date: params.end_date,
        pack_id: params.pack_id,
        flow_id: params.flow_id,
        success: params.success,
        limit: params.limit.unwrap_or(1000),
    });
    Ok(Json(json!({ "entries": entries, "count": entries.len() })))
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct FlowRunBody {
    #[serde(default)]
    inputs: Option<Value>,
    #[serde(default)]
    timeout: Option<f64>,
}

pub async fn run_flow(
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    body: Option<Json<FlowRunBody>>,
) -> Result<Response, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let started = Instant::now();

    let Ok(_permit) = state.flow_semaphore.try_acquire() else {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "success": false, "error": "Too many concurrent flows" })),
        )
            .into_response());
    };

    let timeout = body
        .timeout
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_FLOW_TIMEOUT);
    let inputs = body.inputs.unwrap_or_else(|| json!({}));

    let outcome = tokio::time::timeout(timeout, state.flow_runner.run(&flow_id, inputs)).await;
    let execution_time = started.elapsed().as_secs_f64();

    match outcome {
        Err(_) => {
            state.audit.log_flow_execution(
                &flow_id,
                false,
                execution_time * 1000.0,
                Some("flow timed out".into()),
            );
            Ok((
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({ "success": false, "error": "Flow execution timed out" })),
            )
                .into_response())
        }
        Ok(Err(e)) => {
            state.audit.log_flow_execution(
                &flow_id,
                false,
                execution_time * 1000.0,
                Some(e.message.clone()),
            );
            Err(e.into())
        }
        Ok(Ok(result)) => {
            state
                .audit
                .log_flow_execution(&flow_id, true, execution_time * 1000.0, None);
            let result = truncate_result(result, state.config.max_response_bytes);
            Ok(Json(json!({
                "success": true,
                "result": result,
                "execution_time": execution_time,
            }))
            .into_response())
        }
    }
}
