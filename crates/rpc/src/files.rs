//! File registry endpoints.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use pinledger_pinning::PinReceipt;
use pinledger_registry::{
    compute_cid_hash, Address, CidHash, FileRecord, OperationCost,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::server::{
    optional_caller, parse_address, parse_cid_hash, required_caller, ApiError, ApiJson,
    SharedState,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFileRequest {
    pub cid: String,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFileResponse {
    #[serde(flatten)]
    pub record: FileRecord,
    pub cost: OperationCost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub cid: String,
    pub cid_hash: CidHash,
    pub exists: bool,
}

/// Body of the pin and unpin calls; the registry only keeps the hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinRequest {
    pub cid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinResponse {
    pub cid_hash: CidHash,
    pub pinned: bool,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<PinReceipt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderFilesResponse {
    pub uploader: Address,
    pub files: Vec<CidHash>,
    pub total: usize,
}

pub(crate) async fn handle_store_file(
    State(state): State<SharedState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<StoreFileRequest>,
) -> Result<(StatusCode, Json<StoreFileResponse>), ApiError> {
    state.record_request();
    let caller = required_caller(&headers)?;

    let (record, cost) =
        state
            .registry
            .store_file_metered(caller, &request.cid, request.name, request.size)?;

    Ok((StatusCode::CREATED, Json(StoreFileResponse { record, cost })))
}

pub(crate) async fn handle_get_file(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(cid): Path<String>,
) -> Result<Json<FileRecord>, ApiError> {
    state.record_request();
    let caller = optional_caller(&headers)?.unwrap_or(Address::ZERO);
    let record = state.registry.get_file_meta(caller, &cid)?;
    Ok(Json(record))
}

pub(crate) async fn handle_file_exists(
    State(state): State<SharedState>,
    Path(cid): Path<String>,
) -> Json<ExistsResponse> {
    state.record_request();
    let exists = state.registry.file_exists_by_cid(&cid);
    Json(ExistsResponse {
        cid_hash: compute_cid_hash(&cid),
        cid,
        exists,
    })
}

pub(crate) async fn handle_get_file_by_hash(
    State(state): State<SharedState>,
    Path(hash_hex): Path<String>,
) -> Result<Json<FileRecord>, ApiError> {
    state.record_request();
    let cid_hash = parse_cid_hash(&hash_hex)?;
    let record = state.registry.get_file_meta_by_hash(&cid_hash)?;
    Ok(Json(record))
}

pub(crate) async fn handle_pin(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(hash_hex): Path<String>,
    ApiJson(request): ApiJson<PinRequest>,
) -> Result<Json<PinResponse>, ApiError> {
    state.record_request();
    let caller = required_caller(&headers)?;
    let cid_hash = parse_cid_hash(&hash_hex)?;
    ensure_cid_matches(&request.cid, &cid_hash)?;

    // Nothing reaches the pinning service unless the registry would accept the flag change.
    state.registry.authorize_modification(caller, &cid_hash)?;

    let receipt = state.pin_service.pin(&request.cid).await?;
    debug!(cid = %request.cid, backend = state.pin_service.name(), "Remote pin confirmed");
    if let Err(err) = state.registry.pin_cid(caller, &cid_hash) {
        warn!(
            cid = %request.cid,
            cid_hash = %cid_hash,
            error = %err,
            "CID pinned remotely but registry flag not set"
        );
        return Err(err.into());
    }
    info!(cid_hash = %cid_hash, caller = %caller, "Pin recorded");

    Ok(Json(PinResponse {
        cid_hash,
        pinned: true,
        backend: state.pin_service.name().to_string(),
        receipt: Some(receipt),
    }))
}

pub(crate) async fn handle_unpin(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(hash_hex): Path<String>,
    ApiJson(request): ApiJson<PinRequest>,
) -> Result<Json<PinResponse>, ApiError> {
    state.record_request();
    let caller = required_caller(&headers)?;
    let cid_hash = parse_cid_hash(&hash_hex)?;
    ensure_cid_matches(&request.cid, &cid_hash)?;

    state.registry.authorize_modification(caller, &cid_hash)?;

    state.pin_service.unpin(&request.cid).await?;
    if let Err(err) = state.registry.unpin_cid(caller, &cid_hash) {
        warn!(
            cid = %request.cid,
            cid_hash = %cid_hash,
            error = %err,
            "CID unpinned remotely but registry flag still set"
        );
        return Err(err.into());
    }
    info!(cid_hash = %cid_hash, caller = %caller, "Unpin recorded");

    Ok(Json(PinResponse {
        cid_hash,
        pinned: false,
        backend: state.pin_service.name().to_string(),
        receipt: None,
    }))
}

pub(crate) async fn handle_uploader_files(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> Result<Json<UploaderFilesResponse>, ApiError> {
    state.record_request();
    let uploader = parse_address(&address)?;
    let files = state.registry.get_uploader_files(&uploader);
    Ok(Json(UploaderFilesResponse {
        uploader,
        total: files.len(),
        files,
    }))
}

fn ensure_cid_matches(cid: &str, cid_hash: &CidHash) -> Result<(), ApiError> {
    if cid.is_empty() {
        return Err(ApiError::bad_request("empty_cid", "CID must not be empty"));
    }
    let computed = compute_cid_hash(cid);
    if &computed != cid_hash {
        return Err(ApiError::bad_request(
            "cid_hash_mismatch",
            format!("CID hashes to {computed}, not {cid_hash}"),
        ));
    }
    Ok(())
}
