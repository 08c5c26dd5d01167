//! Serves the OCI distribution v2 API: `GET /v2/`, manifest and blob
//! read/write endpoints, and the chunked-upload session protocol. The
//! PUT-manifest handler is the one endpoint with side effects beyond
//! storage — see `manifest::put_manifest`.

pub mod blobstore;
pub mod manifest;
pub mod uploads;

use std::{net::SocketAddr, sync::Arc};

use axum::{
  body::Bytes,
  extract::{ConnectInfo, Path, State},
  http::{HeaderMap, Method, StatusCode},
  middleware::{self, Next},
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, instrument};
use yeet_entities::{ErrorKind, YeetError};

use crate::store::Store;

use self::{blobstore::BlobStore, manifest::ComposeInstaller, uploads::UploadManager};

pub struct RegistryState {
  pub blobstore: BlobStore,
  pub uploads: UploadManager,
  pub store: Arc<Store>,
  pub installer: Arc<dyn ComposeInstaller>,
}

type SharedState = Arc<RegistryState>;

/// Maps the shared error taxonomy onto an HTTP status and the OCI
/// distribution JSON error body `{"errors":[{"code","message","detail"}]}`.
fn oci_error(err: YeetError) -> Response {
  let status = match err.kind {
    ErrorKind::User => StatusCode::BAD_REQUEST,
    ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
    ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
    ErrorKind::Infra => StatusCode::INTERNAL_SERVER_ERROR,
    ErrorKind::RemoteExit(_) => StatusCode::INTERNAL_SERVER_ERROR,
  };
  let code = match err.kind {
    ErrorKind::User => "NAME_INVALID",
    ErrorKind::Validation => "MANIFEST_INVALID",
    ErrorKind::Transient => "UNAVAILABLE",
    ErrorKind::Infra | ErrorKind::RemoteExit(_) => "UNKNOWN",
  };
  (status, Json(json!({ "errors": [{ "code": code, "message": err.message, "detail": null }] }))).into_response()
}

fn not_found(message: impl Into<String>) -> Response {
  oci_error(YeetError { kind: ErrorKind::User, message: message.into() })
}

async fn get_root() -> Json<serde_json::Value> {
  Json(json!({}))
}

#[instrument(skip(state))]
async fn get_manifest(
  State(state): State<SharedState>,
  Path((service, container, reference)): Path<(String, String, String)>,
) -> Response {
  let repo = format!("{service}/{container}");
  let view = match state.store.get().await {
    Ok(v) => v,
    Err(e) => return oci_error(YeetError::infra(e.to_string())),
  };
  let Some(image_repo) = view.images.get(&repo) else {
    return not_found(format!("repository {repo} not found"));
  };
  let Some(record) = image_repo.tags.get(&reference) else {
    return not_found(format!("manifest {reference} not found"));
  };
  let Ok(body) = state.blobstore.read_blob(&record.digest).await else {
    return not_found(format!("manifest blob {} not found", record.digest));
  };
  (
    StatusCode::OK,
    [
      ("Content-Type", record.content_type.clone()),
      ("Docker-Content-Digest", record.digest.clone()),
    ],
    body,
  )
    .into_response()
}

#[instrument(skip(state, headers, body))]
async fn put_manifest(
  State(state): State<SharedState>,
  Path((service, container, reference)): Path<(String, String, String)>,
  headers: HeaderMap,
  body: Bytes,
) -> Response {
  let repo = format!("{service}/{container}");
  let content_type = headers
    .get("content-type")
    .and_then(|v| v.to_str().ok())
    .unwrap_or("application/vnd.oci.image.manifest.v1+json")
    .to_string();

  match manifest::put_manifest(
    &state.store,
    &state.blobstore,
    &state.installer,
    &repo,
    &reference,
    &content_type,
    &body,
  )
  .await
  {
    Ok(outcome) => (
      StatusCode::CREATED,
      [
        ("Docker-Content-Digest", outcome.digest.clone()),
        ("Location", format!("/v2/{repo}/manifests/{}", outcome.digest)),
      ],
    )
      .into_response(),
    Err(e) => oci_error(e),
  }
}

#[instrument(skip(state))]
async fn get_blob(
  State(state): State<SharedState>,
  Path((_service, _container, digest)): Path<(String, String, String)>,
) -> Response {
  if !state.blobstore.exists(&digest).await {
    return not_found(format!("blob {digest} not found"));
  }
  match state.blobstore.read_blob(&digest).await {
    Ok(body) => (StatusCode::OK, [("Docker-Content-Digest", digest)], body).into_response(),
    Err(_) => not_found(format!("blob {digest} not found")),
  }
}

#[instrument(skip(state))]
async fn delete_blob(
  State(state): State<SharedState>,
  Path((_service, _container, digest)): Path<(String, String, String)>,
) -> Response {
  match state.blobstore.delete_blob(&digest).await {
    Ok(()) => StatusCode::ACCEPTED.into_response(),
    Err(_) => not_found(format!("blob {digest} not found")),
  }
}

#[instrument(skip(state))]
async fn start_upload(
  State(state): State<SharedState>,
  Path((service, container)): Path<(String, String)>,
) -> Response {
  let repo = format!("{service}/{container}");
  match state.uploads.start(&repo).await {
    Ok(id) => (
      StatusCode::ACCEPTED,
      [
        ("Location", format!("/v2/{repo}/blobs/uploads/{id}")),
        ("Range", "0-0".to_string()),
        ("Docker-Upload-UUID", id),
      ],
    )
      .into_response(),
    Err(e) => oci_error(YeetError::infra(e.to_string())),
  }
}

#[instrument(skip(state, body))]
async fn patch_upload(
  State(state): State<SharedState>,
  Path((service, container, id)): Path<(String, String, String)>,
  body: Bytes,
) -> Response {
  let repo = format!("{service}/{container}");
  if !state.uploads.exists(&id) {
    return not_found(format!("unknown upload session {id}"));
  }
  let start = match state.uploads.offset(&id).await {
    Ok(n) => n,
    Err(e) => return oci_error(YeetError::infra(e.to_string())),
  };
  match state.uploads.write_chunk(&id, start, &body).await {
    Ok(next) => (
      StatusCode::ACCEPTED,
      [
        ("Location", format!("/v2/{repo}/blobs/uploads/{id}")),
        ("Range", format!("0-{}", next.saturating_sub(1))),
        ("Docker-Upload-UUID", id),
      ],
    )
      .into_response(),
    Err(e) => oci_error(YeetError::validation(e.to_string())),
  }
}

#[instrument(skip(state, body))]
async fn put_upload(
  State(state): State<SharedState>,
  Path((service, container, id)): Path<(String, String, String)>,
  headers: HeaderMap,
  body: Bytes,
) -> Response {
  let repo = format!("{service}/{container}");
  if !state.uploads.exists(&id) {
    return not_found(format!("unknown upload session {id}"));
  }
  if !body.is_empty() {
    let start = match state.uploads.offset(&id).await {
      Ok(n) => n,
      Err(e) => return oci_error(YeetError::infra(e.to_string())),
    };
    if let Err(e) = state.uploads.write_chunk(&id, start, &body).await {
      return oci_error(YeetError::validation(e.to_string()));
    }
  }
  let expected_digest =
    headers.get("digest").or_else(|| headers.get("Digest")).and_then(|v| v.to_str().ok()).map(str::to_string);
  match state.uploads.complete(&id, &state.blobstore, expected_digest.as_deref()).await {
    Ok(digest) => (
      StatusCode::CREATED,
      [("Docker-Content-Digest", digest.clone()), ("Location", format!("/v2/{repo}/blobs/{digest}"))],
    )
      .into_response(),
    Err(e) => oci_error(YeetError::validation(e.to_string())),
  }
}

fn is_loopback(addr: SocketAddr) -> bool {
  addr.ip().is_loopback()
}

/// Write operations must come over the trusted mesh-VPN, never from a
/// loopback client. `ConnectInfo` is absent in unit tests driving the
/// router directly (no real socket); treated as non-loopback there.
async fn reject_loopback_writes(
  connect_info: Option<ConnectInfo<SocketAddr>>,
  req: axum::extract::Request,
  next: Next,
) -> Response {
  let is_write = matches!(req.method(), &Method::PUT | &Method::POST | &Method::PATCH | &Method::DELETE);
  let is_loopback_peer = connect_info.map(|ConnectInfo(addr)| is_loopback(addr)).unwrap_or(false);
  if is_write && is_loopback_peer {
    return (
      StatusCode::METHOD_NOT_ALLOWED,
      Json(json!({ "errors": [{ "code": "DENIED", "message": "writes are rejected from loopback clients", "detail": null }] })),
    )
      .into_response();
  }
  next.run(req).await
}

pub fn router(state: SharedState) -> Router {
  Router::new()
    .route("/v2/", get(get_root))
    .route(
      "/v2/:service/:container/manifests/:reference",
      get(get_manifest).head(get_manifest).put(put_manifest),
    )
    .route("/v2/:service/:container/blobs/:digest", get(get_blob).head(get_blob).delete(delete_blob))
    .route("/v2/:service/:container/blobs/uploads/", post(start_upload))
    .route(
      "/v2/:service/:container/blobs/uploads/:id",
      axum::routing::patch(patch_upload).put(put_upload),
    )
    .layer(middleware::from_fn(reject_loopback_writes))
    .with_state(state)
}

#[instrument(skip(state))]
pub async fn serve(bind_ip: &str, port: u16, state: SharedState) -> anyhow::Result<()> {
  let addr: SocketAddr = format!("{bind_ip}:{port}").parse()?;
  let listener = TcpListener::bind(addr).await?;
  info!(%addr, "internal registry listening");
  axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>()).await?;
  Ok(())
}
