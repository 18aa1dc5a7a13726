//! JSON/HTTP surface
//!
//! ## Incidents
//! - `POST /incidents` - Raise an incident
//! - `GET /incidents/{id}` - Incident view with the current tier deadline
//! - `POST /incidents/{id}/responses` - Responder accepts or declines
//! - `POST /incidents/{id}/cancel` - User marks themselves safe
//! - `POST /incidents/{id}/signals` - Distress signal (emotion/evidence/manual)
//! - `POST /incidents/{id}/evidence` - Finalize an upload session into evidence
//!
//! ## Responders
//! - `POST /responders` - Register or update a responder
//! - `POST /responders/{id}/heartbeat` - Latest position
//!
//! ## Uploads
//! - `POST /uploads` - Declare streams and chunk counts
//! - `PUT /uploads/{session}/{stream}/{index}` - One chunk (raw body)
//! - `GET /uploads/{session}` - Received/missing chunks per stream
//!
//! ## Evidence
//! - `GET /evidence/{id}` - Record
//! - `POST /evidence/{id}/verify` - Re-hash from storage (422 on mismatch)
//! - `POST /evidence/{id}/shares` - Grant a party access
//! - `DELETE /evidence/{id}` - Always refused (409)
//! - `POST /evidence/{id}/streams/{stream}/link` - Signed, expiring reference for the
//!   owner or a party the evidence is shared with
//! - `GET /evidence/access/{token}` - Stream bytes behind a signed reference
//! - `GET /ledger/verify` - Walk the hash chain
//!
//! ```bash
//! curl -X PUT --data-binary @chunk-0003.bin \
//!      http://localhost:8088/uploads/upl-4f2c/audio/3
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::app::Lifeline;
use crate::evidence::StreamType;
use crate::geo::GeoPoint;
use crate::incident::{DistressSource, IncidentType, ResponseAction};
use crate::responders::ResponderProfile;
use crate::types::{LifelineError, Result};

type HttpResponse = Response<Full<Bytes>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Upper bound for JSON request bodies
const MAX_JSON_BYTES: usize = 1024 * 1024;

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenIncidentRequest {
    user_id: String,
    incident_type: IncidentType,
    lat: f64,
    lon: f64,
    #[serde(default)]
    radius_meters: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ResponseRequest {
    responder_id: String,
    action: ResponseAction,
}

#[derive(Debug, Deserialize)]
struct UserRequest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct DistressRequest {
    source: DistressSource,
    score: f32,
}

#[derive(Debug, Deserialize)]
struct SubmitEvidenceRequest {
    user_id: String,
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    lat: f64,
    lon: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct BeginUploadRequest {
    recording_id: String,
    streams: HashMap<StreamType, u32>,
}

#[derive(Debug, Serialize)]
struct BeginUploadResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ShareRequest {
    party: String,
}

#[derive(Debug, Deserialize)]
struct LinkRequest {
    /// Owner or a party the evidence is shared with
    party: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_indexes: Option<&'a [u32]>,
}

// ============================================================================
// Server
// ============================================================================

pub struct HttpServer {
    app: Arc<Lifeline>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(app: Arc<Lifeline>, bind_addr: SocketAddr) -> Self {
        Self { app, bind_addr }
    }

    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route a request; component errors become JSON error bodies
    pub async fn handle_request<B>(&self, req: Request<B>) -> std::result::Result<HttpResponse, Infallible>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(method = %method, path = %path, "Incoming request");

        let result = self.route(method.clone(), &path, req).await;
        Ok(match result {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, LifelineError::Storage(_) | LifelineError::Internal(_)) {
                    error!(method = %method, path = %path, error = %e, "Request failed");
                } else {
                    debug!(method = %method, path = %path, error = %e, "Request rejected");
                }
                error_response(&e)
            }
        })
    }

    async fn route<B>(&self, method: Method, path: &str, req: Request<B>) -> Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let app = &self.app;

        match (method, segments.as_slice()) {
            (Method::GET, ["health"]) => Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "status": "ok",
                    "incidents": app.store.len(),
                    "active_dispatches": app.dispatcher.active_count(),
                    "upload_sessions": app.chunks.session_count(),
                    "responders": app.directory.len(),
                }),
            )),

            // Incidents
            (Method::POST, ["incidents"]) => {
                let body: OpenIncidentRequest = read_json(req).await?;
                let view = app
                    .orchestrator
                    .open_incident(
                        &body.user_id,
                        body.incident_type,
                        GeoPoint::new(body.lat, body.lon),
                        body.radius_meters,
                    )
                    .await?;
                Ok(json_response(StatusCode::CREATED, &view))
            }
            (Method::GET, ["incidents", id]) => {
                Ok(json_response(StatusCode::OK, &app.orchestrator.get_incident(id).await?))
            }
            (Method::POST, ["incidents", id, "responses"]) => {
                let body: ResponseRequest = read_json(req).await?;
                let response = app
                    .orchestrator
                    .record_response(id, &body.responder_id, body.action)
                    .await?;
                Ok(json_response(StatusCode::OK, &response))
            }
            (Method::POST, ["incidents", id, "cancel"]) => {
                let body: UserRequest = read_json(req).await?;
                let view = app.orchestrator.cancel_incident(id, &body.user_id).await?;
                Ok(json_response(StatusCode::OK, &view))
            }
            (Method::POST, ["incidents", id, "signals"]) => {
                let body: DistressRequest = read_json(req).await?;
                let view = app
                    .orchestrator
                    .report_distress(id, body.source, body.score)
                    .await?;
                Ok(json_response(StatusCode::OK, &view))
            }
            (Method::POST, ["incidents", id, "evidence"]) => {
                let body: SubmitEvidenceRequest = read_json(req).await?;
                let record = app
                    .orchestrator
                    .submit_evidence(id, &body.user_id, &body.session_id)
                    .await?;
                Ok(json_response(StatusCode::CREATED, &record))
            }

            // Responders
            (Method::POST, ["responders"]) => {
                let profile: ResponderProfile = read_json(req).await?;
                let responder_id = profile.responder_id.clone();
                app.directory.register_responder(profile)?;
                Ok(json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "responder_id": responder_id }),
                ))
            }
            (Method::POST, ["responders", id, "heartbeat"]) => {
                let body: HeartbeatRequest = read_json(req).await?;
                app.directory.record_heartbeat(
                    id,
                    GeoPoint::new(body.lat, body.lon),
                    body.timestamp.unwrap_or_else(Utc::now),
                )?;
                Ok(empty_response(StatusCode::NO_CONTENT))
            }

            // Uploads
            (Method::POST, ["uploads"]) => {
                let body: BeginUploadRequest = read_json(req).await?;
                let session_id = app.chunks.begin_session(&body.recording_id, &body.streams)?;
                Ok(json_response(
                    StatusCode::CREATED,
                    &BeginUploadResponse { session_id },
                ))
            }
            (Method::PUT, ["uploads", session, stream, index]) => {
                let stream_type = parse_stream(stream)?;
                let index: u32 = index.parse().map_err(|_| {
                    LifelineError::Validation(format!("invalid chunk index: {index}"))
                })?;
                let data = read_body(req, app.config.evidence.max_chunk_bytes).await?;
                let ack = app
                    .chunks
                    .put_chunk(session, stream_type, index, data)
                    .await?;
                Ok(json_response(StatusCode::OK, &ack))
            }
            (Method::GET, ["uploads", session]) => {
                Ok(json_response(StatusCode::OK, &app.chunks.session_status(session)?))
            }

            // Evidence
            (Method::GET, ["evidence", "access", token]) => {
                let (stream_type, data) = app.access.open(token).await?;
                Ok(binary_response(stream_type, data))
            }
            (Method::GET, ["evidence", id]) => {
                Ok(json_response(StatusCode::OK, &app.ledger.get(id)?))
            }
            (Method::POST, ["evidence", id, "verify"]) => {
                let report = app.ledger.verify(id).await?;
                let status = if report.ok {
                    StatusCode::OK
                } else {
                    StatusCode::UNPROCESSABLE_ENTITY
                };
                Ok(json_response(status, &report))
            }
            (Method::POST, ["evidence", id, "shares"]) => {
                let body: ShareRequest = read_json(req).await?;
                let record = app.ledger.grant_share(id, &body.party).await?;
                Ok(json_response(StatusCode::OK, &record))
            }
            (Method::DELETE, ["evidence", id]) => {
                app.ledger.request_deletion(id)?;
                Ok(empty_response(StatusCode::NO_CONTENT))
            }
            (Method::POST, ["evidence", id, "streams", stream, "link"]) => {
                let stream_type = parse_stream(stream)?;
                let body: LinkRequest = read_json(req).await?;
                let reference = app.access.issue(id, stream_type, &body.party)?;
                Ok(json_response(StatusCode::CREATED, &reference))
            }
            (Method::GET, ["ledger", "verify"]) => {
                let report = app.ledger.verify_chain().await;
                let status = if report.ok {
                    StatusCode::OK
                } else {
                    StatusCode::UNPROCESSABLE_ENTITY
                };
                Ok(json_response(status, &report))
            }

            _ => Err(LifelineError::NotFound(format!("route {path}"))),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_stream(s: &str) -> Result<StreamType> {
    s.parse().map_err(LifelineError::Validation)
}

/// Collect a body, giving up as soon as it grows past `limit`
async fn read_body<B>(req: Request<B>, limit: usize) -> Result<Bytes>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let collected = Limited::new(req.into_body(), limit)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                LifelineError::Validation(format!("request body exceeds {limit} bytes"))
            } else {
                LifelineError::Validation(format!("failed to read body: {e}"))
            }
        })?;
    Ok(collected.to_bytes())
}

async fn read_json<T, B>(req: Request<B>) -> Result<T>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<BoxError>,
{
    let body = read_body(req, MAX_JSON_BYTES).await?;
    serde_json::from_slice(&body)
        .map_err(|e| LifelineError::Validation(format!("invalid JSON body: {e}")))
}

/// HTTP status for each error kind
pub fn status_for(err: &LifelineError) -> StatusCode {
    match err {
        LifelineError::Validation(_) => StatusCode::BAD_REQUEST,
        LifelineError::NotFound(_) => StatusCode::NOT_FOUND,
        LifelineError::Conflict(_) | LifelineError::IncompleteUpload { .. } => {
            StatusCode::CONFLICT
        }
        LifelineError::ChannelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        LifelineError::TamperSuspected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LifelineError::Storage(_) | LifelineError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: &LifelineError) -> HttpResponse {
    let missing_indexes = match err {
        LifelineError::IncompleteUpload {
            missing_indexes, ..
        } => Some(missing_indexes.as_slice()),
        _ => None,
    };
    json_response(
        status_for(err),
        &ErrorBody {
            error: err.kind(),
            message: err.to_string(),
            missing_indexes,
        },
    )
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            let mut response = Response::new(Full::new(Bytes::from_static(
                br#"{"error":"internal","message":"serialization failed"}"#,
            )));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn empty_response(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn binary_response(stream_type: StreamType, data: Bytes) -> HttpResponse {
    let content_type = match stream_type {
        StreamType::FrontVideo | StreamType::BackVideo => "video/mp4",
        StreamType::Audio => "audio/mp4",
        StreamType::Photo => "image/jpeg",
    };
    let len = data.len();
    let mut response = Response::new(Full::new(data));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Collaborators;
    use crate::collaborators::{InMemoryIdentity, InMemoryObjectStore, LoggingAuthority, UserProfile};
    use crate::config::LifelineConfig;
    use crate::dispatch::{ChannelSet, RecordingChannel};
    use crate::ids::SequentialIds;

    async fn server() -> HttpServer {
        server_with(LifelineConfig::default()).await
    }

    async fn server_with(config: LifelineConfig) -> HttpServer {
        let identity = InMemoryIdentity::new();
        identity
            .upsert(
                UserProfile {
                    user_id: "u-1".into(),
                    name: "Asha".into(),
                    phone: None,
                    emergency_contacts: Vec::new(),
                },
                Vec::new(),
            )
            .await;

        let app = Lifeline::build(
            config,
            Collaborators {
                ids: Arc::new(SequentialIds::new()),
                identity: Arc::new(identity),
                object_store: Arc::new(InMemoryObjectStore::new()),
                authority: Arc::new(LoggingAuthority),
                channels: ChannelSet::uniform(Arc::new(RecordingChannel::new())),
            },
        )
        .unwrap();
        HttpServer::new(Arc::new(app), "127.0.0.1:0".parse().unwrap())
    }

    fn request(method: Method, uri: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body.into()))
            .unwrap()
    }

    async fn send(server: &HttpServer, req: Request<Full<Bytes>>) -> (StatusCode, serde_json::Value) {
        let response = server.handle_request(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&LifelineError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&LifelineError::IncompleteUpload {
                stream_type: StreamType::Audio,
                missing_indexes: vec![1]
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&LifelineError::ChannelUnavailable("sms".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&LifelineError::TamperSuspected {
                evidence_id: "e".into(),
                mismatches: vec![]
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&LifelineError::Storage("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_health_and_unknown_route() {
        let server = server().await;
        let (status, body) = send(&server, request(Method::GET, "/health", Bytes::new())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&server, request(Method::GET, "/nowhere", Bytes::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_open_incident_and_bad_json() {
        let server = server().await;
        let (status, body) = send(
            &server,
            request(
                Method::POST,
                "/incidents",
                r#"{"user_id":"u-1","incident_type":"medical","lat":12.97,"lon":77.59}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) =
            send(&server, request(Method::GET, &format!("/incidents/{id}"), Bytes::new())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["incident_type"], "medical");

        let (status, _) = send(&server, request(Method::POST, "/incidents", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_incomplete_upload_reports_missing_indexes() {
        let server = server().await;
        let (status, body) = send(
            &server,
            request(
                Method::POST,
                "/uploads",
                r#"{"recording_id":"rec-1","streams":{"audio":3}}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let session = body["session_id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &server,
            request(Method::PUT, &format!("/uploads/{session}/audio/1"), "chunk"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, incident) = send(
            &server,
            request(
                Method::POST,
                "/incidents",
                r#"{"user_id":"u-1","incident_type":"sos","lat":1.0,"lon":1.0}"#,
            ),
        )
        .await;
        let incident_id = incident["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &server,
            request(
                Method::POST,
                &format!("/incidents/{incident_id}/evidence"),
                format!(r#"{{"user_id":"u-1","session_id":"{session}"}}"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "incomplete_upload");
        assert_eq!(body["missing_indexes"], serde_json::json!([0, 2]));
    }

    #[tokio::test]
    async fn test_committed_evidence_cannot_be_deleted() {
        let server = server().await;
        let (status, _) =
            send(&server, request(Method::DELETE, "/evidence/evd-missing", Bytes::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(
            &server,
            request(
                Method::POST,
                "/uploads",
                r#"{"recording_id":"rec-9","streams":{"photo":1}}"#,
            ),
        )
        .await;
        let session = body["session_id"].as_str().unwrap().to_string();
        send(
            &server,
            request(Method::PUT, &format!("/uploads/{session}/photo/0"), "jpeg"),
        )
        .await;

        let (_, incident) = send(
            &server,
            request(
                Method::POST,
                "/incidents",
                r#"{"user_id":"u-1","incident_type":"assault","lat":1.0,"lon":1.0}"#,
            ),
        )
        .await;
        let incident_id = incident["id"].as_str().unwrap().to_string();
        let (status, record) = send(
            &server,
            request(
                Method::POST,
                &format!("/incidents/{incident_id}/evidence"),
                format!(r#"{{"user_id":"u-1","session_id":"{session}"}}"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let evidence_id = record["evidence_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &server,
            request(Method::DELETE, &format!("/evidence/{evidence_id}"), Bytes::new()),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");

        let (status, _) =
            send(&server, request(Method::GET, &format!("/evidence/{evidence_id}"), Bytes::new())).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_rejected_before_storing() {
        let mut config = LifelineConfig::default();
        config.evidence.max_chunk_bytes = 8;
        let server = server_with(config).await;

        let (_, body) = send(
            &server,
            request(
                Method::POST,
                "/uploads",
                r#"{"recording_id":"rec-big","streams":{"audio":1}}"#,
            ),
        )
        .await;
        let session = body["session_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &server,
            request(
                Method::PUT,
                &format!("/uploads/{session}/audio/0"),
                Bytes::from(vec![0u8; 64]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("exceeds 8 bytes"));

        let (status, body) =
            send(&server, request(Method::GET, &format!("/uploads/{session}"), Bytes::new())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["streams"][0]["received"], 0);
    }
}
