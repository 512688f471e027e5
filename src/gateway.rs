//! Provides the HTTP gateway which fronts the cache cluster.
//!
//! The gateway exposes the cache under plain REST routes of the form
//! `/<group>/<key>`:
//! * **GET** yields `{"group":…, "key":…, "value":…}` or 404 if no value is
//!   present.
//! * **POST** with a body of `{"value": …}` (a JSON string or integer) stores
//!   the value and echoes the envelope.
//! * **DELETE** removes the value and yields `{"group":…, "key":…}`.
//!
//! For each request the gateway consults its peer directory (fed by the same
//! registry the nodes register with, using an empty self address so every node
//! counts as remote) and forwards the operation to the node owning the key via
//! the RPC protocol. An empty ring is answered with 500 - there is no node which
//! could serve the request.
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::json;

use crate::cache::Value;
use crate::picker::PeerPicker;
use crate::shutdown::Shutdown;

/// Runs the HTTP gateway on the given port until the shutdown is triggered.
pub async fn run(
    shutdown: Arc<Shutdown>,
    port: u16,
    picker: Arc<PeerPicker>,
) -> anyhow::Result<()> {
    let address = SocketAddr::from(([0, 0, 0, 0], port));

    let make_service = make_service_fn(move |_connection| {
        let picker = picker.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| handle(picker.clone(), request)))
        }
    });

    let server = hyper::Server::try_bind(&address)
        .with_context(|| format!("Failed to bind the HTTP gateway to {}", address))?
        .serve(make_service);
    log::info!("HTTP gateway listening on {}...", address);

    server
        .with_graceful_shutdown(async move { shutdown.stopped().await })
        .await
        .context("The HTTP gateway failed")?;

    log::info!("HTTP gateway stopped.");
    Ok(())
}

async fn handle(
    picker: Arc<PeerPicker>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    Ok(route(picker, request).await)
}

/// Routes a request to the matching cache operation.
async fn route(picker: Arc<PeerPicker>, request: Request<Body>) -> Response<Body> {
    let path = request.uri().path().trim_matches('/').to_owned();
    let mut segments = path.split('/');
    let (group, key) = match (segments.next(), segments.next(), segments.next()) {
        (Some(group), Some(key), None) if !group.is_empty() && !key.is_empty() => {
            (group.to_owned(), key.to_owned())
        }
        _ => {
            return json_response(
                StatusCode::NOT_FOUND,
                json!({"error": "expected a path of the form /<group>/<key>"}),
            )
        }
    };

    // The gateway never owns a key itself, so "no peer" means an empty ring...
    let peer = match picker.pick_peer(&key) {
        Some(peer) => peer,
        None => {
            log::warn!("No cache node available for key {}", key);
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "no cache node available"}),
            );
        }
    };

    // The method is cloned up front as the POST branch consumes the request.
    let method = request.method().clone();
    match method {
        Method::GET => match peer.get::<Value>(&group, &key).await {
            Some(value) => json_response(
                StatusCode::OK,
                json!({"group": group, "key": key, "value": render(&value)}),
            ),
            None => json_response(StatusCode::NOT_FOUND, json!({"error": "not found"})),
        },
        Method::POST => {
            let value = match read_value(request).await {
                Ok(value) => value,
                Err(error) => {
                    log::warn!("Rejected a write of {}/{}: {}", group, key, error);
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        json!({"error": error.to_string()}),
                    );
                }
            };

            if peer.set(&group, &key, &value).await {
                json_response(
                    StatusCode::OK,
                    json!({"group": group, "key": key, "value": render(&value)}),
                )
            } else {
                json_response(
                    StatusCode::BAD_GATEWAY,
                    json!({"error": "the cache node rejected the write"}),
                )
            }
        }
        Method::DELETE => {
            if peer.delete(&group, &key).await {
                json_response(StatusCode::OK, json!({"group": group, "key": key}))
            } else {
                json_response(
                    StatusCode::BAD_GATEWAY,
                    json!({"error": "the cache node rejected the delete"}),
                )
            }
        }
        _ => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            json!({"error": "only GET, POST and DELETE are supported"}),
        ),
    }
}

/// Extracts the value from a `{"value": …}` request body.
async fn read_value(request: Request<Body>) -> anyhow::Result<Value> {
    let body = hyper::body::to_bytes(request.into_body())
        .await
        .context("Failed to read the request body")?;
    let parsed: serde_json::Value =
        serde_json::from_slice(&body).context("The request body is not valid JSON")?;

    match &parsed["value"] {
        serde_json::Value::String(string) => Ok(Value::Str(string.clone())),
        serde_json::Value::Number(number) => number
            .as_i64()
            .and_then(|number| i32::try_from(number).ok())
            .map(Value::Int)
            .ok_or_else(|| anyhow::anyhow!("Numeric values must fit a 32-bit signed integer")),
        _ => Err(anyhow::anyhow!(
            "The body must carry a 'value' field holding a string or an integer"
        )),
    }
}

/// Renders the value envelope into its JSON representation.
fn render(value: &Value) -> serde_json::Value {
    match value {
        Value::Str(string) => json!(string),
        Value::Int(number) => json!(number),
    }
}

fn json_response(status: StatusCode, payload: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(payload.to_string()));
    *response.status_mut() = status;
    let _ = response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
