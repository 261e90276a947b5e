//! REST control surface.
//!
//! A thin dispatcher over the simulation registry:
//!
//! ```text
//! GET  /faults
//! POST /faults/{name}/simulation
//! POST /fault-simulations/{id}/enable
//! POST /fault-simulations/{id}/resolve
//! POST /fault-simulations/{id}/clean-up
//! ```
//!
//! Unknown names and ids map to 404, lifecycle misuse to 409. The
//! control plane never blocks on proxy traffic; handlers only touch the
//! registry.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::fault::FaultError;
use crate::registry::{RegistryError, SimulationRegistry};

/// Serve the control API until `shutdown` completes.
pub async fn serve(
    registry: Arc<SimulationRegistry>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "control API listening");
    }
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!(peer_addr = %peer_addr, "control connection accepted");
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                handle_request(Arc::clone(&registry), req)
                            });
                            if let Err(e) = hyper::server::conn::http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(error = %e, "control connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "control accept failed");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("control API shutting down");
                break;
            }
        }
    }
}

/// Route one control request. Generic over the body type because no
/// endpoint reads a request body.
pub(crate) async fn handle_request<B>(
    registry: Arc<SimulationRegistry>,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (req.method().as_str(), segments.as_slice()) {
        ("GET", ["faults"]) => list_faults(&registry),
        ("POST", ["faults", name, "simulation"]) => create_simulation(&registry, name).await,
        ("POST", ["fault-simulations", id, "enable"]) => {
            lifecycle(registry.enable(id).await, "enabled")
        }
        ("POST", ["fault-simulations", id, "resolve"]) => {
            lifecycle(registry.resolve(id).await, "resolved")
        }
        ("POST", ["fault-simulations", id, "clean-up"]) => {
            lifecycle(registry.clean_up(id).await, "cleaned up")
        }
        (_, ["faults"])
        | (_, ["faults", _, "simulation"])
        | (_, ["fault-simulations", _, "enable" | "resolve" | "clean-up"]) => {
            status_response(StatusCode::METHOD_NOT_ALLOWED)
        }
        _ => status_response(StatusCode::NOT_FOUND),
    };

    Ok(response)
}

fn list_faults(registry: &SimulationRegistry) -> Response<Full<Bytes>> {
    match serde_json::to_string(&registry.fault_names()) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "failed to serialize fault list");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn create_simulation(registry: &SimulationRegistry, name: &str) -> Response<Full<Bytes>> {
    match registry.create_simulation(name).await {
        Ok(descriptor) => match serde_json::to_string(&descriptor) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                error!(error = %e, "failed to serialize simulation descriptor");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        Err(e) => error_response(e),
    }
}

fn lifecycle(result: Result<(), RegistryError>, verb: &'static str) -> Response<Full<Bytes>> {
    match result {
        Ok(()) => json_response(StatusCode::OK, format!("{{\"status\":\"{}\"}}", verb)),
        Err(e) => error_response(e),
    }
}

fn error_response(error: RegistryError) -> Response<Full<Bytes>> {
    let status = match &error {
        RegistryError::UnknownFault(_) | RegistryError::UnknownSimulation(_) => {
            StatusCode::NOT_FOUND
        }
        RegistryError::Fault(FaultError::Lifecycle { .. }) => StatusCode::CONFLICT,
        RegistryError::Fault(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    debug!(status = %status, error = %error, "control request failed");

    let body = serde_json::json!({ "error": error.to_string() }).to_string();
    json_response(status, body)
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
