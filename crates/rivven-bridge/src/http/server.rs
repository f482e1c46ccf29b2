//! HTTP server
//!
//! Routes:
//! - `POST /topics/{topic}` publish records, partition chosen per record
//! - `POST /topics/{topic}/partitions/{partition}` publish to one partition
//! - `GET /healthy` liveness
//! - `GET /ready` readiness, false once shutdown has begun

use super::source::{ErrorResponse, HttpSourceEndpoint, PublishRequest, PublishResponse};
use crate::broker::SharedBrokerClient;
use crate::config::{BridgeConfig, HttpConfig};
use crate::converter::{http_converter, HttpMessageConverter};
use crate::endpoint::BridgeEndpoint;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Shared server state
pub struct HttpState {
    bridge_id: Option<String>,
    config: HttpConfig,
    broker: SharedBrokerClient,
    converter: Arc<dyn HttpMessageConverter>,
    ready: AtomicBool,
}

impl HttpState {
    async fn publish(&self, request: PublishRequest) -> Response {
        let mut endpoint = HttpSourceEndpoint::new(
            self.bridge_id.as_deref(),
            self.config.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.converter),
        );
        let response = match endpoint.handle(request).await {
            Ok(response) => response.into_response(),
            Err(e) => {
                error!("Endpoint '{}' failed: {}", endpoint.name(), e);
                PublishResponse::Error(ErrorResponse {
                    error_code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    message: e.to_string(),
                })
                .into_response()
            }
        };

        // one endpoint per request: the server owns its close
        if endpoint.is_closing() {
            debug!("Endpoint '{}' flagged for close", endpoint.name());
        }
        endpoint.close().await;
        response
    }
}

/// HTTP side of the bridge
pub struct HttpBridge {
    state: Arc<HttpState>,
}

impl HttpBridge {
    pub fn new(config: &BridgeConfig, broker: SharedBrokerClient) -> Self {
        Self {
            state: Arc::new(HttpState {
                bridge_id: config.bridge_id.clone(),
                config: config.http.clone(),
                broker,
                converter: http_converter(config.http.format),
                ready: AtomicBool::new(true),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthy", get(healthy_handler))
            .route("/ready", get(ready_handler))
            .route("/topics/:topic", post(publish_handler))
            .route(
                "/topics/:topic/partitions/:partition",
                post(publish_partition_handler),
            )
            .layer(DefaultBodyLimit::max(self.state.config.max_body_bytes))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests
    pub async fn run<F>(self, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("HTTP bridge listening on {}", addr);

        let state = Arc::clone(&self.state);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                state.ready.store(false, Ordering::Release);
                info!("HTTP bridge shutting down");
            })
            .await?;
        Ok(())
    }
}

async fn healthy_handler() -> StatusCode {
    StatusCode::OK
}

async fn ready_handler(State(state): State<Arc<HttpState>>) -> StatusCode {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn publish_handler(
    State(state): State<Arc<HttpState>>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Response {
    state.publish(PublishRequest::new(topic, body)).await
}

async fn publish_partition_handler(
    State(state): State<Arc<HttpState>>,
    Path((topic, partition)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    state
        .publish(PublishRequest::new(topic, body).with_partition(partition))
        .await
}
