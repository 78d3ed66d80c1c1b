use axum::{
    Extension, Router,
    body::Body,
    response::{self, IntoResponse, Response},
    routing::get,
};
use http::{Request, StatusCode, header::HeaderName};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::App;

pub mod vm;

/// The opaque identity attached to a request by whatever authenticator
/// fronts this service. The core never inspects its contents — it only
/// checks that one was attached, which is what lets the terminal endpoint
/// answer `401` per SPEC_FULL §6/§4.7 without owning any auth logic itself.
#[derive(Clone)]
pub struct Principal(pub String);

pub fn app(env: App) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");
    Router::new()
        .route("/", get(|| async { "ok" }))
        .merge(vms())
        .layer(
            ServiceBuilder::new()
                .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
                .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        let request_id = request
                            .extensions()
                            .get::<RequestId>()
                            .map(|value| value.header_value().to_str().unwrap_or_default())
                            .unwrap_or_default();

                        tracing::info_span!(
                            "HTTP",
                            http.method = %request.method(),
                            http.url = %request.uri(),
                            request_id = %request_id,
                        )
                    }),
                ),
        )
        .layer(Extension(env))
}

fn vms() -> Router {
    Router::new()
        .route("/vms", get(vm::list).post(vm::create))
        .route("/vms/{vm_id}", get(vm::get).delete(vm::delete))
        .route("/vms/{vm_id}/start", axum::routing::post(vm::start))
        .route("/vms/{vm_id}/stop", axum::routing::post(vm::stop))
        .route("/vms/{vm_id}/terminal", get(vm::attach_terminal))
}

pub struct ApiResponse<T> {
    data: T,
    code: StatusCode,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data,
            code: StatusCode::OK,
        }
    }

    pub fn created(data: T) -> Self {
        Self {
            data,
            code: StatusCode::CREATED,
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Send + Sync + Serialize,
{
    fn into_response(self) -> Response {
        let mut response = response::Json(self.data).into_response();
        *response.status_mut() = self.code;
        response
    }
}
