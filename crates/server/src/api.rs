//! JSON routes over the allocation engine.
//!
//! Caller identity arrives in `x-user-id` / `x-user-role` headers set by the upstream identity
//! provider. The router is generic over the engine's store, directory and notifier so the same
//! routes serve the SQLite deployment and in-memory tests.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use provisio_core::allocation::{
    AllocationEngine, AllocationStore, AvailabilityQuery, CreateRequest, OperationContext,
};
use provisio_core::approvals::UserDirectory;
use provisio_core::domain::request::{RequestSnapshot, ResourceRequestId};
use provisio_core::domain::resource::{PhaseId, ResourceId};
use provisio_core::domain::user::{Caller, Role};
use provisio_core::errors::{AllocationError, ErrorClass, InterfaceError};
use provisio_core::flows::states::ActionCommand;
use provisio_core::ledger::AvailabilityReport;
use provisio_core::notify::Notifier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

type SharedEngine<S, D, N> = Arc<AllocationEngine<S, D, N>>;

pub fn router<S, D, N>(engine: SharedEngine<S, D, N>) -> Router
where
    S: AllocationStore + 'static,
    D: UserDirectory + 'static,
    N: Notifier + 'static,
{
    Router::new()
        .route("/requests", post(create_request::<S, D, N>))
        .route("/requests/{id}", get(get_request::<S, D, N>))
        .route("/requests/{id}/actions", post(act::<S, D, N>))
        .route("/resources/{id}/availability", get(resource_availability::<S, D, N>))
        .route("/phases/{phase_id}/availability", get(type_availability::<S, D, N>))
        .with_state(engine)
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

#[derive(Serialize)]
struct ErrorBody {
    error: InterfaceError,
    hint: &'static str,
}

impl ApiError {
    fn new(error: AllocationError, correlation_id: &str) -> Self {
        Self(error.into_interface(correlation_id))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.class {
            ErrorClass::BadRequest => StatusCode::BAD_REQUEST,
            ErrorClass::Forbidden => StatusCode::FORBIDDEN,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        let hint = self.0.user_message();
        (status, Json(ErrorBody { error: self.0, hint })).into_response()
    }
}

/// Correlation id from `x-correlation-id`, or a fresh one.
pub struct CorrelationId(pub String);

impl<St: Send + Sync> FromRequestParts<St> for CorrelationId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        Ok(Self(correlation_id(parts)))
    }
}

/// Authenticated caller plus correlation id.
pub struct RequestContext(pub OperationContext);

impl<St: Send + Sync> FromRequestParts<St> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        let correlation_id = correlation_id(parts);

        let user_id = header_value(parts, USER_ID_HEADER).ok_or_else(|| {
            ApiError::new(
                AllocationError::validation(USER_ID_HEADER, "header is required"),
                &correlation_id,
            )
        })?;
        let raw_role = header_value(parts, USER_ROLE_HEADER).ok_or_else(|| {
            ApiError::new(
                AllocationError::validation(USER_ROLE_HEADER, "header is required"),
                &correlation_id,
            )
        })?;
        let role = Role::parse(&raw_role).ok_or_else(|| {
            ApiError::new(
                AllocationError::validation(USER_ROLE_HEADER, format!("unknown role `{raw_role}`")),
                &correlation_id,
            )
        })?;

        let context = OperationContext::new(Caller::new(user_id, role))
            .with_correlation_id(correlation_id);
        Ok(Self(context))
    }
}

fn correlation_id(parts: &Parts) -> String {
    header_value(parts, CORRELATION_ID_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn json_body<T>(
    body: Result<Json<T>, JsonRejection>,
    correlation_id: &str,
) -> Result<T, ApiError> {
    body.map(|Json(value)| value).map_err(|rejection| {
        ApiError::new(AllocationError::validation("body", rejection.body_text()), correlation_id)
    })
}

async fn create_request<S, D, N>(
    State(engine): State<SharedEngine<S, D, N>>,
    RequestContext(context): RequestContext,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RequestSnapshot>), ApiError>
where
    S: AllocationStore,
    D: UserDirectory,
    N: Notifier,
{
    let command = json_body(body, &context.correlation_id)?;
    let snapshot = engine
        .create_request(&context, command)
        .await
        .map_err(|error| ApiError::new(error, &context.correlation_id))?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_request<S, D, N>(
    State(engine): State<SharedEngine<S, D, N>>,
    CorrelationId(correlation_id): CorrelationId,
    Path(id): Path<String>,
) -> Result<Json<RequestSnapshot>, ApiError>
where
    S: AllocationStore,
    D: UserDirectory,
    N: Notifier,
{
    engine
        .get_request(&ResourceRequestId(id))
        .await
        .map(Json)
        .map_err(|error| ApiError::new(error, &correlation_id))
}

async fn act<S, D, N>(
    State(engine): State<SharedEngine<S, D, N>>,
    RequestContext(context): RequestContext,
    Path(id): Path<String>,
    body: Result<Json<ActionCommand>, JsonRejection>,
) -> Result<Json<RequestSnapshot>, ApiError>
where
    S: AllocationStore,
    D: UserDirectory,
    N: Notifier,
{
    let command = json_body(body, &context.correlation_id)?;
    engine
        .act(&context, &ResourceRequestId(id), command)
        .await
        .map(Json)
        .map_err(|error| ApiError::new(error, &context.correlation_id))
}

async fn resource_availability<S, D, N>(
    State(engine): State<SharedEngine<S, D, N>>,
    CorrelationId(correlation_id): CorrelationId,
    Path(id): Path<String>,
) -> Result<Json<AvailabilityReport>, ApiError>
where
    S: AllocationStore,
    D: UserDirectory,
    N: Notifier,
{
    engine
        .availability(&AvailabilityQuery::Resource { resource_id: ResourceId(id) })
        .await
        .map(Json)
        .map_err(|error| ApiError::new(error, &correlation_id))
}

#[derive(Debug, Deserialize)]
struct TypeAvailabilityParams {
    resource_type: Option<String>,
}

async fn type_availability<S, D, N>(
    State(engine): State<SharedEngine<S, D, N>>,
    CorrelationId(correlation_id): CorrelationId,
    Path(phase_id): Path<String>,
    params: Result<Query<TypeAvailabilityParams>, QueryRejection>,
) -> Result<Json<AvailabilityReport>, ApiError>
where
    S: AllocationStore,
    D: UserDirectory,
    N: Notifier,
{
    let resource_type = params
        .ok()
        .and_then(|Query(params)| params.resource_type)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            ApiError::new(
                AllocationError::validation("resource_type", "query parameter is required"),
                &correlation_id,
            )
        })?;

    engine
        .availability(&AvailabilityQuery::ResourceType {
            phase_id: PhaseId(phase_id),
            resource_type,
        })
        .await
        .map(Json)
        .map_err(|error| ApiError::new(error, &correlation_id))
}
