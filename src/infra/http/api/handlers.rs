//! Timestamp handlers

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{Map, Value};
use slastamp_api_types::{CreateTimestampRequest, CreateTimestampResponse, ListTimestampsQuery};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::domain::timestamps::{CreateTimestampCommand, DEFAULT_LIST_LIMIT, TimestampQuery};
use crate::domain::types::{Stage, Tag};
use crate::infra::http::service_error_to_api;

use super::error::ApiError;
use super::state::ApiState;

pub async fn create_timestamp(
    State(state): State<ApiState>,
    payload: Result<Json<CreateTimestampRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload.map_err(|rejection| ApiError::invalid_json(rejection.body_text()))?;

    let command = CreateTimestampCommand {
        external_id: payload.external_id,
        timestamp: payload.timestamp,
        tag: payload.tag,
        stage: payload.stage,
        meta: payload.meta.unwrap_or_default(),
    };

    let id = state
        .timestamps
        .create(command)
        .await
        .map_err(service_error_to_api)?;

    Ok((StatusCode::CREATED, Json(CreateTimestampResponse { id })))
}

pub async fn get_timestamp(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let record = state
        .timestamps
        .get_by_id(id)
        .await
        .map_err(service_error_to_api)?;

    Ok(Json(record))
}

pub async fn list_timestamps(
    State(state): State<ApiState>,
    query: Result<Query<ListTimestampsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query
        .map_err(|rejection| ApiError::bad_request("Invalid query", Some(rejection.body_text())))?;
    let query = query_from_params(query)?;

    let records = state
        .timestamps
        .list(query)
        .await
        .map_err(service_error_to_api)?;

    Ok(Json(records))
}

pub async fn delete_timestamp(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    state
        .timestamps
        .delete(id)
        .await
        .map_err(service_error_to_api)?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn health(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    state.timestamps.ping().await.map_err(service_error_to_api)?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|err| ApiError::bad_request("Invalid timestamp id", Some(err.to_string())))
}

/// Translate query-string parameters into a domain query; range and limit checks happen in the service.
fn query_from_params(params: ListTimestampsQuery) -> Result<TimestampQuery, ApiError> {
    let tag = params
        .tag
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::parse::<Tag>)
        .transpose()
        .map_err(|err| ApiError::bad_request("Invalid tag", Some(err.to_string())))?;

    let stage = params
        .stage
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::parse::<Stage>)
        .transpose()
        .map_err(|err| ApiError::bad_request("Invalid stage", Some(err.to_string())))?;

    let from = parse_instant(params.timestamp_from.as_deref(), "timestamp_from")?;
    let to = parse_instant(params.timestamp_to.as_deref(), "timestamp_to")?;

    let meta = match params.meta_filter.as_deref().map(str::trim) {
        None | Some("") => Map::new(),
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(ApiError::bad_request(
                    "Invalid meta_filter",
                    Some("meta_filter must be a JSON object".to_string()),
                ));
            }
            Err(err) => {
                return Err(ApiError::bad_request(
                    "Invalid meta_filter",
                    Some(err.to_string()),
                ));
            }
        },
    };

    Ok(TimestampQuery {
        limit: params.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        offset: params.offset.unwrap_or(0),
        external_id: params.external_id,
        tag,
        stage,
        from,
        to,
        meta,
    })
}

fn parse_instant(raw: Option<&str>, field: &str) -> Result<Option<OffsetDateTime>, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => OffsetDateTime::parse(value, &Rfc3339).map(Some).map_err(|err| {
            ApiError::bad_request(
                "Invalid timestamp range",
                Some(format!("{field} must be RFC 3339: {err}")),
            )
        }),
    }
}
