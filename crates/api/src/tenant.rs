//! Request tenant taken from the `TENANT_ID`, `REGION`, `MAJOR_VERSION` and
//! `MINOR_VERSION` headers.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use common::{Tenant, TenantId};
use uuid::Uuid;

use crate::error::ApiError;

// Header names are case-insensitive; `http` stores them lowercased.
pub const TENANT_ID_HEADER: &str = "tenant_id";
pub const REGION_HEADER: &str = "region";
pub const MAJOR_VERSION_HEADER: &str = "major_version";
pub const MINOR_VERSION_HEADER: &str = "minor_version";

/// The tenant a request acts for.
#[derive(Debug, Clone)]
pub struct RequestTenant(pub Tenant);

impl<S: Send + Sync> FromRequestParts<S> for RequestTenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        tenant_from_headers(&parts.headers).map(RequestTenant)
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {name} header")))
}

fn version(headers: &HeaderMap, name: &str) -> Result<u16, ApiError> {
    let value = header(headers, name)?;
    value
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {name} header: {value}")))
}

pub fn tenant_from_headers(headers: &HeaderMap) -> Result<Tenant, ApiError> {
    let id = header(headers, TENANT_ID_HEADER)?;
    let id = Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("invalid {TENANT_ID_HEADER} header: {e}")))?;

    Ok(Tenant::new(
        TenantId::from_uuid(id),
        header(headers, REGION_HEADER)?,
        version(headers, MAJOR_VERSION_HEADER)?,
        version(headers, MINOR_VERSION_HEADER)?,
    ))
}
