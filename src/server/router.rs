//! Mux assembly: mount-path validation, prefix mounting, 404 fallback.
//!
//! Prefix dispatch only: each service is nested at its mount path, which
//! strips the prefix before the service's own table dispatches. Anything
//! unmatched falls through to an explicit `404` handler.

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::Router;

use super::host::ServerError;
use crate::service::HostedService;

/// Rejects ambiguous or malformed mount configurations before any route
/// is registered. Determinism over first-match mux semantics: duplicate
/// names, equal or nested mount paths, and more than one directly
/// registered service are all construction errors.
pub(crate) fn validate_mounts(
    services: &[Arc<dyn HostedService>],
    roots: &[Arc<dyn HostedService>],
) -> Result<(), ServerError> {
    if roots.len() > 1 {
        return Err(ServerError::RootServiceConflict);
    }

    // Roots share the name space and the path rules even though their
    // mount path is not used for dispatch.
    let mut names = HashSet::new();
    for service in services.iter().chain(roots.iter()) {
        if !names.insert(service.name().to_string()) {
            return Err(ServerError::DuplicateServiceName(
                service.name().to_string(),
            ));
        }

        let path = service.mount_path();
        if path.len() < 2 || !path.starts_with('/') || path.ends_with('/') {
            return Err(ServerError::InvalidMountPath(path.to_string()));
        }
    }

    for (index, service) in services.iter().enumerate() {
        for other in &services[index + 1..] {
            if paths_overlap(service.mount_path(), other.mount_path()) {
                return Err(ServerError::MountCollision {
                    path: other.mount_path().to_string(),
                    existing: service.mount_path().to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Segment-aware prefix overlap: `/api` collides with `/api` and with
/// `/api/v1`, but not with `/apiary`.
fn paths_overlap(a: &str, b: &str) -> bool {
    a == b || b.starts_with(&format!("{a}/")) || a.starts_with(&format!("{b}/"))
}

/// Composes the base dispatcher: an optional directly registered service,
/// every prefixed service nested at its mount path (registration order),
/// and the not-found fallback.
pub(crate) fn build_mux(
    services: &[Arc<dyn HostedService>],
    roots: &[Arc<dyn HostedService>],
) -> Router {
    let mut mux = Router::new();

    if let Some(root) = roots.first() {
        mux = root.register_router(mux);
    }

    for service in services {
        mux = mux.nest(service.mount_path(), service.routes());
    }

    mux.fallback(not_found)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
