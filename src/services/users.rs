//! Users service: factory and route handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use sqlx::Row;
use tracing::error;

use crate::config::Settings;
use crate::database::{Database, DatabaseError};
use crate::service::Service;

pub const NAME: &str = "users";
pub const MOUNT_PATH: &str = "/api/v1/users";

#[derive(Clone)]
struct UsersState {
    database: Arc<Database>,
}

#[derive(Debug, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
}

/// Builds the users service: opens its pool from the settings, then
/// registers the route handlers. A pool failure aborts construction —
/// no half-initialized service is ever returned.
///
/// # Errors
///
/// Propagates [`DatabaseError::ConnectionFailed`] from the pool open.
pub fn service(settings: &Settings) -> Result<Service, DatabaseError> {
    let database = Database::open(settings).map_err(|err| {
        error!(error = %err, "establishing users database pool");
        err
    })?;
    let database = Arc::new(database);

    let routes = Router::new()
        .route("/", get(list_users))
        .route("/{id}", get(get_user))
        .with_state(UsersState {
            database: Arc::clone(&database),
        });

    Ok(Service::new(NAME, MOUNT_PATH)
        .with_database(database)
        .with_routes(routes))
}

async fn list_users(
    State(state): State<UsersState>,
) -> Result<Json<Vec<User>>, (StatusCode, Json<serde_json::Value>)> {
    let rows = sqlx::query("SELECT id, name, email FROM users ORDER BY id")
        .fetch_all(state.database.handle())
        .await
        .map_err(internal_error)?;

    let users = rows
        .iter()
        .map(|row| {
            Ok(User {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(internal_error)?;

    Ok(Json(users))
}

async fn get_user(
    State(state): State<UsersState>,
    Path(id): Path<i64>,
) -> Result<Json<User>, (StatusCode, Json<serde_json::Value>)> {
    let row = sqlx::query("SELECT id, name, email FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(state.database.handle())
        .await
        .map_err(internal_error)?;

    let Some(row) = row else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "user not found" })),
        ));
    };

    let user = User {
        id: row.try_get("id").map_err(internal_error)?,
        name: row.try_get("name").map_err(internal_error)?,
        email: row.try_get("email").map_err(internal_error)?,
    };
    Ok(Json(user))
}

/// Per-request failures never crash the accept loop: log the cause, hand
/// the client an opaque 500.
fn internal_error(err: sqlx::Error) -> (StatusCode, Json<serde_json::Value>) {
    error!(error = %err, "users query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal server error" })),
    )
}
