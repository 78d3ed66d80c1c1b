use axum::{
    Extension, Json,
    extract::{Path, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::App;
use crate::db::vms::{NewVm, Vm};
use crate::errors::{Error, Result};
use crate::terminal;

use super::{ApiResponse, Principal};

pub async fn list(Extension(app): Extension<App>) -> Result<ApiResponse<Vec<Vm>>> {
    let vms = app.lifecycle.list().await?;
    Ok(ApiResponse::ok(vms))
}

pub async fn get(Extension(app): Extension<App>, Path(id): Path<Uuid>) -> Result<ApiResponse<Vm>> {
    let vm = app.lifecycle.get(id).await?;
    Ok(ApiResponse::ok(vm))
}

pub async fn create(
    Extension(app): Extension<App>,
    Json(new_vm): Json<NewVm>,
) -> Result<ApiResponse<Vm>> {
    use validator::Validate;
    new_vm.validate()?;
    let vm = app.lifecycle.create(&new_vm).await?;
    Ok(ApiResponse::created(vm))
}

pub async fn delete(Extension(app): Extension<App>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    app.lifecycle.delete(id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn start(Extension(app): Extension<App>, Path(id): Path<Uuid>) -> Result<ApiResponse<Vm>> {
    let vm = app.lifecycle.start(id).await?;
    Ok(ApiResponse::ok(vm))
}

pub async fn stop(Extension(app): Extension<App>, Path(id): Path<Uuid>) -> Result<ApiResponse<Vm>> {
    let vm = app.lifecycle.stop(id).await?;
    Ok(ApiResponse::ok(vm))
}

pub async fn attach_terminal(
    Extension(app): Extension<App>,
    Path(id): Path<Uuid>,
    principal: Option<Extension<Principal>>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    if principal.is_none() {
        return Err(Error::Unauthorized(
            "request carries no authenticated principal".into(),
        ));
    }

    let vm = app.lifecycle.get(id).await?;
    if vm.status != crate::db::vms::VmStatus::Running {
        return Err(Error::InvalidState(format!("vm {id} is not running")));
    }

    let Some((guard, cancel)) = app.terminal_registry.try_acquire(id).await else {
        return Err(Error::Conflict(format!(
            "vm {id} already has an active terminal connection"
        )));
    };

    let vm_dir = app.vm_dir.clone();
    Ok(ws
        .on_upgrade(move |socket| async move {
            let _guard = guard;
            terminal::run_session(socket, vm_dir, id, cancel).await;
        })
        .into_response())
}
