//! UserService handlers (thin wrappers over the user store)

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use super::{decode, to_value, Services};
use crate::error::{Status, Violations};
use crate::pipeline::{CallContext, CallResult};
use crate::users::{Role, User, UserStatus};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GetUserRequest {
    pub user_id: String,
}

fn load_user(services: &Services, user_id: &str) -> Result<User, Status> {
    services
        .auth
        .users()
        .get(user_id)
        .map_err(Status::internal)?
        .ok_or_else(|| Status::not_found(format!("user {user_id} not found")))
}

fn require_user_id(user_id: &str, violations: &mut Violations) {
    violations.require("user_id", !user_id.is_empty(), "user id is required");
}

pub async fn get_user(services: Arc<Services>, _ctx: CallContext, request: Value) -> CallResult {
    let req: GetUserRequest = decode(request)?;
    let mut violations = Violations::new();
    require_user_id(&req.user_id, &mut violations);
    violations.into_result()?;

    to_value(&load_user(&services, &req.user_id)?)
}

pub async fn list_users(services: Arc<Services>, _ctx: CallContext, _request: Value) -> CallResult {
    let mut users = services.auth.users().list().map_err(Status::internal)?;
    users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(json!({ "total": users.len(), "users": users }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdateUserRoleRequest {
    pub user_id: String,
    pub role: String,
}

pub async fn update_user_role(
    services: Arc<Services>,
    ctx: CallContext,
    request: Value,
) -> CallResult {
    let req: UpdateUserRoleRequest = decode(request)?;
    let mut violations = Violations::new();
    require_user_id(&req.user_id, &mut violations);
    let role = match req.role.parse::<Role>() {
        Ok(role) => Some(role),
        Err(err) => {
            violations.push("role", err);
            None
        }
    };
    violations.into_result()?;
    let Some(role) = role else {
        return Err(Status::invalid_argument("role is required"));
    };

    let change = services.auth.change_access(&req.user_id, Some(role), None)?;
    if change.previous_role != role {
        tracing::info!(
            user_id = %change.user.id,
            from = %change.previous_role,
            to = %role,
            by = %ctx.user_id().unwrap_or("bootstrap"),
            "User role changed"
        );
    }
    to_value(&change.user)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdateUserStatusRequest {
    pub user_id: String,
    pub status: String,
}

pub async fn update_user_status(
    services: Arc<Services>,
    ctx: CallContext,
    request: Value,
) -> CallResult {
    let req: UpdateUserStatusRequest = decode(request)?;
    let mut violations = Violations::new();
    require_user_id(&req.user_id, &mut violations);
    let status = match req.status.parse::<UserStatus>() {
        Ok(status) => Some(status),
        Err(err) => {
            violations.push("status", err);
            None
        }
    };
    violations.into_result()?;
    let Some(status) = status else {
        return Err(Status::invalid_argument("status is required"));
    };

    let change = services.auth.change_access(&req.user_id, None, Some(status))?;
    let user = change.user;

    let sessions_ended = if matches!(status, UserStatus::Suspended | UserStatus::Deleted) {
        services.auth.end_user_sessions(&user.id)?
    } else {
        0
    };

    tracing::info!(
        user_id = %user.id,
        from = %change.previous_status,
        to = %status,
        sessions_ended,
        by = %ctx.user_id().unwrap_or("bootstrap"),
        "User status changed"
    );
    Ok(json!({ "user": user, "sessions_ended": sessions_ended }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use crate::methods;
    use crate::rpc::testing;

    #[tokio::test]
    async fn get_user_validates_and_finds() {
        let services = testing::services();
        let (_, ctx) = testing::login(&services, methods::GET_USER);
        let user_id = ctx.user_id().unwrap().to_string();

        let err = get_user(services.clone(), ctx.clone(), json!({})).await.unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);

        let err = get_user(services.clone(), ctx.clone(), json!({ "user_id": "ghost" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);

        let user = get_user(services, ctx, json!({ "user_id": user_id })).await.unwrap();
        assert_eq!(user["role"], "admin");
    }

    #[tokio::test]
    async fn role_change_rejects_unknown_role() {
        let services = testing::services();
        let (_, admin) = testing::login(&services, methods::UPDATE_USER_ROLE);
        let err = update_user_role(
            services,
            admin.clone(),
            json!({ "user_id": admin.user_id().unwrap(), "role": "root" }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert_eq!(err.violations[0].field, "role");
    }

    #[tokio::test]
    async fn last_admin_cannot_demote_itself() {
        let services = testing::services();
        let (_, admin) = testing::login(&services, methods::UPDATE_USER_ROLE);
        let err = update_user_role(
            services,
            admin.clone(),
            json!({ "user_id": admin.user_id().unwrap(), "role": "user" }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn suspension_ends_sessions() {
        let services = testing::services();
        let (_, admin) = testing::login(&services, methods::UPDATE_USER_STATUS);
        let (_, member) = testing::login(&services, methods::LIST_MY_SESSIONS);
        let member_id = member.user_id().unwrap().to_string();
        let token = member.caller.as_ref().unwrap().session_id().to_string();

        let response = update_user_status(
            services.clone(),
            admin,
            json!({ "user_id": member_id, "status": "suspended" }),
        )
        .await
        .unwrap();
        assert_eq!(response["sessions_ended"], 1);
        assert_eq!(response["user"]["status"], "suspended");

        let validation = services.auth.validate_session(&token).unwrap();
        assert!(!validation.valid);
    }

    #[tokio::test]
    async fn promote_member_to_admin() {
        let services = testing::services();
        let (_, admin) = testing::login(&services, methods::UPDATE_USER_ROLE);
        let (_, member) = testing::login(&services, methods::GET_USER);

        let updated = update_user_role(
            services.clone(),
            admin,
            json!({ "user_id": member.user_id().unwrap(), "role": "admin" }),
        )
        .await
        .unwrap();
        assert_eq!(updated["role"], "admin");

        let listed = list_users(services, member, Value::Null).await.unwrap();
        assert_eq!(listed["total"], 2);
    }
}
