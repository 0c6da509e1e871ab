//! Fully-qualified RPC method names.

pub const AUTH_SERVICE: &str = "strata.v1.AuthService";
pub const CHALLENGE: &str = "/strata.v1.AuthService/Challenge";
pub const VERIFY_CHALLENGE: &str = "/strata.v1.AuthService/VerifyChallenge";
pub const LOGOUT: &str = "/strata.v1.AuthService/Logout";
pub const REFRESH_SESSION: &str = "/strata.v1.AuthService/RefreshSession";
pub const VALIDATE_SESSION: &str = "/strata.v1.AuthService/ValidateSession";
pub const LIST_MY_SESSIONS: &str = "/strata.v1.AuthService/ListMySessions";
pub const REVOKE_SESSION: &str = "/strata.v1.AuthService/RevokeSession";
pub const REVOKE_ALL_SESSIONS: &str = "/strata.v1.AuthService/RevokeAllSessions";

pub const GET_USER: &str = "/strata.v1.UserService/GetUser";
pub const LIST_USERS: &str = "/strata.v1.UserService/ListUsers";
pub const UPDATE_USER_ROLE: &str = "/strata.v1.UserService/UpdateUserRole";
pub const UPDATE_USER_STATUS: &str = "/strata.v1.UserService/UpdateUserStatus";

pub const GET_CONFIG: &str = "/strata.v1.AdminService/GetConfig";
pub const SHUTDOWN: &str = "/strata.v1.AdminService/Shutdown";
pub const TAIL_LOGS: &str = "/strata.v1.AdminService/TailLogs";
pub const LIST_AUDIT_ENTRIES: &str = "/strata.v1.AdminService/ListAuditEntries";
pub const VERIFY_AUDIT_CHAIN: &str = "/strata.v1.AdminService/VerifyAuditChain";
pub const CREATE_BACKUP: &str = "/strata.v1.AdminService/CreateBackup";
pub const RESTORE_BACKUP: &str = "/strata.v1.AdminService/RestoreBackup";

pub const LIST_MEMBERS: &str = "/strata.v1.ClusterService/ListMembers";
pub const JOIN_NODE: &str = "/strata.v1.ClusterService/JoinNode";
pub const REMOVE_NODE: &str = "/strata.v1.ClusterService/RemoveNode";

pub const HEALTH_CHECK: &str = "/strata.v1.HealthService/Check";

pub const CREATE_TOPIC: &str = "/strata.v1.TopicService/CreateTopic";
pub const GET_TOPIC: &str = "/strata.v1.TopicService/GetTopic";
pub const LIST_TOPICS: &str = "/strata.v1.TopicService/ListTopics";
pub const UPDATE_TOPIC: &str = "/strata.v1.TopicService/UpdateTopic";
pub const DELETE_TOPIC: &str = "/strata.v1.TopicService/DeleteTopic";

pub const CREATE_DATASET: &str = "/strata.v1.DatasetService/CreateDataset";
pub const GET_DATASET: &str = "/strata.v1.DatasetService/GetDataset";
pub const LIST_DATASETS: &str = "/strata.v1.DatasetService/ListDatasets";
pub const DELETE_DATASET: &str = "/strata.v1.DatasetService/DeleteDataset";
pub const QUERY_DATASET: &str = "/strata.v1.DatasetService/Query";

/// `"/pkg.Service/Method"` → `("pkg.Service", "Method")`
pub fn split(method: &str) -> Option<(&str, &str)> {
    let rest = method.strip_prefix('/')?;
    let (service, name) = rest.split_once('/')?;
    if service.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((service, name))
}

/// Audit resource for a method: the bare service name without its
/// `Service` suffix, lowercased (`/strata.v1.TopicService/X` → `topic`).
pub fn resource_of(method: &str) -> String {
    let service = split(method).map(|(s, _)| s).unwrap_or(method);
    let bare = service.rsplit('.').next().unwrap_or(service);
    bare.strip_suffix("Service").unwrap_or(bare).to_lowercase()
}
