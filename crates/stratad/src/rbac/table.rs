//! The static policy and mutation tables.

use crate::audit::AuditAction;
use crate::methods::*;
use crate::users::Role;

use super::{MethodPermission, MutationTable, PolicyTable};

pub fn default_policy_table() -> PolicyTable {
    let mut table = PolicyTable::empty();

    // Auth: the handshake is public, everything else is the caller's own session
    table.insert(CHALLENGE, MethodPermission::public());
    table.insert(VERIFY_CHALLENGE, MethodPermission::public());
    table.insert(HEALTH_CHECK, MethodPermission::public());
    for method in [
        LOGOUT,
        REFRESH_SESSION,
        VALIDATE_SESSION,
        LIST_MY_SESSIONS,
        REVOKE_SESSION,
        REVOKE_ALL_SESSIONS,
    ] {
        table.insert(method, MethodPermission::authenticated());
    }

    // Users
    table.insert(GET_USER, MethodPermission::role(Role::Admin).with_self());
    table.insert(LIST_USERS, MethodPermission::role(Role::Admin).with_bootstrap());
    table.insert(UPDATE_USER_ROLE, MethodPermission::role(Role::Admin));
    table.insert(UPDATE_USER_STATUS, MethodPermission::role(Role::Admin));

    // Administration
    table.insert(GET_CONFIG, MethodPermission::role(Role::Admin).with_bootstrap());
    for method in [
        SHUTDOWN,
        TAIL_LOGS,
        LIST_AUDIT_ENTRIES,
        VERIFY_AUDIT_CHAIN,
        CREATE_BACKUP,
        RESTORE_BACKUP,
        LIST_MEMBERS,
        JOIN_NODE,
        REMOVE_NODE,
    ] {
        table.insert(method, MethodPermission::role(Role::Admin));
    }

    // Resources
    for method in [GET_TOPIC, LIST_TOPICS, GET_DATASET, LIST_DATASETS, QUERY_DATASET] {
        table.insert(method, MethodPermission::role(Role::Readonly));
    }
    for method in [CREATE_DATASET, DELETE_DATASET] {
        table.insert(method, MethodPermission::role(Role::User));
    }
    for method in [CREATE_TOPIC, UPDATE_TOPIC, DELETE_TOPIC] {
        table.insert(method, MethodPermission::role(Role::Admin));
    }

    table
}

pub fn default_mutation_table() -> MutationTable {
    let mut table = MutationTable::empty();

    table.insert(VERIFY_CHALLENGE, AuditAction::Create);
    table.insert(LOGOUT, AuditAction::Delete);
    table.insert(REVOKE_SESSION, AuditAction::Delete);
    table.insert(REVOKE_ALL_SESSIONS, AuditAction::Delete);

    table.insert(UPDATE_USER_ROLE, AuditAction::Update);
    table.insert(UPDATE_USER_STATUS, AuditAction::Update);

    for method in [SHUTDOWN, CREATE_BACKUP, RESTORE_BACKUP, JOIN_NODE, REMOVE_NODE] {
        table.insert(method, AuditAction::Execute);
    }

    table.insert(CREATE_TOPIC, AuditAction::Ddl);
    table.insert(UPDATE_TOPIC, AuditAction::Ddl);
    table.insert(DELETE_TOPIC, AuditAction::Ddl);
    table.insert(CREATE_DATASET, AuditAction::Create);
    table.insert(DELETE_DATASET, AuditAction::Delete);

    table
}
