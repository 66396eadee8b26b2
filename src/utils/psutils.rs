use sysinfo::{Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use users::{Users, UsersCache};

/// Snapshot of the identifying fields of a running process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub cmd: Vec<String>,
}

/// Utility function to resolve a user ID to a username
pub fn resolve_username(uid: u32, users_cache: &UsersCache) -> String {
    users_cache
        .get_user_by_uid(uid)
        .map(|user| user.name().to_string_lossy().to_string())
        .unwrap_or_else(|| uid.to_string())
}

/// Owner of a process, or "unknown" when the platform does not report one.
pub fn process_owner(process: &Process, users_cache: &UsersCache) -> String {
    process
        .user_id()
        .map(|uid| resolve_username(**uid, users_cache))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Enumerates every running process with its name and command line.
pub fn list_processes() -> Vec<ProcessInfo> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );

    system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessInfo {
            pid: pid.as_u32(),
            parent: process.parent().map(|parent| parent.as_u32()),
            name: process.name().to_string_lossy().to_string(),
            cmd: process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect(),
        })
        .collect()
}
