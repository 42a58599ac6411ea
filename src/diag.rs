//! Connection diagnostics: a structured trace of why a dry-run connection
//! attempt succeeded or failed, for user-facing reporting.

use std::time::Duration;

use drawbridge_backend::Backend;
use drawbridge_domain::id::DiagnosticId;
use drawbridge_domain::resource::{DatabaseServer, ResourceKind};
use drawbridge_domain::role::RoleSet;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::resources;

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum TraceType {
    RbacPrincipal,
    RbacNode,
    RbacDatabase,
    RbacDatabaseLogin,
    Connectivity,
    DatabaseDbUser,
    DatabaseDbName,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Success,
    Failed,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Trace {
    #[serde(rename = "type")]
    pub trace_type: TraceType,
    pub status: TraceStatus,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Trace {
    fn success(trace_type: TraceType, details: &str) -> Self {
        Self {
            trace_type,
            status: TraceStatus::Success,
            details: details.to_string(),
            error: None,
        }
    }

    fn failed(trace_type: TraceType, details: String, error: Option<String>) -> Self {
        Self {
            trace_type,
            status: TraceStatus::Failed,
            details,
            error,
        }
    }
}

/// Append-only diagnostic keyed by its id
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ConnectionDiagnostic {
    pub id: DiagnosticId,
    pub success: bool,
    pub message: String,
    pub traces: Vec<Trace>,
}

impl ConnectionDiagnostic {
    fn new() -> Self {
        Self {
            id: DiagnosticId::random(),
            success: false,
            message: "failed".to_string(),
            traces: vec![],
        }
    }

    fn push(&mut self, trace: Trace) {
        self.traces.push(trace);
    }

    fn succeed(&mut self) {
        self.success = true;
        self.message = "success".to_string();
    }

    pub fn trace(&self, trace_type: TraceType) -> Option<&Trace> {
        self.traces
            .iter()
            .find(|trace| trace.trace_type == trace_type)
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct DiagnoseRequest {
    pub resource_kind: ResourceKind,
    pub resource_name: String,
    #[serde(default)]
    pub db_user: Option<String>,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

fn default_dial_timeout_ms() -> u64 {
    1000
}

/// Dry-run a database connection for `roles`, producing the trace list.
/// RBAC failures short-circuit the remaining traces; connectivity is
/// attempted whenever reachability makes sense.
pub async fn diagnose_database<B: Backend>(
    backend: &B,
    roles: &RoleSet,
    request: &DiagnoseRequest,
) -> ConnectionDiagnostic {
    let mut diag = ConnectionDiagnostic::new();

    let databases: Vec<DatabaseServer> = resources::list(backend, ResourceKind::Database)
        .await
        .unwrap_or_default();
    let database = databases
        .into_iter()
        .find(|db| db.name == request.resource_name);

    let Some(database) = database else {
        diag.push(Trace::failed(
            TraceType::RbacDatabase,
            format!(
                "Database not found. Database {:?} is not registered in the cluster.",
                request.resource_name
            ),
            None,
        ));
        return diag;
    };

    if let Err(err) = roles.check_db_access(&database.labels) {
        diag.push(Trace::failed(
            TraceType::RbacDatabase,
            "Access denied when accessing Database. Please check the Error message for more information.".to_string(),
            Some(err.user_message()),
        ));
        return diag;
    }
    diag.push(Trace::success(
        TraceType::RbacDatabase,
        "A Database Agent is available to proxy the connection to the Database.",
    ));

    // reachability makes sense from here on, regardless of later failures
    let timeout = Duration::from_millis(request.dial_timeout_ms);
    match tokio::time::timeout(timeout, TcpStream::connect(&database.uri)).await {
        Ok(Ok(_)) => {
            diag.push(Trace::success(
                TraceType::Connectivity,
                "Database is accessible from the Database Agent.",
            ));
        }
        Ok(Err(err)) => {
            debug!(?err, uri = %database.uri, "diagnostic dial failed");
            diag.push(Trace::failed(
                TraceType::Connectivity,
                "Database is not accessible from the Database Agent.".to_string(),
                Some(err.to_string()),
            ));
            return diag;
        }
        Err(_) => {
            diag.push(Trace::failed(
                TraceType::Connectivity,
                "Database is not accessible from the Database Agent.".to_string(),
                Some(format!("dial timed out after {timeout:?}")),
            ));
            return diag;
        }
    }

    let db_user = request.db_user.clone().unwrap_or_default();
    let db_name = request.db_name.clone().unwrap_or_default();

    if let Err(err) = roles.check_db_login(&database.labels, &db_user, &db_name) {
        diag.push(Trace::failed(
            TraceType::RbacDatabaseLogin,
            "Access denied when accessing Database. Please check the Error message for more information.".to_string(),
            Some(err.user_message()),
        ));
        return diag;
    }
    diag.push(Trace::success(
        TraceType::RbacDatabaseLogin,
        "Access to Database User and Database Name granted.",
    ));

    if !database.known_users.is_empty() && !database.known_users.contains(&db_user) {
        diag.push(Trace::failed(
            TraceType::DatabaseDbUser,
            format!("Database User {db_user:?} does not exist in the Database."),
            None,
        ));
        return diag;
    }
    diag.push(Trace::success(
        TraceType::DatabaseDbUser,
        "Database User exists in the Database.",
    ));

    if !database.known_names.is_empty() && !database.known_names.contains(&db_name) {
        diag.push(Trace::failed(
            TraceType::DatabaseDbName,
            format!("Database Name {db_name:?} does not exist in the Database."),
            None,
        ));
        return diag;
    }
    diag.push(Trace::success(
        TraceType::DatabaseDbName,
        "Database Name exists in the Database.",
    ));

    diag.succeed();
    diag
}

#[cfg(test)]
mod tests {
    use super::*;
    use drawbridge_backend::memory::MemoryBackend;
    use drawbridge_domain::label::LabelMatcher;
    use drawbridge_domain::resource::DatabaseProtocol;
    use drawbridge_domain::role::{Role, RoleConditions};
    use tokio::net::TcpListener;

    async fn seed_database(backend: &MemoryBackend, name: &str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    return;
                };
                drop(conn);
            }
        });

        let database = DatabaseServer {
            name: name.to_string(),
            protocol: DatabaseProtocol::Postgres,
            uri: addr.to_string(),
            labels: Default::default(),
            host_id: "db-agent-1".to_string(),
            known_users: vec!["dbuser".to_string()],
            known_names: vec!["dbname".to_string()],
        };
        resources::upsert(backend, ResourceKind::Database, name, &database, None)
            .await
            .unwrap();
        addr
    }

    fn db_role() -> RoleSet {
        RoleSet::new(vec![Role {
            name: "db-access".to_string(),
            allow: RoleConditions {
                db_labels: LabelMatcher::wildcard(),
                db_users: vec!["dbuser".to_string()],
                db_names: vec!["dbname".to_string()],
                ..Default::default()
            },
            deny: Default::default(),
            options: Default::default(),
        }])
    }

    fn request(name: &str, db_user: &str, db_name: &str) -> DiagnoseRequest {
        DiagnoseRequest {
            resource_kind: ResourceKind::Database,
            resource_name: name.to_string(),
            db_user: Some(db_user.to_string()),
            db_name: Some(db_name.to_string()),
            dial_timeout_ms: 1000,
        }
    }

    #[test_log::test(tokio::test)]
    async fn postgres_happy_path() {
        let backend = MemoryBackend::new();
        seed_database(&backend, "mypsqldb").await;

        let diag =
            diagnose_database(&backend, &db_role(), &request("mypsqldb", "dbuser", "dbname"))
                .await;

        assert!(diag.success);
        assert_eq!("success", diag.message);

        let expectations = [
            (
                TraceType::RbacDatabase,
                "A Database Agent is available to proxy the connection to the Database.",
            ),
            (
                TraceType::Connectivity,
                "Database is accessible from the Database Agent.",
            ),
            (
                TraceType::RbacDatabaseLogin,
                "Access to Database User and Database Name granted.",
            ),
            (
                TraceType::DatabaseDbUser,
                "Database User exists in the Database.",
            ),
            (
                TraceType::DatabaseDbName,
                "Database Name exists in the Database.",
            ),
        ];
        for (trace_type, details) in expectations {
            let trace = diag.trace(trace_type).expect("trace present");
            assert_eq!(TraceStatus::Success, trace.status);
            assert_eq!(details, trace.details);
        }
    }

    #[test_log::test(tokio::test)]
    async fn database_not_found() {
        let backend = MemoryBackend::new();
        seed_database(&backend, "mypsqldb").await;

        let diag =
            diagnose_database(&backend, &db_role(), &request("dbnotfound", "dbuser", "dbname"))
                .await;

        assert!(!diag.success);
        assert_eq!("failed", diag.message);
        assert_eq!(1, diag.traces.len());

        let trace = diag.trace(TraceType::RbacDatabase).unwrap();
        assert_eq!(TraceStatus::Failed, trace.status);
        assert!(trace.details.starts_with("Database not found."), "{}", trace.details);
    }

    #[test_log::test(tokio::test)]
    async fn database_login_denied() {
        let backend = MemoryBackend::new();
        seed_database(&backend, "mypsqldb").await;

        let diag =
            diagnose_database(&backend, &db_role(), &request("mypsqldb", "root", "system")).await;

        assert!(!diag.success);
        assert_eq!("failed", diag.message);

        let trace = diag.trace(TraceType::RbacDatabaseLogin).unwrap();
        assert_eq!(TraceStatus::Failed, trace.status);
        assert_eq!(
            "Access denied when accessing Database. Please check the Error message for more information.",
            trace.details
        );
        // connectivity was still attempted before the login check
        assert!(diag.trace(TraceType::Connectivity).is_some());
    }
}
