//! Database connection diagnostics through the web API.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use drawbridge_domain::identity::{CertUsage, Identity};
use drawbridge_domain::label::LabelMatcher;
use drawbridge_domain::resource::{DatabaseProtocol, DatabaseServer, User};
use drawbridge_domain::role::{Role, RoleConditions};
use serde_json::{json, Value};
use test_log::test;
use tokio::net::TcpListener;
use tower::util::ServiceExt;

use crate::auth::system_identity;
use crate::web::{self, PeerIdentity};

use super::test_gateway;

async fn seed_cluster(gateway: &super::TestGateway) -> std::net::SocketAddr {
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

    let system = system_identity();
    gateway
        .ctx
        .auth
        .upsert_role(
            &system,
            Role {
                name: "db-access".to_string(),
                allow: RoleConditions {
                    db_labels: LabelMatcher::wildcard(),
                    db_users: vec!["dbuser".to_string()],
                    db_names: vec!["dbname".to_string()],
                    ..Default::default()
                },
                deny: Default::default(),
                options: Default::default(),
            },
        )
        .await
        .unwrap();
    gateway
        .ctx
        .auth
        .upsert_user(
            &system,
            User {
                name: "alice".to_string(),
                roles: vec!["db-access".to_string()],
                traits: Default::default(),
                password_hash: None,
            },
        )
        .await
        .unwrap();
    gateway
        .ctx
        .auth
        .upsert_database(DatabaseServer {
            name: "mypsqldb".to_string(),
            protocol: DatabaseProtocol::Postgres,
            uri: addr.to_string(),
            labels: Default::default(),
            host_id: "db-agent-1".to_string(),
            known_users: vec!["dbuser".to_string()],
            known_names: vec!["dbname".to_string()],
        })
        .await
        .unwrap();

    addr
}

async fn post_diagnose(gateway: &super::TestGateway, body: Value) -> (StatusCode, Value) {
    let router = web::router().with_state(gateway.ctx.clone());

    let identity = Identity::new("alice", vec!["db-access".to_string()], CertUsage::Database);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/webapi/sites/root.test/diagnostics/connections")
        .header(header::CONTENT_TYPE, "application/json")
        .extension(PeerIdentity(Some(identity)))
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn trace<'a>(diag: &'a Value, trace_type: &str) -> Option<&'a Value> {
    diag["traces"]
        .as_array()
        .unwrap()
        .iter()
        .find(|trace| trace["type"] == trace_type)
}

#[test(tokio::test)]
async fn diagnose_postgres_happy_path() {
    let gateway = test_gateway(Default::default()).await;
    seed_cluster(&gateway).await;

    let (status, diag) = post_diagnose(
        &gateway,
        json!({
            "resource_kind": "database",
            "resource_name": "mypsqldb",
            "db_user": "dbuser",
            "db_name": "dbname",
            "dial_timeout_ms": 1000,
        }),
    )
    .await;

    assert_eq!(StatusCode::OK, status);
    assert_eq!(true, diag["success"]);
    assert_eq!("success", diag["message"]);

    for (trace_type, details) in [
        (
            "rbac_database",
            "A Database Agent is available to proxy the connection to the Database.",
        ),
        (
            "connectivity",
            "Database is accessible from the Database Agent.",
        ),
        (
            "rbac_database_login",
            "Access to Database User and Database Name granted.",
        ),
        ("database_db_user", "Database User exists in the Database."),
        ("database_db_name", "Database Name exists in the Database."),
    ] {
        let trace = trace(&diag, trace_type).expect(trace_type);
        assert_eq!("success", trace["status"], "{trace_type}");
        assert_eq!(details, trace["details"], "{trace_type}");
    }

    // the seeding upserts made it to the audit sink
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    assert!(gateway
        .audit_sink
        .events()
        .iter()
        .any(|event| event.event.event_type() == "resource.upserted"));

    gateway.cancel.cancel();
}

#[test(tokio::test)]
async fn diagnose_database_not_found() {
    let gateway = test_gateway(Default::default()).await;
    seed_cluster(&gateway).await;

    let (status, diag) = post_diagnose(
        &gateway,
        json!({
            "resource_kind": "database",
            "resource_name": "dbnotfound",
            "db_user": "dbuser",
            "db_name": "dbname",
        }),
    )
    .await;

    assert_eq!(StatusCode::OK, status);
    assert_eq!(false, diag["success"]);
    assert_eq!("failed", diag["message"]);
    assert_eq!(1, diag["traces"].as_array().unwrap().len());

    let trace = trace(&diag, "rbac_database").unwrap();
    assert_eq!("failed", trace["status"]);
    assert!(
        trace["details"]
            .as_str()
            .unwrap()
            .starts_with("Database not found."),
        "{}",
        trace["details"]
    );

    gateway.cancel.cancel();
}

#[test(tokio::test)]
async fn diagnose_database_login_denied() {
    let gateway = test_gateway(Default::default()).await;
    seed_cluster(&gateway).await;

    let (status, diag) = post_diagnose(
        &gateway,
        json!({
            "resource_kind": "database",
            "resource_name": "mypsqldb",
            "db_user": "root",
            "db_name": "system",
        }),
    )
    .await;

    assert_eq!(StatusCode::OK, status);
    assert_eq!(false, diag["success"]);
    assert_eq!("failed", diag["message"]);

    let trace = trace(&diag, "rbac_database_login").unwrap();
    assert_eq!("failed", trace["status"]);
    assert_eq!(
        "Access denied when accessing Database. Please check the Error message for more information.",
        trace["details"]
    );

    gateway.cancel.cancel();
}

#[test(tokio::test)]
async fn diagnose_requires_an_identity() {
    let gateway = test_gateway(Default::default()).await;
    seed_cluster(&gateway).await;

    let router = web::router().with_state(gateway.ctx.clone());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/webapi/sites/root.test/diagnostics/connections")
        .header(header::CONTENT_TYPE, "application/json")
        .extension(PeerIdentity(None))
        .body(Body::from(
            json!({
                "resource_kind": "database",
                "resource_name": "mypsqldb",
            })
            .to_string(),
        ))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(StatusCode::FORBIDDEN, response.status());

    gateway.cancel.cancel();
}
