//! Auth service flows: local login, SSO mapping, password reset,
//! impersonation, session minting and lock enforcement.

use std::time::Duration;

use drawbridge_domain::identity::CertUsage;
use drawbridge_domain::resource::{Lock, LockTarget, User};
use drawbridge_domain::role::{ImpersonateConditions, Role, RoleConditions, RoleOptions};
use drawbridge_domain::GatewayError;
use secrecy::ExposeSecret;
use test_log::test;

use crate::auth::{hash_password, system_identity, UserCertRequest};

use super::test_gateway;

fn dev_role(max_ttl: Duration) -> Role {
    Role {
        name: "dev".to_string(),
        allow: RoleConditions {
            logins: vec!["dev".to_string(), "ubuntu".to_string()],
            node_labels: drawbridge_domain::label::LabelMatcher::wildcard(),
            ..Default::default()
        },
        deny: Default::default(),
        options: RoleOptions {
            max_session_ttl: max_ttl,
            ..Default::default()
        },
    }
}

fn local_user(name: &str, password: Option<&str>) -> User {
    User {
        name: name.to_string(),
        roles: vec!["dev".to_string()],
        traits: Default::default(),
        password_hash: password.map(|p| hash_password(p).unwrap()),
    }
}

#[test(tokio::test)]
async fn password_login_and_reset() {
    let gateway = test_gateway(Default::default()).await;
    let auth = &gateway.ctx.auth;
    let system = system_identity();

    auth.upsert_role(&system, dev_role(Duration::from_secs(8 * 3600)))
        .await
        .unwrap();
    auth.upsert_user(&system, local_user("alice", Some("hunter2hunter2")))
        .await
        .unwrap();

    let identity = auth
        .authenticate_password("alice", "hunter2hunter2", true)
        .await
        .unwrap();
    assert_eq!("alice", identity.username);
    assert!(identity.mfa_verified);

    // wrong password and unknown users surface the same generic denial
    assert!(matches!(
        auth.authenticate_password("alice", "wrong", false).await,
        Err(GatewayError::AccessDenied)
    ));
    assert!(matches!(
        auth.authenticate_password("nobody", "hunter2hunter2", false).await,
        Err(GatewayError::AccessDenied)
    ));

    // reset flow: token is single-use and rewrites the hash
    let token = auth
        .create_reset_password_token(&system, "alice", Duration::from_secs(600))
        .await
        .unwrap();
    auth.reset_password(token.expose_secret(), "correct-horse-battery")
        .await
        .unwrap();

    auth.authenticate_password("alice", "correct-horse-battery", false)
        .await
        .unwrap();
    assert!(auth
        .reset_password(token.expose_secret(), "again")
        .await
        .is_err());

    gateway.cancel.cancel();
}

#[test(tokio::test)]
async fn sso_login_materializes_the_user() {
    let gateway = test_gateway(Default::default()).await;
    let auth = &gateway.ctx.auth;
    let system = system_identity();

    auth.upsert_role(&system, dev_role(Duration::from_secs(3600)))
        .await
        .unwrap();

    let identity = auth
        .authenticate_sso("carol", vec!["dev".to_string()], Default::default())
        .await
        .unwrap();
    assert_eq!("carol", identity.username);

    let user = auth.get_user("carol").await.unwrap();
    assert_eq!(vec!["dev"], user.roles);
    assert!(user.password_hash.is_none());

    gateway.cancel.cancel();
}

#[test(tokio::test)]
async fn cert_ttl_capped_by_the_role_set() {
    let gateway = test_gateway(Default::default()).await;
    let auth = &gateway.ctx.auth;
    let system = system_identity();

    auth.upsert_role(&system, dev_role(Duration::from_secs(3600)))
        .await
        .unwrap();
    auth.upsert_user(&system, local_user("alice", None))
        .await
        .unwrap();

    let bundle = auth
        .generate_user_certs(
            &system,
            UserCertRequest {
                username: "alice".to_string(),
                ttl_secs: 24 * 3600,
                usage: CertUsage::Ssh,
                route_to_cluster: None,
                impersonate: None,
                mfa_verified: false,
                connection_diagnostic_id: None,
            },
        )
        .await
        .unwrap();

    // a day was requested; the role caps it at an hour
    let not_after = bundle.tls.not_after().unwrap();
    let remaining = not_after - time::OffsetDateTime::now_utc();
    assert!(remaining <= time::Duration::hours(1) + time::Duration::minutes(1));

    // SSH usage carries the principal set from the role logins
    let ssh = bundle.ssh.expect("ssh cert for ssh usage");
    assert_eq!(
        vec!["dev".to_string(), "ubuntu".to_string()],
        ssh.valid_principals()
    );

    gateway.cancel.cancel();
}

#[test(tokio::test)]
async fn impersonation_is_gated_by_the_caller_roles() {
    let gateway = test_gateway(Default::default()).await;
    let auth = &gateway.ctx.auth;
    let system = system_identity();

    auth.upsert_role(&system, dev_role(Duration::from_secs(3600)))
        .await
        .unwrap();
    auth.upsert_role(
        &system,
        Role {
            name: "impersonator".to_string(),
            allow: RoleConditions {
                impersonate: ImpersonateConditions {
                    users: vec!["alice".to_string()],
                    roles: vec!["dev".to_string()],
                },
                ..Default::default()
            },
            deny: Default::default(),
            options: Default::default(),
        },
    )
    .await
    .unwrap();
    auth.upsert_user(&system, local_user("alice", None))
        .await
        .unwrap();
    auth.upsert_user(
        &system,
        User {
            name: "bot".to_string(),
            roles: vec!["impersonator".to_string()],
            traits: Default::default(),
            password_hash: None,
        },
    )
    .await
    .unwrap();
    auth.upsert_user(
        &system,
        User {
            name: "plain".to_string(),
            roles: vec!["dev".to_string()],
            traits: Default::default(),
            password_hash: None,
        },
    )
    .await
    .unwrap();

    let request = |caller: &str| UserCertRequest {
        username: caller.to_string(),
        ttl_secs: 600,
        usage: CertUsage::Ssh,
        route_to_cluster: None,
        impersonate: Some("alice".to_string()),
        mfa_verified: false,
        connection_diagnostic_id: None,
    };

    let bot = drawbridge_domain::identity::Identity::new(
        "bot",
        vec!["impersonator".to_string()],
        CertUsage::Ssh,
    );
    let bundle = auth.generate_user_certs(&bot, request("bot")).await.unwrap();
    let recovered =
        drawbridge_domain::sshcert::cert_identity(bundle.ssh.as_ref().unwrap()).unwrap();
    assert_eq!("alice", recovered.username);
    assert_eq!(Some("bot".to_string()), recovered.impersonator);

    let plain =
        drawbridge_domain::identity::Identity::new("plain", vec!["dev".to_string()], CertUsage::Ssh);
    assert!(matches!(
        auth.generate_user_certs(&plain, request("plain")).await,
        Err(GatewayError::AccessDenied)
    ));

    gateway.cancel.cancel();
}

#[test(tokio::test)]
async fn web_and_app_sessions_verify_against_the_jwt_authority() {
    let gateway = test_gateway(Default::default()).await;
    let auth = &gateway.ctx.auth;

    let web = auth
        .create_web_session("alice", Duration::from_secs(600))
        .unwrap();
    assert_eq!("alice", auth.validate_web_session(&web.token).unwrap());

    let app = auth
        .create_app_session("alice", "grafana", Duration::from_secs(600))
        .unwrap();
    assert_eq!("alice", auth.validate_web_session(&app.token).unwrap());

    assert!(auth.validate_web_session("not-a-token").is_err());

    gateway.cancel.cancel();
}

#[test(tokio::test)]
async fn locks_deny_cert_issuance() {
    let gateway = test_gateway(Default::default()).await;
    let auth = &gateway.ctx.auth;
    let system = system_identity();

    auth.upsert_role(&system, dev_role(Duration::from_secs(3600)))
        .await
        .unwrap();
    auth.upsert_user(&system, local_user("alice", None))
        .await
        .unwrap();
    auth.upsert_lock(
        &system,
        Lock {
            name: "ban-alice".to_string(),
            target: LockTarget {
                user: Some("alice".to_string()),
                ..Default::default()
            },
            message: Some("credentials reported stolen".to_string()),
            expires: None,
        },
    )
    .await
    .unwrap();

    // the lock propagates through the watcher
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let denied = auth
                .generate_user_certs(
                    &system,
                    UserCertRequest {
                        username: "alice".to_string(),
                        ttl_secs: 600,
                        usage: CertUsage::Ssh,
                        route_to_cluster: None,
                        impersonate: None,
                        mfa_verified: false,
                        connection_diagnostic_id: None,
                    },
                )
                .await;
            if matches!(denied, Err(GatewayError::Locked(_))) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("lock must start denying issuance");

    gateway.cancel.cancel();
}

#[test(tokio::test)]
async fn resource_mutation_requires_an_editor() {
    let gateway = test_gateway(Default::default()).await;
    let auth = &gateway.ctx.auth;

    let nobody =
        drawbridge_domain::identity::Identity::new("nobody", vec!["dev".to_string()], CertUsage::Ssh);
    let denied = auth
        .upsert_role(&nobody, dev_role(Duration::from_secs(3600)))
        .await;
    assert!(matches!(denied, Err(GatewayError::AccessDenied)));

    gateway.cancel.cancel();
}
