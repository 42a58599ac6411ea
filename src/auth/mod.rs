//! The auth service: authoritative resource store and certificate issuer.
//!
//! Every request arrives with a verified identity extracted from the mTLS
//! client certificate. Mutations of cluster-scoped resources go through
//! here exclusively; proxies and agents cache them via watchers.

use std::sync::Arc;

use drawbridge_backend::Backend;
use drawbridge_domain::cluster::ClusterName;
use drawbridge_domain::identity::{CertUsage, Identity};
use drawbridge_domain::label::Labels;
use drawbridge_domain::resource::{
    DatabaseServer, HostRole, KubeCluster, Lock, ResourceKind, ReverseTunnel, Server,
    TrustedCluster, User,
};
use drawbridge_domain::role::{Role, RoleSet};
use drawbridge_domain::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::audit::{AuditEmitter, AuditEvent};
use crate::ca::{CaStore, CaType, HostCertBundle, RemoteAuthority, RotationRequest, UserCertBundle};

pub mod locks;
pub mod resources;
pub mod tokens;
pub mod watch;

pub use locks::{LockQuery, LockWatcher};
pub use watch::{WatchDispatcher, WatchEvent, WatchStream};

/// Roles whose holders may mutate cluster-scoped resources
const EDITOR_ROLES: &[&str] = &["editor", "admin"];

/// The identity internal components act under
pub fn system_identity() -> Identity {
    Identity::new("system", vec!["editor".to_string()], CertUsage::Ssh)
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct UserCertRequest {
    pub username: String,
    pub ttl_secs: u64,
    pub usage: CertUsage,
    #[serde(default)]
    pub route_to_cluster: Option<ClusterName>,
    /// Present when the caller requests certificates for another user
    #[serde(default)]
    pub impersonate: Option<String>,
    #[serde(default)]
    pub mfa_verified: bool,
    #[serde(default)]
    pub connection_diagnostic_id: Option<drawbridge_domain::id::DiagnosticId>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct WebSession {
    pub token: String,
    pub user: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires: OffsetDateTime,
}

#[derive(Serialize, Deserialize)]
struct WebSessionClaims {
    sub: String,
    sid: String,
    exp: i64,
    /// Application the session is scoped to, when minted for app access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ResetToken {
    user: String,
    secret_hash: String,
}

pub struct AuthService<B> {
    backend: B,
    ca: Arc<CaStore>,
    cluster: ClusterName,
    dispatcher: WatchDispatcher,
    locks: LockWatcher,
    audit: AuditEmitter,
}

impl<B: Backend + Clone> AuthService<B> {
    pub fn new(
        backend: B,
        ca: Arc<CaStore>,
        dispatcher: WatchDispatcher,
        locks: LockWatcher,
        audit: AuditEmitter,
    ) -> Self {
        let cluster = ca.cluster().clone();
        Self {
            backend,
            ca,
            cluster,
            dispatcher,
            locks,
            audit,
        }
    }

    pub fn cluster(&self) -> &ClusterName {
        &self.cluster
    }

    pub fn ca(&self) -> &Arc<CaStore> {
        &self.ca
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn lock_watcher(&self) -> &LockWatcher {
        &self.locks
    }

    fn require_editor(&self, caller: &Identity) -> GatewayResult<()> {
        let allowed = caller
            .groups
            .iter()
            .any(|group| EDITOR_ROLES.contains(&group.as_str()));
        if allowed {
            Ok(())
        } else {
            warn!(user = %caller.username, "resource mutation denied");
            self.audit.emit(AuditEvent::AccessDenied {
                user: caller.username.clone(),
                reason: "resource mutation requires an editor role".to_string(),
            });
            Err(GatewayError::AccessDenied)
        }
    }

    /// Resolve the role set granted to a user resource
    pub async fn role_set_for(&self, user: &User) -> GatewayResult<RoleSet> {
        let mut roles = Vec::with_capacity(user.roles.len());
        for name in &user.roles {
            roles.push(resources::get::<Role>(&self.backend, ResourceKind::Role, name).await?);
        }
        Ok(RoleSet::new(roles))
    }

    // ---- authentication ----

    /// Password + MFA-presence authentication for local users
    pub async fn authenticate_password(
        &self,
        username: &str,
        password: &str,
        mfa_verified: bool,
    ) -> GatewayResult<Identity> {
        let user: User = resources::get(&self.backend, ResourceKind::User, username)
            .await
            .map_err(|_| self.login_failure(username, "unknown user"))?;

        let Some(hash) = user.password_hash.clone() else {
            return Err(self.login_failure(username, "user has no local credentials"));
        };

        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || {
            use argon2::password_hash::PasswordHash;
            use argon2::PasswordVerifier;

            let Ok(parsed) = PasswordHash::new(&hash) else {
                return false;
            };
            argon2::Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .await
        .map_err(|err| GatewayError::ConnectionProblem(format!("verifier task: {err}")))?;

        if !verified {
            return Err(self.login_failure(username, "bad password"));
        }

        self.locks.check(&LockQuery::for_user(username, &user.roles))?;

        self.audit.emit(AuditEvent::UserLogin {
            user: username.to_string(),
            success: true,
            error: None,
        });

        let mut identity = Identity::new(username, user.roles.clone(), CertUsage::Ssh);
        identity.traits = user.traits.clone();
        identity.mfa_verified = mfa_verified;
        Ok(identity)
    }

    fn login_failure(&self, username: &str, reason: &str) -> GatewayError {
        // precise reason goes to the audit log only
        self.audit.emit(AuditEvent::UserLogin {
            user: username.to_string(),
            success: false,
            error: Some(reason.to_string()),
        });
        GatewayError::AccessDenied
    }

    /// Map an assertion already verified by an external IdP connector onto
    /// a local identity. Role mapping happened connector-side.
    pub async fn authenticate_sso(
        &self,
        username: &str,
        roles: Vec<String>,
        traits: std::collections::BTreeMap<String, Vec<String>>,
    ) -> GatewayResult<Identity> {
        self.locks.check(&LockQuery::for_user(username, &roles))?;

        // materialize the user resource so watchers and role lookups see it
        let user = User {
            name: username.to_string(),
            roles: roles.clone(),
            traits: traits.clone(),
            password_hash: None,
        };
        resources::upsert(&self.backend, ResourceKind::User, username, &user, None).await?;

        self.audit.emit(AuditEvent::UserLogin {
            user: username.to_string(),
            success: true,
            error: None,
        });

        let mut identity = Identity::new(username, roles, CertUsage::Ssh);
        identity.traits = traits;
        Ok(identity)
    }

    /// Single-use password reset token; only its hash is persisted
    pub async fn create_reset_password_token(
        &self,
        caller: &Identity,
        username: &str,
        ttl: std::time::Duration,
    ) -> GatewayResult<secrecy::SecretString> {
        self.require_editor(caller)?;
        // the user must exist
        let _: User = resources::get(&self.backend, ResourceKind::User, username).await?;

        let secret = hex::encode(rand::random::<[u8; 16]>());
        let record = ResetToken {
            user: username.to_string(),
            secret_hash: blake3::hash(secret.as_bytes()).to_hex().to_string(),
        };
        let expires = OffsetDateTime::now_utc() + ttl;
        resources::upsert(
            &self.backend,
            ResourceKind::ResetToken,
            username,
            &record,
            Some(expires),
        )
        .await?;

        Ok(secrecy::SecretString::from(secret))
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> GatewayResult<()> {
        let presented = blake3::hash(token.as_bytes()).to_hex().to_string();

        let records: Vec<ResetToken> =
            resources::list(&self.backend, ResourceKind::ResetToken).await?;
        let record = records
            .into_iter()
            .find(|record| record.secret_hash == presented)
            .ok_or(GatewayError::AccessDenied)?;

        let mut user: User =
            resources::get(&self.backend, ResourceKind::User, &record.user).await?;
        user.password_hash = Some(hash_password(new_password)?);
        resources::upsert(&self.backend, ResourceKind::User, &record.user, &user, None).await?;
        resources::remove(&self.backend, ResourceKind::ResetToken, &record.user).await?;
        Ok(())
    }

    // ---- certificate issuance ----

    /// Mint the session certificates for a user. TTL is capped by the role
    /// set; principals are the allowed logins; locks are consulted first.
    pub async fn generate_user_certs(
        &self,
        caller: &Identity,
        request: UserCertRequest,
    ) -> GatewayResult<UserCertBundle> {
        let target_username = request
            .impersonate
            .clone()
            .unwrap_or_else(|| request.username.clone());

        let user: User =
            resources::get(&self.backend, ResourceKind::User, &target_username).await?;
        let role_set = self.role_set_for(&user).await?;

        self.locks
            .check(&LockQuery::for_user(&target_username, &user.roles))?;

        let requested = std::time::Duration::from_secs(request.ttl_secs);
        let ttl = requested.min(role_set.max_session_ttl());
        let ttl = time::Duration::try_from(ttl)
            .map_err(|_| GatewayError::InvalidArgument("certificate ttl".to_string()))?;

        let mut identity = Identity::new(target_username.clone(), user.roles.clone(), request.usage);
        identity.traits = user.traits.clone();
        identity.route_to_cluster = request.route_to_cluster;
        identity.mfa_verified = request.mfa_verified;
        identity.connection_diagnostic_id = request.connection_diagnostic_id;
        if request.impersonate.is_some() {
            identity.impersonator = Some(caller.username.clone());
        }

        let requester_roles = if identity.impersonator.is_some() {
            let caller_user: User =
                resources::get(&self.backend, ResourceKind::User, &caller.username).await?;
            Some(self.role_set_for(&caller_user).await?)
        } else {
            None
        };

        let principals = role_set.allowed_logins();
        let bundle =
            self.ca
                .issue_user_cert(requester_roles.as_ref(), &identity, &principals, ttl)?;

        self.audit.emit(AuditEvent::CertIssued {
            user: target_username,
            usage: identity.usage.to_string(),
        });

        Ok(bundle)
    }

    pub fn generate_host_cert(
        &self,
        role: HostRole,
        host_uuid: &str,
        node_name: &str,
        principals: &[String],
    ) -> GatewayResult<HostCertBundle> {
        self.ca.issue_host_cert(
            role,
            host_uuid,
            node_name,
            &self.cluster,
            principals,
            time::Duration::days(30),
        )
    }

    pub fn generate_database_cert(
        &self,
        sans: &[String],
        ttl: time::Duration,
    ) -> GatewayResult<drawbridge_domain::cert::IssuedCert> {
        self.ca.issue_db_cert(sans, ttl)
    }

    pub fn rotate_ca(
        &self,
        caller: &Identity,
        ca_type: CaType,
        request: RotationRequest,
    ) -> GatewayResult<()> {
        self.require_editor(caller)?;
        let phase = self.ca.rotate(ca_type, request)?;
        self.audit.emit(AuditEvent::RotationStep {
            ca_type: ca_type.to_string(),
            phase: phase.to_string(),
        });
        Ok(())
    }

    // ---- joining ----

    /// Token-gated host join: validates the token, mints the host
    /// certificates and registers the server resource.
    pub async fn register_host(
        &self,
        token_secret: &str,
        role: HostRole,
        host_id: &str,
        node_name: &str,
        addr: Option<String>,
        labels: Labels,
    ) -> GatewayResult<HostCertBundle> {
        tokens::consume_join_token(&self.backend, token_secret, role).await?;

        let bundle = self.generate_host_cert(role, host_id, node_name, &[])?;

        let server = Server {
            id: host_id.to_string(),
            hostname: node_name.to_string(),
            uses_tunnel: addr.is_none(),
            addr,
            labels,
            expires: Some(OffsetDateTime::now_utc() + time::Duration::minutes(10)),
            cluster: self.cluster.clone(),
        };
        resources::upsert(&self.backend, ResourceKind::Node, host_id, &server, server.expires)
            .await?;

        info!(host_id, node_name, %role, "host joined the cluster");
        self.audit.emit(AuditEvent::HostJoined {
            host_id: host_id.to_string(),
            node_name: node_name.to_string(),
            role: role.to_string(),
        });

        Ok(bundle)
    }

    // ---- sessions ----

    /// JWT-backed web session
    pub fn create_web_session(
        &self,
        user: &str,
        ttl: std::time::Duration,
    ) -> GatewayResult<WebSession> {
        self.mint_session(user, None, ttl)
    }

    /// Like a web session, but scoped to one published application
    pub fn create_app_session(
        &self,
        user: &str,
        app_name: &str,
        ttl: std::time::Duration,
    ) -> GatewayResult<WebSession> {
        self.mint_session(user, Some(app_name.to_string()), ttl)
    }

    fn mint_session(
        &self,
        user: &str,
        app: Option<String>,
        ttl: std::time::Duration,
    ) -> GatewayResult<WebSession> {
        let expires = OffsetDateTime::now_utc() + ttl;
        let claims = WebSessionClaims {
            sub: user.to_string(),
            sid: drawbridge_domain::id::SessionId::random().to_string(),
            exp: expires.unix_timestamp(),
            app,
        };
        let token = self.ca.sign_jwt(&claims)?;
        Ok(WebSession {
            token,
            user: user.to_string(),
            expires,
        })
    }

    pub fn validate_web_session(&self, token: &str) -> GatewayResult<String> {
        let claims: WebSessionClaims = self.ca.verify_jwt(token)?;
        if claims.exp < OffsetDateTime::now_utc().unix_timestamp() {
            return Err(GatewayError::AccessDenied);
        }
        Ok(claims.sub)
    }

    // ---- resource CRUD ----

    pub async fn upsert_role(&self, caller: &Identity, role: Role) -> GatewayResult<()> {
        self.require_editor(caller)?;
        resources::upsert(&self.backend, ResourceKind::Role, &role.name.clone(), &role, None)
            .await?;
        self.emit_upsert(caller, ResourceKind::Role, &role.name);
        Ok(())
    }

    pub async fn upsert_user(&self, caller: &Identity, user: User) -> GatewayResult<()> {
        self.require_editor(caller)?;
        resources::upsert(&self.backend, ResourceKind::User, &user.name.clone(), &user, None)
            .await?;
        self.emit_upsert(caller, ResourceKind::User, &user.name);
        Ok(())
    }

    pub async fn upsert_trusted_cluster(
        &self,
        caller: &Identity,
        trusted: TrustedCluster,
        remote_user_ca: Option<rustls::pki_types::CertificateDer<'static>>,
    ) -> GatewayResult<()> {
        self.require_editor(caller)?;

        if let Some(der) = remote_user_ca {
            self.ca.register_remote_authority(RemoteAuthority {
                cluster: trusted.name.clone(),
                ca_type: CaType::User,
                der,
            });
        }

        let name = trusted.name.to_string();
        resources::upsert(&self.backend, ResourceKind::TrustedCluster, &name, &trusted, None)
            .await?;
        self.emit_upsert(caller, ResourceKind::TrustedCluster, &name);
        Ok(())
    }

    pub async fn upsert_lock(&self, caller: &Identity, lock: Lock) -> GatewayResult<()> {
        self.require_editor(caller)?;
        resources::upsert(
            &self.backend,
            ResourceKind::Lock,
            &lock.name.clone(),
            &lock,
            lock.expires,
        )
        .await?;
        self.audit.emit(AuditEvent::LockCreated {
            name: lock.name.clone(),
            user: caller.username.clone(),
        });
        Ok(())
    }

    pub async fn upsert_node(&self, server: Server) -> GatewayResult<()> {
        resources::upsert(&self.backend, ResourceKind::Node, &server.id.clone(), &server, server.expires)
            .await?;
        Ok(())
    }

    pub async fn upsert_database(&self, db: DatabaseServer) -> GatewayResult<()> {
        resources::upsert(&self.backend, ResourceKind::Database, &db.name.clone(), &db, None)
            .await?;
        Ok(())
    }

    pub async fn upsert_kube_cluster(&self, kube: KubeCluster) -> GatewayResult<()> {
        resources::upsert(&self.backend, ResourceKind::KubeCluster, &kube.name.clone(), &kube, None)
            .await?;
        Ok(())
    }

    pub async fn upsert_reverse_tunnel(&self, tunnel: ReverseTunnel) -> GatewayResult<()> {
        let name = tunnel.cluster_name.to_string();
        resources::upsert(&self.backend, ResourceKind::ReverseTunnel, &name, &tunnel, None)
            .await?;
        Ok(())
    }

    pub async fn get_user(&self, name: &str) -> GatewayResult<User> {
        resources::get(&self.backend, ResourceKind::User, name).await
    }

    pub async fn get_role(&self, name: &str) -> GatewayResult<Role> {
        resources::get(&self.backend, ResourceKind::Role, name).await
    }

    pub async fn list_nodes(&self) -> GatewayResult<Vec<Server>> {
        resources::list(&self.backend, ResourceKind::Node).await
    }

    pub async fn list_databases(&self) -> GatewayResult<Vec<DatabaseServer>> {
        resources::list(&self.backend, ResourceKind::Database).await
    }

    pub async fn list_reverse_tunnels(&self) -> GatewayResult<Vec<ReverseTunnel>> {
        resources::list(&self.backend, ResourceKind::ReverseTunnel).await
    }

    /// Untyped listing for clients that page over arbitrary kinds
    pub async fn list_resources(
        &self,
        kind: ResourceKind,
    ) -> GatewayResult<Vec<serde_json::Value>> {
        resources::list(&self.backend, kind).await
    }

    pub async fn get_session_tracker(
        &self,
        id: drawbridge_domain::id::SessionId,
    ) -> GatewayResult<crate::sessions::StoredTracker> {
        crate::sessions::tracker::get_session_tracker(&self.backend, id).await
    }

    pub async fn delete_resource(
        &self,
        caller: &Identity,
        kind: ResourceKind,
        name: &str,
    ) -> GatewayResult<()> {
        self.require_editor(caller)?;
        resources::remove(&self.backend, kind, name).await?;
        self.audit.emit(AuditEvent::ResourceDeleted {
            kind: kind.to_string(),
            name: name.to_string(),
            user: caller.username.clone(),
        });
        Ok(())
    }

    /// Typed event stream per the watcher contract
    pub fn watch(&self, kinds: impl IntoIterator<Item = ResourceKind>) -> WatchStream {
        self.dispatcher.subscribe(kinds)
    }

    fn emit_upsert(&self, caller: &Identity, kind: ResourceKind, name: &str) {
        self.audit.emit(AuditEvent::ResourceUpserted {
            kind: kind.to_string(),
            name: name.to_string(),
            user: caller.username.clone(),
        });
    }
}

pub fn hash_password(password: &str) -> GatewayResult<String> {
    use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};

    let salt = SaltString::generate(&mut OsRng);
    argon2::Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| GatewayError::BadParameter(format!("password hashing: {err}")))
}

/// Keep-alive window granted per announce
pub const ANNOUNCE_TTL: time::Duration = time::Duration::minutes(10);

impl<B: Backend + Clone> crate::inventory::AnnounceSink for AuthService<B> {
    /// Heartbeats refresh the server resource and its expiry;
    /// latest-wins is the observable state
    async fn announce(&self, mut server: Server) -> GatewayResult<()> {
        server.expires = Some(OffsetDateTime::now_utc() + ANNOUNCE_TTL);
        self.upsert_node(server).await
    }
}
