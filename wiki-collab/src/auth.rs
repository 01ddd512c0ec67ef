//! Authorization gate: collab token verification and permission tiers.
//!
//! Resolution order for a user on a page's space:
//! ```text
//! 1. membership (direct or via group)  → highest role
//! 2. workspace owner/admin             → admin
//! 3. active share grant (user/group)   → highest role
//! 4. open space                        → writer
//! otherwise                            → unauthorized
//! ```
//! A reader session is admitted read-only.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::DocumentName;
use crate::hooks::{AuthenticatePayload, Extension, HookError};
use crate::storage::{
    AccessDirectory, PageStore, ShareGrant, SpaceRole, SpaceVisibility, StoreError,
};

/// Purpose tag carried by collaboration tokens.
pub const COLLAB_TOKEN_TYPE: &str = "collab";

/// Lifetime of tokens issued by [`TokenService::issue_collab_token`].
const COLLAB_TOKEN_TTL_HOURS: i64 = 24;

/// Reasons a session is refused.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Identity and permissions attached to an admitted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    pub role: SpaceRole,
    pub read_only: bool,
}

impl AuthContext {
    pub fn new(user_id: Uuid, workspace_id: Uuid, role: SpaceRole) -> Self {
        Self {
            user_id,
            workspace_id,
            role,
            read_only: role == SpaceRole::Reader,
        }
    }
}

/// JWT claims of a collaboration token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollabClaims {
    pub sub: Uuid,
    pub workspace_id: Uuid,
    #[serde(rename = "type")]
    pub token_type: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies collaboration tokens (HS256).
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Issue a 24h collaboration token.
    pub fn issue_collab_token(&self, user_id: Uuid, workspace_id: Uuid) -> Result<String, AuthError> {
        self.issue_at(user_id, workspace_id, Utc::now(), Duration::hours(COLLAB_TOKEN_TTL_HOURS))
    }

    /// Issue a token with an explicit issue time and lifetime.
    pub fn issue_at(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let claims = CollabClaims {
            sub: user_id,
            workspace_id,
            token_type: COLLAB_TOKEN_TYPE.to_string(),
            iat: issued_at.timestamp(),
            exp: (issued_at + ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Unauthorized(format!("cannot sign token: {e}")))
    }

    /// Verify signature, expiry and purpose tag.
    pub fn verify(&self, token: &str) -> Result<CollabClaims, AuthError> {
        let data = decode::<CollabClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::Unauthorized(format!("invalid collab token: {e}")))?;
        if data.claims.token_type != COLLAB_TOKEN_TYPE {
            return Err(AuthError::Unauthorized(format!(
                "token type {:?} is not a collab token",
                data.claims.token_type
            )));
        }
        Ok(data.claims)
    }
}

/// Resolves whether a token may open a document, and how.
pub struct Authorizer {
    tokens: TokenService,
    pages: Arc<dyn PageStore>,
    directory: Arc<dyn AccessDirectory>,
}

impl Authorizer {
    pub fn new(
        tokens: TokenService,
        pages: Arc<dyn PageStore>,
        directory: Arc<dyn AccessDirectory>,
    ) -> Self {
        Self {
            tokens,
            pages,
            directory,
        }
    }

    pub async fn authorize(
        &self,
        document_name: &str,
        token: &str,
    ) -> Result<AuthContext, AuthError> {
        let claims = self.tokens.verify(token)?;

        let name = DocumentName::parse(document_name)
            .ok_or_else(|| AuthError::NotFound(format!("malformed document name {document_name:?}")))?;

        let user = self
            .directory
            .find_user(claims.sub, claims.workspace_id)
            .await?
            .ok_or_else(|| AuthError::Unauthorized(format!("unknown user {}", claims.sub)))?;
        if user.deactivated_at.is_some() {
            return Err(AuthError::Unauthorized(format!("user {} is deactivated", user.id)));
        }

        let page = self
            .pages
            .find_page(name.id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("page {}", name.id)))?;

        let space = self
            .directory
            .find_space(page.space_id)
            .await?
            .filter(|s| s.deleted_at.is_none())
            .ok_or_else(|| AuthError::Unauthorized(format!("space {} unavailable", page.space_id)))?;
        if space.workspace_id != claims.workspace_id {
            return Err(AuthError::Unauthorized(format!(
                "space {} is outside workspace {}",
                space.id, claims.workspace_id
            )));
        }

        let role = self
            .resolve_role(user.id, user.role.is_admin(), space.id, space.visibility)
            .await?
            .ok_or_else(|| {
                AuthError::Unauthorized(format!("user {} has no access to space {}", user.id, space.id))
            })?;

        log::debug!("Authorized {} on {document_name} as {}", user.id, role.as_str());
        Ok(AuthContext::new(user.id, claims.workspace_id, role))
    }

    async fn resolve_role(
        &self,
        user_id: Uuid,
        workspace_admin: bool,
        space_id: Uuid,
        visibility: SpaceVisibility,
    ) -> Result<Option<SpaceRole>, StoreError> {
        let membership = self.directory.membership_roles(user_id, space_id).await?;
        if let Some(role) = membership.into_iter().max() {
            return Ok(Some(role));
        }
        if workspace_admin {
            return Ok(Some(SpaceRole::Admin));
        }
        let grants = self.directory.share_grants(user_id, space_id).await?;
        if let Some(role) = highest_active_grant(&grants, Utc::now()) {
            return Ok(Some(role));
        }
        if visibility == SpaceVisibility::Open {
            return Ok(Some(SpaceRole::Writer));
        }
        Ok(None)
    }
}

/// Highest role among grants that are neither revoked nor expired.
pub fn highest_active_grant(grants: &[ShareGrant], now: DateTime<Utc>) -> Option<SpaceRole> {
    grants
        .iter()
        .filter(|g| g.is_active(now))
        .map(|g| g.role)
        .max()
}

/// Admits sessions through an [`Authorizer`].
pub struct AuthenticationExtension {
    authorizer: Arc<Authorizer>,
}

impl AuthenticationExtension {
    pub fn new(authorizer: Arc<Authorizer>) -> Self {
        Self { authorizer }
    }
}

#[async_trait]
impl Extension for AuthenticationExtension {
    fn name(&self) -> &'static str {
        "authentication"
    }

    async fn on_authenticate(
        &self,
        payload: &AuthenticatePayload,
    ) -> Result<Option<AuthContext>, HookError> {
        match self
            .authorizer
            .authorize(&payload.document_name, &payload.token)
            .await
        {
            Ok(context) => Ok(Some(context)),
            Err(e) => {
                log::warn!("Refused session for {}: {e}", payload.document_name);
                Err(e.into())
            }
        }
    }
}
