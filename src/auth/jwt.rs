//! HS256 room tokens.
//!
//! Tokens are issued by the web front end after it has checked that the user
//! owns the snippet or collaborates on it. The server only verifies them and
//! reads the identity and the room allow-list from the claims.

use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::{random_color, room_allowed, AccessError, AccessPolicy, Identity};

/// Configuration for token verification
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Shared HS256 secret
    pub secret: String,
    /// Expected issuer, if any
    pub issuer: Option<String>,
    /// Default token TTL in seconds
    pub token_ttl_seconds: u64,
}

impl JwtConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer: None,
            token_ttl_seconds: 6 * 60 * 60,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.token_ttl_seconds = seconds;
        self
    }

    pub fn validate(&self) -> Result<(), AccessError> {
        if self.secret.len() < 16 {
            return Err(AccessError::InvalidConfig(
                "secret must be at least 16 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Claims carried by a room token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomClaims {
    /// User id
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Avatar URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Room allow-list, see [`room_allowed`]
    #[serde(default)]
    pub rooms: Vec<String>,
    pub iat: u64,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl RoomClaims {
    fn identity(&self) -> Identity {
        let identity = Identity::new(
            self.sub.clone(),
            self.name.clone().unwrap_or_else(|| self.sub.clone()),
            self.color.clone().unwrap_or_else(random_color),
        );
        match &self.picture {
            Some(picture) => identity.with_avatar(picture.clone()),
            None => identity,
        }
    }
}

/// Access policy backed by signed room tokens
pub struct JwtAccess {
    config: JwtConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAccess {
    pub fn new(config: JwtConfig) -> Result<Self, AccessError> {
        config.validate()?;

        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            config,
        })
    }

    /// Issue a token for `identity` granting the given room patterns
    pub fn issue_token(
        &self,
        identity: &Identity,
        rooms: &[&str],
        ttl_seconds: Option<u64>,
    ) -> Result<String, AccessError> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = RoomClaims {
            sub: identity.user_id.clone(),
            name: Some(identity.display_name.clone()),
            picture: identity.avatar_url.clone(),
            color: Some(identity.color.clone()),
            rooms: rooms.iter().map(|r| r.to_string()).collect(),
            iat: now,
            exp: now + ttl_seconds.unwrap_or(self.config.token_ttl_seconds),
            iss: self.config.issuer.clone(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AccessError::InvalidToken(e.to_string()))
    }

    /// Verify signature and expiry, returning the claims
    pub fn verify(&self, token: &str) -> Result<RoomClaims, AccessError> {
        decode::<RoomClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AccessError::Expired,
                _ => AccessError::InvalidToken(e.to_string()),
            })
    }
}

impl AccessPolicy for JwtAccess {
    fn authorize(&self, room_id: &str, credentials: Option<&str>) -> Result<Identity, AccessError> {
        let token = credentials.ok_or(AccessError::MissingCredentials)?;
        let claims = self.verify(token)?;

        if !room_allowed(&claims.rooms, room_id) {
            return Err(AccessError::RoomNotAllowed(room_id.to_string()));
        }

        Ok(claims.identity())
    }
}
