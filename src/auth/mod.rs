//! Room access and peer identity.
//!
//! Joining a room goes through an [`AccessPolicy`], which turns optional
//! client credentials into an [`Identity`] or refuses the join. Two policies
//! ship with the server:
//! - [`OpenAccess`] admits everyone as an anonymous user
//! - [`JwtAccess`] verifies HS256 room tokens issued by the web front end

mod jwt;

pub use jwt::{JwtAccess, JwtConfig, RoomClaims};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cursor colors handed out to users without one of their own
pub const COLOR_PALETTE: [&str; 15] = [
    "#D583F0", "#F08385", "#F0D885", "#85EED6", "#85BBF0", "#8594F0", "#85DBF0", "#87EE85",
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8",
];

const ANONYMOUS_PREFIX: &str = "anonymous:";

/// Pick a random palette color
pub fn random_color() -> String {
    use rand::Rng;
    let idx = rand::thread_rng().gen_range(0..COLOR_PALETTE.len());
    COLOR_PALETTE[idx].to_string()
}

/// Errors raised while authorizing a join
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    Expired,

    #[error("Access to room {0} is not allowed")]
    RoomNotAllowed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Who a peer is, as far as the room is concerned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub color: String,
    /// Set only by [`Identity::anonymous`]; token claims cannot produce it
    #[serde(skip)]
    anonymous: bool,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
            color: color.into(),
            anonymous: false,
        }
    }

    /// Fresh anonymous identity with a random color
    pub fn anonymous() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            anonymous: true,
            ..Self::new(format!("{}{}", ANONYMOUS_PREFIX, &id[..8]), "Anonymous", random_color())
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }
}

/// Decides who may join which room
pub trait AccessPolicy: Send + Sync {
    fn authorize(&self, room_id: &str, credentials: Option<&str>) -> Result<Identity, AccessError>;
}

/// Admits everyone as an anonymous user
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

impl AccessPolicy for OpenAccess {
    fn authorize(&self, _room_id: &str, _credentials: Option<&str>) -> Result<Identity, AccessError> {
        Ok(Identity::anonymous())
    }
}

/// Check a room id against an allow-list.
///
/// `*` allows every room, a trailing `*` allows a prefix, anything else must
/// match exactly.
pub fn room_allowed(patterns: &[String], room_id: &str) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => room_id.starts_with(prefix),
        None => pattern == room_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_identity() {
        let identity = Identity::anonymous();
        assert!(identity.is_anonymous());
        assert_eq!(identity.display_name, "Anonymous");
        assert!(COLOR_PALETTE.contains(&identity.color.as_str()));

        let named = Identity::new("user-1", "Ada", "#FF6B6B").with_avatar("https://a/b.png");
        assert!(!named.is_anonymous());

        let lookalike = Identity::new("anonymous:1234", "Ada", "#FF6B6B");
        assert!(!lookalike.is_anonymous());
        assert_eq!(named.avatar_url.as_deref(), Some("https://a/b.png"));
    }

    #[test]
    fn test_open_access_admits_everyone() {
        let identity = OpenAccess.authorize("any-room", None).unwrap();
        assert!(identity.is_anonymous());
    }

    #[test]
    fn test_room_patterns() {
        let all = vec!["*".to_string()];
        assert!(room_allowed(&all, "snippet-1"));

        let scoped = vec!["snippet-*".to_string(), "lobby".to_string()];
        assert!(room_allowed(&scoped, "snippet-42"));
        assert!(room_allowed(&scoped, "lobby"));
        assert!(!room_allowed(&scoped, "lobby-2"));
        assert!(!room_allowed(&[], "lobby"));
    }

    #[test]
    fn test_random_color_from_palette() {
        for _ in 0..20 {
            let color = random_color();
            assert!(color.starts_with('#'));
            assert_eq!(color.len(), 7);
        }
    }
}
