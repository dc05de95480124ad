//! Identity token validation for gateway connections.
//!
//! The auth service issues a short-lived HS256 JWT per signed-in user. The
//! realtime core only reads it to learn which user a socket belongs to.

use hearth_common::room;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by an identity token.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,
    pub name: String,
    #[serde(default)]
    pub picture: Option<String>,
    pub exp: i64,
}

/// Who a connection belongs to, once identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl From<IdentityClaims> for Identity {
    fn from(claims: IdentityClaims) -> Self {
        Self {
            user_id: claims.sub,
            display_name: claims.name,
            avatar: claims.picture,
        }
    }
}

/// Validates identity tokens against the shared secret.
#[derive(Clone)]
pub struct IdentityVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl IdentityVerifier {
    /// Build a verifier. With no secret every token is rejected.
    pub fn new(secret: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Validate `token` and return the identity it asserts.
    pub fn verify(&self, token: &str) -> Result<Identity, &'static str> {
        let key = self.key.as_ref().ok_or("Identity tokens are not accepted")?;

        let data = jsonwebtoken::decode::<IdentityClaims>(token, key, &self.validation).map_err(
            |e| {
                tracing::debug!(?e, "identity token validation failed");
                "Invalid or expired identity token"
            },
        )?;

        if data.claims.sub.trim().is_empty() {
            return Err("Identity token has an empty subject");
        }
        if !room::is_participant_id(&data.claims.sub) {
            return Err("Identity token subject contains the room key separator");
        }

        Ok(data.claims.into())
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{EncodingKey, Header};

    use super::*;

    const SECRET: &str = "test-identity-secret";

    fn mint(sub: &str, exp_offset_secs: i64, secret: &str) -> String {
        let claims = IdentityClaims {
            sub: sub.to_string(),
            name: "Test User".to_string(),
            picture: Some("https://cdn.test/a.png".to_string()),
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verify_accepts_valid_token() {
        let verifier = IdentityVerifier::new(Some(SECRET));
        let identity = verifier.verify(&mint("u1", 300, SECRET)).unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.display_name, "Test User");
        assert_eq!(identity.avatar.as_deref(), Some("https://cdn.test/a.png"));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let verifier = IdentityVerifier::new(Some(SECRET));
        assert!(verifier.verify(&mint("u1", 300, "other-secret")).is_err());
    }

    #[test]
    fn verify_rejects_expired_token() {
        let verifier = IdentityVerifier::new(Some(SECRET));
        assert!(verifier.verify(&mint("u1", -600, SECRET)).is_err());
    }

    #[test]
    fn disabled_verifier_rejects_everything() {
        let verifier = IdentityVerifier::new(None);
        assert!(!verifier.is_enabled());
        assert!(verifier.verify(&mint("u1", 300, SECRET)).is_err());
    }

    #[test]
    fn verify_rejects_subject_with_room_separator() {
        let verifier = IdentityVerifier::new(Some(SECRET));
        assert!(verifier.verify(&mint("a_b", 300, SECRET)).is_err());
    }

    #[test]
    fn verify_rejects_garbage() {
        let verifier = IdentityVerifier::new(Some(SECRET));
        assert!(verifier.verify("not-a-jwt").is_err());
    }
}
