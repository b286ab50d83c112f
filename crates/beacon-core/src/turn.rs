//! Ephemeral TURN credentials
//!
//! Implements the shared-secret scheme understood by coturn's
//! `use-auth-secret` mode: the username carries its own expiry and the
//! password is an HMAC-SHA1 of the username, so the relay can validate a
//! credential without any per-user state.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::CredentialError;

type HmacSha1 = Hmac<Sha1>;

/// How long issued credentials stay valid (6 hours)
pub const TURN_CREDENTIAL_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Time-limited TURN username/password pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnCredential {
    /// `{expires_at}:{client_id}`
    pub username: String,
    /// base64(HMAC-SHA1(secret, username))
    pub password: String,
    /// Unix seconds after which the relay rejects the credential
    pub expires_at: u64,
}

impl TurnCredential {
    /// Issue a credential valid from the current system time
    pub fn issue(secret: &str, client_id: &str) -> Self {
        generate_turn_credentials(secret, client_id, SystemTime::now())
    }

    /// Validate the credential the way the relay server does
    pub fn verify(&self, secret: &str, now: SystemTime) -> Result<(), CredentialError> {
        let (expiry, _client_id) = self
            .username
            .split_once(':')
            .ok_or_else(|| CredentialError::MalformedUsername(self.username.clone()))?;
        let expires_at: u64 = expiry
            .parse()
            .map_err(|_| CredentialError::MalformedUsername(self.username.clone()))?;

        let now = unix_secs(now);
        if now > expires_at {
            return Err(CredentialError::Expired { expires_at, now });
        }

        let signature = STANDARD
            .decode(&self.password)
            .map_err(|_| CredentialError::BadSignature)?;

        mac_for(secret, &self.username)
            .verify_slice(&signature)
            .map_err(|_| CredentialError::BadSignature)
    }
}

/// Generate TURN credentials for `client_id`, expiring `TURN_CREDENTIAL_TTL` after `now`
pub fn generate_turn_credentials(secret: &str, client_id: &str, now: SystemTime) -> TurnCredential {
    let expires_at = unix_secs(now) + TURN_CREDENTIAL_TTL.as_secs();
    let username = format!("{}:{}", expires_at, client_id);
    let password = STANDARD.encode(mac_for(secret, &username).finalize().into_bytes());

    TurnCredential {
        username,
        password,
        expires_at,
    }
}

fn mac_for(secret: &str, username: &str) -> HmacSha1 {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(username.as_bytes());
    mac
}

/// Seconds since the Unix epoch, clamped at zero
fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "north-relay-secret";

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_known_vector() {
        let creds = generate_turn_credentials(SECRET, "alice", at(1_700_000_000));

        assert_eq!(creds.username, "1700021600:alice");
        assert_eq!(creds.password, "51W66QoGTSsZ5wO7JzdQhBA4b10=");
        assert_eq!(creds.expires_at, 1_700_021_600);
    }

    #[test]
    fn test_deterministic() {
        let a = generate_turn_credentials(SECRET, "bob", at(1_000));
        let b = generate_turn_credentials(SECRET, "bob", at(1_000));
        assert_eq!(a, b);
    }

    #[test]
    fn test_expiration_is_six_hours_out() {
        let creds = generate_turn_credentials(SECRET, "bob", at(1_000));
        assert_eq!(creds.expires_at, 1_000 + 6 * 60 * 60);
        assert!(creds.username.starts_with("22600:"));
    }

    #[test]
    fn test_shifted_time_changes_pair() {
        let a = generate_turn_credentials(SECRET, "bob", at(1_000));
        let b = generate_turn_credentials(SECRET, "bob", at(1_001));
        assert_ne!(a.username, b.username);
        assert_ne!(a.password, b.password);
    }

    #[test]
    fn test_verify_roundtrip() {
        let creds = generate_turn_credentials(SECRET, "carol", at(5_000));

        assert!(creds.verify(SECRET, at(5_000)).is_ok());
        assert!(creds.verify(SECRET, at(5_000 + 6 * 60 * 60)).is_ok());
        assert_eq!(
            creds.verify("wrong-secret", at(5_000)),
            Err(CredentialError::BadSignature)
        );
    }

    #[test]
    fn test_verify_expired() {
        let creds = generate_turn_credentials(SECRET, "carol", at(5_000));
        let later = 5_000 + 6 * 60 * 60 + 1;

        assert_eq!(
            creds.verify(SECRET, at(later)),
            Err(CredentialError::Expired {
                expires_at: 5_000 + 6 * 60 * 60,
                now: later,
            })
        );
    }

    #[test]
    fn test_verify_tampered_username() {
        let mut creds = generate_turn_credentials(SECRET, "carol", at(5_000));
        creds.username = creds.username.replace("carol", "mallory");
        assert_eq!(
            creds.verify(SECRET, at(5_000)),
            Err(CredentialError::BadSignature)
        );

        creds.username = "no-separator".into();
        assert!(matches!(
            creds.verify(SECRET, at(5_000)),
            Err(CredentialError::MalformedUsername(_))
        ));
    }

    #[test]
    fn test_client_id_may_contain_colons() {
        let creds = generate_turn_credentials(SECRET, "room:alice", at(10));
        assert_eq!(creds.username, "21610:room:alice");
        assert!(creds.verify(SECRET, at(10)).is_ok());
    }
}
