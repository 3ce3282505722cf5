//! Session identity and resource-name generation.
//!
//! The resource is derived from the credentials so that the same client on the
//! same host reuses a recognisable name, with a random postfix so concurrent
//! sessions do not collide. A naming conflict reported by the server rolls the
//! postfix.

use rand::Rng;
use serde::Serialize;

const HASH_SEED: i32 = (5381 << 16) + 5381;
const HASH_MULTIPLIER: i64 = 1_566_083_941;
const POSTFIX_MAX: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub uid: String,
    pub realm: String,
    #[serde(skip)]
    password: String,
    pub resource_prefix: String,
    pub protocol: String,
    pub postfix: u32,
    pub resource: String,
}

impl Identity {
    pub fn new(
        uid: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
        resource_prefix: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        let mut identity = Self {
            uid: uid.into(),
            realm: realm.into(),
            password: password.into(),
            resource_prefix: resource_prefix.into(),
            protocol: protocol.into(),
            postfix: 0,
            resource: String::new(),
        };
        identity.regenerate_resource();
        identity
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Bare address, `uid@realm`.
    pub fn jid(&self) -> String {
        format!("{}@{}", self.uid, self.realm)
    }

    /// Full address including the negotiated resource.
    pub fn full_jid(&self) -> String {
        format!("{}/{}", self.jid(), self.resource)
    }

    /// Picks a fresh random postfix and rebuilds the resource name.
    pub fn regenerate_resource(&mut self) {
        self.postfix = rand::rng().random_range(0..=POSTFIX_MAX);
        self.resource = make_resource(
            &self.uid,
            &self.password,
            &self.resource_prefix,
            &self.protocol,
            Some(self.postfix),
        );
    }
}

/// Deterministic resource name for the given credentials.
///
/// A zero or absent postfix is omitted from the name.
pub fn make_resource(
    username: &str,
    password: &str,
    prefix: &str,
    protocol: &str,
    postfix: Option<u32>,
) -> String {
    let source = format!("{username}-{password}-{protocol}");
    let (h1, h2) = dual_hash(&source);

    let mut resource = format!("{prefix}-{username}-{}-{}", tail4(h1), tail4(h2));
    if let Some(postfix) = postfix.filter(|p| *p != 0) {
        resource.push('-');
        resource.push_str(&postfix.to_string());
    }
    resource
}

/// Per-instance session id. Salted with randomness, so never stable.
pub fn make_unique_id(username: &str, password: &str, prefix: &str) -> String {
    let salt: f64 = rand::rng().random();
    let source = format!("{username}{password}{salt}");
    let (h1, h2) = dual_hash(&source);
    format!("{prefix}_{username}_{}_{}", tail4(h1), tail4(h2))
}

fn dual_hash(input: &str) -> (i64, i64) {
    let units: Vec<u16> = input.encode_utf16().collect();
    let mut h1 = HASH_SEED;
    let mut h2 = HASH_SEED;
    let mut pos = 0;

    while pos < units.len() {
        h1 = mix(h1, units[pos]);
        if pos == units.len() - 1 {
            break;
        }
        h2 = mix(h2, units[pos + 1]);
        pos += 2;
    }

    (i64::from(h1), i64::from(h2) * HASH_MULTIPLIER)
}

fn mix(hash: i32, unit: u16) -> i32 {
    let sum = i64::from(hash.wrapping_shl(5)) + i64::from(hash) + i64::from(hash >> 27);
    (sum as i32) ^ i32::from(unit)
}

fn tail4(value: i64) -> String {
    let digits = value.to_string();
    let start = digits.len().saturating_sub(4);
    digits[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_resource_is_deterministic() {
        let a = make_resource("309180", "secret", "web", "wss", Some(42));
        let b = make_resource("309180", "secret", "web", "wss", Some(42));
        assert_eq!(a, b);
        assert!(a.starts_with("web-309180-"));
        assert!(a.ends_with("-42"));
    }

    #[test]
    fn test_make_resource_depends_on_credentials() {
        let a = make_resource("309180", "secret", "web", "wss", None);
        let b = make_resource("309180", "other", "web", "wss", None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_zero_postfix_is_omitted() {
        let a = make_resource("1", "p", "web", "wss", Some(0));
        let b = make_resource("1", "p", "web", "wss", None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_addresses() {
        let identity = Identity::new("100", "pw", "pbx.local", "web", "wss");
        assert_eq!(identity.jid(), "100@pbx.local");
        assert!(identity.full_jid().starts_with("100@pbx.local/web-100-"));
        assert_eq!(identity.password(), "pw");
    }

    #[test]
    fn test_unique_id_shape() {
        let sid = make_unique_id("100", "pw", "sbapi");
        assert!(sid.starts_with("sbapi_100_"));
    }
}
