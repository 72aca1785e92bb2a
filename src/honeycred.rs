use sha2::{Digest, Sha256, Sha512};

use crate::event::to_hex;

/// A planted credential to watch for. Password patterns are either plaintext
/// or "sha256$salt$hexdigest" / "sha512$salt$hexdigest" where the digest is
/// over salt bytes followed by password bytes.
#[derive(Debug, Clone)]
pub struct HoneyCred {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl HoneyCred {
    /// True when every field this credential specifies matches the attempt.
    /// A field the attempt did not include can only match a credential that
    /// does not specify it.
    pub fn matches(&self, username: Option<&str>, password: Option<&str>) -> bool {
        if self.username.is_none() && self.password.is_none() {
            return false;
        }
        if let Some(expected) = &self.username {
            match username {
                Some(attempted) if attempted == expected => {}
                _ => return false,
            }
        }
        if let Some(pattern) = &self.password {
            match password {
                Some(attempted) if verify_password(pattern, attempted) => {}
                _ => return false,
            }
        }
        true
    }
}

pub fn matches_any(creds: &[HoneyCred], username: Option<&str>, password: Option<&str>) -> bool {
    creds.iter().any(|cred| cred.matches(username, password))
}

fn verify_password(pattern: &str, attempt: &str) -> bool {
    let parts: Vec<&str> = pattern.splitn(3, '$').collect();
    match parts.as_slice() {
        ["sha256", salt, expected] => {
            let mut hasher = Sha256::new();
            hasher.update(salt.as_bytes());
            hasher.update(attempt.as_bytes());
            let digest = to_hex(hasher.finalize().as_slice());
            constant_time_eq(digest.as_bytes(), expected.to_ascii_lowercase().as_bytes())
        }
        ["sha512", salt, expected] => {
            let mut hasher = Sha512::new();
            hasher.update(salt.as_bytes());
            hasher.update(attempt.as_bytes());
            let digest = to_hex(hasher.finalize().as_slice());
            constant_time_eq(digest.as_bytes(), expected.to_ascii_lowercase().as_bytes())
        }
        _ => constant_time_eq(pattern.as_bytes(), attempt.as_bytes()),
    }
}

/// Comparison that does not short-circuit on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA256_ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const SHA512_ABC: &str = "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
                              2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f";

    fn cred(username: Option<&str>, password: Option<&str>) -> HoneyCred {
        HoneyCred {
            username: username.map(str::to_string),
            password: password.map(str::to_string),
        }
    }

    #[test]
    fn plaintext_password() {
        let cred = cred(Some("admin"), Some("hunter2"));
        assert!(cred.matches(Some("admin"), Some("hunter2")));
        assert!(!cred.matches(Some("admin"), Some("hunter3")));
        assert!(!cred.matches(Some("root"), Some("hunter2")));
    }

    #[test]
    fn sha256_salted_digest() {
        let pattern = format!("sha256$a${}", SHA256_ABC);
        let cred = cred(None, Some(&pattern));
        assert!(cred.matches(None, Some("bc")));
        assert!(cred.matches(Some("whoever"), Some("bc")));
        assert!(!cred.matches(None, Some("bd")));
    }

    #[test]
    fn sha512_salted_digest() {
        let pattern = format!("sha512$a${}", SHA512_ABC);
        let cred = cred(None, Some(&pattern));
        assert!(cred.matches(None, Some("bc")));
        assert!(!cred.matches(None, Some("cb")));
    }

    #[test]
    fn digest_case_is_ignored() {
        let pattern = format!("sha256$a${}", SHA256_ABC.to_ascii_uppercase());
        assert!(cred(None, Some(&pattern)).matches(None, Some("bc")));
    }

    #[test]
    fn username_only_ignores_password() {
        let cred = cred(Some("svc-backup"), None);
        assert!(cred.matches(Some("svc-backup"), None));
        assert!(cred.matches(Some("svc-backup"), Some("anything")));
        assert!(!cred.matches(Some("other"), None));
        assert!(!cred.matches(None, Some("anything")));
    }

    #[test]
    fn specified_field_requires_attempted_field() {
        let cred = cred(Some("admin"), Some("hunter2"));
        assert!(!cred.matches(Some("admin"), None));
        assert!(!cred.matches(None, Some("hunter2")));
    }

    #[test]
    fn empty_credential_never_matches() {
        assert!(!cred(None, None).matches(Some("admin"), Some("x")));
    }

    #[test]
    fn any_match_wins() {
        let creds = vec![cred(Some("a"), None), cred(Some("b"), None)];
        assert!(matches_any(&creds, Some("b"), None));
        assert!(!matches_any(&creds, Some("c"), None));
    }

    #[test]
    fn unequal_lengths_do_not_match() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"abc", b"abc"));
    }
}
