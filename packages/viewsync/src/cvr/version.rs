//! CVR versions and the cookies that encode them.
//!
//! A version is the upstream state version plus a minor counter for changes
//! that happen without new upstream data (subscribing, adding a client).
//! Both parts are written as lexi versions: base-36 digits prefixed by one
//! base-36 digit holding the digit count minus one. Lexi strings sort like
//! the numbers they encode, so cookies compare correctly as plain strings.

use crate::error::VersionError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn version_to_lexi(mut v: u64) -> String {
    let mut digits = Vec::with_capacity(13);
    loop {
        digits.push(DIGITS[(v % 36) as usize]);
        v /= 36;
        if v == 0 {
            break;
        }
    }
    let mut out = String::with_capacity(digits.len() + 1);
    out.push(DIGITS[digits.len() - 1] as char);
    out.extend(digits.iter().rev().map(|&d| d as char));
    out
}

pub fn version_from_lexi(s: &str) -> Result<u64, VersionError> {
    let invalid = || VersionError::InvalidLexi(s.to_string());
    let bytes = s.as_bytes();
    let (&prefix, digits) = bytes.split_first().ok_or_else(invalid)?;
    let len = digit_value(prefix).ok_or_else(invalid)? as usize + 1;
    if digits.len() != len || (len > 1 && digits[0] == b'0') {
        return Err(invalid());
    }
    let mut value: u64 = 0;
    for &d in digits {
        let d = digit_value(d).ok_or_else(invalid)?;
        value = value
            .checked_mul(36)
            .and_then(|v| v.checked_add(d))
            .ok_or_else(invalid)?;
    }
    Ok(value)
}

fn digit_value(c: u8) -> Option<u64> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u64),
        b'a'..=b'z' => Some((c - b'a') as u64 + 10),
        _ => None,
    }
}

/// Version of a client view record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvrVersion {
    /// Lexi-encoded upstream state version.
    pub state_version: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub minor_version: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// `None` is the version of a client that has nothing yet.
pub type NullableCvrVersion = Option<CvrVersion>;

impl CvrVersion {
    pub fn new(state_version: u64, minor_version: u64) -> Self {
        Self {
            state_version: version_to_lexi(state_version),
            minor_version,
        }
    }

    /// Version of a freshly created record.
    pub fn initial() -> Self {
        Self::new(0, 0)
    }

    pub fn state(&self) -> Result<u64, VersionError> {
        version_from_lexi(&self.state_version)
    }

    /// The version that follows this one.
    ///
    /// Moves to `source_version` when that is newer than the current state,
    /// otherwise bumps the minor counter. Always strictly greater than
    /// `self`.
    pub fn next(&self, source_version: Option<u64>) -> CvrVersion {
        let current = self.state().unwrap_or(0);
        match source_version {
            Some(v) if v > current => CvrVersion::new(v, 0),
            _ => CvrVersion {
                state_version: self.state_version.clone(),
                minor_version: self.minor_version + 1,
            },
        }
    }

    pub fn to_cookie(&self) -> String {
        version_to_cookie(self)
    }
}

impl PartialOrd for CvrVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Lexi strings order like their values.
impl Ord for CvrVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.state_version
            .cmp(&other.state_version)
            .then(self.minor_version.cmp(&other.minor_version))
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cookie())
    }
}

pub fn version_to_cookie(v: &CvrVersion) -> String {
    if v.minor_version == 0 {
        v.state_version.clone()
    } else {
        format!("{}:{}", v.state_version, version_to_lexi(v.minor_version))
    }
}

pub fn version_to_nullable_cookie(v: &NullableCvrVersion) -> Option<String> {
    v.as_ref().map(version_to_cookie)
}

/// Parse a cookie. A missing cookie is the null version; anything else must
/// be canonical, so `version_to_cookie(cookie_to_version(c)) == c`.
pub fn cookie_to_version(cookie: Option<&str>) -> Result<NullableCvrVersion, VersionError> {
    let Some(cookie) = cookie else {
        return Ok(None);
    };
    let invalid = |_| VersionError::InvalidCookie(cookie.to_string());
    let (state, minor) = match cookie.split_once(':') {
        Some((state, minor)) => {
            let minor = version_from_lexi(minor).map_err(invalid)?;
            if minor == 0 {
                return Err(VersionError::InvalidCookie(cookie.to_string()));
            }
            (state, minor)
        }
        None => (cookie, 0),
    };
    version_from_lexi(state).map_err(invalid)?;
    Ok(Some(CvrVersion {
        state_version: state.to_string(),
        minor_version: minor,
    }))
}

/// Total order over nullable versions, null first.
pub fn cmp_versions(a: &NullableCvrVersion, b: &NullableCvrVersion) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexi_known_values() {
        assert_eq!(version_to_lexi(0), "00");
        assert_eq!(version_to_lexi(35), "0z");
        assert_eq!(version_to_lexi(36), "110");
        assert_eq!(version_to_lexi(u64::MAX).len(), 14);
        assert_eq!(version_from_lexi("110").unwrap(), 36);
        assert_eq!(version_from_lexi(&version_to_lexi(u64::MAX)).unwrap(), u64::MAX);
    }

    #[test]
    fn test_lexi_preserves_order() {
        let values = [0u64, 1, 9, 10, 35, 36, 1295, 1296, 1_000_000, u64::MAX];
        for pair in values.windows(2) {
            assert!(version_to_lexi(pair[0]) < version_to_lexi(pair[1]));
        }
    }

    #[test]
    fn test_lexi_rejects_non_canonical() {
        for bad in ["", "1", "0Z", "105", "2ab", "1-1", "010"] {
            assert!(version_from_lexi(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_cookie_round_trip() {
        let v = CvrVersion::new(1234, 0);
        assert_eq!(cookie_to_version(Some(&v.to_cookie())).unwrap(), Some(v));

        let minor = CvrVersion::new(1234, 3);
        assert_eq!(minor.to_cookie(), format!("{}:03", version_to_lexi(1234)));
        assert_eq!(cookie_to_version(Some(&minor.to_cookie())).unwrap(), Some(minor));

        assert_eq!(cookie_to_version(None).unwrap(), None);
    }

    #[test]
    fn test_bad_cookies_rejected() {
        for bad in ["zz", "1a:", "1a:00", "05:x", ":01"] {
            assert!(cookie_to_version(Some(bad)).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_version_order() {
        let a = CvrVersion::new(5, 0);
        let b = CvrVersion::new(5, 2);
        let c = CvrVersion::new(36, 0);
        assert!(a < b && b < c);
        assert_eq!(cmp_versions(&None, &Some(a.clone())), Ordering::Less);
        assert!(a.to_cookie() < b.to_cookie() && b.to_cookie() < c.to_cookie());
    }

    #[test]
    fn test_next_version() {
        let v = CvrVersion::new(5, 0);
        assert_eq!(v.next(Some(9)), CvrVersion::new(9, 0));
        assert_eq!(v.next(Some(5)), CvrVersion::new(5, 1));
        assert_eq!(v.next(Some(3)), CvrVersion::new(5, 1));
        assert_eq!(v.next(None).next(None), CvrVersion::new(5, 2));
        assert!(v.next(Some(3)) > v);
    }
}
