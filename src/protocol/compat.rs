//! Compatibility shims for older server releases.
//!
//! Each shim is gated on the version reported in the app config so it can be
//! dropped once those releases are no longer deployed.

use semver::Version;

/// Parse a server version, tolerating short forms like `3.6` or `4.0b2`.
pub fn parse_lenient(version: &str) -> Option<Version> {
    let trimmed = version.trim().trim_start_matches('v');
    if let Ok(parsed) = Version::parse(trimmed) {
        return Some(parsed);
    }

    let mut parts = trimmed.split('.').map(|part| {
        part.chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
    });
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

/// Whether `version` is older than `major.minor`. Unparseable versions are treated as current.
pub fn older_than(version: &str, major: u64, minor: u64) -> bool {
    parse_lenient(version).is_some_and(|parsed| parsed < Version::new(major, minor, 0))
}

/// Servers before 3.6 expect the session hash as soon as the socket opens
/// instead of prompting for it with `send_hash`.
pub fn sends_hash_on_open(version: &str) -> bool {
    older_than(version, 3, 6)
}
