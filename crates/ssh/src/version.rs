//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and server
//! send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The identification string (without CR LF) is kept verbatim because it
//! is part of the exchange hash.
//!
//! # Security
//!
//! - Maximum line length: 255 characters (DoS prevention)
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::version::Version;
//!
//! let version = Version::new("Fynx_0.1.0", Some("test build"));
//! assert_eq!(version.to_string(), "SSH-2.0-Fynx_0.1.0 test build");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use fynx_platform::{FynxError, FynxResult};
use std::fmt;

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Lines a server may send before its identification string.
pub const MAX_PRE_VERSION_LINES: usize = 1024;

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    raw: String,
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH 2.0 identification string.
    ///
    /// # Example
    ///
    /// ```rust
    /// use fynx_ssh::version::Version;
    ///
    /// let version = Version::new("Fynx_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Fynx_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let raw = match comments {
            Some(c) => format!("SSH-2.0-{} {}", software, c),
            None => format!("SSH-2.0-{}", software),
        };
        Self {
            raw,
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default Fynx identification string.
    pub fn default_fynx() -> Self {
        Self::new(&format!("Fynx_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH identification line (with or without CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    pub fn parse(line: &str) -> FynxResult<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.len() > MAX_VERSION_LENGTH {
            return Err(FynxError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(FynxError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(FynxError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 || parts[2].is_empty() {
            return Err(FynxError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(FynxError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            raw: line.to_string(),
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Whether a received line is an identification string rather than a
    /// pre-version banner line.
    pub fn is_identification(line: &str) -> bool {
        line.starts_with("SSH-")
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "Fynx_0.1.0").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The identification string exactly as sent, without CR LF.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw.len() + 2);
        out.extend_from_slice(self.raw.as_bytes());
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_new() {
        let version = Version::new("Fynx_0.1.0", Some("comment"));
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "Fynx_0.1.0");
        assert_eq!(version.comments(), Some("comment"));
        assert_eq!(version.to_wire(), b"SSH-2.0-Fynx_0.1.0 comment\r\n");
    }

    #[test]
    fn test_parse_keeps_raw_text() {
        let line = "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1  extra\r\n";
        let version = Version::parse(line).unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9p1");
        assert_eq!(version.as_str(), "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1  extra");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1  extra"));
    }

    #[test]
    fn test_parse_bare_lf() {
        let version = Version::parse("SSH-1.99-Legacy\n").unwrap();
        assert_eq!(version.proto_version(), "1.99");
        assert_eq!(version.as_str(), "SSH-1.99-Legacy");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Version::parse("SSH-1.5-Old").is_err());
        assert!(Version::parse("HTTP/1.1 200 OK").is_err());
        assert!(Version::parse("SSH-2.0-").is_err());
        assert!(Version::parse("SSH-2.0-A\0B").is_err());
        let long = format!("SSH-2.0-{}", "x".repeat(300));
        assert!(matches!(Version::parse(&long), Err(FynxError::Protocol(_))));
    }

    #[test]
    fn test_identification_detection() {
        assert!(Version::is_identification("SSH-2.0-x"));
        assert!(!Version::is_identification("Welcome to host"));
    }
}
