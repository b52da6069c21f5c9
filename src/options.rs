//! Connection-options model: a key/value store with core, SSL, and extra
//! visibilities, plus the cross-constraint validation and override/rendering
//! operations used throughout the cluster-control core.

use std::collections::BTreeMap;

use crate::error::{ClusterControlError, Result};

/// How a server is physically reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Tcp,
    Socket,
    Pipe,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportType::Tcp => "TCP/IP",
            TransportType::Socket => "Unix socket",
            TransportType::Pipe => "Pipe",
        };
        f.write_str(s)
    }
}

/// SSL/TLS verification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disabled,
    Preferred,
    Required,
    VerifyCa,
    VerifyIdentity,
}

impl SslMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "disabled" => Ok(SslMode::Disabled),
            "preferred" => Ok(SslMode::Preferred),
            "required" => Ok(SslMode::Required),
            "verify_ca" => Ok(SslMode::VerifyCa),
            "verify_identity" => Ok(SslMode::VerifyIdentity),
            other => Err(ClusterControlError::ValueError(format!(
                "Invalid ssl-mode value '{other}', allowed values: disabled, preferred, required, verify_ca, verify_identity"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disabled => "disabled",
            SslMode::Preferred => "preferred",
            SslMode::Required => "required",
            SslMode::VerifyCa => "verify_ca",
            SslMode::VerifyIdentity => "verify_identity",
        }
    }
}

/// SSL option bag. Cross-constraints are enforced by `validate`, not by the
/// individual setters, matching the way the original accumulates options
/// before a single late validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslOptions {
    pub mode: Option<SslMode>,
    pub ca: Option<String>,
    pub capath: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub crl: Option<String>,
    pub crlpath: Option<String>,
    pub cipher: Option<String>,
    pub tls_version: Option<String>,
    pub tls_ciphersuites: Option<String>,
}

impl SslOptions {
    pub fn has_data(&self) -> bool {
        self.mode.is_some()
            || self.ca.is_some()
            || self.capath.is_some()
            || self.cert.is_some()
            || self.key.is_some()
            || self.crl.is_some()
            || self.crlpath.is_some()
            || self.cipher.is_some()
            || self.tls_version.is_some()
            || self.tls_ciphersuites.is_some()
    }

    fn has_ca_options(&self) -> bool {
        self.ca.is_some() || self.capath.is_some() || self.crl.is_some() || self.crlpath.is_some()
    }

    /// Validates the mode=DISABLED and verify-only cross-constraints of §4.6.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Some(SslMode::Disabled) => {
                let other = self.ca.is_some()
                    || self.capath.is_some()
                    || self.cert.is_some()
                    || self.key.is_some()
                    || self.crl.is_some()
                    || self.crlpath.is_some()
                    || self.cipher.is_some()
                    || self.tls_version.is_some()
                    || self.tls_ciphersuites.is_some();
                if other {
                    return Err(ClusterControlError::ValueError(
                        "SSL options cannot be set when ssl-mode is disabled".into(),
                    ));
                }
            }
            Some(SslMode::VerifyCa) | Some(SslMode::VerifyIdentity) => {}
            _ => {
                if self.has_ca_options() {
                    return Err(ClusterControlError::ValueError(
                        "ca/capath/crl/crlpath require ssl-mode=verify_ca or verify_identity"
                            .into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Extra driver-specific options. Keys outside the pre-declared set are kept
/// but not validated, mirroring the original's permissive freeform map.
const KNOWN_EXTRA_KEYS: &[&str] = &[
    "get-server-public-key",
    "connect-timeout",
    "net-read-timeout",
    "net-write-timeout",
    "compression",
    "compression-algorithms",
    "compression-level",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraOptions {
    values: BTreeMap<String, String>,
}

impl ExtraOptions {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if key == "compression-level" {
            if value.parse::<u32>().is_err() {
                return Err(ClusterControlError::ValueError(
                    "Compression level is undefined.".into(),
                ));
            }
        }
        if key.starts_with("authentication-") || KNOWN_EXTRA_KEYS.contains(&key.as_str()) {
            self.values.insert(key, value);
            return Ok(());
        }
        self.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Core connection options plus the SSL and extra sub-bags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub scheme: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub socket: Option<String>,
    pub pipe: Option<String>,
    pub schema: Option<String>,
    pub ssl: SslOptions,
    pub extra: ExtraOptions,
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport_type(&self) -> TransportType {
        if self.socket.is_some() {
            TransportType::Socket
        } else if self.pipe.is_some() {
            TransportType::Pipe
        } else {
            TransportType::Tcp
        }
    }

    pub fn has_data(&self) -> bool {
        self.scheme.is_some()
            || self.user.is_some()
            || self.password.is_some()
            || self.host.is_some()
            || self.port.is_some()
            || self.socket.is_some()
            || self.pipe.is_some()
            || self.schema.is_some()
            || self.ssl.has_data()
    }

    /// Copies every non-null value from `src` into `self`.
    pub fn override_from(&mut self, src: &ConnectionOptions) {
        macro_rules! take {
            ($field:ident) => {
                if src.$field.is_some() {
                    self.$field = src.$field.clone();
                }
            };
        }
        take!(scheme);
        take!(user);
        take!(password);
        take!(host);
        take!(port);
        take!(socket);
        take!(pipe);
        take!(schema);
        if src.ssl.has_data() {
            self.ssl = src.ssl.clone();
        }
    }

    /// Copies only user/password/ssl, for re-authenticating against the same
    /// endpoint with different credentials.
    pub fn login_override_from(&mut self, src: &ConnectionOptions) {
        if src.user.is_some() {
            self.user = src.user.clone();
        }
        if src.password.is_some() {
            self.password = src.password.clone();
        }
        if src.ssl.has_data() {
            self.ssl = src.ssl.clone();
        }
    }

    /// A fingerprint suitable for instance-pool session caching:
    /// `(host, port, user, auth-kind)`.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.host.as_deref().unwrap_or(""),
            self.port.unwrap_or(0),
            self.user.as_deref().unwrap_or(""),
            self.ssl
                .mode
                .map(|m| m.as_str())
                .unwrap_or("preferred")
        )
    }

    /// Renders a URI with optional per-token masking (e.g. always masking the
    /// password).
    pub fn render(&self, mask_password: bool) -> String {
        let mut out = String::new();
        out.push_str(self.scheme.as_deref().unwrap_or("mysql"));
        out.push_str("://");
        if let Some(user) = &self.user {
            out.push_str(&crate::uri::percent_encode(user));
            if let Some(password) = &self.password {
                out.push(':');
                out.push_str(if mask_password { "****" } else { password });
            }
            out.push('@');
        }
        match self.transport_type() {
            TransportType::Socket => {
                out.push('(');
                out.push_str(self.socket.as_deref().unwrap_or(""));
                out.push(')');
            }
            TransportType::Pipe => {
                out.push('(');
                out.push_str(self.pipe.as_deref().unwrap_or(""));
                out.push(')');
            }
            TransportType::Tcp => {
                out.push_str(self.host.as_deref().unwrap_or("localhost"));
                if let Some(port) = self.port {
                    out.push(':');
                    out.push_str(&port.to_string());
                }
            }
        }
        if let Some(schema) = &self.schema {
            out.push('/');
            out.push_str(schema);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_mode_disabled_forbids_other_options() {
        let mut opts = SslOptions {
            mode: Some(SslMode::Disabled),
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
        opts.ca = Some("ca.pem".into());
        assert!(opts.validate().is_err());
    }

    #[test]
    fn ssl_ca_requires_verify_mode() {
        let opts = SslOptions {
            mode: Some(SslMode::Required),
            ca: Some("ca.pem".into()),
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = SslOptions {
            mode: Some(SslMode::VerifyCa),
            ca: Some("ca.pem".into()),
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn override_copies_only_non_null_fields() {
        let mut dest = ConnectionOptions {
            host: Some("original".into()),
            port: Some(3306),
            ..Default::default()
        };
        let src = ConnectionOptions {
            user: Some("root".into()),
            ..Default::default()
        };
        dest.override_from(&src);
        assert_eq!(dest.host.as_deref(), Some("original"));
        assert_eq!(dest.user.as_deref(), Some("root"));
    }

    #[test]
    fn login_override_does_not_touch_host() {
        let mut dest = ConnectionOptions {
            host: Some("h1".into()),
            user: Some("u1".into()),
            ..Default::default()
        };
        let src = ConnectionOptions {
            host: Some("h2".into()),
            user: Some("u2".into()),
            password: Some("p2".into()),
            ..Default::default()
        };
        dest.login_override_from(&src);
        assert_eq!(dest.host.as_deref(), Some("h1"));
        assert_eq!(dest.user.as_deref(), Some("u2"));
        assert_eq!(dest.password.as_deref(), Some("p2"));
    }

    #[test]
    fn fingerprint_distinguishes_users() {
        let a = ConnectionOptions {
            host: Some("h".into()),
            port: Some(3306),
            user: Some("a".into()),
            ..Default::default()
        };
        let b = ConnectionOptions {
            user: Some("b".into()),
            ..a.clone()
        };
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
