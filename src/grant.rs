//! Shared-access grants
//!
//! A grant is a signed, time-limited credential that lets its holder perform
//! a fixed set of operations on one container or one blob without knowing
//! the storage account key. Grants travel as query-string tokens:
//!
//! ```text
//! sr=b&sp=r&se=2026-10-19T14:00:00Z&sig=<base64url>
//! ```
//!
//! The signature is an HMAC-SHA256 over the account, scope, resource path,
//! permissions and expiry. The resource path is not carried in the token;
//! it comes from the URL the token is presented with, so a blob grant cannot
//! be replayed against another blob.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Expiry format used inside tokens and signatures
const EXPIRY_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Operations a grant allows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub add: bool,
    pub create: bool,
    pub write: bool,
    pub delete: bool,
}

impl Permissions {
    pub const READ: Permissions = Permissions {
        read: true,
        add: false,
        create: false,
        write: false,
        delete: false,
    };

    pub const WRITE: Permissions = Permissions {
        read: false,
        add: false,
        create: false,
        write: true,
        delete: false,
    };

    /// Read, add, create, write and delete
    pub fn all() -> Self {
        Self {
            read: true,
            add: true,
            create: true,
            write: true,
            delete: true,
        }
    }

    /// Canonical compact form, letters in `racwd` order
    pub fn as_compact(&self) -> String {
        let mut s = String::with_capacity(5);
        if self.read {
            s.push('r');
        }
        if self.add {
            s.push('a');
        }
        if self.create {
            s.push('c');
        }
        if self.write {
            s.push('w');
        }
        if self.delete {
            s.push('d');
        }
        s
    }

    /// Parse the compact form; letters may appear in any order
    pub fn parse(s: &str) -> Result<Self, GrantError> {
        let mut perms = Permissions::default();
        for c in s.chars() {
            match c {
                'r' => perms.read = true,
                'a' => perms.add = true,
                'c' => perms.create = true,
                'w' => perms.write = true,
                'd' => perms.delete = true,
                other => {
                    return Err(GrantError::Malformed(format!(
                        "unknown permission letter '{}'",
                        other
                    )))
                }
            }
        }
        Ok(perms)
    }

    /// True if every operation in `needed` is allowed here
    pub fn covers(&self, needed: Permissions) -> bool {
        (!needed.read || self.read)
            && (!needed.add || self.add)
            && (!needed.create || self.create)
            && (!needed.write || self.write)
            && (!needed.delete || self.delete)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_compact())
    }
}

/// What a grant is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantScope {
    Container,
    Blob,
}

impl GrantScope {
    fn code(&self) -> &'static str {
        match self {
            GrantScope::Container => "c",
            GrantScope::Blob => "b",
        }
    }

    fn from_code(code: &str) -> Result<Self, GrantError> {
        match code {
            "c" => Ok(GrantScope::Container),
            "b" => Ok(GrantScope::Blob),
            other => Err(GrantError::Malformed(format!("unknown scope '{}'", other))),
        }
    }
}

/// A decoded grant token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub scope: GrantScope,
    pub permissions: Permissions,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

impl AccessGrant {
    /// Encode as a query-string token
    pub fn to_token(&self) -> String {
        format!(
            "sr={}&sp={}&se={}&sig={}",
            self.scope.code(),
            self.permissions.as_compact(),
            self.expires_at.format(EXPIRY_FORMAT),
            self.signature
        )
    }

    /// Decode a query-string token
    pub fn parse_token(token: &str) -> Result<Self, GrantError> {
        let token = token.trim().trim_matches('"').trim_start_matches('?');
        let fields: BTreeMap<&str, &str> = token
            .split('&')
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.split_once('='))
            .collect();

        let field = |name: &str| {
            fields
                .get(name)
                .copied()
                .ok_or_else(|| GrantError::Malformed(format!("missing '{}'", name)))
        };

        let scope = GrantScope::from_code(field("sr")?)?;
        let permissions = Permissions::parse(field("sp")?)?;
        let expires_at = DateTime::parse_from_rfc3339(field("se")?)
            .map_err(|e| GrantError::Malformed(format!("bad expiry: {}", e)))?
            .with_timezone(&Utc);
        let signature = field("sig")?.to_string();

        Ok(Self {
            scope,
            permissions,
            expires_at,
            signature,
        })
    }
}

/// Issues and verifies grants for one storage account
#[derive(Clone)]
pub struct GrantSigner {
    account: String,
    key: Vec<u8>,
}

impl fmt::Debug for GrantSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantSigner")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl GrantSigner {
    pub fn new(account: impl Into<String>, key: impl AsRef<[u8]>) -> Self {
        Self {
            account: account.into(),
            key: key.as_ref().to_vec(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Grant on a single blob
    pub fn issue_blob(
        &self,
        container: &str,
        blob: &str,
        permissions: Permissions,
        expires_at: DateTime<Utc>,
    ) -> AccessGrant {
        self.issue(GrantScope::Blob, container, Some(blob), permissions, expires_at)
    }

    /// Grant on every blob in a container
    pub fn issue_container(
        &self,
        container: &str,
        permissions: Permissions,
        expires_at: DateTime<Utc>,
    ) -> AccessGrant {
        self.issue(GrantScope::Container, container, None, permissions, expires_at)
    }

    fn issue(
        &self,
        scope: GrantScope,
        container: &str,
        blob: Option<&str>,
        permissions: Permissions,
        expires_at: DateTime<Utc>,
    ) -> AccessGrant {
        let expires_at = expires_at.trunc_subsecs(0);
        let signature = self.sign(scope, container, blob, permissions, expires_at);
        AccessGrant {
            scope,
            permissions,
            expires_at,
            signature,
        }
    }

    /// Check that `grant` authorizes `needed` on `container`/`blob` at `now`
    pub fn verify(
        &self,
        grant: &AccessGrant,
        container: &str,
        blob: Option<&str>,
        needed: Permissions,
        now: DateTime<Utc>,
    ) -> Result<(), GrantError> {
        let signed_blob = match grant.scope {
            GrantScope::Container => None,
            GrantScope::Blob => Some(blob.ok_or(GrantError::ScopeMismatch)?),
        };

        let presented = URL_SAFE_NO_PAD
            .decode(&grant.signature)
            .map_err(|_| GrantError::InvalidSignature)?;
        self.mac(
            grant.scope,
            container,
            signed_blob,
            grant.permissions,
            grant.expires_at,
        )
        .verify_slice(&presented)
        .map_err(|_| GrantError::InvalidSignature)?;

        if now >= grant.expires_at {
            return Err(GrantError::Expired {
                expired_at: grant.expires_at,
            });
        }

        if !grant.permissions.covers(needed) {
            return Err(GrantError::PermissionDenied {
                needed: needed.as_compact(),
                granted: grant.permissions.as_compact(),
            });
        }

        Ok(())
    }

    fn sign(
        &self,
        scope: GrantScope,
        container: &str,
        blob: Option<&str>,
        permissions: Permissions,
        expires_at: DateTime<Utc>,
    ) -> String {
        let mac = self.mac(scope, container, blob, permissions, expires_at);
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// MAC state over the string to sign, ready to finalize or verify
    fn mac(
        &self,
        scope: GrantScope,
        container: &str,
        blob: Option<&str>,
        permissions: Permissions,
        expires_at: DateTime<Utc>,
    ) -> HmacSha256 {
        let resource = match blob {
            Some(b) => format!("/{}/{}/{}", self.account, container, b),
            None => format!("/{}/{}", self.account, container),
        };
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            scope.code(),
            resource,
            permissions.as_compact(),
            expires_at.format(EXPIRY_FORMAT)
        );

        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(string_to_sign.as_bytes());
        mac
    }
}

/// Grant errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GrantError {
    #[error("malformed access token: {0}")]
    Malformed(String),

    #[error("access grant expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },

    #[error("access grant signature does not match")]
    InvalidSignature,

    #[error("access grant allows '{granted}', operation needs '{needed}'")]
    PermissionDenied { needed: String, granted: String },

    #[error("blob-scoped grant presented without a blob")]
    ScopeMismatch,
}

impl GrantError {
    pub fn is_expired(&self) -> bool {
        matches!(self, GrantError::Expired { .. })
    }
}
