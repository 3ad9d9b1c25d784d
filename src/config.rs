//! Harvester configuration
//!
//! Immutable value types describing a directory connection, a query rule,
//! and the attribute schema of interest. All of these are supplied per call
//! and never mutated by the core.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, HarvestResult};
use crate::keys::DN_ATTRIBUTE;

/// Transport method for the directory connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMethod {
    /// Plain LDAP.
    #[default]
    Plain,
    /// LDAP over TLS (ldaps).
    Secure,
}

/// Authentication mode for the directory connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// No credentials supplied.
    #[default]
    Anonymous,
    /// Simple bind with principal and password.
    Simple,
}

/// Settings for one directory connection. Immutable value; the password is
/// never logged in clear form.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Directory server hostname or IP address.
    pub hostname: String,

    /// Directory server port (389 for LDAP, 636 for LDAPS).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport method.
    #[serde(default)]
    pub method: ConnectMethod,

    /// Authentication mode.
    #[serde(default)]
    pub auth: AuthType,

    /// Bind principal for simple authentication.
    #[serde(default)]
    pub username: String,

    /// Bind password for simple authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Base DN all searches are relative to (e.g. "dc=example,dc=com").
    pub base_dn: String,
}

fn default_port() -> u16 {
    389
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("method", &self.method)
            .field("auth", &self.auth)
            .field("username", &self.username)
            .field(
                "password",
                &self.password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("base_dn", &self.base_dn)
            .finish()
    }
}

impl ConnectionSettings {
    /// Create settings for an anonymous plain connection.
    pub fn new(hostname: impl Into<String>, base_dn: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: default_port(),
            method: ConnectMethod::Plain,
            auth: AuthType::Anonymous,
            username: String::new(),
            password: None,
            base_dn: base_dn.into(),
        }
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use simple bind with the given principal and password.
    pub fn with_simple_bind(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth = AuthType::Simple;
        self.username = username.into();
        self.password = Some(password.into());
        self
    }

    /// Use TLS transport (ldaps).
    #[must_use]
    pub fn with_tls(mut self) -> Self {
        self.method = ConnectMethod::Secure;
        self.port = 636;
        self
    }

    /// Connection URL including the encoded base DN.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = match self.method {
            ConnectMethod::Secure => "ldaps",
            ConnectMethod::Plain => "ldap",
        };
        format!(
            "{}://{}:{}/{}",
            scheme,
            self.hostname,
            self.port,
            encode_base_dn(&self.base_dn)
        )
    }

    /// Validate the settings.
    pub fn validate(&self) -> HarvestResult<()> {
        if self.hostname.is_empty() {
            return Err(HarvestError::invalid_state("hostname is required"));
        }
        if self.base_dn.is_empty() {
            return Err(HarvestError::invalid_state("base_dn is required"));
        }
        if self.auth == AuthType::Simple && self.username.is_empty() {
            return Err(HarvestError::invalid_state(
                "username is required for simple bind",
            ));
        }
        Ok(())
    }

    /// Create a redacted copy for logging/display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut settings = self.clone();
        if settings.password.is_some() {
            settings.password = Some("***REDACTED***".to_string());
        }
        settings
    }
}

/// Encode a base DN for use in an LDAP URL. Only spaces are escaped: general
/// URL escaping is wrong here because `+` must remain literal for the
/// protocol.
fn encode_base_dn(base_dn: &str) -> String {
    base_dn.replace(' ', "%20")
}

/// One directory query: a search scope and a filter expression. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRule {
    /// Search scope: "subtree" (default), "onelevel", or "object".
    #[serde(default = "default_scope")]
    pub scope: String,

    /// LDAP filter expression, relative to the connection's base DN.
    pub filter: String,
}

fn default_scope() -> String {
    "subtree".to_string()
}

impl QueryRule {
    /// Create a query rule.
    pub fn new(scope: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            filter: filter.into(),
        }
    }

    /// Create a subtree-scoped query rule.
    pub fn subtree(filter: impl Into<String>) -> Self {
        Self::new(default_scope(), filter)
    }
}

/// The set of attribute names to retain, plus the designated key attribute.
///
/// Attribute names are case-insensitive and held lower-cased. An empty
/// attribute set means "return all attributes". When the set is non-empty the
/// key attribute is folded into it, so every retained record can carry its
/// own key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    attributes: BTreeSet<String>,
    key: String,
}

impl Schema {
    /// Create a schema restricted to the given attribute names.
    pub fn new<I, S>(attributes: I, key: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut attributes: BTreeSet<String> = attributes
            .into_iter()
            .map(|a| a.into().to_lowercase())
            .collect();
        let key = key.to_lowercase();
        if !attributes.is_empty() {
            attributes.insert(key.clone());
        }
        Self { attributes, key }
    }

    /// Create a schema that returns all attributes, keyed by `key`.
    pub fn unrestricted(key: &str) -> Self {
        Self {
            attributes: BTreeSet::new(),
            key: key.to_lowercase(),
        }
    }

    /// Schema keyed by the canonical DN, retaining all attributes.
    #[must_use]
    pub fn dn_keyed() -> Self {
        Self::unrestricted(DN_ATTRIBUTE)
    }

    /// Whether all attributes are returned.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Whether a (lower-cased) attribute name is retained by this schema.
    #[must_use]
    pub fn retains(&self, lower_name: &str) -> bool {
        self.is_unrestricted() || self.attributes.contains(lower_name)
    }

    /// The lower-cased key attribute name.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The lower-cased attribute names, in ascending order.
    pub fn attribute_names(&self) -> impl Iterator<Item = &String> {
        self.attributes.iter()
    }
}
