//! # LDAP Harvester
//!
//! Polls an LDAP directory for entries matching a query and exposes the
//! result set as keyed JSON-ready documents for downstream indexing.
//!
//! ## Features
//!
//! - LDAP v3 over plain or TLS transport, anonymous or simple bind
//! - Paged result retrieval (RFC 2696 continuation cookies)
//! - Attribute/schema filtering with lower-case normalization
//! - Bounded schema-discovery sampling
//! - Retrying document fetch with an escalating backoff schedule
//!
//! ## Example
//!
//! ```ignore
//! use ldap_harvester::{
//!     ConnectionSettings, DocumentFetcher, LdapRecordSource, QueryRule, Schema,
//! };
//! use std::time::Duration;
//!
//! let settings = ConnectionSettings::new("ldap.example.com", "dc=example,dc=com")
//!     .with_simple_bind("cn=admin,dc=example,dc=com", "secret");
//! let rule = QueryRule::new("subtree", "(objectClass=inetOrgPerson)");
//! let schema = Schema::new(["cn", "mail"], "cn");
//!
//! let source = LdapRecordSource::new(settings, rule, schema)
//!     .with_connect_timeout(Duration::from_secs(30));
//! let mut fetcher = DocumentFetcher::new(source);
//! let documents = fetcher.fetch().await?;
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod keys;
pub mod search;

// Re-exports
pub use config::{AuthType, ConnectMethod, ConnectionSettings, QueryRule, Schema};
pub use connection::{ConnectionManager, Session};
pub use discovery::{DiscoveredSchema, SchemaDiscoverer, DEFAULT_SAMPLE_CAP};
pub use error::{ConnectionErrorKind, HarvestError, HarvestResult};
pub use fetch::{BackoffSchedule, Document, DocumentFetcher, LdapRecordSource, RecordSource};
pub use keys::{canonical_dn, encode_key, DN_ATTRIBUTE};
pub use search::{PagedSearchExecutor, Record, ResultSet};
