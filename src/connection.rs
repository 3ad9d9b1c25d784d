//! Session establishment with classified error reporting.
//!
//! [`ConnectionManager::open`] never raises for a classified connection
//! failure: it returns `None` and records the failures in an error map the
//! caller can inspect through [`ConnectionManager::errors`].

use std::collections::BTreeMap;
use std::time::Duration;

use ldap3::controls::PagedResults;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};
use tracing::{debug, info, instrument, warn};

use crate::config::{AuthType, ConnectionSettings};
use crate::error::{ConnectionErrorKind, HarvestError, HarvestResult};

/// Page size requested when arming the paging protocol.
pub const PAGE_SIZE: i32 = 1000;

/// OID of the simple paged results control (RFC 2696).
const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// An open, bound directory session with paging armed.
///
/// A session is owned exclusively by one query execution and must be closed
/// when that execution ends, regardless of outcome.
pub struct Session {
    pub(crate) ldap: Ldap,
    pub(crate) base_dn: String,
    pub(crate) page_size: i32,
}

impl Session {
    /// Release the session, unbinding from the server. Unbind failures are
    /// logged, not propagated; the query outcome is already decided.
    pub async fn close(mut self) {
        if let Err(e) = self.ldap.unbind().await {
            warn!(error = %e, "error during LDAP unbind");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("base_dn", &self.base_dn)
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Opens directory sessions and classifies connection failures.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    errors: Option<BTreeMap<ConnectionErrorKind, String>>,
}

impl ConnectionManager {
    /// Create a connection manager with no recorded error state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classified errors from the most recent `open` call.
    ///
    /// Calling this before `open` is a programmer error.
    pub fn errors(&self) -> HarvestResult<&BTreeMap<ConnectionErrorKind, String>> {
        self.errors.as_ref().ok_or_else(|| {
            HarvestError::invalid_state("connection errors requested before any open call")
        })
    }

    /// Open a session: connect, bind per the auth settings, and arm the
    /// paging protocol. All failures are classified and collected; a `None`
    /// return means the error map has at least one entry.
    #[instrument(skip_all, fields(url = %settings.url()))]
    pub async fn open(
        &mut self,
        settings: &ConnectionSettings,
        connect_timeout: Duration,
    ) -> Option<Session> {
        let mut errors = BTreeMap::new();
        let session = self.try_open(settings, connect_timeout, &mut errors).await;
        if session.is_none() && errors.is_empty() {
            errors.insert(
                ConnectionErrorKind::CommunicationOther,
                "unknown connection error".to_string(),
            );
        }
        self.errors = Some(errors);
        session
    }

    async fn try_open(
        &self,
        settings: &ConnectionSettings,
        connect_timeout: Duration,
        errors: &mut BTreeMap<ConnectionErrorKind, String>,
    ) -> Option<Session> {
        debug!(settings = ?settings.redacted(), "connecting to directory server");

        let conn_settings = LdapConnSettings::new().set_conn_timeout(connect_timeout);
        let url = format!(
            "{}://{}:{}",
            match settings.method {
                crate::config::ConnectMethod::Secure => "ldaps",
                crate::config::ConnectMethod::Plain => "ldap",
            },
            settings.hostname,
            settings.port
        );

        let mut ldap = match LdapConnAsync::with_settings(conn_settings, &url).await {
            Ok((conn, ldap)) => {
                tokio::spawn(async move {
                    if let Err(e) = conn.drive().await {
                        warn!(error = %e, "LDAP connection driver error");
                    }
                });
                ldap
            }
            Err(e) => {
                let (kind, message) = classify_connect_error(&e);
                warn!(error = %e, kind = %kind, "directory connection failed");
                errors.insert(kind, message);
                return None;
            }
        };

        match settings.auth {
            AuthType::Simple => {
                debug!(bind_dn = %settings.username, "performing simple bind");
                let password = settings.password.as_deref().unwrap_or("");
                match ldap.simple_bind(&settings.username, password).await {
                    Ok(result) if result.rc == 0 => {}
                    Ok(result) => {
                        let (kind, message) = classify_bind_rc(result.rc, &result.text);
                        warn!(rc = result.rc, kind = %kind, "directory bind rejected");
                        errors.insert(kind, message);
                        return None;
                    }
                    Err(e) => {
                        let (kind, message) = classify_connect_error(&e);
                        warn!(error = %e, kind = %kind, "directory bind failed");
                        errors.insert(kind, message);
                        return None;
                    }
                }
            }
            AuthType::Anonymous => {
                info!("using anonymous authentication");
            }
        }

        // Arm paging before handing out the session: a root-DSE probe
        // carrying the paged results control, which also tells us whether
        // the server advertises the control at all.
        let probe = ldap
            .with_controls(PagedResults {
                size: PAGE_SIZE,
                cookie: Vec::new(),
            })
            .search("", Scope::Base, "(objectClass=*)", vec!["supportedControl"])
            .await
            .and_then(ldap3::SearchResult::success);

        match probe {
            Ok((entries, _res)) => {
                let advertised = entries.into_iter().next().map(SearchEntry::construct);
                if let Some(root_dse) = advertised {
                    if let Some(controls) = root_dse.attrs.get("supportedControl") {
                        if !controls.iter().any(|oid| oid == PAGED_RESULTS_OID) {
                            errors.insert(
                                ConnectionErrorKind::ProtocolError,
                                format!(
                                    "server does not advertise paged results control {PAGED_RESULTS_OID}"
                                ),
                            );
                            return None;
                        }
                    }
                }
            }
            Err(e) => {
                let (kind, message) = classify_paging_error(&e);
                warn!(error = %e, kind = %kind, "failed to arm paged results");
                errors.insert(kind, message);
                return None;
            }
        }

        info!(host = %settings.hostname, page_size = PAGE_SIZE, "directory session established");

        Some(Session {
            ldap,
            base_dn: settings.base_dn.clone(),
            page_size: PAGE_SIZE,
        })
    }
}

/// Classify a connection-phase `ldap3` error.
fn classify_connect_error(err: &LdapError) -> (ConnectionErrorKind, String) {
    match err {
        LdapError::Io { source } => classify_io(source),
        LdapError::LdapResult { result } => classify_bind_rc(result.rc, &result.text),
        other => {
            let message = other.to_string();
            if message.contains("timed out") || message.contains("timeout") {
                (ConnectionErrorKind::Timeout, message)
            } else {
                (ConnectionErrorKind::CommunicationOther, message)
            }
        }
    }
}

/// Classify an I/O error from connect or bind.
fn classify_io(err: &std::io::Error) -> (ConnectionErrorKind, String) {
    let message = err.to_string();
    match err.kind() {
        std::io::ErrorKind::TimedOut => (ConnectionErrorKind::Timeout, message),
        std::io::ErrorKind::NotFound => (ConnectionErrorKind::UnknownHost, message),
        _ if message.contains("failed to lookup address")
            || message.contains("name or service not known")
            || message.contains("nodename nor servname") =>
        {
            (ConnectionErrorKind::UnknownHost, message)
        }
        _ => (ConnectionErrorKind::CommunicationOther, message),
    }
}

/// Classify a non-zero bind result code.
fn classify_bind_rc(rc: u32, text: &str) -> (ConnectionErrorKind, String) {
    let message = format!("bind failed with code {rc}: {text}");
    match rc {
        49 => (ConnectionErrorKind::AuthenticationFailed, message),
        // authMethodNotSupported, strongerAuthRequired,
        // confidentialityRequired, inappropriateAuthentication
        7 | 8 | 13 | 48 => (ConnectionErrorKind::AuthenticationUnsupported, message),
        _ => (ConnectionErrorKind::ProtocolError, message),
    }
}

/// Classify a failure while arming the paging control.
fn classify_paging_error(err: &LdapError) -> (ConnectionErrorKind, String) {
    match err {
        LdapError::Io { source } => (ConnectionErrorKind::IoError, source.to_string()),
        other => (ConnectionErrorKind::ProtocolError, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_before_open_is_invalid_state() {
        let manager = ConnectionManager::new();
        let err = manager.errors().unwrap_err();
        assert!(matches!(err, HarvestError::InvalidState { .. }));
    }

    #[test]
    fn test_classify_bind_rc() {
        assert_eq!(
            classify_bind_rc(49, "invalid credentials").0,
            ConnectionErrorKind::AuthenticationFailed
        );
        assert_eq!(
            classify_bind_rc(7, "auth method not supported").0,
            ConnectionErrorKind::AuthenticationUnsupported
        );
        assert_eq!(
            classify_bind_rc(48, "inappropriate authentication").0,
            ConnectionErrorKind::AuthenticationUnsupported
        );
        assert_eq!(
            classify_bind_rc(2, "protocol error").0,
            ConnectionErrorKind::ProtocolError
        );
    }

    #[test]
    fn test_classify_io() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out");
        assert_eq!(classify_io(&timed_out).0, ConnectionErrorKind::Timeout);

        let dns = std::io::Error::other("failed to lookup address information");
        assert_eq!(classify_io(&dns).0, ConnectionErrorKind::UnknownHost);

        let reset = std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        );
        assert_eq!(
            classify_io(&reset).0,
            ConnectionErrorKind::CommunicationOther
        );
    }

    #[test]
    fn test_classify_connect_error_io() {
        let err = LdapError::Io {
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
        };
        assert_eq!(classify_connect_error(&err).0, ConnectionErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_open_against_unresolvable_host_collects_errors() {
        let settings = ConnectionSettings::new("no-such-host.invalid", "dc=example,dc=com");
        let mut manager = ConnectionManager::new();
        let session = manager.open(&settings, Duration::from_millis(500)).await;

        assert!(session.is_none());
        let errors = manager.errors().expect("errors available after open");
        assert!(!errors.is_empty());
    }
}
