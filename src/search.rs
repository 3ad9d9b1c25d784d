//! Paged search execution.
//!
//! Drives one logical query to completion over the RFC 2696 paging protocol,
//! filtering and normalizing attributes into a sorted key-to-record map.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ldap3::controls::{Control, ControlType, PagedResults};
use ldap3::{LdapError, Scope, SearchEntry};
use tracing::{debug, info, instrument, warn};

use crate::config::{QueryRule, Schema};
use crate::connection::Session;
use crate::error::{HarvestError, HarvestResult};
use crate::keys::{canonical_dn, DN_ATTRIBUTE};

/// One directory entry: lower-cased attribute name to ordered string values.
/// Binary-valued attributes are never stored.
pub type Record = BTreeMap<String, Vec<String>>;

/// Query results keyed by the schema-key value, in ascending key order.
/// Duplicate keys are last-write-wins.
pub type ResultSet = BTreeMap<String, Record>;

/// One page of raw results plus the server's continuation cookie. An empty
/// cookie means the query is complete.
pub(crate) struct Page {
    pub entries: Vec<SearchEntry>,
    pub cookie: Vec<u8>,
}

/// Seam between the page loop and the wire: issues one page request for the
/// given continuation cookie.
#[async_trait]
pub(crate) trait PageSource: Send {
    async fn next_page(
        &mut self,
        scope: Scope,
        filter: &str,
        attrs: &[String],
        cookie: Vec<u8>,
    ) -> HarvestResult<Page>;
}

#[async_trait]
impl PageSource for Session {
    async fn next_page(
        &mut self,
        scope: Scope,
        filter: &str,
        attrs: &[String],
        cookie: Vec<u8>,
    ) -> HarvestResult<Page> {
        let result = self
            .ldap
            .with_controls(PagedResults {
                size: self.page_size,
                cookie,
            })
            .search(&self.base_dn, scope, filter, attrs.to_vec())
            .await
            .map_err(map_search_error)?;

        let (entries, res) = result.success().map_err(map_search_error)?;

        let mut next_cookie = Vec::new();
        for ctrl in res.ctrls {
            if let Control(Some(ControlType::PagedResults), raw) = ctrl {
                next_cookie = raw.parse::<PagedResults>().cookie;
            }
        }

        Ok(Page {
            entries: entries.into_iter().map(SearchEntry::construct).collect(),
            cookie: next_cookie,
        })
    }
}

/// Map a mid-query `ldap3` error onto the retryable/fatal taxonomy.
fn map_search_error(err: LdapError) -> HarvestError {
    match err {
        LdapError::Io { .. } | LdapError::EndOfStream => {
            HarvestError::transient_with_source("communication dropped mid-query", err)
        }
        LdapError::LdapResult { ref result } if matches!(result.rc, 51 | 52) => {
            // busy / unavailable
            HarvestError::transient_with_source(
                format!("server reported code {}: {}", result.rc, result.text),
                err,
            )
        }
        other => HarvestError::protocol_with_source("directory search failed", other),
    }
}

/// Runs one logical query to completion over the paging protocol.
pub struct PagedSearchExecutor;

impl PagedSearchExecutor {
    /// Execute `rule` against the session, filtering attributes by `schema`
    /// and keying records by the schema's key attribute. `max_results == 0`
    /// means unbounded. The session is consumed and closed on every exit
    /// path.
    #[instrument(skip_all, fields(filter = %rule.filter, scope = %rule.scope))]
    pub async fn search(
        mut session: Session,
        rule: &QueryRule,
        schema: &Schema,
        max_results: usize,
    ) -> HarvestResult<ResultSet> {
        let outcome = Self::run(&mut session, rule, schema, max_results).await;
        session.close().await;
        outcome
    }

    /// The page loop, generic over the page seam for testability.
    pub(crate) async fn run<S: PageSource>(
        source: &mut S,
        rule: &QueryRule,
        schema: &Schema,
        max_results: usize,
    ) -> HarvestResult<ResultSet> {
        let scope = map_scope(&rule.scope)?;
        let attrs = returned_attributes(schema);

        let mut results = ResultSet::new();
        let mut cookie = Vec::new();
        let mut pages = 0usize;

        loop {
            let page = source
                .next_page(scope, &rule.filter, &attrs, cookie)
                .await?;
            pages += 1;

            let mut capped = false;
            for entry in page.entries {
                let record = record_from_entry(entry, schema);
                match record.get(schema.key()).and_then(|v| v.first()) {
                    Some(key) => {
                        let key = key.clone();
                        // Last-write-wins: a later entry with the same key
                        // silently replaces the earlier one.
                        results.insert(key, record);
                    }
                    None => {
                        warn!(
                            dn = %record
                                .get(DN_ATTRIBUTE)
                                .and_then(|v| v.first())
                                .map(String::as_str)
                                .unwrap_or(""),
                            key_attribute = %schema.key(),
                            "entry is missing its schema key attribute, skipping"
                        );
                    }
                }
                if max_results > 0 && results.len() >= max_results {
                    capped = true;
                    break;
                }
            }

            debug!(pages, retained = results.len(), "page processed");

            // Once the cap is reached, no further page request is issued.
            if capped || page.cookie.is_empty() {
                break;
            }
            cookie = page.cookie;
        }

        info!(pages, retained = results.len(), "search complete");
        Ok(results)
    }
}

/// Map the rule's scope string onto a wire scope. An unknown scope is a
/// fatal protocol failure, not a retryable condition.
fn map_scope(scope: &str) -> HarvestResult<Scope> {
    match scope {
        "subtree" => Ok(Scope::Subtree),
        "onelevel" => Ok(Scope::OneLevel),
        "object" => Ok(Scope::Base),
        other => Err(HarvestError::protocol(format!(
            "unsupported search scope: {other}"
        ))),
    }
}

/// Attribute-return list for the wire: everything, or exactly the schema.
fn returned_attributes(schema: &Schema) -> Vec<String> {
    if schema.is_unrestricted() {
        vec!["*".to_string()]
    } else {
        schema.attribute_names().cloned().collect()
    }
}

/// Normalize one entry into a record: canonical DN under "dn" (always kept),
/// attribute names case-folded, binary values dropped, schema filter applied.
fn record_from_entry(entry: SearchEntry, schema: &Schema) -> Record {
    let mut record = Record::new();
    record.insert(DN_ATTRIBUTE.to_string(), vec![canonical_dn(&entry.dn)]);

    for (name, values) in entry.attrs {
        let name = name.to_lowercase();
        if name == DN_ATTRIBUTE || !schema.retains(&name) {
            continue;
        }
        record.entry(name).or_default().extend(values);
    }

    // entry.bin_attrs intentionally dropped: only string values are indexed.
    record
}
