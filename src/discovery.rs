//! Bounded schema-discovery probe.
//!
//! Samples the directory with an unfiltered-attribute query and unions every
//! attribute name observed, giving the configuration layer a candidate
//! schema to present.

use std::collections::BTreeSet;

use tracing::{info, instrument};

use crate::config::{QueryRule, Schema};
use crate::connection::Session;
use crate::error::HarvestResult;
#[cfg(test)]
use crate::search::PageSource;
use crate::search::PagedSearchExecutor;

/// Default sampling bound for [`SchemaDiscoverer::discover`].
pub const DEFAULT_SAMPLE_CAP: usize = 1000;

/// Attribute names observed across a bounded sample of entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSchema {
    /// Union of attribute names seen, lower-cased, dn included.
    pub attributes: BTreeSet<String>,
    /// Number of sampled records actually examined.
    pub sample_count: usize,
}

/// Probes a directory for the attribute names its entries carry.
pub struct SchemaDiscoverer;

impl SchemaDiscoverer {
    /// Run `rule` with all attributes returned, sampling at most
    /// `sample_cap` records. Zero samples is not an error here; the caller
    /// decides how to present an empty directory.
    #[instrument(skip_all, fields(filter = %rule.filter))]
    pub async fn discover(
        session: Session,
        rule: &QueryRule,
        sample_cap: usize,
    ) -> HarvestResult<DiscoveredSchema> {
        let probe = Schema::dn_keyed();
        let results = PagedSearchExecutor::search(session, rule, &probe, sample_cap).await?;
        Ok(Self::union(results))
    }

    /// Test seam mirroring `discover` over an arbitrary page source.
    #[cfg(test)]
    pub(crate) async fn probe<S: PageSource>(
        source: &mut S,
        rule: &QueryRule,
        sample_cap: usize,
    ) -> HarvestResult<DiscoveredSchema> {
        let probe = Schema::dn_keyed();
        let results = PagedSearchExecutor::run(source, rule, &probe, sample_cap).await?;
        Ok(Self::union(results))
    }

    fn union(results: crate::search::ResultSet) -> DiscoveredSchema {
        let sample_count = results.len();
        let mut attributes = BTreeSet::new();
        for record in results.values() {
            attributes.extend(record.keys().cloned());
        }
        info!(
            sample_count,
            attribute_count = attributes.len(),
            "schema discovery complete"
        );
        DiscoveredSchema {
            attributes,
            sample_count,
        }
    }
}
