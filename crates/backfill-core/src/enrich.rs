//! Batched resolution of containers and groups for one page.
//!
//! Every page costs exactly one container lookup and one group lookup,
//! whatever its size. A record whose container or group cannot be resolved
//! is a dangling reference:
//!
//! - non-strict (default): the record is excluded, logged, and reported in
//!   [`EnrichedPage::excluded`]; the rest of the page continues
//! - strict: the page aborts with [`Error::DataIntegrity`]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, IntegrityError, Result};
use crate::model::{Container, ContainerId, EnrichedRecord, Group, GroupId, Record};
use crate::source::RecordSource;

/// Outcome of enriching one page.
#[derive(Debug, Default)]
pub struct EnrichedPage {
    /// Resolved records, in the page's original order.
    pub records: Vec<EnrichedRecord>,
    /// Records left out because of dangling references.
    pub excluded: Vec<IntegrityError>,
}

/// Attaches resolved containers and groups to records.
#[derive(Debug, Clone, Copy, Default)]
pub struct Enricher {
    strict: bool,
}

impl Enricher {
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Resolve and wrap every record of a page.
    pub fn enrich<S: RecordSource>(&self, source: &S, records: Vec<Record>) -> Result<EnrichedPage> {
        if records.is_empty() {
            return Ok(EnrichedPage::default());
        }

        let container_ids: Vec<ContainerId> = records
            .iter()
            .map(|r| r.container_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let group_ids: Vec<GroupId> = records
            .iter()
            .filter_map(|r| r.group_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let containers: HashMap<ContainerId, Arc<Container>> = source
            .containers_by_id(&container_ids)?
            .into_iter()
            .map(|c| (c.id, Arc::new(c)))
            .collect();
        let groups: HashMap<GroupId, Arc<Group>> = source
            .groups_by_id(&group_ids)?
            .into_iter()
            .map(|g| (g.id, Arc::new(g)))
            .collect();

        let mut page = EnrichedPage {
            records: Vec::with_capacity(records.len()),
            excluded: Vec::new(),
        };

        for record in records {
            match resolve(&record, &containers, &groups) {
                Ok((container, group)) => page.records.push(EnrichedRecord {
                    record,
                    container,
                    group,
                }),
                Err(integrity) => {
                    if self.strict {
                        return Err(Error::DataIntegrity(integrity));
                    }
                    warn!(
                        record_id = integrity.record_id(),
                        error = %integrity,
                        "Excluding record with dangling reference"
                    );
                    page.excluded.push(integrity);
                }
            }
        }

        Ok(page)
    }
}

fn resolve(
    record: &Record,
    containers: &HashMap<ContainerId, Arc<Container>>,
    groups: &HashMap<GroupId, Arc<Group>>,
) -> std::result::Result<(Arc<Container>, Arc<Group>), IntegrityError> {
    let container = containers
        .get(&record.container_id)
        .cloned()
        .ok_or(IntegrityError::DanglingContainer {
            record_id: record.id,
            container_id: record.container_id,
        })?;
    let group_id = record
        .group_id
        .ok_or(IntegrityError::MissingGroup { record_id: record.id })?;
    let group = groups
        .get(&group_id)
        .cloned()
        .ok_or(IntegrityError::DanglingGroup {
            record_id: record.id,
            group_id,
        })?;
    Ok((container, group))
}
