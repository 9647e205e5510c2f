//! Planning of the reads needed to refresh a set of fields.
//!
//! Planning happens in three steps:
//!
//! 1. Every stale field contributes its addresses. Fields sharing a fetch
//!    group are read together; a field without one is read on its own.
//! 2. The raw queries are merged in address order per class when they touch
//!    or are separated by at most `allowed_gap` registers (`allowed_gap * 16`
//!    discretes), as long as the result stays within the request limit and
//!    does not cover a known read error. The skipped addresses are recorded
//!    as holes.
//! 3. When a merged query fails it is split up and the parts are retried, so
//!    a single broken register does not take its neighbours down with it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::address::{Address, AddressKind};

/// Identifies a field within a schema.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId {
    /// The block id.
    pub block: String,
    /// The field id.
    pub field: String,
}

impl FieldId {
    /// Creates a field identifier.
    pub fn new(block: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            block: block.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.block, self.field)
    }
}

/// The outcome of a [`ModbusQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    /// Not executed yet.
    #[default]
    NotFetched,
    /// The device returned the values.
    Success,
    /// The device returned a read error or the transport failed.
    Error,
}

#[derive(Debug, Clone, PartialEq)]
enum QueryKind {
    /// Reads the addresses of the listed fields.
    Plain,
    /// Several queries read in one request.
    Merged(Vec<ModbusQuery>),
    /// Addresses no field needs, read only to join two other queries.
    Hole,
}

/// One read request: `count` consecutive values starting at `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusQuery {
    start: Address,
    count: u16,
    status: QueryStatus,
    duration: Option<Duration>,
    fields: Vec<FieldId>,
    kind: QueryKind,
}

impl ModbusQuery {
    pub(crate) fn new(start: Address, count: u16, fields: Vec<FieldId>) -> Self {
        Self {
            start,
            count,
            status: QueryStatus::NotFetched,
            duration: None,
            fields,
            kind: QueryKind::Plain,
        }
    }

    fn hole(start: Address, count: u16) -> Self {
        Self {
            kind: QueryKind::Hole,
            ..Self::new(start, count, Vec::new())
        }
    }

    fn merged(first: ModbusQuery) -> Self {
        Self {
            fields: first.fields.clone(),
            kind: QueryKind::Merged(Vec::new()),
            ..Self::new(first.start, first.count, Vec::new())
        }
        .with_part(first)
    }

    /// A merged query holding one part is just that part.
    fn unwrap_single(self) -> Self {
        match self.kind {
            QueryKind::Merged(mut parts) if parts.len() == 1 => parts.remove(0),
            kind => Self { kind, ..self },
        }
    }

    fn with_part(mut self, part: ModbusQuery) -> Self {
        self.append(part);
        self
    }

    /// The first address read.
    pub fn start(&self) -> Address {
        self.start
    }

    /// The number of values read.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// The outcome.
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// How long the read took, once executed.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// The fields this query was made for.
    pub fn fields(&self) -> &[FieldId] {
        &self.fields
    }

    /// The queries combined into this one (empty unless merged).
    pub fn parts(&self) -> &[ModbusQuery] {
        match &self.kind {
            QueryKind::Merged(parts) => parts,
            _ => &[],
        }
    }

    /// `true` for a query that only fills the gap between two others.
    pub fn is_hole(&self) -> bool {
        self.kind == QueryKind::Hole
    }

    /// `true` for a query combining other queries.
    pub fn is_merged(&self) -> bool {
        matches!(self.kind, QueryKind::Merged(_))
    }

    pub(crate) fn record(&mut self, status: QueryStatus, duration: Duration) {
        self.status = status;
        self.duration = Some(duration);
    }

    fn end(&self) -> u32 {
        u32::from(self.start.physical()) + u32::from(self.count)
    }

    /// Adds `part` to a merged query, widening it and recording any hole
    /// between the current end and the start of `part`.
    fn append(&mut self, part: ModbusQuery) {
        let end = self.end();
        let part_start = u32::from(part.start.physical());
        let new_end = end.max(part.end());
        let QueryKind::Merged(parts) = &mut self.kind else {
            return;
        };
        if part_start > end {
            if let (Ok(gap), Ok(hole_start)) = (u16::try_from(part_start - end), u16::try_from(end))
            {
                parts.push(ModbusQuery::hole(Address::new(self.start.class(), hole_start), gap));
            }
        }
        for field in &part.fields {
            if !self.fields.contains(field) {
                self.fields.push(field.clone());
            }
        }
        parts.push(part);
        let physical = u32::from(self.start.physical());
        self.count = u16::try_from(new_end - physical).unwrap_or(u16::MAX);
    }
}

impl fmt::Display for ModbusQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModbusQuery {{ {} # {} }}", self.start, self.count)?;
        if self.is_hole() {
            return f.write_str(" (HOLE: No fields!)");
        }
        let fields: Vec<String> = self.fields.iter().map(FieldId::to_string).collect();
        write!(f, " (Fields: {})", fields.join(", "))
    }
}

/// Request size limits and the gap tolerance used while merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchLimits {
    pub max_registers: u16,
    pub max_discretes: u16,
    pub allowed_gap: u16,
}

impl FetchLimits {
    fn max_for(&self, kind: AddressKind) -> u32 {
        u32::from(match kind {
            AddressKind::Register => self.max_registers,
            AddressKind::Discrete => self.max_discretes,
        })
        .max(1)
    }

    fn gap_for(&self, kind: AddressKind) -> u32 {
        match kind {
            AddressKind::Register => u32::from(self.allowed_gap),
            AddressKind::Discrete => u32::from(self.allowed_gap) * 16,
        }
    }
}

/// What one field needs fetched.
#[derive(Debug, Clone)]
pub(crate) struct FieldRequest {
    pub id: FieldId,
    pub fetch_group: Option<String>,
    pub addresses: Vec<Address>,
    pub stale: bool,
}

/// Splits addresses into runs of consecutive addresses of one class, no
/// longer than the request limit.
pub(crate) fn address_runs<'a>(
    addresses: impl IntoIterator<Item = &'a Address>,
    limits: &FetchLimits,
) -> Vec<(Address, u16)> {
    let sorted: BTreeSet<Address> = addresses.into_iter().copied().collect();
    let mut runs: Vec<(Address, u16)> = Vec::new();
    for address in sorted {
        let max = limits.max_for(address.class().kind());
        match runs.last_mut() {
            Some((start, count))
                if start.distance(address) == Some(i32::from(*count))
                    && u32::from(*count) < max =>
            {
                *count += 1;
            }
            _ => runs.push((address, 1)),
        }
    }
    runs
}

/// The smallest queries that refresh every stale request.
///
/// Requests with a fetch group are combined with every other request in the
/// same group, stale or not, so a group is always read as a whole.
pub(crate) fn raw_queries(requests: &[FieldRequest], limits: &FetchLimits) -> Vec<ModbusQuery> {
    let mut groups: BTreeMap<&str, (BTreeSet<Address>, Vec<FieldId>)> = BTreeMap::new();
    let mut queries = Vec::new();
    for request in requests {
        match &request.fetch_group {
            Some(group) => {
                let (addresses, fields) = groups.entry(group.as_str()).or_default();
                addresses.extend(request.addresses.iter().copied());
                if request.stale {
                    fields.push(request.id.clone());
                }
            }
            None if request.stale => {
                for (start, count) in address_runs(&request.addresses, limits) {
                    queries.push(ModbusQuery::new(start, count, vec![request.id.clone()]));
                }
            }
            None => {}
        }
    }
    for (addresses, fields) in groups.values() {
        if fields.is_empty() {
            continue;
        }
        for (start, count) in address_runs(addresses, limits) {
            queries.push(ModbusQuery::new(start, count, fields.clone()));
        }
    }
    queries.sort_by_key(|query| (query.start, query.count));
    queries
}

/// Combines queries that are close enough together into fewer requests.
pub(crate) fn merge_queries(
    mut queries: Vec<ModbusQuery>,
    limits: &FetchLimits,
    read_errors: &BTreeSet<Address>,
) -> Vec<ModbusQuery> {
    if queries.len() <= 1 {
        return queries;
    }
    queries.sort_by_key(|query| (query.start, query.count));

    let mut merged: Vec<ModbusQuery> = Vec::new();
    for query in queries {
        match merged.last_mut() {
            Some(current) if can_absorb(current, &query, limits, read_errors) => {
                current.append(query);
            }
            _ => merged.push(ModbusQuery::merged(query)),
        }
    }
    merged.into_iter().map(ModbusQuery::unwrap_single).collect()
}

fn can_absorb(
    current: &ModbusQuery,
    next: &ModbusQuery,
    limits: &FetchLimits,
    read_errors: &BTreeSet<Address>,
) -> bool {
    let class = current.start.class();
    if next.start.class() != class {
        return false;
    }
    let kind = class.kind();
    let first = u32::from(current.start.physical());
    let end = current.end();
    let next_start = u32::from(next.start.physical());
    let merged_count = end.max(next.end()) - first;
    if merged_count > limits.max_for(kind) {
        return false;
    }
    if next_start <= end {
        return true;
    }
    if next_start - end > limits.gap_for(kind) {
        return false;
    }
    // Reading through a known read error would fail the whole request.
    !read_errors.iter().any(|address| {
        current
            .start
            .distance(*address)
            .is_some_and(|offset| offset >= 0 && u32::try_from(offset).is_ok_and(|o| o < merged_count))
    })
}

/// The queries to try after `failed` (a merged query) returned an error.
///
/// Nothing is retried for a single part. Up to three parts are retried one by
/// one; larger sets are cut into a few smaller merged queries of at most
/// `parts / 2 + 1` parts each, so the broken part is found in a few rounds.
/// Groups of one or two parts are retried as separate queries.
pub(crate) fn retry_queries(failed: &ModbusQuery) -> Vec<ModbusQuery> {
    let parts = failed.parts();
    if parts.len() <= 1 {
        return Vec::new();
    }
    if parts.len() < 4 {
        return parts.to_vec();
    }
    let half = parts.len() / 2;
    let mut groups: Vec<ModbusQuery> = Vec::new();
    for part in parts {
        match groups.last_mut() {
            Some(group) if group.parts().len() <= half => group.append(part.clone()),
            _ => groups.push(ModbusQuery::merged(part.clone())),
        }
    }
    groups
        .into_iter()
        .flat_map(|group| {
            if group.parts().len() > 2 {
                vec![group]
            } else {
                group.parts().to_vec()
            }
        })
        .collect()
}
