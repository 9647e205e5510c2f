//! Schema devices: named fields decoded from the memory of a Modbus device.
//!
//! A [`SchemaDevice`] holds [`Block`]s of [`Field`]s, each computed by an
//! expression over device addresses and other fields. It keeps a copy of the
//! device memory and only reads what the needed fields require.
//!
//! # Lifecycle
//!
//! | Step | Method |
//! |------|--------|
//! | Describe | [`SchemaDevice::builder`], [`Block`], [`Field`] |
//! | Parse and bind | [`SchemaDevice::initialize`] |
//! | Attach a transport | [`SchemaDevice::connect`] |
//! | Choose fields | [`SchemaDevice::need`], [`SchemaDevice::need_all`] |
//! | Refresh | [`SchemaDevice::update`] |
//! | Read | [`SchemaDevice::value`] and the typed accessors |
//! | Release | [`SchemaDevice::close`] |
//!
//! # Example
//!
//! ```
//! use modbus_schema::{Address, AddressClass, Block, Field, MockedModbusDevice, SchemaDevice};
//!
//! let block = Block::new("Meter")?
//!     .with_field(Field::new("Name", "utf8(hr:0#2)")?)?
//!     .with_field(Field::new("Power", "int16(hr:2) * Scale")?.with_unit("W"))?
//!     .with_field(Field::new("Scale", "10")?)?;
//! let mut schema = SchemaDevice::builder().description("Demo meter").block(block).build()?;
//! assert!(schema.initialize()?);
//!
//! let first = Address::new(AddressClass::HoldingRegister, 0);
//! schema.connect(MockedModbusDevice::new().with_registers(first, "4142 4344 0017")?);
//! schema.need_all();
//! schema.update(0)?;
//!
//! assert_eq!(schema.string_value("Meter", "Name").as_deref(), Some("ABCD"));
//! assert_eq!(schema.long_value("Meter", "Power"), Some(230));
//! # Ok::<(), modbus_schema::ModbusError>(())
//! ```

mod block;
mod fetcher;
mod field;
mod image;
mod scenario;
#[cfg(feature = "serde")]
mod yaml;

pub use block::Block;
pub use fetcher::{FieldId, ModbusQuery, QueryStatus};
pub use field::Field;
pub use scenario::{ScenarioResults, TestResult, TestScenario, VerificationReport};
#[cfg(feature = "serde")]
pub use yaml::CURRENT_SCHEMA_FEATURE_LEVEL;

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, warn};

use crate::address::{Address, AddressClass, AddressKind};
use crate::device::{check_limit, ModbusDevice, MODBUS_MAX_REGISTERS_PER_REQUEST};
use crate::error::{ModbusError, Result};
use crate::expression::{EvaluationContext, FieldValue, Problem};
use crate::memory::{DiscreteBlock, RegisterBlock};
use crate::utils::StringTable;
use crate::value::{current_time_ms, DiscreteValue, RegisterValue};

use fetcher::{merge_queries, raw_queries, retry_queries, FetchLimits, FieldRequest};
use image::MemoryImage;

/// Registers that may be read needlessly to join two reads, unless
/// configured otherwise.
pub const DEFAULT_ALLOWED_GAP: u16 = 0;

/// Block index and field index.
type FieldPos = (usize, usize);

#[derive(Debug)]
struct CachedValue {
    fingerprint: u64,
    value: Option<FieldValue>,
}

struct RuntimeState {
    memory: MemoryImage,
    device: Option<Box<dyn ModbusDevice + Send>>,
    limits: FetchLimits,
    needed: HashMap<FieldPos, usize>,
    cache: HashMap<FieldPos, CachedValue>,
}

/// What expressions see while a field is evaluated: the memory image plus
/// the values of the fields it refers to.
struct FieldContext<'a> {
    memory: &'a MemoryImage,
    fields: &'a HashMap<String, Option<FieldValue>>,
}

impl EvaluationContext for FieldContext<'_> {
    fn register(&self, address: Address) -> Option<&RegisterValue> {
        self.memory.register(address)
    }

    fn discrete(&self, address: Address) -> Option<&DiscreteValue> {
        self.memory.discrete(address)
    }

    fn field_value(&self, name: &str) -> Option<FieldValue> {
        self.fields.get(name).cloned().flatten()
    }
}

/// Builder for [`SchemaDevice`].
#[derive(Debug, Default)]
pub struct SchemaDeviceBuilder {
    description: String,
    max_registers_per_request: Option<u16>,
    allowed_gap: u16,
    blocks: Vec<Block>,
    scenarios: Vec<TestScenario>,
}

impl SchemaDeviceBuilder {
    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Limits every register read, for devices that cannot handle the
    /// protocol maximum of 125.
    pub fn max_registers_per_request(mut self, max: u16) -> Self {
        self.max_registers_per_request = Some(max);
        self
    }

    /// How many unneeded registers may be read to join two reads into one.
    pub fn allowed_gap(mut self, allowed_gap: u16) -> Self {
        self.allowed_gap = allowed_gap;
        self
    }

    /// Adds a block.
    pub fn block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    /// Adds a test scenario.
    pub fn test_scenario(mut self, scenario: TestScenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    /// Builds the (not yet initialized) schema device.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidParameter` for a request size outside
    /// 1..=125 or a gap larger than the request size, and
    /// `ModbusError::Schema` for duplicate block ids.
    pub fn build(self) -> Result<SchemaDevice> {
        let max_registers = check_limit(
            "max_registers_per_request",
            self.max_registers_per_request
                .unwrap_or(MODBUS_MAX_REGISTERS_PER_REQUEST),
            MODBUS_MAX_REGISTERS_PER_REQUEST,
        )?;
        if self.allowed_gap >= max_registers {
            return Err(ModbusError::invalid_parameter(
                "allowed_gap",
                format!(
                    "{} must be smaller than the request size {max_registers}",
                    self.allowed_gap
                ),
            ));
        }
        let mut device = SchemaDevice::new(self.description);
        device.max_registers_per_request = max_registers;
        device.allowed_gap = self.allowed_gap;
        for block in self.blocks {
            device.add_block(block)?;
        }
        for scenario in self.scenarios {
            device.add_test_scenario(scenario);
        }
        Ok(device)
    }
}

/// A device described by a schema.
///
/// All mutable state (memory image, transport, needed fields, cached
/// values) sits behind one lock, so a `SchemaDevice` can be shared between
/// threads and only one update runs at a time.
pub struct SchemaDevice {
    description: String,
    blocks: Vec<Block>,
    block_index: HashMap<String, usize>,
    scenarios: Vec<TestScenario>,
    max_registers_per_request: u16,
    allowed_gap: u16,
    initialized: bool,
    immutable_addresses: BTreeSet<Address>,
    state: Mutex<RuntimeState>,
}

impl SchemaDevice {
    /// Creates an empty schema device with default limits.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            blocks: Vec::new(),
            block_index: HashMap::new(),
            scenarios: Vec::new(),
            max_registers_per_request: MODBUS_MAX_REGISTERS_PER_REQUEST,
            allowed_gap: DEFAULT_ALLOWED_GAP,
            initialized: false,
            immutable_addresses: BTreeSet::new(),
            state: Mutex::new(RuntimeState {
                memory: MemoryImage::default(),
                device: None,
                limits: FetchLimits {
                    max_registers: MODBUS_MAX_REGISTERS_PER_REQUEST,
                    max_discretes: crate::device::MODBUS_MAX_DISCRETES_PER_REQUEST,
                    allowed_gap: DEFAULT_ALLOWED_GAP,
                },
                needed: HashMap::new(),
                cache: HashMap::new(),
            }),
        }
    }

    /// Starts a builder.
    pub fn builder() -> SchemaDeviceBuilder {
        SchemaDeviceBuilder::default()
    }

    /// The description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The blocks in the order they were added.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The block with this id.
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(*self.block_index.get(id)?)
    }

    /// The field `field` of block `block`.
    pub fn field(&self, block: &str, field: &str) -> Option<&Field> {
        self.block(block)?.field(field)
    }

    /// The configured register request limit.
    pub fn max_registers_per_request(&self) -> u16 {
        self.max_registers_per_request
    }

    /// The configured gap tolerance.
    pub fn allowed_gap(&self) -> u16 {
        self.allowed_gap
    }

    /// `true` once [`SchemaDevice::initialize`] succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The test scenarios.
    pub fn test_scenarios(&self) -> &[TestScenario] {
        &self.scenarios
    }

    /// Adds a block. The schema must be initialized again afterwards.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Schema` for a duplicate block id.
    pub fn add_block(&mut self, block: Block) -> Result<()> {
        if self.block_index.contains_key(block.id()) {
            return Err(ModbusError::schema(format!(
                "The schema already has a block {}",
                block.id()
            )));
        }
        self.block_index.insert(block.id().to_string(), self.blocks.len());
        self.blocks.push(block);
        self.initialized = false;
        Ok(())
    }

    /// Adds a test scenario.
    pub fn add_test_scenario(&mut self, scenario: TestScenario) {
        self.scenarios.push(scenario);
    }

    /// Parses and binds every field.
    ///
    /// Returns `Ok(false)` when an expression has a fatal problem; see
    /// [`SchemaDevice::initialization_problems`].
    ///
    /// # Errors
    ///
    /// Fails on the first expression that does not parse, on circular field
    /// references and on fetch groups whose addresses have gaps.
    pub fn initialize(&mut self) -> Result<bool> {
        self.initialized = false;
        for block in &mut self.blocks {
            block.initialize()?;
        }
        self.check_fetch_groups()?;
        self.immutable_addresses = self.find_immutable_addresses();
        self.initialized = true;

        let mut state = self.lock();
        self.reset_memory(&mut state)?;
        drop(state);

        let problems = self.initialization_problems();
        for (field, problem) in &problems {
            warn!(field = %field, "{problem}");
        }
        Ok(!problems.iter().any(|(_, problem)| problem.is_fatal()))
    }

    /// Every problem of every field.
    pub fn initialization_problems(&self) -> Vec<(FieldId, Problem)> {
        self.blocks
            .iter()
            .flat_map(|block| {
                block.fields().iter().flat_map(move |field| {
                    field
                        .problems()
                        .into_iter()
                        .map(move |problem| (FieldId::new(block.id(), field.id()), problem))
                })
            })
            .collect()
    }

    /// [`SchemaDevice::initialize`] followed by
    /// [`SchemaDevice::verify_provided_tests`]; `Ok(true)` only if both
    /// are clean.
    ///
    /// # Errors
    ///
    /// See [`SchemaDevice::initialize`] and
    /// [`SchemaDevice::verify_provided_tests`].
    pub fn initialize_and_verify(&mut self) -> Result<bool> {
        if !self.initialize()? {
            return Ok(false);
        }
        Ok(self.verify_provided_tests()?.log_results())
    }

    fn check_fetch_groups(&self) -> Result<()> {
        let mut groups: BTreeMap<&str, BTreeSet<Address>> = BTreeMap::new();
        for block in &self.blocks {
            for field in block.fields() {
                if let Some(group) = field.fetch_group() {
                    groups
                        .entry(group)
                        .or_default()
                        .extend(field.required_addresses());
                }
            }
        }
        for (group, addresses) in groups {
            let (Some(first), Some(last)) = (addresses.first(), addresses.last()) else {
                continue;
            };
            let contiguous = first
                .distance(*last)
                .is_some_and(|span| usize::try_from(span).is_ok_and(|span| span + 1 == addresses.len()));
            if !contiguous {
                let list: Vec<String> = addresses.iter().map(Address::to_string).collect();
                return Err(ModbusError::schema(format!(
                    "There are gaps in the addresses for fetch group \"{group}\": [{}]",
                    list.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Addresses used only by immutable fields.
    fn find_immutable_addresses(&self) -> BTreeSet<Address> {
        let mut usage: BTreeMap<Address, bool> = BTreeMap::new();
        for block in &self.blocks {
            for field in block.fields() {
                let immutable = field.is_immutable();
                for address in field.required_addresses() {
                    *usage.entry(address).or_insert(true) &= immutable;
                }
            }
        }
        usage
            .into_iter()
            .filter_map(|(address, immutable)| immutable.then_some(address))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset_memory(&self, state: &mut RuntimeState) -> Result<()> {
        state.memory.clear();
        state.cache.clear();
        for address in &self.immutable_addresses {
            state.memory.set_immutable(*address, true)?;
        }
        Ok(())
    }

    fn position(&self, block: &str, field: &str) -> Result<FieldPos> {
        let block_pos = self
            .block_index
            .get(block)
            .copied()
            .ok_or_else(|| ModbusError::schema(format!("No block {block}")))?;
        let field_pos = self.blocks[block_pos]
            .position(field)
            .ok_or_else(|| ModbusError::schema(format!("No field {block}[{field}]")))?;
        Ok((block_pos, field_pos))
    }

    fn field_at(&self, (block, field): FieldPos) -> &Field {
        &self.blocks[block].fields()[field]
    }

    fn all_positions(&self) -> Vec<FieldPos> {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(b, block)| (0..block.fields().len()).map(move |f| (b, f)))
            .collect()
    }

    /// `pos` and every field it depends on, directly or not.
    fn with_dependencies(&self, pos: FieldPos, out: &mut BTreeSet<FieldPos>) {
        if !out.insert(pos) {
            return;
        }
        for dependency in self.blocks[pos.0].dependencies(pos.1) {
            self.with_dependencies((pos.0, dependency), out);
        }
    }

    // ------------------------------------------------------------------
    // Transport

    /// Attaches a transport. The memory image is cleared and the request
    /// limit becomes the smaller of the schema and device limits.
    pub fn connect<D>(&self, device: D)
    where
        D: ModbusDevice + Send + 'static,
    {
        let config = device.config().clone();
        let mut state = self.lock();
        state.limits = FetchLimits {
            max_registers: self
                .max_registers_per_request
                .min(config.max_per_request(AddressKind::Register)),
            max_discretes: config.max_per_request(AddressKind::Discrete),
            allowed_gap: self.allowed_gap,
        };
        state.device = Some(Box::new(device));
        if let Err(error) = self.reset_memory(&mut state) {
            warn!(%error, "could not mark immutable addresses");
        }
    }

    /// Detaches and closes the transport.
    ///
    /// # Errors
    ///
    /// Whatever the transport reports while closing.
    pub fn close(&self) -> Result<()> {
        let device = self.lock().device.take();
        match device {
            Some(mut device) => device.close(),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Needed fields

    /// Keeps `field` (and the fields it uses) up to date in
    /// [`SchemaDevice::update`]. Soft read errors on its addresses are
    /// cleared so they are tried again.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Schema` for an unknown field.
    pub fn need(&self, block: &str, field: &str) -> Result<()> {
        let pos = self.position(block, field)?;
        self.need_at(&mut self.lock(), pos);
        Ok(())
    }

    /// Reverts one [`SchemaDevice::need`].
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Schema` for an unknown field.
    pub fn un_need(&self, block: &str, field: &str) -> Result<()> {
        let pos = self.position(block, field)?;
        self.un_need_at(&mut self.lock(), pos);
        Ok(())
    }

    /// Needs every field.
    pub fn need_all(&self) {
        let mut state = self.lock();
        for pos in self.all_positions() {
            self.need_at(&mut state, pos);
        }
    }

    /// Reverts [`SchemaDevice::need_all`].
    pub fn un_need_all(&self) {
        let mut state = self.lock();
        for pos in self.all_positions() {
            self.un_need_at(&mut state, pos);
        }
    }

    /// The fields currently needed.
    pub fn needed_fields(&self) -> Vec<FieldId> {
        let state = self.lock();
        let mut needed: Vec<FieldPos> = state.needed.keys().copied().collect();
        needed.sort_unstable();
        needed.into_iter().map(|pos| self.field_id(pos)).collect()
    }

    fn field_id(&self, pos: FieldPos) -> FieldId {
        FieldId::new(self.blocks[pos.0].id(), self.field_at(pos).id())
    }

    fn need_at(&self, state: &mut RuntimeState, pos: FieldPos) {
        *state.needed.entry(pos).or_insert(0) += 1;
        for address in self.field_at(pos).required_addresses() {
            state.memory.clear_soft_read_error(address);
        }
        for dependency in self.blocks[pos.0].dependencies(pos.1) {
            self.need_at(state, (pos.0, dependency));
        }
    }

    fn un_need_at(&self, state: &mut RuntimeState, pos: FieldPos) {
        if let Entry::Occupied(mut entry) = state.needed.entry(pos) {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
        for dependency in self.blocks[pos.0].dependencies(pos.1) {
            self.un_need_at(state, (pos.0, dependency));
        }
    }

    // ------------------------------------------------------------------
    // Fetching

    /// Reads every needed field whose inputs are older than `max_age_ms`
    /// (or absent) and returns the reads that were made.
    ///
    /// Devices reporting a read error do not fail the update: the values are
    /// marked and evaluate as absent.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Schema` before initialization or without a
    /// device, and transport errors that are not read failures.
    pub fn update(&self, max_age_ms: i64) -> Result<Vec<ModbusQuery>> {
        let mut state = self.lock();
        let targets: BTreeSet<FieldPos> = state.needed.keys().copied().collect();
        self.fetch(&mut state, &targets, max_age_ms)
    }

    /// Reads the inputs of one field (and the fields it uses) now.
    ///
    /// # Errors
    ///
    /// As [`SchemaDevice::update`], and for an unknown field.
    pub fn update_field(&self, block: &str, field: &str) -> Result<Vec<ModbusQuery>> {
        let mut targets = BTreeSet::new();
        self.with_dependencies(self.position(block, field)?, &mut targets);
        self.fetch(&mut self.lock(), &targets, 0)
    }

    /// Needs all fields, updates, and un-needs them again.
    ///
    /// # Errors
    ///
    /// As [`SchemaDevice::update`].
    pub fn update_all(&self, max_age_ms: i64) -> Result<Vec<ModbusQuery>> {
        self.need_all();
        let result = self.update(max_age_ms);
        self.un_need_all();
        result
    }

    /// Reads every immutable field that has not been read yet.
    ///
    /// # Errors
    ///
    /// As [`SchemaDevice::update`].
    pub fn resolve_all_immutable_fields(&self) -> Result<Vec<ModbusQuery>> {
        let mut targets = BTreeSet::new();
        for pos in self.all_positions() {
            if self.field_at(pos).is_immutable() {
                self.with_dependencies(pos, &mut targets);
            }
        }
        self.fetch(&mut self.lock(), &targets, i64::MAX)
    }

    fn fetch(
        &self,
        state: &mut RuntimeState,
        targets: &BTreeSet<FieldPos>,
        max_age_ms: i64,
    ) -> Result<Vec<ModbusQuery>> {
        if !self.initialized {
            return Err(ModbusError::schema("The schema has not been initialized"));
        }
        if state.device.is_none() {
            return Err(ModbusError::schema("No Modbus device is connected"));
        }

        let now = current_time_ms();
        let mut requests = Vec::new();
        for pos in self.all_positions() {
            let field = self.field_at(pos);
            let wanted = targets.contains(&pos);
            if !wanted && field.fetch_group().is_none() {
                continue;
            }
            let addresses = field.required_addresses();
            let stale = wanted
                && addresses
                    .iter()
                    .any(|address| state.memory.needs_update(*address, now, max_age_ms));
            requests.push(FieldRequest {
                id: self.field_id(pos),
                fetch_group: field.fetch_group().map(str::to_string),
                addresses,
                stale,
            });
        }

        let limits = state.limits;
        let read_errors: BTreeSet<Address> = AddressClass::ALL
            .iter()
            .flat_map(|class| state.memory.read_error_addresses(*class))
            .collect();
        let queries: Vec<ModbusQuery> = raw_queries(&requests, &limits)
            .into_iter()
            .filter(|query| !touches(query, &read_errors))
            .collect();

        let mut executed = Vec::new();
        for query in merge_queries(queries, &limits, &read_errors) {
            self.run_query(state, query, &mut executed)?;
        }
        Ok(executed)
    }

    fn run_query(
        &self,
        state: &mut RuntimeState,
        mut query: ModbusQuery,
        executed: &mut Vec<ModbusQuery>,
    ) -> Result<()> {
        let started = Instant::now();
        let success = match read_range(state, query.start(), query.count()) {
            Ok(success) => success,
            Err(error) if error.is_read_failure() => {
                warn!(query = %query, %error, "read failed");
                false
            }
            Err(error) => return Err(error),
        };
        let elapsed = started.elapsed();

        if success {
            query.record(QueryStatus::Success, elapsed);
            debug!(query = %query, ?elapsed, "fetched");
            executed.push(query);
            return Ok(());
        }

        query.record(QueryStatus::Error, elapsed);
        warn!(query = %query, "read error");
        if query.is_hole() {
            mark_read_errors(state, query.start(), query.count(), false)?;
            executed.push(query);
            return Ok(());
        }
        let retries = retry_queries(&query);
        if retries.is_empty() {
            mark_read_errors(state, query.start(), query.count(), true)?;
        }
        executed.push(query);
        for retry in retries {
            self.run_query(state, retry, executed)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Values

    fn evaluate(&self, state: &mut RuntimeState, pos: FieldPos) -> (Option<FieldValue>, u64) {
        let block = &self.blocks[pos.0];
        let Some(expression) = self.field_at(pos).expression() else {
            return (None, 0);
        };

        let mut hasher = DefaultHasher::new();
        let mut inputs: HashMap<String, Option<FieldValue>> = HashMap::new();
        for name in expression.required_fields() {
            if let Some(dependency) = block.position(&name) {
                let (value, fingerprint) = self.evaluate(state, (pos.0, dependency));
                fingerprint.hash(&mut hasher);
                inputs.insert(name, value);
            }
        }
        for address in expression.required_addresses() {
            address.hash(&mut hasher);
            state.memory.slot(address).hash(&mut hasher);
        }
        let fingerprint = hasher.finish();

        if let Some(cached) = state.cache.get(&pos) {
            if cached.fingerprint == fingerprint {
                return (cached.value.clone(), fingerprint);
            }
        }
        let context = FieldContext {
            memory: &state.memory,
            fields: &inputs,
        };
        let value = expression.evaluate(&context);
        state.cache.insert(
            pos,
            CachedValue {
                fingerprint,
                value: value.clone(),
            },
        );
        (value, fingerprint)
    }

    /// The current value of a field; `None` when unknown, not read yet or
    /// unreadable.
    pub fn value(&self, block: &str, field: &str) -> Option<FieldValue> {
        let pos = self.position(block, field).ok()?;
        self.evaluate(&mut self.lock(), pos).0
    }

    /// The value of an integer field.
    pub fn long_value(&self, block: &str, field: &str) -> Option<i64> {
        self.value(block, field)?.as_long()
    }

    /// The value of a numeric field as a double.
    pub fn double_value(&self, block: &str, field: &str) -> Option<f64> {
        self.value(block, field)?.as_double()
    }

    /// The value of a string field.
    pub fn string_value(&self, block: &str, field: &str) -> Option<String> {
        match self.value(block, field)? {
            FieldValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// The value of a string list field.
    pub fn string_list_value(&self, block: &str, field: &str) -> Option<Vec<String>> {
        match self.value(block, field)? {
            FieldValue::StringList(value) => Some(value),
            _ => None,
        }
    }

    /// The value of a boolean field.
    pub fn boolean_value(&self, block: &str, field: &str) -> Option<bool> {
        self.value(block, field)?.as_bool()
    }

    /// The timestamp (epoch ms) of the oldest mutable input of a field.
    pub fn value_epoch_ms(&self, block: &str, field: &str) -> Option<i64> {
        let pos = self.position(block, field).ok()?;
        let state = self.lock();
        self.field_at(pos)
            .required_addresses()
            .into_iter()
            .map(|address| state.memory.slot(address))
            .filter(|slot| !slot.immutable)
            .filter_map(|slot| slot.timestamp)
            .min()
    }

    /// The inputs of a field that are marked as read errors.
    pub fn used_read_error_addresses(&self, block: &str, field: &str) -> Vec<Address> {
        let Ok(pos) = self.position(block, field) else {
            return Vec::new();
        };
        let state = self.lock();
        self.field_at(pos)
            .required_addresses()
            .into_iter()
            .filter(|address| state.memory.is_read_error(*address))
            .collect()
    }

    /// The value of a field in the text form used by test scenarios.
    pub fn test_compare_value(&self, block: &str, field: &str) -> Vec<String> {
        compare_strings(self.value(block, field))
    }

    // ------------------------------------------------------------------
    // Test scenarios

    /// Runs every test scenario against a clean memory image. The memory
    /// image is empty afterwards.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Schema` when a scenario expects a value for a
    /// field that does not exist.
    pub fn verify_provided_tests(&self) -> Result<VerificationReport> {
        let mut state = self.lock();
        let report = self.run_scenarios(&mut state);
        self.reset_memory(&mut state)?;
        report
    }

    fn run_scenarios(&self, state: &mut RuntimeState) -> Result<VerificationReport> {
        let mut report = VerificationReport::default();
        for scenario in &self.scenarios {
            self.reset_memory(state)?;
            for block in scenario.registers() {
                state.memory.merge_registers(block)?;
            }
            for block in scenario.discretes() {
                state.memory.merge_discretes(block)?;
            }

            let mut results = ScenarioResults {
                name: scenario.name().to_string(),
                ..ScenarioResults::default()
            };
            for (block, fields) in scenario.expected() {
                for (field, expected) in fields {
                    let pos = self.position(block, field).map_err(|_| {
                        ModbusError::schema(format!(
                            "Test {} expects a value for {block}[{field}] which does not exist",
                            scenario.name()
                        ))
                    })?;
                    let actual = compare_strings(self.evaluate(state, pos).0);
                    results
                        .results
                        .entry(block.clone())
                        .or_default()
                        .insert(field.clone(), TestResult::new(expected.clone(), actual));
                }
            }
            report.scenarios.push(results);
        }
        Ok(report)
    }

    /// Records the current memory image and the values of all non-system
    /// fields as a test scenario.
    pub fn snapshot_scenario(&self, name: impl Into<String>) -> TestScenario {
        let mut state = self.lock();
        let mut scenario = TestScenario::new(name);
        for block in state.memory.register_blocks() {
            scenario.add_register_block(block.clone());
        }
        for block in state.memory.discrete_blocks() {
            scenario.add_discrete_block(block.clone());
        }
        for pos in self.all_positions() {
            let field = self.field_at(pos);
            if field.is_system() {
                continue;
            }
            let values = compare_strings(self.evaluate(&mut state, pos).0);
            scenario.set_expected(self.blocks[pos.0].id(), field.id(), values);
        }
        scenario
    }
}

fn touches(query: &ModbusQuery, read_errors: &BTreeSet<Address>) -> bool {
    let start = query.start();
    let last = Address::new(
        start.class(),
        start
            .physical()
            .saturating_add(query.count().saturating_sub(1)),
    );
    read_errors.range(start..=last).next().is_some()
}

/// Reads a range into the memory image; `Ok(false)` when the device
/// answered with read errors.
fn read_range(state: &mut RuntimeState, first: Address, count: u16) -> Result<bool> {
    let device = state
        .device
        .as_mut()
        .ok_or_else(|| ModbusError::schema("No Modbus device is connected"))?;
    match first.class().kind() {
        AddressKind::Register => {
            let block = device.get_registers(first, count)?;
            if block.values().any(RegisterValue::is_read_error) {
                return Ok(false);
            }
            state.memory.merge_registers(&block)?;
        }
        AddressKind::Discrete => {
            let block = device.get_discretes(first, count)?;
            if block.values().any(DiscreteValue::is_read_error) {
                return Ok(false);
            }
            state.memory.merge_discretes(&block)?;
        }
    }
    Ok(true)
}

fn mark_read_errors(state: &mut RuntimeState, first: Address, count: u16, hard: bool) -> Result<()> {
    match first.class().kind() {
        AddressKind::Register => {
            let mut block = RegisterBlock::read_error(first, count)?;
            if hard {
                block.set_hard_read_errors();
            }
            state.memory.merge_registers(&block)
        }
        AddressKind::Discrete => {
            let mut block = DiscreteBlock::read_error(first, count)?;
            if hard {
                block.set_hard_read_errors();
            }
            state.memory.merge_discretes(&block)
        }
    }
}

/// `%.3f` for doubles, with `NaN`, `+Infinite` and `-Infinite`.
fn compare_strings(value: Option<FieldValue>) -> Vec<String> {
    match value {
        None => Vec::new(),
        Some(FieldValue::Boolean(value)) => vec![value.to_string()],
        Some(FieldValue::Long(value)) => vec![value.to_string()],
        Some(FieldValue::Double(value)) => vec![if value.is_nan() {
            "NaN".to_string()
        } else if value == f64::INFINITY {
            "+Infinite".to_string()
        } else if value == f64::NEG_INFINITY {
            "-Infinite".to_string()
        } else {
            format!("{value:.3}")
        }],
        Some(FieldValue::String(value)) => vec![value],
        Some(FieldValue::StringList(values)) => values,
    }
}

impl fmt::Debug for SchemaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaDevice")
            .field("description", &self.description)
            .field("blocks", &self.blocks)
            .field("max_registers_per_request", &self.max_registers_per_request)
            .field("allowed_gap", &self.allowed_gap)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for SchemaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut table = StringTable::new(["Block", "Field", "Value", "Unit"]);
        let mut state = self.lock();
        for pos in self.all_positions() {
            let field = self.field_at(pos);
            if field.is_system() {
                continue;
            }
            let value = self
                .evaluate(&mut state, pos)
                .0
                .map(|value| value.to_string())
                .unwrap_or_default();
            table.add_row([
                self.blocks[pos.0].id(),
                field.id(),
                value.as_str(),
                field.unit(),
            ]);
        }
        drop(state);
        writeln!(f, "{}", self.description)?;
        write!(f, "{table}")
    }
}
