//! # Modbus Schema Library
//!
//! Turns the raw registers and discretes of a Modbus device into named, typed
//! values, driven by a schema of small expressions such as
//! `int16(hr:141) / Scale` or `utf8(hr:101 # 13)`.
//!
//! This is a **decoding** library. It does not speak a wire protocol: a
//! transport (TCP, RTU, a test double) is plugged in through the
//! [`ModbusDevice`] trait, and the schema decides what to read and when.
//!
//! ## Features
//!
//! - **Typed addresses** - `hr:00007`, `c:12`, `30001` style notations, ordered and checked
//! - **Expressions** - numeric decoders, strings, enums, bitsets, network addresses, booleans
//! - **Minimal reads** - requests are grouped, merged across small gaps and split on failure
//! - **Caching** - field values are recomputed only when their inputs change
//! - **Self tests** - schemas can carry recorded memory and the values it must decode to
//! - **Schema files** - load and save schemas with their tests as YAML (`serde` feature)
//! - **No panics** - all errors returned as `Result<T, ModbusError>`
//!
//! ## Quick Start
//!
//! ```
//! use modbus_schema::{Address, AddressClass, Block, Field, MockedModbusDevice, SchemaDevice};
//!
//! fn main() -> modbus_schema::Result<()> {
//!     let meter = Block::new("Meter")?
//!         .with_field(Field::new("Voltage", "int16(hr:0) / 10")?.with_unit("V"))?
//!         .with_field(Field::new("Model", "utf8(hr:1 # 2)")?.with_immutable(true))?;
//!
//!     let mut schema = SchemaDevice::builder()
//!         .description("A small meter")
//!         .block(meter)
//!         .build()?;
//!     schema.initialize()?;
//!
//!     // Any ModbusDevice works here; the mock answers from fixed memory.
//!     let first = Address::new(AddressClass::HoldingRegister, 0);
//!     schema.connect(MockedModbusDevice::new().with_registers(first, "0901 4142 4344")?);
//!
//!     schema.need_all();
//!     schema.update(1_000)?;
//!
//!     assert_eq!(schema.double_value("Meter", "Voltage"), Some(230.5));
//!     assert_eq!(schema.string_value("Meter", "Model").as_deref(), Some("ABCD"));
//!     Ok(())
//! }
//! ```
//!
//! ## Address Notation
//!
//! | Class | Prefixes | Legacy range | Kind |
//! |-------|----------|--------------|------|
//! | [`AddressClass::Coil`] | `c:`, `coil:` | `00001`-`09999` | Discrete |
//! | [`AddressClass::DiscreteInput`] | `di:`, `discrete-input:` | `10001`-`19999` | Discrete |
//! | [`AddressClass::InputRegister`] | `ir:`, `input-register:` | `30001`-`39999` | Register |
//! | [`AddressClass::HoldingRegister`] | `hr:`, `holding-register:` | `40001`-`49999` | Register |
//!
//! ## Expressions
//!
//! Expressions are parsed with [`parse`]; the [`expression`] module holds the
//! resulting tree. Fields of the same block can be referenced by name:
//!
//! ```
//! use modbus_schema::parse;
//! use modbus_schema::expression::ReturnType;
//!
//! let expression = parse("ieee754_32(hr:10 # 2) * 1000 / Divider")?;
//! assert_eq!(expression.return_type(), ReturnType::Double);
//! assert_eq!(expression.required_fields(), vec!["Divider".to_string()]);
//! # Ok::<(), modbus_schema::ModbusError>(())
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T, ModbusError>`]. Read failures
//! reported by a device during [`SchemaDevice::update`] do not fail the
//! update; the affected values are marked and evaluate to `None`.
//!
//! ```
//! use modbus_schema::{Address, ModbusError};
//!
//! match Address::parse("hr:70000") {
//!     Ok(address) => println!("{address}"),
//!     Err(ModbusError::InvalidAddress { address, reason }) => {
//!         println!("{address}: {reason}");
//!     }
//!     Err(e) => println!("Error: {e}"),
//! }
//! ```
//!
//! ## Logging
//!
//! The library logs through [`tracing`]: failed reads at `warn`, every read
//! at `debug`, test verification results at `info`/`error`. Install any
//! subscriber to see them.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod address;
mod device;
mod error;
pub mod expression;
mod memory;
mod mock;
mod parser;
mod schema;
pub mod utils;
mod value;

// Public re-exports
pub use address::{Address, AddressClass, AddressKind, MAX_PHYSICAL_ADDRESS};
pub use device::{
    DeviceConfig, ModbusDevice, UnitId, DEFAULT_TIMEOUT, MAX_UNIT_ID,
    MODBUS_MAX_DISCRETES_PER_REQUEST, MODBUS_MAX_REGISTERS_PER_REQUEST, MODBUS_STANDARD_TCP_PORT,
};
pub use error::{ModbusError, Result};
pub use expression::{Expression, FieldValue, Problem, ReturnType};
pub use memory::{DiscreteBlock, ModbusBlock, RegisterBlock, LOADED_VALUE_TIMESTAMP};
pub use mock::MockedModbusDevice;
pub use parser::parse;
pub use schema::{
    Block, Field, FieldId, ModbusQuery, QueryStatus, ScenarioResults, SchemaDevice,
    SchemaDeviceBuilder, TestResult, TestScenario, VerificationReport, DEFAULT_ALLOWED_GAP,
};
#[cfg(feature = "serde")]
pub use schema::CURRENT_SCHEMA_FEATURE_LEVEL;
pub use value::{
    current_time_ms, DiscreteValue, ModbusValue, RawModbusValue, RawValue, ReadErrorState,
    RegisterValue, NEVER_FETCHED, NEVER_VALID_BEFORE, READ_ERROR_TIMESTAMP,
};
