//! Single register and discrete values.
//!
//! A [`ModbusValue`] is one slot of the device memory image: its address, the
//! raw value (if any), when it was fetched, and whether the device failed to
//! deliver it. Registers and discretes share the same container and differ
//! only in the raw type ([`u16`] or [`bool`]).
//!
//! | State | Register | Discrete |
//! |-------|:--------:|:--------:|
//! | Value present | `1A2B` | `1` / `0` |
//! | Soft read error | `xxxx` | `x` |
//! | Hard read error | `XXXX` | `X` |
//! | Absent | `----` | `-` |

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::address::{Address, AddressKind};
use crate::error::{ModbusError, Result};

/// Timestamp of a value that was never fetched.
pub const NEVER_FETCHED: i64 = i64::MIN;

/// Timestamp stored with read-error markers (1888-08-08, epoch ms).
pub const READ_ERROR_TIMESTAMP: i64 = -2_568_642_711_112;

/// Values older than this (1900-01-01, epoch ms) are always refreshed.
pub const NEVER_VALID_BEFORE: i64 = -2_208_988_800_000;

/// Current wall clock time in epoch milliseconds.
pub fn current_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Why a value could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadErrorState {
    /// No read error.
    #[default]
    None,
    /// A combined read failed; retried once the value is explicitly needed again.
    Soft,
    /// The smallest possible read failed; the fetcher stops asking for it.
    Hard,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u16 {}
    impl Sealed for bool {}
}

/// Raw payload of a [`ModbusValue`]: [`u16`] for registers, [`bool`] for discretes.
pub trait RawValue: sealed::Sealed + Copy + PartialEq + fmt::Debug + Send + 'static {
    /// The address kind that holds this payload.
    const KIND: AddressKind;

    /// Name of the block type used in diagnostics.
    const BLOCK_NAME: &'static str;

    /// Text used for a single value in block dumps.
    fn format(value: Option<Self>, read_error: ReadErrorState) -> String;

    /// The payload widened to a word (for change detection).
    fn to_word(self) -> u16;
}

impl RawValue for u16 {
    const KIND: AddressKind = AddressKind::Register;
    const BLOCK_NAME: &'static str = "RegisterBlock";

    fn format(value: Option<Self>, read_error: ReadErrorState) -> String {
        match (value, read_error) {
            (_, ReadErrorState::Soft) => "xxxx".to_string(),
            (_, ReadErrorState::Hard) => "XXXX".to_string(),
            (Some(word), ReadErrorState::None) => format!("{word:04X}"),
            (None, ReadErrorState::None) => "----".to_string(),
        }
    }

    fn to_word(self) -> u16 {
        self
    }
}

impl RawValue for bool {
    const KIND: AddressKind = AddressKind::Discrete;
    const BLOCK_NAME: &'static str = "DiscreteBlock";

    fn format(value: Option<Self>, read_error: ReadErrorState) -> String {
        match (value, read_error) {
            (_, ReadErrorState::Soft) => "x".to_string(),
            (_, ReadErrorState::Hard) => "X".to_string(),
            (Some(true), ReadErrorState::None) => "1".to_string(),
            (Some(false), ReadErrorState::None) => "0".to_string(),
            (None, ReadErrorState::None) => "-".to_string(),
        }
    }

    fn to_word(self) -> u16 {
        u16::from(self)
    }
}

/// One register or discrete slot of the memory image.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusValue<T: RawValue> {
    address: Address,
    value: Option<T>,
    timestamp: i64,
    read_error: ReadErrorState,
    /// Once present the value never goes stale.
    pub immutable: bool,
    /// Free text attached by loaders or tooling.
    pub comment: Option<String>,
    /// The fetch group this value is read with.
    pub fetch_group: Option<String>,
}

/// A 16 bit register value.
pub type RegisterValue = ModbusValue<u16>;

/// A single bit discrete value.
pub type DiscreteValue = ModbusValue<bool>;

impl<T: RawValue> ModbusValue<T> {
    /// Creates an empty value (never fetched, no error).
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::IllegalAddressClass` when the address class does
    /// not hold this kind of value (for example a coil as a register).
    ///
    /// # Example
    ///
    /// ```
    /// use modbus_schema::{Address, AddressClass, RegisterValue};
    ///
    /// let value = RegisterValue::new(Address::new(AddressClass::HoldingRegister, 0))?;
    /// assert!(value.value().is_none());
    /// assert!(RegisterValue::new(Address::new(AddressClass::Coil, 0)).is_err());
    /// # Ok::<(), modbus_schema::ModbusError>(())
    /// ```
    pub fn new(address: Address) -> Result<Self> {
        if address.class().kind() != T::KIND {
            return Err(ModbusError::illegal_address_class(address.class(), T::KIND));
        }
        Ok(Self::placeholder(address))
    }

    /// Creates a value holding `value` fetched at `timestamp`.
    ///
    /// # Errors
    ///
    /// Same as [`ModbusValue::new`].
    pub fn with_value(address: Address, value: T, timestamp: i64) -> Result<Self> {
        let mut result = Self::new(address)?;
        result.set_value(value, timestamp);
        Ok(result)
    }

    /// Unchecked constructor for callers that already validated the class.
    pub(crate) fn placeholder(address: Address) -> Self {
        Self {
            address,
            value: None,
            timestamp: NEVER_FETCHED,
            read_error: ReadErrorState::None,
            immutable: false,
            comment: None,
            fetch_group: None,
        }
    }

    /// The address of this slot.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The raw value, if present.
    pub fn value(&self) -> Option<T> {
        self.value
    }

    /// When the value was fetched (epoch ms), or one of the sentinels.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The read-error state.
    pub fn read_error(&self) -> ReadErrorState {
        self.read_error
    }

    /// Stores a freshly fetched value and clears any read error.
    pub fn set_value(&mut self, value: T, timestamp: i64) {
        self.value = Some(value);
        self.timestamp = timestamp;
        self.read_error = ReadErrorState::None;
    }

    /// Drops the value without marking an error.
    pub fn clear(&mut self) {
        self.value = None;
        self.timestamp = NEVER_FETCHED;
        self.read_error = ReadErrorState::None;
    }

    /// Marks the value as a soft read error.
    pub fn set_soft_read_error(&mut self) {
        self.mark_read_error(ReadErrorState::Soft);
    }

    /// Marks the value as a hard read error.
    pub fn set_hard_read_error(&mut self) {
        self.mark_read_error(ReadErrorState::Hard);
    }

    fn mark_read_error(&mut self, state: ReadErrorState) {
        self.value = None;
        self.timestamp = READ_ERROR_TIMESTAMP;
        self.read_error = state;
    }

    /// Returns `true` for both soft and hard read errors.
    pub fn is_read_error(&self) -> bool {
        self.read_error != ReadErrorState::None
    }

    /// Forgets a soft read error so the value is fetched again.
    pub fn clear_soft_read_error(&mut self) {
        if self.read_error == ReadErrorState::Soft {
            self.clear();
        }
    }

    /// Whether this value must be fetched again.
    ///
    /// Read errors are never refreshed automatically; absent values always
    /// are; immutable values never are once present; values older than 1900
    /// always are; anything else when it is older than `max_age_ms`.
    pub fn needs_to_be_updated(&self, now_ms: i64, max_age_ms: i64) -> bool {
        if self.is_read_error() {
            return false;
        }
        if self.value.is_none() {
            return true;
        }
        if self.immutable {
            return false;
        }
        if self.timestamp < NEVER_VALID_BEFORE {
            return true;
        }
        now_ms.saturating_sub(self.timestamp) > max_age_ms
    }

    /// Whether `self` should replace `existing` when two blocks are merged.
    ///
    /// Read-error markers always apply; otherwise the newer timestamp wins.
    pub(crate) fn supersedes(&self, existing: &Self) -> bool {
        self.is_read_error() || existing.value.is_none() || self.timestamp >= existing.timestamp
    }

    /// Compact text form (`1A2B`, `xxxx`, `XXXX`, `----` for registers).
    pub fn to_hex_string(&self) -> String {
        T::format(self.value, self.read_error)
    }
}

impl<T: RawValue> fmt::Display for ModbusValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.address, self.to_hex_string())
    }
}

/// A register or discrete value read by an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum RawModbusValue {
    /// A register value.
    Register(RegisterValue),
    /// A discrete value.
    Discrete(DiscreteValue),
}

impl RawModbusValue {
    /// The address of the underlying value.
    pub fn address(&self) -> Address {
        match self {
            RawModbusValue::Register(value) => value.address(),
            RawModbusValue::Discrete(value) => value.address(),
        }
    }
}

impl fmt::Display for RawModbusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawModbusValue::Register(value) => value.fmt(f),
            RawModbusValue::Discrete(value) => value.fmt(f),
        }
    }
}
