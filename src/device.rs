//! The transport seam between the schema layer and a real device.
//!
//! A [`ModbusDevice`] turns "give me `count` values starting at this address"
//! into a [`RegisterBlock`] or [`DiscreteBlock`]. Wire protocols live in the
//! implementations; the schema layer only plans requests and merges blocks.
//!
//! # Constants
//!
//! - [`MODBUS_MAX_REGISTERS_PER_REQUEST`] - Protocol limit for one register read (125)
//! - [`MODBUS_MAX_DISCRETES_PER_REQUEST`] - Protocol limit for one discrete read (2000)
//! - [`MODBUS_STANDARD_TCP_PORT`] - Standard Modbus TCP port (502)
//! - [`MAX_UNIT_ID`] - Highest valid unit identifier (247)
//! - [`DEFAULT_TIMEOUT`] - Default request timeout (2 seconds)
//!
//! # Implementing a transport
//!
//! A request the device answers with a protocol exception should come back as
//! [`RegisterBlock::read_error`], not as an `Err`. Errors are for failures the
//! adapter cannot map; of those, [`ModbusError::is_read_failure`] ones are
//! still turned into read-error markers by the fetcher.

use std::fmt;
use std::time::Duration;

use crate::address::{Address, AddressKind};
use crate::error::{ModbusError, Result};
use crate::memory::{DiscreteBlock, RegisterBlock};

/// Maximum number of registers the protocol allows in one read.
pub const MODBUS_MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of discretes the protocol allows in one read.
pub const MODBUS_MAX_DISCRETES_PER_REQUEST: u16 = 2000;

/// Standard Modbus TCP port.
pub const MODBUS_STANDARD_TCP_PORT: u16 = 502;

/// Highest valid unit (slave) identifier.
pub const MAX_UNIT_ID: u8 = 247;

/// Default timeout for a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// A validated unit (slave) identifier, 0 to 247.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UnitId(u8);

impl UnitId {
    /// Creates a unit identifier.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidParameter` above [`MAX_UNIT_ID`].
    ///
    /// # Example
    ///
    /// ```
    /// use modbus_schema::UnitId;
    ///
    /// assert_eq!(UnitId::new(1)?.value(), 1);
    /// assert!(UnitId::new(248).is_err());
    /// # Ok::<(), modbus_schema::ModbusError>(())
    /// ```
    pub fn new(unit_id: u8) -> Result<Self> {
        if unit_id > MAX_UNIT_ID {
            return Err(ModbusError::invalid_parameter(
                "unit_id",
                format!("{unit_id} is not in the range 0-{MAX_UNIT_ID}"),
            ));
        }
        Ok(Self(unit_id))
    }

    /// The raw identifier.
    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settings every transport shares.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// The unit (slave) the requests are addressed to.
    pub unit_id: UnitId,
    /// Largest register read the device accepts.
    pub max_registers_per_request: u16,
    /// Largest discrete read the device accepts.
    pub max_discretes_per_request: u16,
    /// Timeout for one request.
    pub timeout: Duration,
}

impl DeviceConfig {
    /// Creates a configuration with the protocol limits and the default timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use modbus_schema::{DeviceConfig, UnitId};
    /// use std::time::Duration;
    ///
    /// let config = DeviceConfig::new(UnitId::new(1)?)
    ///     .with_max_registers_per_request(60)?
    ///     .with_timeout(Duration::from_millis(500));
    /// assert_eq!(config.max_registers_per_request, 60);
    /// # Ok::<(), modbus_schema::ModbusError>(())
    /// ```
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            max_registers_per_request: MODBUS_MAX_REGISTERS_PER_REQUEST,
            max_discretes_per_request: MODBUS_MAX_DISCRETES_PER_REQUEST,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Limits the number of registers per request (1 to 125).
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidParameter` outside that range.
    pub fn with_max_registers_per_request(mut self, max: u16) -> Result<Self> {
        self.max_registers_per_request =
            check_limit("max_registers_per_request", max, MODBUS_MAX_REGISTERS_PER_REQUEST)?;
        Ok(self)
    }

    /// Limits the number of discretes per request (1 to 2000).
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidParameter` outside that range.
    pub fn with_max_discretes_per_request(mut self, max: u16) -> Result<Self> {
        self.max_discretes_per_request =
            check_limit("max_discretes_per_request", max, MODBUS_MAX_DISCRETES_PER_REQUEST)?;
        Ok(self)
    }

    /// Sets a custom timeout (default is 2 seconds).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The request limit for one kind of address.
    pub fn max_per_request(&self, kind: AddressKind) -> u16 {
        match kind {
            AddressKind::Register => self.max_registers_per_request,
            AddressKind::Discrete => self.max_discretes_per_request,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new(UnitId::default())
    }
}

pub(crate) fn check_limit(parameter: &str, value: u16, max: u16) -> Result<u16> {
    if value == 0 || value > max {
        return Err(ModbusError::invalid_parameter(
            parameter,
            format!("{value} is not in the range 1-{max}"),
        ));
    }
    Ok(value)
}

/// A connection to something that answers Modbus reads.
pub trait ModbusDevice {
    /// The settings of this connection.
    fn config(&self) -> &DeviceConfig;

    /// Reads `count` registers starting at `first`.
    ///
    /// The returned block may hold fewer values than requested. A request the
    /// device rejects is returned as a read-error block.
    ///
    /// # Errors
    ///
    /// Transport failures the adapter cannot express as a block.
    fn get_registers(&mut self, first: Address, count: u16) -> Result<RegisterBlock>;

    /// Reads `count` discretes starting at `first`.
    ///
    /// # Errors
    ///
    /// Transport failures the adapter cannot express as a block.
    fn get_discretes(&mut self, first: Address, count: u16) -> Result<DiscreteBlock>;

    /// Releases the connection.
    ///
    /// # Errors
    ///
    /// Failures while shutting the transport down.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
