//! An in-memory device for tests and demos.
//!
//! [`MockedModbusDevice`] answers reads from blocks loaded in the text format
//! of [`RegisterBlock::from_text`]. It behaves like a real device for grouped
//! reads: if any value in a requested range is a read error, the whole
//! response is a read error.
//!
//! ```
//! use modbus_schema::{Address, AddressClass, MockedModbusDevice, ModbusDevice};
//!
//! let first = Address::new(AddressClass::InputRegister, 0);
//! let mut device = MockedModbusDevice::new().with_registers(first, "F001 E002 ---- xxxx")?;
//!
//! let whole = device.get_registers(first, 4)?;
//! assert_eq!(whole.to_hex_string(), "xxxx xxxx xxxx xxxx");
//!
//! let single = device.get_registers(first, 1)?;
//! assert_eq!(single.value(first), Some(0xF001));
//! # Ok::<(), modbus_schema::ModbusError>(())
//! ```

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use tracing::trace;

use crate::address::{Address, AddressClass};
use crate::device::{DeviceConfig, ModbusDevice};
use crate::error::Result;
use crate::memory::{DiscreteBlock, ModbusBlock, RegisterBlock};
use crate::value::{current_time_ms, RawValue};

fn memory_for<T: RawValue>(
    blocks: &mut BTreeMap<AddressClass, ModbusBlock<T>>,
    class: AddressClass,
) -> Result<&mut ModbusBlock<T>> {
    Ok(match blocks.entry(class) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(ModbusBlock::new(class)?),
    })
}

/// A device backed by fixed blocks of values.
#[derive(Debug, Default)]
pub struct MockedModbusDevice {
    config: DeviceConfig,
    registers: BTreeMap<AddressClass, RegisterBlock>,
    discretes: BTreeMap<AddressClass, DiscreteBlock>,
    log_requests: bool,
    requests: usize,
}

impl MockedModbusDevice {
    /// Creates an empty device with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Logs every request at trace level.
    pub fn with_log_requests(mut self, log_requests: bool) -> Self {
        self.log_requests = log_requests;
        self
    }

    /// Loads registers in the text format, starting at `first`.
    ///
    /// # Errors
    ///
    /// Fails for a discrete class or malformed text.
    pub fn with_registers(mut self, first: Address, text: &str) -> Result<Self> {
        self.add_registers(first, text)?;
        Ok(self)
    }

    /// Loads discretes in the text format, starting at `first`.
    ///
    /// # Errors
    ///
    /// Fails for a register class or malformed text.
    pub fn with_discretes(mut self, first: Address, text: &str) -> Result<Self> {
        self.add_discretes(first, text)?;
        Ok(self)
    }

    /// Loads registers into an existing device.
    ///
    /// # Errors
    ///
    /// Fails for a discrete class or malformed text.
    pub fn add_registers(&mut self, first: Address, text: &str) -> Result<()> {
        memory_for(&mut self.registers, first.class())?.load_text(first, text)
    }

    /// Loads discretes into an existing device.
    ///
    /// # Errors
    ///
    /// Fails for a register class or malformed text.
    pub fn add_discretes(&mut self, first: Address, text: &str) -> Result<()> {
        memory_for(&mut self.discretes, first.class())?.load_text(first, text)
    }

    /// Copies the values of `block` into the device.
    ///
    /// # Errors
    ///
    /// Never fails for a well formed block.
    pub fn add_register_block(&mut self, block: &RegisterBlock) -> Result<()> {
        memory_for(&mut self.registers, block.class())?.merge(block)
    }

    /// Copies the values of `block` into the device.
    ///
    /// # Errors
    ///
    /// Never fails for a well formed block.
    pub fn add_discrete_block(&mut self, block: &DiscreteBlock) -> Result<()> {
        memory_for(&mut self.discretes, block.class())?.merge(block)
    }

    /// Number of reads answered so far.
    pub fn request_count(&self) -> usize {
        self.requests
    }

    fn answer<T: RawValue>(
        memory: Option<&ModbusBlock<T>>,
        first: Address,
        count: u16,
    ) -> Result<ModbusBlock<T>> {
        let mut result = ModbusBlock::new(first.class())?;
        let Some(memory) = memory else {
            return Ok(result);
        };
        let mut addresses = Vec::with_capacity(usize::from(count));
        for offset in 0..count {
            addresses.push(first.increment(offset)?);
        }
        if addresses
            .iter()
            .any(|address| memory.get(*address).is_read_error())
        {
            return ModbusBlock::read_error(first, count);
        }
        let now = current_time_ms();
        for address in addresses {
            if let Some(value) = memory.value(address) {
                result.set_value(address, value, now)?;
            }
        }
        Ok(result)
    }
}

impl ModbusDevice for MockedModbusDevice {
    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn get_registers(&mut self, first: Address, count: u16) -> Result<RegisterBlock> {
        self.requests += 1;
        if self.log_requests {
            trace!(first = %first, count, "mocked register request");
        }
        Self::answer(self.registers.get(&first.class()), first, count)
    }

    fn get_discretes(&mut self, first: Address, count: u16) -> Result<DiscreteBlock> {
        self.requests += 1;
        if self.log_requests {
            trace!(first = %first, count, "mocked discrete request");
        }
        Self::answer(self.discretes.get(&first.class()), first, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ir(physical: u16) -> Address {
        Address::new(AddressClass::InputRegister, physical)
    }

    #[test]
    fn test_grouped_read_error_poisons_range() {
        let mut device = MockedModbusDevice::new()
            .with_registers(ir(0), "F001 E002 ---- xxxx")
            .unwrap();

        let whole = device.get_registers(ir(0), 4).unwrap();
        assert_eq!(whole.len(), 4);
        assert!(whole.values().all(|value| value.is_read_error()));

        for (physical, expected) in [(0, Some(0xF001)), (1, Some(0xE002)), (2, None)] {
            let block = device.get_registers(ir(physical), 1).unwrap();
            assert_eq!(block.value(ir(physical)), expected);
            assert!(!block.get(ir(physical)).is_read_error());
        }
        assert!(device.get_registers(ir(3), 1).unwrap().get(ir(3)).is_read_error());
        assert_eq!(device.request_count(), 5);
    }

    #[test]
    fn test_unknown_class_is_empty() {
        let mut device = MockedModbusDevice::new();
        let block = device
            .get_registers(Address::new(AddressClass::HoldingRegister, 0), 3)
            .unwrap();
        assert!(block.is_empty());
    }

    #[test]
    fn test_discretes() {
        let first = Address::new(AddressClass::Coil, 0);
        let mut device = MockedModbusDevice::new()
            .with_discretes(first, "1011")
            .unwrap()
            .with_log_requests(true);
        let block = device.get_discretes(first, 4).unwrap();
        assert_eq!(block.to_hex_string(), "1 0 1 1");
        assert!(block.get(first).timestamp() > 0);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let coil = Address::new(AddressClass::Coil, 0);
        assert!(MockedModbusDevice::new().with_registers(coil, "0001").is_err());
        assert!(MockedModbusDevice::new().with_discretes(ir(0), "1").is_err());
    }
}
