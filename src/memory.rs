//! Register and discrete blocks.
//!
//! A [`ModbusBlock`] is a sparse, ordered map from [`Address`] to
//! [`ModbusValue`] for exactly one [`AddressClass`]. Transport adapters return
//! blocks, the schema layer keeps one block per class as its memory image,
//! and tests load blocks from a compact text format.
//!
//! # Text format
//!
//! Register blocks take whitespace separated tokens, one per register:
//!
//! | Token | Meaning |
//! |-------|---------|
//! | `1A2B` | Value `0x1A2B` (1 to 4 hex digits) |
//! | `----` or `null` | Absent |
//! | `xxxx` or `-x` | Soft read error |
//!
//! Discrete blocks take one character per discrete: `1`, `0`, `-` (absent)
//! and `x` (soft read error). Whitespace is ignored, so `0101 1100` is eight
//! discretes. In both formats `#` and `//` start a comment that runs to the
//! end of the line.
//!
//! # Example
//!
//! ```
//! use modbus_schema::{Address, AddressClass, RegisterBlock};
//!
//! let first = Address::new(AddressClass::InputRegister, 0);
//! let block = RegisterBlock::from_text(first, "F001 E002 ---- xxxx")?;
//! assert_eq!(block.value(first), Some(0xF001));
//! assert_eq!(block.to_hex_string(), "F001 E002 ---- xxxx");
//! # Ok::<(), modbus_schema::ModbusError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::address::{Address, AddressClass};
use crate::error::{ModbusError, Result};
use crate::value::{ModbusValue, RawValue};

/// Timestamp given to values loaded from text (2001-02-03T04:05:06.789Z).
pub const LOADED_VALUE_TIMESTAMP: i64 = 981_173_106_789;

/// Ordered values of one address class.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusBlock<T: RawValue> {
    class: AddressClass,
    values: BTreeMap<Address, ModbusValue<T>>,
}

/// A block of 16 bit registers.
pub type RegisterBlock = ModbusBlock<u16>;

/// A block of single bit discretes.
pub type DiscreteBlock = ModbusBlock<bool>;

impl<T: RawValue> ModbusBlock<T> {
    /// Creates an empty block.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::IllegalAddressClass` if the class holds the
    /// other kind of value.
    pub fn new(class: AddressClass) -> Result<Self> {
        if class.kind() != T::KIND {
            return Err(ModbusError::illegal_address_class(class, T::KIND));
        }
        Ok(Self {
            class,
            values: BTreeMap::new(),
        })
    }

    /// Creates a block where `count` values starting at `first` are soft read
    /// errors. Adapters return this when the device rejects a request.
    ///
    /// # Errors
    ///
    /// Fails for a class of the wrong kind or a range past the last address.
    pub fn read_error(first: Address, count: u16) -> Result<Self> {
        let mut block = Self::new(first.class())?;
        for offset in 0..count {
            let address = first.increment(offset)?;
            let mut value = ModbusValue::placeholder(address);
            value.set_soft_read_error();
            block.values.insert(address, value);
        }
        Ok(block)
    }

    /// The address class of every value in this block.
    pub fn class(&self) -> AddressClass {
        self.class
    }

    fn check(&self, address: Address) -> Result<()> {
        if address.class() != self.class {
            return Err(ModbusError::invalid_address(
                address.to_string(),
                format!("does not belong in a {} of {}", T::BLOCK_NAME, self.class),
            ));
        }
        Ok(())
    }

    /// Returns the value at `address`, or an empty placeholder if the block
    /// has nothing there. The block itself is not modified.
    pub fn get(&self, address: Address) -> ModbusValue<T> {
        self.values
            .get(&address)
            .cloned()
            .unwrap_or_else(|| ModbusValue::placeholder(address))
    }

    /// Borrowed access to a stored value.
    pub fn get_ref(&self, address: Address) -> Option<&ModbusValue<T>> {
        self.values.get(&address)
    }

    /// Mutable access to a stored value.
    pub fn get_mut(&mut self, address: Address) -> Option<&mut ModbusValue<T>> {
        self.values.get_mut(&address)
    }

    /// Mutable access to the value at `address`, inserting a placeholder
    /// first when needed.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidAddress` for an address of another class.
    pub fn get_or_insert(&mut self, address: Address) -> Result<&mut ModbusValue<T>> {
        self.check(address)?;
        Ok(self
            .values
            .entry(address)
            .or_insert_with(|| ModbusValue::placeholder(address)))
    }

    /// The raw value at `address`, if present.
    pub fn value(&self, address: Address) -> Option<T> {
        self.values.get(&address).and_then(ModbusValue::value)
    }

    /// Inserts or replaces a complete value.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidAddress` for an address of another class.
    pub fn put(&mut self, value: ModbusValue<T>) -> Result<()> {
        self.check(value.address())?;
        self.values.insert(value.address(), value);
        Ok(())
    }

    /// Stores a raw value fetched at `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidAddress` for an address of another class.
    pub fn set_value(&mut self, address: Address, value: T, timestamp: i64) -> Result<()> {
        self.get_or_insert(address)?.set_value(value, timestamp);
        Ok(())
    }

    /// Marks `address` as a soft read error.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidAddress` for an address of another class.
    pub fn set_soft_read_error(&mut self, address: Address) -> Result<()> {
        self.get_or_insert(address)?.set_soft_read_error();
        Ok(())
    }

    /// Marks every value in the block as a hard read error.
    pub fn set_hard_read_errors(&mut self) {
        self.values
            .values_mut()
            .for_each(ModbusValue::set_hard_read_error);
    }

    /// Merges `other` into this block.
    ///
    /// Addresses only in `other` are added. For addresses in both, the value
    /// with the newer timestamp wins; read-error markers always replace the
    /// current value. The `immutable`, `comment` and `fetch_group` settings of
    /// the existing value are kept.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::IllegalAddressClass` if the blocks hold
    /// different address classes.
    pub fn merge(&mut self, other: &ModbusBlock<T>) -> Result<()> {
        if other.class != self.class {
            return Err(ModbusError::illegal_address_class(other.class, T::KIND));
        }
        for (address, incoming) in &other.values {
            match self.values.get_mut(address) {
                Some(existing) if incoming.supersedes(existing) => {
                    let ModbusValue {
                        immutable,
                        comment,
                        fetch_group,
                        ..
                    } = existing.clone();
                    *existing = incoming.clone();
                    existing.immutable = immutable || incoming.immutable;
                    existing.comment = comment.or_else(|| incoming.comment.clone());
                    existing.fetch_group = fetch_group.or_else(|| incoming.fetch_group.clone());
                }
                Some(_) => {}
                None => {
                    self.values.insert(*address, incoming.clone());
                }
            }
        }
        Ok(())
    }

    /// The lowest address in the block.
    pub fn first_address(&self) -> Option<Address> {
        self.values.keys().next().copied()
    }

    /// All stored values in address order.
    pub fn values(&self) -> impl Iterator<Item = &ModbusValue<T>> + '_ {
        self.values.values()
    }

    /// The values (or placeholders) for the given addresses, in that order.
    pub fn values_for(&self, addresses: &[Address]) -> Vec<ModbusValue<T>> {
        addresses.iter().map(|address| self.get(*address)).collect()
    }

    /// Addresses currently marked with a read error.
    pub fn read_error_addresses(&self) -> Vec<Address> {
        self.values
            .values()
            .filter(|value| value.is_read_error())
            .map(ModbusValue::address)
            .collect()
    }

    /// All values from the first to the last address, with placeholders
    /// filling the gaps.
    pub fn no_gaps_values(&self) -> Vec<ModbusValue<T>> {
        let (Some(first), Some(last)) = (self.values.keys().next(), self.values.keys().last())
        else {
            return Vec::new();
        };
        (first.physical()..=last.physical())
            .map(|physical| self.get(Address::new(self.class, physical)))
            .collect()
    }

    /// Space separated text form of [`ModbusBlock::no_gaps_values`].
    pub fn to_hex_string(&self) -> String {
        self.no_gaps_values()
            .iter()
            .map(ModbusValue::to_hex_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the block holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Removes every value.
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl<T: RawValue> fmt::Display for ModbusBlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.first_address() {
            Some(first) => write!(f, "Starting at {first}: [ {} ]", self.to_hex_string()),
            None => write!(f, "Empty {}", T::BLOCK_NAME),
        }
    }
}

/// Removes `#` and `//` comments from every line.
fn strip_comments(text: &str) -> String {
    text.lines()
        .map(|line| {
            let end = [line.find('#'), line.find("//")]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(line.len());
            &line[..end]
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl ModbusBlock<u16> {
    /// Creates a register block from the text format, starting at `first`.
    ///
    /// # Errors
    ///
    /// Fails for a non register class, a malformed token, or more tokens
    /// than addresses left after `first`.
    pub fn from_text(first: Address, text: &str) -> Result<Self> {
        let mut block = Self::new(first.class())?;
        block.load_text(first, text)?;
        Ok(block)
    }

    /// Loads registers from the text format into this block.
    ///
    /// # Errors
    ///
    /// See [`ModbusBlock::from_text`].
    pub fn load_text(&mut self, first: Address, text: &str) -> Result<()> {
        let cleaned = strip_comments(text).to_lowercase();
        for (offset, token) in cleaned.split_whitespace().enumerate() {
            let offset = u16::try_from(offset)
                .map_err(|_| ModbusError::invalid_parameter("text", "too many registers"))?;
            let address = first.increment(offset)?;
            let value = self.get_or_insert(address)?;
            if token == "null" || token.chars().all(|c| c == '-') {
                value.clear();
            } else if token.contains('x') && token.chars().all(|c| c == 'x' || c == '-') {
                value.set_soft_read_error();
            } else if (1..=4).contains(&token.len()) && token.chars().all(|c| c.is_ascii_hexdigit())
            {
                let word = u16::from_str_radix(token, 16).map_err(|e| {
                    ModbusError::invalid_parameter("text", format!("bad register \"{token}\": {e}"))
                })?;
                value.set_value(word, LOADED_VALUE_TIMESTAMP);
            } else {
                return Err(ModbusError::invalid_parameter(
                    "text",
                    format!("bad register \"{token}\" at {address}"),
                ));
            }
        }
        Ok(())
    }
}

impl ModbusBlock<bool> {
    /// Creates a discrete block from the text format, starting at `first`.
    /// The first character is the value of `first`.
    ///
    /// # Errors
    ///
    /// Fails for a register class, an unknown character, or more characters
    /// than addresses left after `first`.
    pub fn from_text(first: Address, text: &str) -> Result<Self> {
        let mut block = Self::new(first.class())?;
        block.load_text(first, text)?;
        Ok(block)
    }

    /// Loads discretes from the text format into this block.
    ///
    /// # Errors
    ///
    /// See [`ModbusBlock::from_text`].
    pub fn load_text(&mut self, first: Address, text: &str) -> Result<()> {
        let cleaned = strip_comments(text).to_lowercase();
        let symbols = cleaned.chars().filter(|c| !c.is_whitespace());
        for (offset, symbol) in symbols.enumerate() {
            let offset = u16::try_from(offset)
                .map_err(|_| ModbusError::invalid_parameter("text", "too many discretes"))?;
            let address = first.increment(offset)?;
            let value = self.get_or_insert(address)?;
            match symbol {
                '0' => value.set_value(false, LOADED_VALUE_TIMESTAMP),
                '1' => value.set_value(true, LOADED_VALUE_TIMESTAMP),
                '-' => value.clear(),
                'x' => value.set_soft_read_error(),
                other => {
                    return Err(ModbusError::invalid_parameter(
                        "text",
                        format!("bad discrete '{other}' at {address}"),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ReadErrorState, RegisterValue};

    fn ir(physical: u16) -> Address {
        Address::new(AddressClass::InputRegister, physical)
    }

    fn coil(physical: u16) -> Address {
        Address::new(AddressClass::Coil, physical)
    }

    #[test]
    fn test_class_check() {
        assert!(RegisterBlock::new(AddressClass::HoldingRegister).is_ok());
        assert!(RegisterBlock::new(AddressClass::Coil).is_err());
        assert!(DiscreteBlock::new(AddressClass::DiscreteInput).is_ok());
        assert!(DiscreteBlock::new(AddressClass::InputRegister).is_err());

        let mut block = RegisterBlock::new(AddressClass::InputRegister).unwrap();
        let foreign = Address::new(AddressClass::HoldingRegister, 0);
        assert!(block.set_value(foreign, 1, 1).is_err());
    }

    #[test]
    fn test_load_registers() {
        let block = RegisterBlock::from_text(ir(0), "F001 E002 ---- xxxx").unwrap();
        assert_eq!(block.len(), 4);
        assert_eq!(block.value(ir(0)), Some(0xF001));
        assert_eq!(block.value(ir(1)), Some(0xE002));
        assert_eq!(block.value(ir(2)), None);
        assert!(!block.get(ir(2)).is_read_error());
        assert_eq!(block.get(ir(3)).read_error(), ReadErrorState::Soft);
        assert_eq!(block.get(ir(0)).timestamp(), LOADED_VALUE_TIMESTAMP);
        assert_eq!(block.first_address(), Some(ir(0)));
    }

    #[test]
    fn test_load_registers_with_comments() {
        let text = "
            # Header comment
            0001 0002 // two registers
            null -x   # absent and soft error
            ab
        ";
        let block = RegisterBlock::from_text(ir(10), text).unwrap();
        assert_eq!(block.to_hex_string(), "0001 0002 ---- xxxx 00AB");
    }

    #[test]
    fn test_load_registers_invalid() {
        assert!(RegisterBlock::from_text(ir(0), "12345").is_err());
        assert!(RegisterBlock::from_text(ir(0), "GHIJ").is_err());
        assert!(RegisterBlock::from_text(ir(65535), "0001 0002").is_err());
        assert!(RegisterBlock::from_text(coil(0), "0001").is_err());
    }

    #[test]
    fn test_load_discretes() {
        let block = DiscreteBlock::from_text(coil(0), "10-x 1 # trailing").unwrap();
        assert_eq!(block.value(coil(0)), Some(true));
        assert_eq!(block.value(coil(1)), Some(false));
        assert_eq!(block.value(coil(2)), None);
        assert!(block.get(coil(3)).is_read_error());
        assert_eq!(block.value(coil(4)), Some(true));
        assert_eq!(block.to_hex_string(), "1 0 - x 1");
        assert!(DiscreteBlock::from_text(coil(0), "102").is_err());
    }

    #[test]
    fn test_get_returns_placeholder_without_inserting() {
        let block = RegisterBlock::new(AddressClass::InputRegister).unwrap();
        let value = block.get(ir(7));
        assert_eq!(value.address(), ir(7));
        assert_eq!(value.value(), None);
        assert!(block.is_empty());
    }

    #[test]
    fn test_merge_newer_timestamp_wins() {
        let mut first = RegisterBlock::new(AddressClass::InputRegister).unwrap();
        first.set_value(ir(0), 1, 100).unwrap();
        first.set_value(ir(1), 2, 300).unwrap();

        let mut second = RegisterBlock::new(AddressClass::InputRegister).unwrap();
        second.set_value(ir(0), 10, 200).unwrap();
        second.set_value(ir(1), 20, 250).unwrap();
        second.set_value(ir(2), 30, 250).unwrap();

        first.merge(&second).unwrap();
        assert_eq!(first.value(ir(0)), Some(10));
        assert_eq!(first.value(ir(1)), Some(2));
        assert_eq!(first.value(ir(2)), Some(30));
    }

    #[test]
    fn test_merge_keeps_settings_and_applies_errors() {
        let mut memory = RegisterBlock::new(AddressClass::InputRegister).unwrap();
        let slot = memory.get_or_insert(ir(0)).unwrap();
        slot.immutable = true;
        slot.fetch_group = Some("group".to_string());
        slot.set_value(5, 100);

        let fetched = RegisterBlock::read_error(ir(0), 1).unwrap();
        memory.merge(&fetched).unwrap();
        let merged = memory.get(ir(0));
        assert!(merged.is_read_error());
        assert!(merged.immutable);
        assert_eq!(merged.fetch_group.as_deref(), Some("group"));
    }

    #[test]
    fn test_merge_class_mismatch() {
        let mut a = RegisterBlock::new(AddressClass::InputRegister).unwrap();
        let b = RegisterBlock::new(AddressClass::HoldingRegister).unwrap();
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_no_gaps_and_display() {
        let mut block = RegisterBlock::new(AddressClass::InputRegister).unwrap();
        assert_eq!(block.to_string(), "Empty RegisterBlock");
        block.put(RegisterValue::with_value(ir(1), 0x0A0B, 1).unwrap()).unwrap();
        block.put(RegisterValue::with_value(ir(3), 0x0C0D, 1).unwrap()).unwrap();
        assert_eq!(block.no_gaps_values().len(), 3);
        assert_eq!(block.to_string(), "Starting at ir:00001: [ 0A0B ---- 0C0D ]");
        assert_eq!(
            DiscreteBlock::new(AddressClass::Coil).unwrap().to_string(),
            "Empty DiscreteBlock"
        );
    }

    #[test]
    fn test_read_error_block() {
        let block = RegisterBlock::read_error(ir(5), 3).unwrap();
        assert_eq!(block.to_hex_string(), "xxxx xxxx xxxx");
        assert_eq!(block.read_error_addresses(), vec![ir(5), ir(6), ir(7)]);
    }

    #[test]
    fn test_values_for() {
        let block = RegisterBlock::from_text(ir(0), "0001 0002").unwrap();
        let values = block.values_for(&[ir(1), ir(0), ir(9)]);
        let raw: Vec<_> = values.iter().map(|v| v.value()).collect();
        assert_eq!(raw, vec![Some(2), Some(1), None]);
    }
}
