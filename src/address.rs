//! Address algebra for Modbus registers and discretes.
//!
//! An [`Address`] is an [`AddressClass`] plus a zero based physical offset
//! (the number that goes over the wire). Several historical notations exist
//! for the same location; all of them parse back to the identical address.
//!
//! # Notations
//!
//! | Notation | Holding register at offset 123 | Notes |
//! |----------|-------------------------------|-------|
//! | Canonical | `hr:00123` | Also the `Display` form |
//! | Short hex | `hr:0x007B` | |
//! | Modicon 5 | `40124` | Register numbers 1-9999 only |
//! | Modicon 6 | `400124` | |
//! | Modicon X | `4x00124` | |
//!
//! The legacy forms use the register *number*, which is the physical offset
//! plus one.
//!
//! # Example
//!
//! ```
//! use modbus_schema::{Address, AddressClass};
//!
//! let address = Address::parse("4x00124")?;
//! assert_eq!(address.class(), AddressClass::HoldingRegister);
//! assert_eq!(address.physical(), 123);
//! assert_eq!(address.to_string(), "hr:00123");
//! assert_eq!(address.to_modicon5().as_deref(), Some("40124"));
//! # Ok::<(), modbus_schema::ModbusError>(())
//! ```

use std::fmt;

use crate::error::{ModbusError, Result};

/// The largest physical offset in any address class.
pub const MAX_PHYSICAL_ADDRESS: u16 = u16::MAX;

/// The two shapes of value an address class can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// Single bit values (coils and discrete inputs).
    Discrete,
    /// 16 bit register values.
    Register,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::Discrete => write!(f, "discrete"),
            AddressKind::Register => write!(f, "register"),
        }
    }
}

/// The four Modbus value spaces.
///
/// The ordering follows the Modicon base digit, so sorting addresses groups
/// them by class first.
///
/// | Class | Short | Long | Digit | Bits |
/// |-------|-------|------|:-----:|:----:|
/// | [`AddressClass::Coil`] | `c` | `coil` | 0 | 1 |
/// | [`AddressClass::DiscreteInput`] | `di` | `discrete-input` | 1 | 1 |
/// | [`AddressClass::InputRegister`] | `ir` | `input-register` | 3 | 16 |
/// | [`AddressClass::HoldingRegister`] | `hr` | `holding-register` | 4 | 16 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum AddressClass {
    /// Read/write single bits.
    Coil,
    /// Read-only single bits.
    DiscreteInput,
    /// Read-only 16 bit registers.
    InputRegister,
    /// Read/write 16 bit registers.
    HoldingRegister,
}

impl AddressClass {
    /// All address classes in ascending order.
    pub const ALL: [AddressClass; 4] = [
        AddressClass::Coil,
        AddressClass::DiscreteInput,
        AddressClass::InputRegister,
        AddressClass::HoldingRegister,
    ];

    /// Offset between the physical address and the legacy register number.
    pub const REGISTER_NUMBER_OFFSET: u32 = 1;

    /// Leading digit used by the Modicon notations.
    pub fn base_digit(self) -> u8 {
        match self {
            AddressClass::Coil => 0,
            AddressClass::DiscreteInput => 1,
            AddressClass::InputRegister => 3,
            AddressClass::HoldingRegister => 4,
        }
    }

    /// Number of bits in one value of this class.
    pub fn bits_per_value(self) -> u8 {
        match self.kind() {
            AddressKind::Discrete => 1,
            AddressKind::Register => 16,
        }
    }

    /// Whether this class holds discretes or registers.
    pub fn kind(self) -> AddressKind {
        match self {
            AddressClass::Coil | AddressClass::DiscreteInput => AddressKind::Discrete,
            AddressClass::InputRegister | AddressClass::HoldingRegister => AddressKind::Register,
        }
    }

    /// Short label used in the canonical notation (`c`, `di`, `ir`, `hr`).
    pub fn short_label(self) -> &'static str {
        match self {
            AddressClass::Coil => "c",
            AddressClass::DiscreteInput => "di",
            AddressClass::InputRegister => "ir",
            AddressClass::HoldingRegister => "hr",
        }
    }

    /// Long, human readable label.
    pub fn long_label(self) -> &'static str {
        match self {
            AddressClass::Coil => "coil",
            AddressClass::DiscreteInput => "discrete-input",
            AddressClass::InputRegister => "input-register",
            AddressClass::HoldingRegister => "holding-register",
        }
    }

    /// Finds the class for a Modicon base digit.
    pub fn from_base_digit(digit: u32) -> Option<AddressClass> {
        Self::ALL
            .into_iter()
            .find(|class| u32::from(class.base_digit()) == digit)
    }

    /// Finds the class for any of its labels.
    ///
    /// Accepts the short and long labels, plurals, spaces or underscores
    /// instead of dashes, and the Modicon base digit. Case and surrounding
    /// whitespace are ignored.
    ///
    /// # Example
    ///
    /// ```
    /// use modbus_schema::AddressClass;
    ///
    /// assert_eq!(AddressClass::from_label("HR"), Some(AddressClass::HoldingRegister));
    /// assert_eq!(AddressClass::from_label("discrete inputs"), Some(AddressClass::DiscreteInput));
    /// assert_eq!(AddressClass::from_label("3"), Some(AddressClass::InputRegister));
    /// assert_eq!(AddressClass::from_label("xyz"), None);
    /// ```
    pub fn from_label(label: &str) -> Option<AddressClass> {
        let cleaned = label.trim().to_lowercase().replace([' ', '_'], "-");
        let singular = cleaned.strip_suffix('s').unwrap_or(&cleaned);
        Self::ALL.into_iter().find(|class| {
            cleaned == class.short_label()
                || singular == class.long_label()
                || cleaned == class.base_digit().to_string()
        })
    }
}

impl fmt::Display for AddressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.long_label())
    }
}

/// One register or discrete location.
///
/// Ordering is by class first and physical offset second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    class: AddressClass,
    physical: u16,
}

impl Address {
    /// Creates an address from a class and a physical (wire) offset.
    pub const fn new(class: AddressClass, physical: u16) -> Self {
        Self { class, physical }
    }

    /// Creates an address from a legacy register number (physical + 1).
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidAddress` if the register number is 0 or
    /// above 65536.
    pub fn from_register_number(class: AddressClass, register_number: u32) -> Result<Self> {
        let physical = register_number
            .checked_sub(AddressClass::REGISTER_NUMBER_OFFSET)
            .and_then(|physical| u16::try_from(physical).ok())
            .ok_or_else(|| {
                ModbusError::invalid_address(
                    register_number.to_string(),
                    format!("register number out of range for {class}"),
                )
            })?;
        Ok(Self::new(class, physical))
    }

    /// Creates an address from an integer in the 5 digit Modicon notation
    /// (for example `40001` is `hr:00000`).
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidAddress` for values above 99999, an
    /// unknown class digit or register number 0.
    pub fn of_modicon5(tag: u32) -> Result<Self> {
        if tag > 99_999 {
            return Err(ModbusError::invalid_address(
                tag.to_string(),
                "a Modicon 5 tag has at most 5 digits",
            ));
        }
        Self::of_modicon(tag, 10_000)
    }

    /// Creates an address from an integer in the 6 digit Modicon notation
    /// (for example `400001` is `hr:00000`).
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidAddress` for an unknown class digit or a
    /// register number outside 1-65536.
    pub fn of_modicon6(tag: u32) -> Result<Self> {
        Self::of_modicon(tag, 100_000)
    }

    fn of_modicon(tag: u32, divisor: u32) -> Result<Self> {
        let class = AddressClass::from_base_digit(tag / divisor).ok_or_else(|| {
            ModbusError::invalid_address(tag.to_string(), "unknown address class digit")
        })?;
        Self::from_register_number(class, tag % divisor)
    }

    /// Parses any of the supported textual notations.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidAddress` if the text matches none of the
    /// notations or the offset does not fit.
    ///
    /// # Example
    ///
    /// ```
    /// use modbus_schema::Address;
    ///
    /// let canonical = Address::parse("hr:123")?;
    /// assert_eq!(Address::parse("hr:0x007B")?, canonical);
    /// assert_eq!(Address::parse("40124")?, canonical);
    /// assert_eq!(Address::parse("400124")?, canonical);
    /// assert_eq!(Address::parse("holding-register:123")?, canonical);
    /// # Ok::<(), modbus_schema::ModbusError>(())
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let cleaned = text.trim().to_lowercase();
        let invalid = |reason: &str| ModbusError::invalid_address(text.trim(), reason);

        // `hr:123`, `holding-register:123` and `hr:0x7b` use the physical offset.
        if let Some((label, offset)) = cleaned.split_once(':') {
            let class = AddressClass::from_label(label)
                .filter(|_| label.chars().all(|c| c.is_ascii_alphabetic() || c == '-'))
                .ok_or_else(|| invalid("unknown address class"))?;
            let physical = match offset.strip_prefix("0x") {
                Some(hex) if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) => {
                    u32::from_str_radix(hex, 16).ok()
                }
                Some(_) => None,
                None => parse_digits(offset),
            }
            .ok_or_else(|| invalid("malformed offset"))?;
            let physical = u16::try_from(physical).map_err(|_| invalid("offset above 65535"))?;
            return Ok(Self::new(class, physical));
        }

        // `4x124` uses the register number.
        if let Some((digit, number)) = cleaned.split_once('x') {
            let digit = parse_digits(digit)
                .filter(|_| digit.len() == 1)
                .ok_or_else(|| invalid("expected a single class digit before 'x'"))?;
            let number = parse_digits(number).ok_or_else(|| invalid("malformed register number"))?;
            let class = AddressClass::from_base_digit(digit)
                .ok_or_else(|| invalid("unknown address class digit"))?;
            return Self::from_register_number(class, number);
        }

        // `40124` and `400124` use the register number.
        if (5..=6).contains(&cleaned.len()) {
            if let Some(tag) = parse_digits(&cleaned) {
                return if cleaned.len() == 5 {
                    Self::of_modicon5(tag)
                } else {
                    Self::of_modicon6(tag)
                };
            }
        }

        Err(invalid("unrecognized address notation"))
    }

    /// The address class.
    pub fn class(self) -> AddressClass {
        self.class
    }

    /// The zero based physical (wire) offset.
    pub fn physical(self) -> u16 {
        self.physical
    }

    /// The legacy register number (physical offset + 1).
    pub fn register_number(self) -> u32 {
        u32::from(self.physical) + AddressClass::REGISTER_NUMBER_OFFSET
    }

    /// Returns the address `step` positions further in the same class.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidAddress` if the result passes 65535.
    pub fn increment(self, step: u16) -> Result<Self> {
        let physical = self.physical.checked_add(step).ok_or_else(|| {
            ModbusError::invalid_address(
                self.to_string(),
                format!("incrementing by {step} passes the last address"),
            )
        })?;
        Ok(Self::new(self.class, physical))
    }

    /// Signed offset from `self` to `other`, or `None` if the classes differ.
    ///
    /// # Example
    ///
    /// ```
    /// use modbus_schema::{Address, AddressClass};
    ///
    /// let a = Address::new(AddressClass::HoldingRegister, 10);
    /// let b = Address::new(AddressClass::HoldingRegister, 14);
    /// assert_eq!(a.distance(b), Some(4));
    /// assert_eq!(b.distance(a), Some(-4));
    /// assert_eq!(a.distance(Address::new(AddressClass::InputRegister, 10)), None);
    /// ```
    pub fn distance(self, other: Address) -> Option<i32> {
        (self.class == other.class).then(|| i32::from(other.physical) - i32::from(self.physical))
    }

    /// Canonical notation, `hr:00123`.
    pub fn to_canonical(self) -> String {
        format!("{}:{:05}", self.class.short_label(), self.physical)
    }

    /// Short class with a hexadecimal offset, `hr:0x007B`.
    pub fn to_short_hex(self) -> String {
        format!("{}:0x{:04X}", self.class.short_label(), self.physical)
    }

    /// 5 digit Modicon notation, `40124`; `None` above register number 9999.
    pub fn to_modicon5(self) -> Option<String> {
        let register_number = self.register_number();
        (register_number <= 9999)
            .then(|| format!("{}{:04}", self.class.base_digit(), register_number))
    }

    /// 6 digit Modicon notation, `400124`.
    pub fn to_modicon6(self) -> String {
        format!("{}{:05}", self.class.base_digit(), self.register_number())
    }

    /// Modicon notation with an `x` separator, `4x00124`.
    pub fn to_modicon_x(self) -> String {
        format!("{}x{:05}", self.class.base_digit(), self.register_number())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical())
    }
}

impl std::str::FromStr for Address {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = <String as serde::Deserialize>::deserialize(deserializer)?;
        Address::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Parses a non-empty run of ASCII digits.
fn parse_digits(text: &str) -> Option<u32> {
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hr(physical: u16) -> Address {
        Address::new(AddressClass::HoldingRegister, physical)
    }

    #[test]
    fn test_class_properties() {
        assert_eq!(AddressClass::Coil.bits_per_value(), 1);
        assert_eq!(AddressClass::DiscreteInput.kind(), AddressKind::Discrete);
        assert_eq!(AddressClass::InputRegister.bits_per_value(), 16);
        assert_eq!(AddressClass::HoldingRegister.base_digit(), 4);
        assert_eq!(AddressClass::InputRegister.to_string(), "input-register");
    }

    #[test]
    fn test_class_labels() {
        for class in AddressClass::ALL {
            assert_eq!(AddressClass::from_label(class.short_label()), Some(class));
            assert_eq!(AddressClass::from_label(class.long_label()), Some(class));
            assert_eq!(
                AddressClass::from_label(&class.base_digit().to_string()),
                Some(class)
            );
        }
        assert_eq!(AddressClass::from_label(" Coils "), Some(AddressClass::Coil));
        assert_eq!(
            AddressClass::from_label("holding_registers"),
            Some(AddressClass::HoldingRegister)
        );
        assert_eq!(
            AddressClass::from_label("Input Register"),
            Some(AddressClass::InputRegister)
        );
        assert_eq!(AddressClass::from_label("2"), None);
        assert_eq!(AddressClass::from_label(""), None);
    }

    #[test]
    fn test_parse_all_notations() {
        let expected = hr(123);
        for text in [
            "hr:123",
            "hr:00123",
            " HR:00123 ",
            "holding-register:123",
            "hr:0x007B",
            "hr:0x7b",
            "4x124",
            "4x00124",
            "40124",
            "400124",
        ] {
            assert_eq!(Address::parse(text).unwrap(), expected, "{text}");
        }
        assert_eq!(
            Address::parse("c:5").unwrap(),
            Address::new(AddressClass::Coil, 5)
        );
        assert_eq!(
            Address::parse("00006").unwrap(),
            Address::new(AddressClass::Coil, 5)
        );
        assert_eq!(
            Address::parse("1x00001").unwrap(),
            Address::new(AddressClass::DiscreteInput, 0)
        );
    }

    #[test]
    fn test_parse_invalid() {
        for text in [
            "", "hr", "hr:", "hr:-1", "hr:65536", "xx:1", "2x00001", "40000", "4x0", "4x65537",
            "hr:0xZZ", "1234", "1234567", "h1:5",
        ] {
            assert!(Address::parse(text).is_err(), "{text}");
        }
    }

    #[test]
    fn test_formats() {
        let address = hr(123);
        assert_eq!(address.to_canonical(), "hr:00123");
        assert_eq!(address.to_short_hex(), "hr:0x007B");
        assert_eq!(address.to_modicon5().as_deref(), Some("40124"));
        assert_eq!(address.to_modicon6(), "400124");
        assert_eq!(address.to_modicon_x(), "4x00124");
        assert_eq!(hr(65535).to_modicon6(), "465536");
        assert_eq!(Address::new(AddressClass::Coil, 0).to_modicon6(), "000001");
    }

    #[test]
    fn test_round_trip_every_notation() {
        for class in AddressClass::ALL {
            for physical in [0u16, 1, 9, 99, 9997, 9998, 9999, 10_000, 12_345, 65_534, 65_535] {
                let address = Address::new(class, physical);
                assert_eq!(Address::parse(&address.to_canonical()).unwrap(), address);
                assert_eq!(Address::parse(&address.to_short_hex()).unwrap(), address);
                assert_eq!(Address::parse(&address.to_modicon6()).unwrap(), address);
                assert_eq!(Address::parse(&address.to_modicon_x()).unwrap(), address);
                match address.to_modicon5() {
                    Some(modicon5) => {
                        assert!(physical <= 9998);
                        assert_eq!(Address::parse(&modicon5).unwrap(), address);
                    }
                    None => assert!(physical >= 9999),
                }
            }
        }
    }

    #[test]
    fn test_integer_constructors() {
        assert_eq!(Address::of_modicon5(40001).unwrap(), hr(0));
        assert_eq!(Address::of_modicon5(30010).unwrap(), Address::new(AddressClass::InputRegister, 9));
        assert_eq!(Address::of_modicon6(465536).unwrap(), hr(65535));
        assert!(Address::of_modicon5(100_000).is_err());
        assert!(Address::of_modicon5(20001).is_err());
        assert!(Address::of_modicon6(400000).is_err());
    }

    #[test]
    fn test_increment() {
        assert_eq!(hr(5).increment(0).unwrap(), hr(5));
        assert_eq!(hr(5).increment(10).unwrap(), hr(15));
        assert!(hr(65535).increment(1).is_err());
    }

    #[test]
    fn test_distance() {
        let a = hr(100);
        let b = hr(42);
        assert_eq!(a.distance(a), Some(0));
        assert_eq!(a.distance(b), Some(-58));
        assert_eq!(a.distance(b), b.distance(a).map(|d| -d));
        assert_eq!(a.distance(Address::new(AddressClass::Coil, 100)), None);
    }

    #[test]
    fn test_ordering() {
        let mut addresses = vec![
            hr(2),
            Address::new(AddressClass::Coil, 7),
            hr(1),
            Address::new(AddressClass::InputRegister, 0),
        ];
        addresses.sort();
        assert_eq!(
            addresses,
            vec![
                Address::new(AddressClass::Coil, 7),
                Address::new(AddressClass::InputRegister, 0),
                hr(1),
                hr(2),
            ]
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde() {
        let json = serde_json::to_string(&hr(7)).unwrap();
        assert_eq!(json, "\"hr:00007\"");
        let back: Address = serde_json::from_str("\"4x00008\"").unwrap();
        assert_eq!(back, hr(7));
        let class = serde_json::to_string(&AddressClass::DiscreteInput).unwrap();
        assert_eq!(class, "\"discrete-input\"");
    }
}
