//! Error types for schema decoding and device access.
//!
//! Only failures that abort an operation are errors. Defects found while
//! validating expressions are reported as [`Problem`](crate::Problem) values
//! instead, and a device that could not deliver a range is recorded as a
//! read-error marker in the memory image.

use std::io;
use thiserror::Error;

use crate::address::{AddressClass, AddressKind};

/// Result type alias for schema and device operations.
pub type Result<T> = std::result::Result<T, ModbusError>;

/// Errors that can occur while parsing, configuring or reading a device.
#[derive(Debug, Error)]
pub enum ModbusError {
    /// An expression could not be parsed.
    #[error("Unable to parse >>{expression}<<: {reason}")]
    Parse {
        /// The complete expression text.
        expression: String,
        /// What went wrong and where.
        reason: String,
    },

    /// An address was malformed or out of range.
    #[error("Invalid address \"{address}\": {reason}")]
    InvalidAddress {
        /// The offending address text.
        address: String,
        /// Description of the addressing error.
        reason: String,
    },

    /// A value or block was created for an address class of the wrong kind.
    #[error("Illegal address class {class}: a {expected} container was required")]
    IllegalAddressClass {
        /// The address class that was provided.
        class: AddressClass,
        /// The kind of address class the container holds.
        expected: AddressKind,
    },

    /// Invalid parameter provided.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },

    /// The schema itself is structurally broken.
    #[error("Schema error: {reason}")]
    Schema {
        /// Description of the defect.
        reason: String,
    },

    /// The device could not supply the requested range.
    #[error("Read error for {count} values starting at {first}: {reason}")]
    ReadError {
        /// First requested address (canonical form).
        first: String,
        /// Number of requested values.
        count: u16,
        /// Why the read failed.
        reason: String,
    },

    /// Communication timeout.
    #[error("Communication timeout")]
    Timeout,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Any other transport failure.
    #[error("Transport error: {reason}")]
    Transport {
        /// Description of the transport failure.
        reason: String,
    },
}

impl ModbusError {
    /// Creates a new `Parse` error.
    ///
    /// # Example
    ///
    /// ```
    /// use modbus_schema::ModbusError;
    ///
    /// let err = ModbusError::parse("int16(", "unexpected end of input");
    /// assert_eq!(err.to_string(), "Unable to parse >>int16(<<: unexpected end of input");
    /// ```
    pub fn parse(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidAddress` error.
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `IllegalAddressClass` error.
    pub fn illegal_address_class(class: AddressClass, expected: AddressKind) -> Self {
        Self::IllegalAddressClass { class, expected }
    }

    /// Creates a new `InvalidParameter` error.
    ///
    /// # Example
    ///
    /// ```
    /// use modbus_schema::ModbusError;
    ///
    /// let err = ModbusError::invalid_parameter("unit_id", "must be 0-247");
    /// ```
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `Schema` error.
    pub fn schema(reason: impl Into<String>) -> Self {
        Self::Schema {
            reason: reason.into(),
        }
    }

    /// Creates a new `ReadError`.
    pub fn read_error(first: impl ToString, count: u16, reason: impl Into<String>) -> Self {
        Self::ReadError {
            first: first.to_string(),
            count,
            reason: reason.into(),
        }
    }

    /// Creates a new `Transport` error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Returns `true` for failures that mean "the device did not deliver this
    /// range". The fetcher turns these into read-error markers instead of
    /// failing the update.
    pub fn is_read_failure(&self) -> bool {
        matches!(
            self,
            Self::ReadError { .. } | Self::Timeout | Self::Io(_) | Self::Transport { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display() {
        let err = ModbusError::parse("int16(hr:0", "expected ')' at position 10");
        assert_eq!(
            err.to_string(),
            "Unable to parse >>int16(hr:0<<: expected ')' at position 10"
        );
    }

    #[test]
    fn test_illegal_address_class_display() {
        let err = ModbusError::illegal_address_class(AddressClass::Coil, AddressKind::Register);
        assert_eq!(
            err.to_string(),
            "Illegal address class coil: a register container was required"
        );
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(ModbusError::Timeout.to_string(), "Communication timeout");
    }

    #[test]
    fn test_read_failure_classification() {
        assert!(ModbusError::Timeout.is_read_failure());
        assert!(ModbusError::read_error("hr:00000", 2, "exception 0x02").is_read_failure());
        assert!(ModbusError::transport("socket closed").is_read_failure());
        assert!(!ModbusError::schema("circular").is_read_failure());
        assert!(!ModbusError::invalid_parameter("count", "too big").is_read_failure());
    }
}
