//! Utility functions for byte conversion and text formatting.
//!
//! This module provides the helpers the decoders and reports share:
//! register/byte conversion, the textual forms of hex dumps and network
//! addresses, strict UTF-8 decoding, double formatting and a small text table.
//!
//! # Example
//!
//! ```
//! use modbus_schema::utils::{bytes_to_hex_string, words_to_bytes, format_ipv4};
//!
//! let bytes = words_to_bytes(&[0xC0A8, 0x0101]);
//! assert_eq!(bytes, vec![0xC0, 0xA8, 0x01, 0x01]);
//! assert_eq!(bytes_to_hex_string(&bytes), "0xC0 0xA8 0x01 0x01");
//! assert_eq!(format_ipv4(&bytes), "192.168.1.1");
//! ```

use std::fmt;

/// Splits registers into big-endian bytes.
///
/// # Example
///
/// ```
/// use modbus_schema::utils::words_to_bytes;
///
/// assert_eq!(words_to_bytes(&[0x0102, 0xA0B0]), vec![0x01, 0x02, 0xA0, 0xB0]);
/// ```
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_be_bytes()).collect()
}

/// Joins big-endian bytes back into registers. A trailing odd byte is ignored.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Interprets up to 8 big-endian bytes as an unsigned integer.
pub fn bytes_to_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// Formats bytes as `0x61 0x62 0x63`. Empty input gives an empty string.
pub fn bytes_to_hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("0x{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats registers as `0xDEAD 0xBEEF`.
pub fn words_to_hex_string(words: &[u16]) -> String {
    words
        .iter()
        .map(|word| format!("0x{word:04X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats the last 6 bytes as an EUI-48 (MAC) address, `01:23:45:67:89:AB`.
pub fn format_eui48(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(6);
    bytes[start..]
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Formats bytes as a dotted decimal IPv4 address.
pub fn format_ipv4(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Formats bytes as colon separated 4 digit groups, `0001:0203:...`.
///
/// Groups are never shortened or compressed.
pub fn format_ipv6(bytes: &[u8]) -> String {
    bytes_to_words(bytes)
        .iter()
        .map(|word| format!("{word:04X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Strict UTF-8 decoding of a fixed width text field.
///
/// Decoding stops at the first NUL byte or the first invalid sequence.
/// Returns `None` only when the very first character is invalid; a field
/// that starts with NUL is the empty string.
///
/// # Example
///
/// ```
/// use modbus_schema::utils::decode_utf8;
///
/// assert_eq!(decode_utf8(b"abc\0\0\0").as_deref(), Some("abc"));
/// assert_eq!(decode_utf8(b"ab\xFFcd").as_deref(), Some("ab"));
/// assert_eq!(decode_utf8(b"\xFF").as_deref(), None);
/// assert_eq!(decode_utf8(b"").as_deref(), Some(""));
/// ```
pub fn decode_utf8(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|byte| *byte == 0).unwrap_or(bytes.len());
    let text = &bytes[..end];
    match std::str::from_utf8(text) {
        Ok(valid) => Some(valid.to_string()),
        Err(error) if error.valid_up_to() > 0 => {
            Some(String::from_utf8_lossy(&text[..error.valid_up_to()]).into_owned())
        }
        Err(_) => None,
    }
}

/// Significant digits used by [`format_double`].
pub const DOUBLE_SIGNIFICANT_DIGITS: i32 = 10;

/// Formats a double for humans: at most 10 significant digits, trailing
/// zeros removed.
///
/// # Example
///
/// ```
/// use modbus_schema::utils::format_double;
///
/// assert_eq!(format_double(1234.5670000001), "1234.567");
/// assert_eq!(format_double(0.001), "0.001");
/// assert_eq!(format_double(42.0), "42");
/// assert_eq!(format_double(f64::NAN), "NaN");
/// ```
pub fn format_double(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let magnitude = value.abs().log10();
    let exponent = if magnitude.is_finite() {
        magnitude.floor() as i32
    } else {
        1
    };
    let decimals = if exponent < 1 {
        DOUBLE_SIGNIFICANT_DIGITS - exponent
    } else {
        (DOUBLE_SIGNIFICANT_DIGITS - exponent.min(DOUBLE_SIGNIFICANT_DIGITS)).max(1)
    };
    let decimals = usize::try_from(decimals).unwrap_or(1);
    let formatted = format!("{value:.decimals$}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

/// Formats a double the way expressions print their constants: integral
/// values keep a `.0` suffix so they read back as doubles.
pub fn format_double_constant(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

/// A plain text table with `|` borders.
///
/// # Example
///
/// ```
/// use modbus_schema::utils::StringTable;
///
/// let mut table = StringTable::new(["Field", "Value"]);
/// table.add_row(["Name", "Meter"]);
/// assert_eq!(
///     table.to_string(),
///     "|-------+-------|\n| Field | Value |\n|-------+-------|\n| Name  | Meter |\n|-------+-------|\n"
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct StringTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl StringTable {
    /// Creates a table with the given column headers.
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row.
    pub fn add_row<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Appends a separator line.
    pub fn add_separator(&mut self) -> &mut Self {
        self.rows.push(Vec::new());
        self
    }

    fn column_widths(&self) -> Vec<usize> {
        (0..self.headers.len())
            .map(|column| {
                self.rows
                    .iter()
                    .filter_map(|row| row.get(column))
                    .map(|field| field.chars().count())
                    .chain(std::iter::once(self.headers[column].chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect()
    }
}

fn write_separator(f: &mut fmt::Formatter<'_>, widths: &[usize]) -> fmt::Result {
    for (column, width) in widths.iter().enumerate() {
        f.write_str(if column == 0 { "|" } else { "+" })?;
        f.write_str(&"-".repeat(width + 2))?;
    }
    f.write_str("|\n")
}

fn write_row(f: &mut fmt::Formatter<'_>, widths: &[usize], fields: &[String]) -> fmt::Result {
    if fields.is_empty() {
        return write_separator(f, widths);
    }
    let columns = widths.len().max(fields.len());
    for column in 0..columns {
        let width = widths.get(column).copied().unwrap_or(1);
        let field = fields.get(column).map(String::as_str).unwrap_or("");
        write!(f, "| {field:<width$} ")?;
    }
    f.write_str("|\n")
}

impl fmt::Display for StringTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let widths = self.column_widths();
        write_separator(f, &widths)?;
        write_row(f, &widths, &self.headers)?;
        write_separator(f, &widths)?;
        for row in &self.rows {
            write_row(f, &widths, row)?;
        }
        write_separator(f, &widths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_and_bytes() {
        let bytes = hex::decode("0102a0b0").unwrap();
        assert_eq!(words_to_bytes(&[0x0102, 0xA0B0]), bytes);
        assert_eq!(bytes_to_words(&bytes), vec![0x0102, 0xA0B0]);
        assert_eq!(bytes_to_words(&[0x01, 0x02, 0x03]), vec![0x0102]);
        assert_eq!(bytes_to_u64(&bytes), 0x0102_A0B0);
        assert_eq!(bytes_to_u64(&[]), 0);
    }

    #[test]
    fn test_hex_formats() {
        assert_eq!(bytes_to_hex_string(b"ab"), "0x61 0x62");
        assert_eq!(bytes_to_hex_string(&[]), "");
        assert_eq!(words_to_hex_string(&[0xDEAD, 0x0001]), "0xDEAD 0x0001");
    }

    #[test]
    fn test_network_formats() {
        let eui = hex::decode("000001020304050a").unwrap();
        assert_eq!(format_eui48(&eui), "01:02:03:04:05:0A");
        assert_eq!(format_eui48(&eui[2..]), "01:02:03:04:05:0A");
        assert_eq!(format_ipv4(&[10, 0, 255, 1]), "10.0.255.1");
        let ipv6 = hex::decode("00010203040506070809101112131415").unwrap();
        assert_eq!(format_ipv6(&ipv6), "0001:0203:0405:0607:0809:1011:1213:1415");
    }

    #[test]
    fn test_decode_utf8() {
        assert_eq!(decode_utf8("Zoë".as_bytes()).as_deref(), Some("Zoë"));
        assert_eq!(decode_utf8(b"\0abc").as_deref(), Some(""));
        assert_eq!(decode_utf8(b"ab\xC3").as_deref(), Some("ab"));
        assert_eq!(decode_utf8(b"\xC3\x28").as_deref(), None);
    }

    #[test]
    fn test_format_double() {
        assert_eq!(format_double(0.0), "0");
        assert_eq!(format_double(-1.5), "-1.5");
        assert_eq!(format_double(1234.567), "1234.567");
        assert_eq!(format_double(0.000123), "0.000123");
        assert_eq!(format_double(123_456_789_012.0), "123456789012");
        assert_eq!(format_double(f64::INFINITY), "Infinity");
    }

    #[test]
    fn test_format_double_constant() {
        assert_eq!(format_double_constant(5.0), "5.0");
        assert_eq!(format_double_constant(-2.0), "-2.0");
        assert_eq!(format_double_constant(3.25), "3.25");
        assert_eq!(format_double_constant(0.001), "0.001");
    }

    #[test]
    fn test_string_table() {
        let mut table = StringTable::new(["A", "Long header"]);
        table.add_row(["value", "x"]).add_separator().add_row(["y"]);
        let expected = "\
|-------+-------------|
| A     | Long header |
|-------+-------------|
| value | x           |
|-------+-------------|
| y     |             |
|-------+-------------|
";
        assert_eq!(table.to_string(), expected);
    }
}
