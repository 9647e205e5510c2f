//! Text decoders and string composition.

use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use super::booleans::BooleanExpr;
use super::not_implemented::NotImplemented;
use super::numbers::NumberExpr;
use super::problem::{check, check_fatal, combine, Problem};
use super::registers::RegistersExpr;
use super::{EvaluationContext, FieldRef, FieldValue, ReturnType};
use crate::utils::{
    bytes_to_hex_string, decode_utf8, format_double, format_eui48, format_ipv4, format_ipv6,
};

/// An expression producing a string.
#[derive(Debug, Clone, PartialEq)]
pub enum StringExpr {
    /// A quoted constant, `'text'`.
    Constant(String),
    /// UTF-8 text, cut at the first NUL, trailing whitespace removed.
    Utf8(RegistersExpr),
    /// The bytes as `0x61 0x62`.
    Hex(RegistersExpr),
    /// A MAC address from the last 6 bytes of 3 or 4 registers.
    Eui48 {
        /// The registers.
        registers: RegistersExpr,
        /// Patterns that mean "no value".
        not_implemented: NotImplemented,
    },
    /// A dotted IPv4 address from 2 registers.
    Ipv4 {
        /// The registers.
        registers: RegistersExpr,
        /// Patterns that mean "no value".
        not_implemented: NotImplemented,
    },
    /// An IPv6 address from 8 registers.
    Ipv6 {
        /// The registers.
        registers: RegistersExpr,
        /// Patterns that mean "no value".
        not_implemented: NotImplemented,
    },
    /// A signed integer of 1, 2 or 4 registers looked up in a table.
    Enum {
        /// The registers.
        registers: RegistersExpr,
        /// Patterns that mean "no value".
        not_implemented: NotImplemented,
        /// Value to text.
        mapping: BTreeMap<i64, String>,
    },
    /// The parts joined; absent parts contribute nothing.
    Concat(Vec<StringExpr>),
    /// The text form of a number.
    FromNumber(Box<NumberExpr>),
    /// One of two strings chosen by a boolean.
    FromBoolean {
        /// The condition.
        boolean: Box<BooleanExpr>,
        /// Used for `false`.
        zero: String,
        /// Used for `true`.
        one: String,
    },
    /// The value of another field, numbers converted to text.
    Field(FieldRef),
}

const ENUM_WIDTHS: [usize; 3] = [1, 2, 4];

fn width_problem(got: usize, allowed: &[usize]) -> Vec<Problem> {
    check_fatal(allowed.contains(&got), || {
        let allowed: Vec<String> = allowed.iter().map(usize::to_string).collect();
        format!(
            "Must have {} registers (got {got})",
            allowed.join(" or ")
        )
    })
}

/// Bytes of `registers` unless absent or matching a sentinel.
pub(super) fn guarded_bytes(
    registers: &RegistersExpr,
    not_implemented: &NotImplemented,
    context: &dyn EvaluationContext,
) -> Option<Vec<u8>> {
    let bytes = registers.bytes(context)?;
    (!not_implemented.matches(&bytes)).then_some(bytes)
}

fn signed_value(bytes: &[u8]) -> Option<i64> {
    match bytes.len() {
        2 => Some(i64::from(i16::from_be_bytes(bytes.try_into().ok()?))),
        4 => Some(i64::from(i32::from_be_bytes(bytes.try_into().ok()?))),
        8 => Some(i64::from_be_bytes(bytes.try_into().ok()?)),
        _ => None,
    }
}

impl StringExpr {
    /// Always [`ReturnType::String`].
    pub fn return_type(&self) -> ReturnType {
        ReturnType::String
    }

    /// Validation findings for this node and the nodes below it.
    pub fn problems(&self) -> Vec<Problem> {
        match self {
            StringExpr::Constant(_) => Vec::new(),
            StringExpr::Utf8(registers) => combine("utf8", [registers.problems()]),
            StringExpr::Hex(registers) => combine("hexstring", [registers.problems()]),
            StringExpr::Eui48 {
                registers,
                not_implemented,
            } => {
                let got = registers.returned_registers();
                combine(
                    "eui48",
                    [
                        width_problem(got, &[3, 4]),
                        registers.problems(),
                        not_implemented.problems(got),
                    ],
                )
            }
            StringExpr::Ipv4 {
                registers,
                not_implemented,
            } => combine(
                "ipv4addr",
                [
                    width_problem(registers.returned_registers(), &[2]),
                    registers.problems(),
                    not_implemented.problems(2),
                ],
            ),
            StringExpr::Ipv6 {
                registers,
                not_implemented,
            } => combine(
                "ipv6addr",
                [
                    width_problem(registers.returned_registers(), &[8]),
                    registers.problems(),
                    not_implemented.problems(8),
                ],
            ),
            StringExpr::Enum {
                registers,
                not_implemented,
                mapping,
            } => {
                let got = registers.returned_registers();
                combine(
                    "enum",
                    [
                        width_problem(got, &ENUM_WIDTHS),
                        registers.problems(),
                        not_implemented.problems(got),
                        check(!mapping.is_empty(), || "No mappings".to_string()),
                    ],
                )
            }
            StringExpr::Concat(parts) => combine("concat", parts.iter().map(StringExpr::problems)),
            StringExpr::FromNumber(number) => combine("str", [number.problems()]),
            StringExpr::FromBoolean { boolean, .. } => combine("boolean", [boolean.problems()]),
            StringExpr::Field(field) => field.problems(),
        }
    }

    /// The text, or `None` when a needed value is absent.
    pub fn evaluate(&self, context: &dyn EvaluationContext) -> Option<String> {
        match self {
            StringExpr::Constant(text) => Some(text.clone()),
            StringExpr::Utf8(registers) => {
                let text = decode_utf8(&registers.bytes(context)?)?;
                Some(text.trim_end().to_string())
            }
            StringExpr::Hex(registers) => Some(bytes_to_hex_string(&registers.bytes(context)?)),
            StringExpr::Eui48 {
                registers,
                not_implemented,
            } => {
                let bytes = guarded_bytes(registers, not_implemented, context)?;
                matches!(bytes.len(), 6 | 8).then(|| format_eui48(&bytes))
            }
            StringExpr::Ipv4 {
                registers,
                not_implemented,
            } => {
                let bytes = guarded_bytes(registers, not_implemented, context)?;
                (bytes.len() == 4).then(|| format_ipv4(&bytes))
            }
            StringExpr::Ipv6 {
                registers,
                not_implemented,
            } => {
                let bytes = guarded_bytes(registers, not_implemented, context)?;
                (bytes.len() == 16).then(|| format_ipv6(&bytes))
            }
            StringExpr::Enum {
                registers,
                not_implemented,
                mapping,
            } => {
                let bytes = guarded_bytes(registers, not_implemented, context)?;
                let value = signed_value(&bytes)?;
                let mapped = mapping.get(&value).cloned();
                if mapped.is_none() {
                    warn!(value, expression = %self, "no enum mapping for value");
                }
                mapped
            }
            StringExpr::Concat(parts) => Some(
                parts
                    .iter()
                    .filter_map(|part| part.evaluate(context))
                    .collect(),
            ),
            StringExpr::FromNumber(number) => match number.evaluate(context)? {
                FieldValue::Long(value) => Some(value.to_string()),
                FieldValue::Double(value) => Some(format_double(value)),
                _ => None,
            },
            StringExpr::FromBoolean { boolean, zero, one } => {
                let value = boolean.evaluate(context)?;
                Some(if value { one.clone() } else { zero.clone() })
            }
            StringExpr::Field(field) => match field.value(context)? {
                FieldValue::String(text) => Some(text),
                FieldValue::Long(value) => Some(value.to_string()),
                FieldValue::Double(value) => Some(format_double(value)),
                _ => None,
            },
        }
    }

    pub(crate) fn field_refs_mut<'a>(&'a mut self, out: &mut Vec<&'a mut FieldRef>) {
        match self {
            StringExpr::Concat(parts) => {
                for part in parts {
                    part.field_refs_mut(out);
                }
            }
            StringExpr::FromNumber(number) => number.field_refs_mut(out),
            StringExpr::FromBoolean { boolean, .. } => boolean.field_refs_mut(out),
            StringExpr::Field(field) => out.push(field),
            _ => {}
        }
    }
}

impl fmt::Display for StringExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StringExpr::Constant(text) => write!(f, "'{text}'"),
            StringExpr::Utf8(registers) => write!(f, "utf8({registers})"),
            StringExpr::Hex(registers) => write!(f, "hexstring({registers})"),
            StringExpr::Eui48 {
                registers,
                not_implemented,
            } => write!(f, "eui48({registers}{not_implemented})"),
            StringExpr::Ipv4 {
                registers,
                not_implemented,
            } => write!(f, "ipv4addr({registers}{not_implemented})"),
            StringExpr::Ipv6 {
                registers,
                not_implemented,
            } => write!(f, "ipv6addr({registers}{not_implemented})"),
            StringExpr::Enum {
                registers,
                not_implemented,
                mapping,
            } => {
                write!(f, "enum({registers}{not_implemented}")?;
                for (value, text) in mapping {
                    write!(f, " ; {value}->'{text}'")?;
                }
                f.write_str(")")
            }
            StringExpr::Concat(parts) => {
                let parts: Vec<String> = parts.iter().map(StringExpr::to_string).collect();
                write!(f, "concat({})", parts.join(", "))
            }
            StringExpr::FromNumber(number) => write!(f, "str({number})"),
            StringExpr::FromBoolean { boolean, zero, one } => {
                write!(f, "boolean( {boolean} ; '{zero}' ; '{one}' )")
            }
            StringExpr::Field(field) => write!(f, "{field}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::TestContext;
    use super::*;
    use crate::address::{Address, AddressClass};

    fn hr(physical: u16) -> Address {
        Address::new(AddressClass::HoldingRegister, physical)
    }

    fn regs(first: u16, count: u16) -> RegistersExpr {
        RegistersExpr::Modbus((first..first + count).map(hr).collect())
    }

    #[test]
    fn test_utf8() {
        let context = TestContext::registers(hr(0), "4865 6C6C 6F20 2000 0000");
        assert_eq!(
            StringExpr::Utf8(regs(0, 5)).evaluate(&context).as_deref(),
            Some("Hello")
        );
        let absent = TestContext::registers(hr(0), "4865 ----");
        assert_eq!(StringExpr::Utf8(regs(0, 2)).evaluate(&absent), None);
        let invalid = TestContext::registers(hr(0), "FF41");
        assert_eq!(StringExpr::Utf8(regs(0, 1)).evaluate(&invalid), None);
    }

    #[test]
    fn test_hexstring() {
        let context = TestContext::registers(hr(0), "6162 6364");
        let expr = StringExpr::Hex(regs(0, 2));
        assert_eq!(expr.evaluate(&context).as_deref(), Some("0x61 0x62 0x63 0x64"));
        assert_eq!(expr.to_string(), "hexstring(hr:00000 # 2)");
        assert!(StringExpr::Hex(regs(0, 126)).problems()[0].is_fatal());
    }

    #[test]
    fn test_network_addresses() {
        let context = TestContext::registers(
            hr(0),
            "0001 0203 0405 0607 0809 1011 1213 1415",
        );
        let eui = |count| StringExpr::Eui48 {
            registers: regs(0, count),
            not_implemented: NotImplemented::none(),
        };
        assert_eq!(eui(3).evaluate(&context).as_deref(), Some("00:01:02:03:04:05"));
        assert_eq!(eui(4).evaluate(&context).as_deref(), Some("02:03:04:05:06:07"));
        assert!(eui(2).problems()[0].is_fatal());
        assert_eq!(eui(2).evaluate(&context), None);

        let ipv4 = StringExpr::Ipv4 {
            registers: RegistersExpr::Modbus(vec![hr(6), hr(7)]),
            not_implemented: NotImplemented::none(),
        };
        assert_eq!(ipv4.evaluate(&context).as_deref(), Some("18.19.20.21"));

        let ipv6 = StringExpr::Ipv6 {
            registers: regs(0, 8),
            not_implemented: NotImplemented::none(),
        };
        assert_eq!(
            ipv6.evaluate(&context).as_deref(),
            Some("0001:0203:0405:0607:0809:1011:1213:1415")
        );
    }

    #[test]
    fn test_network_sentinel() {
        let context = TestContext::registers(hr(0), "FFFF FFFF");
        let ipv4 = StringExpr::Ipv4 {
            registers: regs(0, 2),
            not_implemented: NotImplemented::new(vec![vec![0xFFFF, 0xFFFF]]),
        };
        assert_eq!(ipv4.evaluate(&context), None);
        assert_eq!(ipv4.to_string(), "ipv4addr(hr:00000 # 2 ; 0xFFFF 0xFFFF)");
    }

    fn enum_expr(count: u16) -> StringExpr {
        StringExpr::Enum {
            registers: regs(0, count),
            not_implemented: NotImplemented::none(),
            mapping: BTreeMap::from([
                (-1, "Error".to_string()),
                (0, "Off".to_string()),
                (1, "On".to_string()),
            ]),
        }
    }

    #[test]
    fn test_enum() {
        let context = TestContext::registers(hr(0), "0001 FFFF FFFF 0000");
        assert_eq!(enum_expr(1).evaluate(&context).as_deref(), Some("On"));
        let negative = TestContext::registers(hr(0), "FFFF FFFF");
        assert_eq!(enum_expr(2).evaluate(&negative).as_deref(), Some("Error"));
        let unmapped = TestContext::registers(hr(0), "0007");
        assert_eq!(enum_expr(1).evaluate(&unmapped), None);
        assert_eq!(
            enum_expr(1).to_string(),
            "enum(hr:00000 ; -1->'Error' ; 0->'Off' ; 1->'On')"
        );
    }

    #[test]
    fn test_enum_width() {
        let problems = enum_expr(3).problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].is_fatal());
        assert_eq!(problems[0].explain(), "enum(Must have 1 or 2 or 4 registers (got 3))");
        assert!(enum_expr(4).problems().is_empty());
    }

    #[test]
    fn test_concat_and_conversions() {
        let context = TestContext::registers(hr(0), "002A ----");
        let number = NumberExpr::decode(
            super::super::NumericDecoder::Uint16,
            regs(0, 1),
            NotImplemented::none(),
        );
        let missing = NumberExpr::decode(
            super::super::NumericDecoder::Uint16,
            regs(1, 1),
            NotImplemented::none(),
        );
        let concat = StringExpr::Concat(vec![
            StringExpr::Constant("Value: ".to_string()),
            StringExpr::FromNumber(Box::new(number.clone())),
            StringExpr::FromNumber(Box::new(missing)),
            StringExpr::Constant("!".to_string()),
        ]);
        assert_eq!(concat.evaluate(&context).as_deref(), Some("Value: 42!"));
        assert_eq!(
            concat.to_string(),
            "concat('Value: ', str(uint16(hr:00000)), str(uint16(hr:00001)), '!')"
        );

        let half = StringExpr::FromNumber(Box::new(NumberExpr::Double(0.5)));
        assert_eq!(half.evaluate(&context).as_deref(), Some("0.5"));
    }

    #[test]
    fn test_from_boolean() {
        let expr = StringExpr::FromBoolean {
            boolean: Box::new(BooleanExpr::Constant(true)),
            zero: "Closed".to_string(),
            one: "Open".to_string(),
        };
        assert_eq!(expr.evaluate(&TestContext::empty()).as_deref(), Some("Open"));
        assert_eq!(expr.to_string(), "boolean( true ; 'Closed' ; 'Open' )");
    }

    #[test]
    fn test_field_conversion() {
        let context = TestContext::empty()
            .with_field("Count", FieldValue::Long(12))
            .with_field("Ratio", FieldValue::Double(0.25));
        let mut count = FieldRef::new("Count", super::super::ReferenceKind::String);
        count.resolve(ReturnType::Long, false);
        assert_eq!(
            StringExpr::Field(count).evaluate(&context).as_deref(),
            Some("12")
        );
        let mut ratio = FieldRef::new("Ratio", super::super::ReferenceKind::String);
        ratio.resolve(ReturnType::Double, false);
        assert_eq!(
            StringExpr::Field(ratio).evaluate(&context).as_deref(),
            Some("0.25")
        );
    }
}
