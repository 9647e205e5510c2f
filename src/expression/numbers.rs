//! Numeric decoders, constants and arithmetic.

use std::fmt;

use super::not_implemented::NotImplemented;
use super::problem::{check_fatal, combine, Problem};
use super::registers::RegistersExpr;
use super::{EvaluationContext, FieldRef, FieldValue, ReturnType};
use crate::utils::format_double_constant;

/// The fixed width integer and float decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum NumericDecoder {
    /// Signed 16 bit integer.
    Int16,
    /// Signed 32 bit integer.
    Int32,
    /// Signed 64 bit integer.
    Int64,
    /// Unsigned 16 bit integer.
    Uint16,
    /// Unsigned 32 bit integer.
    Uint32,
    /// Unsigned 64 bit integer; values above `i64::MAX` are absent.
    Uint64,
    /// IEEE 754 binary32.
    Ieee754_32,
    /// IEEE 754 binary64.
    Ieee754_64,
}

impl NumericDecoder {
    /// All decoders.
    pub const ALL: [NumericDecoder; 8] = [
        NumericDecoder::Int16,
        NumericDecoder::Int32,
        NumericDecoder::Int64,
        NumericDecoder::Uint16,
        NumericDecoder::Uint32,
        NumericDecoder::Uint64,
        NumericDecoder::Ieee754_32,
        NumericDecoder::Ieee754_64,
    ];

    /// The function name used in expression text.
    pub fn name(self) -> &'static str {
        match self {
            NumericDecoder::Int16 => "int16",
            NumericDecoder::Int32 => "int32",
            NumericDecoder::Int64 => "int64",
            NumericDecoder::Uint16 => "uint16",
            NumericDecoder::Uint32 => "uint32",
            NumericDecoder::Uint64 => "uint64",
            NumericDecoder::Ieee754_32 => "ieee754_32",
            NumericDecoder::Ieee754_64 => "ieee754_64",
        }
    }

    /// Finds a decoder by its function name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|decoder| decoder.name() == name)
    }

    /// Number of registers consumed.
    pub fn registers(self) -> usize {
        match self {
            NumericDecoder::Int16 | NumericDecoder::Uint16 => 1,
            NumericDecoder::Int32 | NumericDecoder::Uint32 | NumericDecoder::Ieee754_32 => 2,
            NumericDecoder::Int64 | NumericDecoder::Uint64 | NumericDecoder::Ieee754_64 => 4,
        }
    }

    /// [`ReturnType::Double`] for the float decoders, [`ReturnType::Long`] otherwise.
    pub fn return_type(self) -> ReturnType {
        match self {
            NumericDecoder::Ieee754_32 | NumericDecoder::Ieee754_64 => ReturnType::Double,
            _ => ReturnType::Long,
        }
    }

    fn decode_long(self, bytes: &[u8]) -> Option<i64> {
        match self {
            NumericDecoder::Int16 => Some(i64::from(i16::from_be_bytes(bytes.try_into().ok()?))),
            NumericDecoder::Uint16 => Some(i64::from(u16::from_be_bytes(bytes.try_into().ok()?))),
            NumericDecoder::Int32 => Some(i64::from(i32::from_be_bytes(bytes.try_into().ok()?))),
            NumericDecoder::Uint32 => Some(i64::from(u32::from_be_bytes(bytes.try_into().ok()?))),
            NumericDecoder::Int64 => Some(i64::from_be_bytes(bytes.try_into().ok()?)),
            NumericDecoder::Uint64 => i64::try_from(u64::from_be_bytes(bytes.try_into().ok()?)).ok(),
            NumericDecoder::Ieee754_32 | NumericDecoder::Ieee754_64 => None,
        }
    }

    fn decode_double(self, bytes: &[u8]) -> Option<f64> {
        match self {
            NumericDecoder::Ieee754_32 => Some(f64::from(f32::from_be_bytes(bytes.try_into().ok()?))),
            NumericDecoder::Ieee754_64 => Some(f64::from_be_bytes(bytes.try_into().ok()?)),
            _ => self.decode_long(bytes).map(|value| value as f64),
        }
    }
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `*` (also implicit, as in `5(3)`)
    Multiply,
    /// `/`, always a double
    Divide,
    /// `^`
    Power,
}

impl BinaryOp {
    /// Name used when wrapping problems.
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "Add",
            BinaryOp::Subtract => "Subtract",
            BinaryOp::Multiply => "Multiply",
            BinaryOp::Divide => "Divide",
            BinaryOp::Power => "Power",
        }
    }

    /// The operator symbol.
    pub fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Subtract => '-',
            BinaryOp::Multiply => '*',
            BinaryOp::Divide => '/',
            BinaryOp::Power => '^',
        }
    }
}

/// What can be promised about the sign of a value before evaluating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueGuarantee {
    /// Nothing is known.
    None,
    /// Always 0 or higher.
    Positive,
    /// Always below 0.
    Negative,
}

/// An expression producing a number.
#[derive(Debug, Clone, PartialEq)]
pub enum NumberExpr {
    /// An integer constant.
    Long(i64),
    /// A floating point constant.
    Double(f64),
    /// A fixed width value decoded from registers.
    Decode {
        /// Which decoder.
        decoder: NumericDecoder,
        /// Where the bytes come from.
        registers: RegistersExpr,
        /// Patterns that mean "no value".
        not_implemented: NotImplemented,
    },
    /// Arithmetic on two numbers.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<NumberExpr>,
        /// Right operand.
        right: Box<NumberExpr>,
    },
    /// The value of another numeric field.
    Field(FieldRef),
}

impl NumberExpr {
    /// Builds a decoder node.
    pub fn decode(
        decoder: NumericDecoder,
        registers: RegistersExpr,
        not_implemented: NotImplemented,
    ) -> Self {
        NumberExpr::Decode {
            decoder,
            registers,
            not_implemented,
        }
    }

    /// Builds an arithmetic node.
    pub fn binary(op: BinaryOp, left: NumberExpr, right: NumberExpr) -> Self {
        NumberExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// [`ReturnType::Long`] or [`ReturnType::Double`]; an unresolved field is
    /// [`ReturnType::Unknown`].
    ///
    /// Add, subtract and multiply stay integral when both sides are. Divide is
    /// always a double. Power is integral only for an integral base and an
    /// exponent that is known not to be negative.
    pub fn return_type(&self) -> ReturnType {
        match self {
            NumberExpr::Long(_) => ReturnType::Long,
            NumberExpr::Double(_) => ReturnType::Double,
            NumberExpr::Decode { decoder, .. } => decoder.return_type(),
            NumberExpr::Binary { op, left, right } => {
                let both_long = left.return_type() == ReturnType::Long
                    && right.return_type() == ReturnType::Long;
                let long = match op {
                    BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply => both_long,
                    BinaryOp::Divide => false,
                    BinaryOp::Power => both_long && right.guarantee() == ValueGuarantee::Positive,
                };
                if long {
                    ReturnType::Long
                } else {
                    ReturnType::Double
                }
            }
            NumberExpr::Field(field) => match field.return_type() {
                ReturnType::Long => ReturnType::Long,
                ReturnType::Double => ReturnType::Double,
                _ => ReturnType::Unknown,
            },
        }
    }

    /// The sign guarantee; only constants and arithmetic on them give one.
    pub fn guarantee(&self) -> ValueGuarantee {
        use ValueGuarantee::{Negative, None, Positive};
        match self {
            NumberExpr::Long(value) if *value >= 0 => Positive,
            NumberExpr::Long(_) => Negative,
            NumberExpr::Double(value) if *value >= 0.0 => Positive,
            NumberExpr::Double(value) if *value < 0.0 => Negative,
            NumberExpr::Binary { op, left, right } => {
                match (op, left.guarantee(), right.guarantee()) {
                    (BinaryOp::Add, Positive, Positive) => Positive,
                    (BinaryOp::Add, Negative, Negative) => Negative,
                    (BinaryOp::Subtract, Positive, Negative) => Positive,
                    (BinaryOp::Subtract, Negative, Positive) => Negative,
                    (BinaryOp::Multiply | BinaryOp::Divide, Positive, Positive)
                    | (BinaryOp::Multiply | BinaryOp::Divide, Negative, Negative) => Positive,
                    (BinaryOp::Multiply | BinaryOp::Divide, Positive, Negative)
                    | (BinaryOp::Multiply | BinaryOp::Divide, Negative, Positive) => Negative,
                    (BinaryOp::Power, Positive, Positive | Negative) => Positive,
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Validation findings for this node and the nodes below it.
    pub fn problems(&self) -> Vec<Problem> {
        match self {
            NumberExpr::Long(_) => Vec::new(),
            NumberExpr::Double(value) => check_fatal(value.is_finite(), || {
                format!("Double constant {value} is not finite")
            }),
            NumberExpr::Decode {
                decoder,
                registers,
                not_implemented,
            } => {
                let need = decoder.registers();
                let got = registers.returned_registers();
                combine(
                    decoder.name(),
                    [
                        registers.problems(),
                        not_implemented.problems(need),
                        check_fatal(got == need, || {
                            format!("Wrong number of registers: Got {got}, need {need}")
                        }),
                    ],
                )
            }
            NumberExpr::Binary { op, left, right } => {
                combine(op.name(), [left.problems(), right.problems()])
            }
            NumberExpr::Field(field) => field.problems(),
        }
    }

    /// The integral value, if this expression has one.
    pub fn as_long(&self, context: &dyn EvaluationContext) -> Option<i64> {
        match self {
            NumberExpr::Long(value) => Some(*value),
            NumberExpr::Double(_) => None,
            NumberExpr::Decode {
                decoder,
                registers,
                not_implemented,
            } => {
                let bytes = registers.bytes(context)?;
                if not_implemented.matches(&bytes) {
                    return None;
                }
                decoder.decode_long(&bytes)
            }
            NumberExpr::Binary { op, left, right } => match op {
                BinaryOp::Add => left.as_long(context)?.checked_add(right.as_long(context)?),
                BinaryOp::Subtract => left.as_long(context)?.checked_sub(right.as_long(context)?),
                BinaryOp::Multiply => left.as_long(context)?.checked_mul(right.as_long(context)?),
                BinaryOp::Divide => None,
                BinaryOp::Power => {
                    if self.return_type() != ReturnType::Long {
                        return None;
                    }
                    let base = left.as_long(context)?;
                    let exponent = u32::try_from(right.as_long(context)?).ok()?;
                    base.checked_pow(exponent)
                }
            },
            NumberExpr::Field(field) => match field.value(context)? {
                FieldValue::Long(value) => Some(value),
                _ => None,
            },
        }
    }

    /// The value as a double. Integral values are converted.
    pub fn as_double(&self, context: &dyn EvaluationContext) -> Option<f64> {
        match self {
            NumberExpr::Long(value) => Some(*value as f64),
            NumberExpr::Double(value) => Some(*value),
            NumberExpr::Decode {
                decoder,
                registers,
                not_implemented,
            } => {
                let bytes = registers.bytes(context)?;
                if not_implemented.matches(&bytes) {
                    return None;
                }
                decoder.decode_double(&bytes)
            }
            NumberExpr::Binary { op, left, right } => {
                let left = validated(left.as_double(context))?;
                let right = validated(right.as_double(context))?;
                let result = match op {
                    BinaryOp::Add => left + right,
                    BinaryOp::Subtract => left - right,
                    BinaryOp::Multiply => left * right,
                    BinaryOp::Divide => left / right,
                    BinaryOp::Power => left.powf(right),
                };
                validated(Some(result))
            }
            NumberExpr::Field(field) => match field.value(context)? {
                FieldValue::Long(value) => Some(value as f64),
                FieldValue::Double(value) => Some(value),
                _ => None,
            },
        }
    }

    /// The value in the shape of [`NumberExpr::return_type`].
    pub fn evaluate(&self, context: &dyn EvaluationContext) -> Option<FieldValue> {
        match self.return_type() {
            ReturnType::Long => self.as_long(context).map(FieldValue::Long),
            _ => self.as_double(context).map(FieldValue::Double),
        }
    }

    pub(crate) fn field_refs_mut<'a>(&'a mut self, out: &mut Vec<&'a mut FieldRef>) {
        match self {
            NumberExpr::Binary { left, right, .. } => {
                left.field_refs_mut(out);
                right.field_refs_mut(out);
            }
            NumberExpr::Field(field) => out.push(field),
            _ => {}
        }
    }

    /// Nested arithmetic is wrapped in parentheses; the outermost is not.
    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, top: bool) -> fmt::Result {
        match self {
            NumberExpr::Long(value) => write!(f, "{value}"),
            NumberExpr::Double(value) => f.write_str(&format_double_constant(*value)),
            NumberExpr::Decode {
                decoder,
                registers,
                not_implemented,
            } => write!(f, "{}({registers}{not_implemented})", decoder.name()),
            NumberExpr::Binary { op, left, right } => {
                if !top {
                    f.write_str("(")?;
                }
                left.fmt_nested(f, false)?;
                write!(f, "{}", op.symbol())?;
                right.fmt_nested(f, false)?;
                if !top {
                    f.write_str(")")?;
                }
                Ok(())
            }
            NumberExpr::Field(field) => write!(f, "{field}"),
        }
    }
}

fn validated(value: Option<f64>) -> Option<f64> {
    value.filter(|value| value.is_finite())
}

impl fmt::Display for NumberExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_nested(f, true)
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

    fn decode(decoder: NumericDecoder, count: u16) -> NumberExpr {
        NumberExpr::decode(decoder, regs(0, count), NotImplemented::none())
    }

    #[test]
    fn test_integer_decoders() {
        let context = TestContext::registers(hr(0), "4996 02D2");
        assert_eq!(decode(NumericDecoder::Int32, 2).as_long(&context), Some(1_234_567_890));
        assert_eq!(decode(NumericDecoder::Uint32, 2).as_long(&context), Some(1_234_567_890));
        assert_eq!(decode(NumericDecoder::Int16, 1).as_long(&context), Some(0x4996));

        let negative = TestContext::registers(hr(0), "FFFE FFFF FFFF FFFF");
        assert_eq!(decode(NumericDecoder::Int16, 1).as_long(&negative), Some(-2));
        assert_eq!(decode(NumericDecoder::Uint16, 1).as_long(&negative), Some(65534));
        assert_eq!(decode(NumericDecoder::Int32, 2).as_long(&negative), Some(-65537));
        assert_eq!(decode(NumericDecoder::Uint32, 2).as_long(&negative), Some(0xFFFE_FFFF));
        assert_eq!(decode(NumericDecoder::Int64, 4).as_long(&negative), Some(-281_474_976_710_657));
        assert_eq!(decode(NumericDecoder::Uint64, 4).as_long(&negative), None);

        let big = TestContext::registers(hr(0), "7FFF FFFF FFFF FFFF");
        assert_eq!(decode(NumericDecoder::Uint64, 4).as_long(&big), Some(i64::MAX));
    }

    #[test]
    fn test_float_decoders() {
        let context = TestContext::registers(hr(0), "449A 5225");
        let value = decode(NumericDecoder::Ieee754_32, 2).as_double(&context).unwrap();
        assert!((value - 1234.567).abs() < 0.001);
        assert_eq!(decode(NumericDecoder::Ieee754_32, 2).as_long(&context), None);
        assert_eq!(
            decode(NumericDecoder::Ieee754_32, 2).return_type(),
            ReturnType::Double
        );

        let double = TestContext::registers(hr(0), "4093 4A45 6D5C FAAD");
        let value = decode(NumericDecoder::Ieee754_64, 4).as_double(&double).unwrap();
        assert!((value - 1234.5678).abs() < 1e-9);
    }

    #[test]
    fn test_not_implemented_and_absent() {
        let context = TestContext::registers(hr(0), "8000 ----");
        let guarded = NumberExpr::decode(
            NumericDecoder::Int16,
            regs(0, 1),
            NotImplemented::new(vec![vec![0x8000]]),
        );
        assert_eq!(guarded.as_long(&context), None);
        assert!(guarded.problems().is_empty());
        assert_eq!(decode(NumericDecoder::Int16, 1).as_long(&context), Some(-32768));
        assert_eq!(decode(NumericDecoder::Int32, 2).as_long(&context), None);
    }

    #[test]
    fn test_wrong_register_count_is_fatal() {
        let context = TestContext::registers(hr(0), "0001 0002 0003");
        let wrong = decode(NumericDecoder::Int32, 3);
        let problems = wrong.problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].is_fatal());
        assert_eq!(
            problems[0].explain(),
            "int32(Wrong number of registers: Got 3, need 2)"
        );
        assert_eq!(wrong.as_long(&context), None);

        let sentinel = NumberExpr::decode(
            NumericDecoder::Int32,
            regs(0, 2),
            NotImplemented::new(vec![vec![0x8000]]),
        );
        assert_eq!(
            sentinel.problems()[0].explain(),
            "int32(NotImplemented(Wrong number of registers: Got 1, need 2))"
        );
    }

    #[test]
    fn test_arithmetic_types() {
        let long = || NumberExpr::Long(4);
        let double = || NumberExpr::Double(0.5);
        let add = NumberExpr::binary(BinaryOp::Add, long(), long());
        assert_eq!(add.return_type(), ReturnType::Long);
        let mixed = NumberExpr::binary(BinaryOp::Multiply, long(), double());
        assert_eq!(mixed.return_type(), ReturnType::Double);
        let divide = NumberExpr::binary(BinaryOp::Divide, long(), long());
        assert_eq!(divide.return_type(), ReturnType::Double);
        let power = NumberExpr::binary(BinaryOp::Power, long(), long());
        assert_eq!(power.return_type(), ReturnType::Long);
        let negative_power = NumberExpr::binary(BinaryOp::Power, long(), NumberExpr::Long(-1));
        assert_eq!(negative_power.return_type(), ReturnType::Double);
        let unknown_power = NumberExpr::binary(BinaryOp::Power, long(), decode(NumericDecoder::Int16, 1));
        assert_eq!(unknown_power.return_type(), ReturnType::Double);
    }

    #[test]
    fn test_arithmetic_values() {
        let context = TestContext::empty();
        let ten = || NumberExpr::Long(10);
        let three = || NumberExpr::Long(3);
        let eval = |expr: NumberExpr| expr.evaluate(&context);

        assert_eq!(eval(NumberExpr::binary(BinaryOp::Add, ten(), three())), Some(FieldValue::Long(13)));
        assert_eq!(eval(NumberExpr::binary(BinaryOp::Subtract, ten(), three())), Some(FieldValue::Long(7)));
        assert_eq!(eval(NumberExpr::binary(BinaryOp::Multiply, ten(), three())), Some(FieldValue::Long(30)));
        assert_eq!(eval(NumberExpr::binary(BinaryOp::Power, ten(), three())), Some(FieldValue::Long(1000)));
        assert_eq!(
            eval(NumberExpr::binary(BinaryOp::Divide, NumberExpr::Long(9), NumberExpr::Long(2))),
            Some(FieldValue::Double(4.5))
        );
        assert_eq!(
            eval(NumberExpr::binary(BinaryOp::Power, ten(), NumberExpr::Long(-3))),
            Some(FieldValue::Double(0.001))
        );
        assert_eq!(
            eval(NumberExpr::binary(BinaryOp::Divide, ten(), NumberExpr::Long(0))),
            None
        );
        assert_eq!(
            eval(NumberExpr::binary(BinaryOp::Add, NumberExpr::Long(i64::MAX), NumberExpr::Long(1))),
            None
        );

        // Integral powers are exact, or absent when they do not fit.
        assert_eq!(
            eval(NumberExpr::binary(BinaryOp::Power, NumberExpr::Long(3), NumberExpr::Long(35))),
            Some(FieldValue::Long(50_031_545_098_999_707))
        );
        assert_eq!(
            eval(NumberExpr::binary(BinaryOp::Power, ten(), NumberExpr::Long(19))),
            None
        );
        assert_eq!(
            eval(NumberExpr::binary(BinaryOp::Power, NumberExpr::Long(-2), NumberExpr::Long(63))),
            Some(FieldValue::Long(i64::MIN))
        );
    }

    #[test]
    fn test_absent_operand() {
        let context = TestContext::registers(hr(0), "----");
        let expr = NumberExpr::binary(BinaryOp::Add, decode(NumericDecoder::Int16, 1), NumberExpr::Long(1));
        assert_eq!(expr.evaluate(&context), None);
    }

    #[test]
    fn test_guarantees() {
        use ValueGuarantee::{Negative, None, Positive};
        let pos = || NumberExpr::Long(2);
        let neg = || NumberExpr::Long(-2);
        assert_eq!(pos().guarantee(), Positive);
        assert_eq!(NumberExpr::Double(-0.5).guarantee(), Negative);
        assert_eq!(NumberExpr::binary(BinaryOp::Add, pos(), pos()).guarantee(), Positive);
        assert_eq!(NumberExpr::binary(BinaryOp::Add, pos(), neg()).guarantee(), None);
        assert_eq!(NumberExpr::binary(BinaryOp::Subtract, neg(), pos()).guarantee(), Negative);
        assert_eq!(NumberExpr::binary(BinaryOp::Multiply, neg(), neg()).guarantee(), Positive);
        assert_eq!(NumberExpr::binary(BinaryOp::Divide, pos(), neg()).guarantee(), Negative);
        assert_eq!(NumberExpr::binary(BinaryOp::Power, pos(), neg()).guarantee(), Positive);
        assert_eq!(NumberExpr::binary(BinaryOp::Power, neg(), pos()).guarantee(), None);
        assert_eq!(decode(NumericDecoder::Uint16, 1).guarantee(), None);
    }

    #[test]
    fn test_display() {
        let expr = NumberExpr::binary(
            BinaryOp::Multiply,
            NumberExpr::binary(BinaryOp::Divide, NumberExpr::Long(12), NumberExpr::Long(3)),
            NumberExpr::Long(4),
        );
        assert_eq!(expr.to_string(), "(12/3)*4");
        assert_eq!(NumberExpr::Double(5.0).to_string(), "5.0");
        let guarded = NumberExpr::decode(
            NumericDecoder::Int32,
            regs(0, 2),
            NotImplemented::new(vec![vec![0xDEAD, 0xDEAD]]),
        );
        assert_eq!(guarded.to_string(), "int32(hr:00000 # 2 ; 0xDEAD 0xDEAD)");
        assert_eq!(NumericDecoder::from_name("ieee754_64"), Some(NumericDecoder::Ieee754_64));
        assert_eq!(NumericDecoder::from_name("float"), None);
    }

    #[test]
    fn test_non_finite_constant_is_fatal() {
        assert!(NumberExpr::Double(f64::NAN).problems()[0].is_fatal());
        assert!(NumberExpr::Double(1.5).problems().is_empty());
    }
}
