//! Booleans and bitsets.
//!
//! Bits are numbered from the least significant bit of the last register:
//! in `0x0001 0x8000` bit 15 and bit 16 are set.

use std::collections::BTreeMap;
use std::fmt;

use super::not_implemented::NotImplemented;
use super::problem::{check_fatal, combine, Problem};
use super::registers::RegistersExpr;
use super::strings::guarded_bytes;
use super::{EvaluationContext, FieldRef, FieldValue, ReturnType};
use crate::address::{Address, AddressKind};
use crate::utils::bytes_to_u64;

const MAX_BITSET_REGISTERS: usize = 4;

fn bitset_width_problem(got: usize) -> Vec<Problem> {
    check_fatal((1..=MAX_BITSET_REGISTERS).contains(&got), || {
        format!("Must have 1 to {MAX_BITSET_REGISTERS} registers (got {got})")
    })
}

fn bitset_value(
    registers: &RegistersExpr,
    not_implemented: &NotImplemented,
    context: &dyn EvaluationContext,
) -> Option<(u64, u32)> {
    let bytes = guarded_bytes(registers, not_implemented, context)?;
    if bytes.is_empty() || bytes.len() > MAX_BITSET_REGISTERS * 2 {
        return None;
    }
    let bits = u32::try_from(bytes.len() * 8).ok()?;
    Some((bytes_to_u64(&bytes), bits))
}

/// An expression producing a boolean.
#[derive(Debug, Clone, PartialEq)]
pub enum BooleanExpr {
    /// `true` or `false`.
    Constant(bool),
    /// A coil or discrete input.
    Discrete(Address),
    /// One bit of 1 to 4 registers.
    BitsetBit {
        /// The registers.
        registers: RegistersExpr,
        /// Patterns that mean "no value".
        not_implemented: NotImplemented,
        /// The bit number.
        bit: u32,
    },
    /// The value of another boolean field.
    Field(FieldRef),
}

impl BooleanExpr {
    /// Always [`ReturnType::Boolean`].
    pub fn return_type(&self) -> ReturnType {
        ReturnType::Boolean
    }

    /// Validation findings for this node and the nodes below it.
    pub fn problems(&self) -> Vec<Problem> {
        match self {
            BooleanExpr::Constant(_) => Vec::new(),
            BooleanExpr::Discrete(address) => combine(
                "boolean",
                [check_fatal(
                    address.class().kind() == AddressKind::Discrete,
                    || format!("Address {address} is not a discrete"),
                )],
            ),
            BooleanExpr::BitsetBit {
                registers,
                not_implemented,
                bit,
            } => {
                let got = registers.returned_registers();
                let max = u32::try_from(got * 16).unwrap_or(u32::MAX);
                combine(
                    "bitsetbit",
                    [
                        bitset_width_problem(got),
                        registers.problems(),
                        check_fatal(*bit < max, || {
                            format!(
                                "The requested bitNr {bit} is larger than the maximum of {}",
                                max.saturating_sub(1)
                            )
                        }),
                        not_implemented.problems(got),
                    ],
                )
            }
            BooleanExpr::Field(field) => field.problems(),
        }
    }

    /// The value, or `None` when a needed value is absent.
    pub fn evaluate(&self, context: &dyn EvaluationContext) -> Option<bool> {
        match self {
            BooleanExpr::Constant(value) => Some(*value),
            BooleanExpr::Discrete(address) => context.discrete(*address)?.value(),
            BooleanExpr::BitsetBit {
                registers,
                not_implemented,
                bit,
            } => {
                let (value, bits) = bitset_value(registers, not_implemented, context)?;
                (*bit < bits).then_some((value >> bit) & 1 == 1)
            }
            BooleanExpr::Field(field) => match field.value(context)? {
                FieldValue::Boolean(value) => Some(value),
                _ => None,
            },
        }
    }

    pub(crate) fn field_refs_mut<'a>(&'a mut self, out: &mut Vec<&'a mut FieldRef>) {
        if let BooleanExpr::Field(field) = self {
            out.push(field);
        }
    }
}

impl fmt::Display for BooleanExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BooleanExpr::Constant(value) => write!(f, "{value}"),
            BooleanExpr::Discrete(address) => write!(f, "boolean({address})"),
            BooleanExpr::BitsetBit {
                registers,
                not_implemented,
                bit,
            } => write!(f, "bitsetbit({registers}{not_implemented} ; {bit})"),
            BooleanExpr::Field(field) => write!(f, "{field}"),
        }
    }
}

/// An expression producing a list of strings.
#[derive(Debug, Clone, PartialEq)]
pub enum StringListExpr {
    /// The names of the set bits of 1 to 4 registers, lowest bit first.
    /// Unnamed bits are reported as `Bit N`.
    Bitset {
        /// The registers.
        registers: RegistersExpr,
        /// Patterns that mean "no value".
        not_implemented: NotImplemented,
        /// Bit number to name.
        mapping: BTreeMap<u32, String>,
    },
}

impl StringListExpr {
    /// Always [`ReturnType::StringList`].
    pub fn return_type(&self) -> ReturnType {
        ReturnType::StringList
    }

    /// The registers read by this expression.
    pub fn registers(&self) -> &RegistersExpr {
        match self {
            StringListExpr::Bitset { registers, .. } => registers,
        }
    }

    /// Validation findings for this node and the nodes below it.
    pub fn problems(&self) -> Vec<Problem> {
        match self {
            StringListExpr::Bitset {
                registers,
                not_implemented,
                ..
            } => {
                let got = registers.returned_registers();
                combine(
                    "bitset",
                    [
                        bitset_width_problem(got),
                        registers.problems(),
                        not_implemented.problems(got),
                    ],
                )
            }
        }
    }

    /// The names of the set bits.
    pub fn evaluate(&self, context: &dyn EvaluationContext) -> Option<Vec<String>> {
        match self {
            StringListExpr::Bitset {
                registers,
                not_implemented,
                mapping,
            } => {
                let (value, bits) = bitset_value(registers, not_implemented, context)?;
                Some(
                    (0..bits)
                        .filter(|bit| (value >> bit) & 1 == 1)
                        .map(|bit| {
                            mapping
                                .get(&bit)
                                .cloned()
                                .unwrap_or_else(|| format!("Bit {bit}"))
                        })
                        .collect(),
                )
            }
        }
    }
}

impl fmt::Display for StringListExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StringListExpr::Bitset {
                registers,
                not_implemented,
                mapping,
            } => {
                write!(f, "bitset({registers}{not_implemented}")?;
                for (bit, name) in mapping {
                    write!(f, " ; {bit}->'{name}'")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::TestContext;
    use super::*;
    use crate::address::AddressClass;

    fn hr(physical: u16) -> Address {
        Address::new(AddressClass::HoldingRegister, physical)
    }

    fn regs(first: u16, count: u16) -> RegistersExpr {
        RegistersExpr::Modbus((first..first + count).map(hr).collect())
    }

    fn bit(count: u16, bit: u32) -> BooleanExpr {
        BooleanExpr::BitsetBit {
            registers: regs(0, count),
            not_implemented: NotImplemented::none(),
            bit,
        }
    }

    #[test]
    fn test_bitset_bit() {
        let context = TestContext::registers(hr(0), "0001 8000");
        assert_eq!(bit(2, 15).evaluate(&context), Some(true));
        assert_eq!(bit(2, 16).evaluate(&context), Some(true));
        assert_eq!(bit(2, 0).evaluate(&context), Some(false));
        assert_eq!(bit(1, 0).evaluate(&context), Some(true));
        assert_eq!(bit(2, 15).to_string(), "bitsetbit(hr:00000 # 2 ; 15)");
    }

    #[test]
    fn test_bitset_bit_out_of_range() {
        let problems = bit(1, 16).problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].is_fatal());
        assert_eq!(
            problems[0].explain(),
            "bitsetbit(The requested bitNr 16 is larger than the maximum of 15)"
        );
        assert!(!bit(5, 1).problems().is_empty());
        assert!(bit(4, 63).problems().is_empty());
    }

    #[test]
    fn test_discrete() {
        let coil = Address::new(AddressClass::Coil, 3);
        let context = TestContext::empty().with_discretes(Address::new(AddressClass::Coil, 0), "0001");
        let expr = BooleanExpr::Discrete(coil);
        assert_eq!(expr.evaluate(&context), Some(true));
        assert_eq!(expr.to_string(), "boolean(c:00003)");
        assert!(expr.problems().is_empty());
        assert_eq!(BooleanExpr::Discrete(Address::new(AddressClass::Coil, 9)).evaluate(&context), None);

        let wrong = BooleanExpr::Discrete(hr(0)).problems();
        assert_eq!(wrong[0].explain(), "boolean(Address hr:00000 is not a discrete)");
    }

    #[test]
    fn test_bitset_names() {
        let context = TestContext::registers(hr(0), "0000 0013");
        let bitset = StringListExpr::Bitset {
            registers: regs(0, 2),
            not_implemented: NotImplemented::none(),
            mapping: BTreeMap::from([(0, "Alarm".to_string()), (1, "Warning".to_string())]),
        };
        assert_eq!(
            bitset.evaluate(&context),
            Some(vec![
                "Alarm".to_string(),
                "Warning".to_string(),
                "Bit 4".to_string()
            ])
        );
        assert_eq!(
            bitset.to_string(),
            "bitset(hr:00000 # 2 ; 0->'Alarm' ; 1->'Warning')"
        );
        assert!(bitset.problems().is_empty());

        let empty = TestContext::registers(hr(0), "0000 0000");
        assert_eq!(bitset.evaluate(&empty), Some(Vec::new()));
        let absent = TestContext::registers(hr(0), "0000");
        assert_eq!(bitset.evaluate(&absent), None);
    }

    #[test]
    fn test_bitset_sentinel() {
        let context = TestContext::registers(hr(0), "FFFF");
        let bitset = StringListExpr::Bitset {
            registers: regs(0, 1),
            not_implemented: NotImplemented::new(vec![vec![0xFFFF]]),
            mapping: BTreeMap::new(),
        };
        assert_eq!(bitset.evaluate(&context), None);
        assert_eq!(bitset.to_string(), "bitset(hr:00000 ; 0xFFFF)");
    }
}
