//! Raw register sources for the decoders.

use std::collections::BTreeSet;
use std::fmt;

use super::problem::{check_fatal, combine, Problem};
use super::EvaluationContext;
use crate::address::{Address, AddressKind};
use crate::device::MODBUS_MAX_REGISTERS_PER_REQUEST;
use crate::utils::{bytes_to_words, words_to_bytes, words_to_hex_string};
use crate::value::{RawModbusValue, RegisterValue};

/// An expression producing raw register bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistersExpr {
    /// Fixed registers, written as `"0x0102 0x0304"`.
    Constant(Vec<u16>),
    /// Registers read from the device, in the listed order.
    Modbus(Vec<Address>),
    /// Swaps the two bytes of each register.
    SwapBytes(Box<RegistersExpr>),
    /// Reverses the 16 bits of each register.
    SwapEndian(Box<RegistersExpr>),
}

impl RegistersExpr {
    /// Number of registers this expression yields.
    pub fn returned_registers(&self) -> usize {
        match self {
            RegistersExpr::Constant(words) => words.len(),
            RegistersExpr::Modbus(addresses) => addresses.len(),
            RegistersExpr::SwapBytes(inner) | RegistersExpr::SwapEndian(inner) => {
                inner.returned_registers()
            }
        }
    }

    /// Addresses read directly by this node (not by nested nodes).
    pub(crate) fn own_addresses(&self) -> &[Address] {
        match self {
            RegistersExpr::Modbus(addresses) => addresses,
            _ => &[],
        }
    }

    pub(crate) fn inner(&self) -> Option<&RegistersExpr> {
        match self {
            RegistersExpr::SwapBytes(inner) | RegistersExpr::SwapEndian(inner) => Some(inner),
            _ => None,
        }
    }

    /// Validation findings for this node and the nodes below it.
    pub fn problems(&self) -> Vec<Problem> {
        match self {
            RegistersExpr::Constant(_) => Vec::new(),
            RegistersExpr::Modbus(addresses) => address_list_problems(addresses),
            RegistersExpr::SwapBytes(inner) => swap_problems("swapbytes", inner),
            RegistersExpr::SwapEndian(inner) => swap_problems("swapendian", inner),
        }
    }

    /// The big-endian bytes, or `None` if any register is absent or unreadable.
    pub fn bytes(&self, context: &dyn EvaluationContext) -> Option<Vec<u8>> {
        match self {
            RegistersExpr::Constant(words) => Some(words_to_bytes(words)),
            RegistersExpr::Modbus(addresses) => {
                let words = addresses
                    .iter()
                    .map(|address| context.register(*address).and_then(RegisterValue::value))
                    .collect::<Option<Vec<u16>>>()?;
                Some(words_to_bytes(&words))
            }
            RegistersExpr::SwapBytes(inner) => {
                let mut bytes = inner.bytes(context)?;
                bytes.chunks_exact_mut(2).for_each(|pair| pair.swap(0, 1));
                Some(bytes)
            }
            RegistersExpr::SwapEndian(inner) => {
                let words: Vec<u16> = bytes_to_words(&inner.bytes(context)?)
                    .into_iter()
                    .map(u16::reverse_bits)
                    .collect();
                Some(words_to_bytes(&words))
            }
        }
    }

    /// The register values read by this node, placeholders for missing ones.
    pub(crate) fn own_values(&self, context: &dyn EvaluationContext) -> Vec<RawModbusValue> {
        self.own_addresses()
            .iter()
            .map(|address| {
                let value = context
                    .register(*address)
                    .cloned()
                    .unwrap_or_else(|| RegisterValue::placeholder(*address));
                RawModbusValue::Register(value)
            })
            .collect()
    }
}

fn swap_problems(function: &str, inner: &RegistersExpr) -> Vec<Problem> {
    let returned = inner.returned_registers();
    combine(
        function,
        [
            inner.problems(),
            check_fatal(returned == 1, || {
                format!("Need exactly 1 register (got {returned})")
            }),
        ],
    )
}

fn format_list(addresses: &[Address]) -> String {
    let listed: Vec<String> = addresses.iter().map(Address::to_string).collect();
    format!("[{}]", listed.join(", "))
}

/// Checks that an address list is one gap free run of registers of a single
/// class, in any order.
fn address_list_problems(addresses: &[Address]) -> Vec<Problem> {
    let Some(first) = addresses.first() else {
        return vec![Problem::fatal("No addresses")];
    };
    if let Some(discrete) = addresses
        .iter()
        .find(|address| address.class().kind() != AddressKind::Register)
    {
        return vec![Problem::fatal(format!(
            "Address {discrete} is not a register: {}",
            format_list(addresses)
        ))];
    }
    if addresses.iter().any(|address| address.class() != first.class()) {
        return vec![Problem::fatal(format!(
            "Mixed address classes: {}",
            format_list(addresses)
        ))];
    }
    let sorted: BTreeSet<Address> = addresses.iter().copied().collect();
    if sorted.len() != addresses.len() {
        return vec![Problem::fatal(format!(
            "Duplicate addresses: {}",
            format_list(addresses)
        ))];
    }
    let contiguous = sorted
        .iter()
        .zip(sorted.iter().skip(1))
        .all(|(a, b)| a.distance(*b) == Some(1));
    if !contiguous {
        return vec![Problem::fatal(format!(
            "Illegal Address range specified: {}",
            format_list(addresses)
        ))];
    }
    let max = usize::from(MODBUS_MAX_REGISTERS_PER_REQUEST);
    check_fatal(addresses.len() <= max, || {
        format!("Too many registers: Got {}, max {max}", addresses.len())
    })
}

/// Consecutive ascending addresses of one class, printable as `first # count`.
fn is_sorted_run(addresses: &[Address]) -> bool {
    addresses
        .windows(2)
        .all(|pair| pair[0].distance(pair[1]) == Some(1))
}

impl fmt::Display for RegistersExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistersExpr::Constant(words) => write!(f, "\"{}\"", words_to_hex_string(words)),
            RegistersExpr::Modbus(addresses) => {
                if is_sorted_run(addresses) && addresses.len() > 1 {
                    write!(f, "{} # {}", addresses[0], addresses.len())
                } else {
                    let listed: Vec<String> = addresses.iter().map(Address::to_string).collect();
                    f.write_str(&listed.join(", "))
                }
            }
            RegistersExpr::SwapBytes(inner) => write!(f, "swapbytes({inner})"),
            RegistersExpr::SwapEndian(inner) => write!(f, "swapendian({inner})"),
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

    fn run(first: u16, count: u16) -> RegistersExpr {
        RegistersExpr::Modbus((first..first + count).map(hr).collect())
    }

    #[test]
    fn test_bytes() {
        let context = TestContext::registers(hr(0), "0102 0304 ----");
        assert_eq!(run(0, 2).bytes(&context), Some(vec![1, 2, 3, 4]));
        assert_eq!(
            RegistersExpr::Modbus(vec![hr(1), hr(0)]).bytes(&context),
            Some(vec![3, 4, 1, 2])
        );
        assert_eq!(run(1, 2).bytes(&context), None);
        assert_eq!(run(5, 1).bytes(&context), None);
        assert_eq!(
            RegistersExpr::Constant(vec![0xABCD]).bytes(&context),
            Some(vec![0xAB, 0xCD])
        );
    }

    #[test]
    fn test_read_error_is_absent() {
        let context = TestContext::registers(hr(0), "0102 xxxx");
        assert_eq!(run(0, 2).bytes(&context), None);
        assert_eq!(run(0, 1).bytes(&context), Some(vec![1, 2]));
    }

    #[test]
    fn test_swaps() {
        let context = TestContext::registers(hr(5), "ABCD");
        let swapped = RegistersExpr::SwapBytes(Box::new(run(5, 1)));
        assert_eq!(swapped.bytes(&context), Some(vec![0xCD, 0xAB]));
        let reversed = RegistersExpr::SwapEndian(Box::new(run(5, 1)));
        assert_eq!(reversed.bytes(&context), Some(vec![0xB3, 0xD5]));
        assert!(swapped.problems().is_empty());
        assert_eq!(swapped.to_string(), "swapbytes(hr:00005)");
    }

    #[test]
    fn test_swap_needs_one_register() {
        let problems = RegistersExpr::SwapEndian(Box::new(run(0, 2))).problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].is_fatal());
        assert_eq!(
            problems[0].explain(),
            "swapendian(Need exactly 1 register (got 2))"
        );
        assert!(!RegistersExpr::SwapBytes(Box::new(run(0, 3)))
            .problems()
            .is_empty());
    }

    #[test]
    fn test_address_list_problems() {
        assert!(run(0, 4).problems().is_empty());
        assert!(RegistersExpr::Modbus(vec![hr(2), hr(0), hr(1)])
            .problems()
            .is_empty());

        let explain = |expr: RegistersExpr| expr.problems()[0].explain().to_string();
        assert_eq!(explain(RegistersExpr::Modbus(vec![])), "No addresses");
        assert_eq!(
            explain(RegistersExpr::Modbus(vec![hr(0), hr(0)])),
            "Duplicate addresses: [hr:00000, hr:00000]"
        );
        assert_eq!(
            explain(RegistersExpr::Modbus(vec![hr(0), hr(2)])),
            "Illegal Address range specified: [hr:00000, hr:00002]"
        );
        assert!(explain(RegistersExpr::Modbus(vec![
            hr(0),
            Address::new(AddressClass::InputRegister, 1)
        ]))
        .starts_with("Mixed address classes"));
        assert!(explain(RegistersExpr::Modbus(vec![Address::new(AddressClass::Coil, 0)]))
            .contains("is not a register"));
        assert!(run(0, 125).problems().is_empty());
        assert!(run(0, 126).problems()[0].is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(run(0, 4).to_string(), "hr:00000 # 4");
        assert_eq!(run(7, 1).to_string(), "hr:00007");
        assert_eq!(
            RegistersExpr::Modbus(vec![hr(1), hr(0)]).to_string(),
            "hr:00001, hr:00000"
        );
        let coils = (0..3).map(|offset| Address::new(AddressClass::Coil, 123 + offset));
        assert_eq!(
            RegistersExpr::Modbus(coils.collect()).to_string(),
            "c:00123 # 3"
        );
        let mixed = vec![hr(0), Address::new(AddressClass::InputRegister, 1)];
        assert_eq!(RegistersExpr::Modbus(mixed).to_string(), "hr:00000, ir:00001");
        assert_eq!(
            RegistersExpr::Constant(vec![0x0102, 0x0304]).to_string(),
            "\"0x0102 0x0304\""
        );
    }

    #[test]
    fn test_returned_registers() {
        assert_eq!(run(0, 3).returned_registers(), 3);
        assert_eq!(RegistersExpr::Constant(vec![1, 2]).returned_registers(), 2);
        let nested = RegistersExpr::SwapBytes(Box::new(run(0, 1)));
        assert_eq!(nested.returned_registers(), 1);
        assert_eq!(nested.own_addresses().len(), 0);
        assert_eq!(nested.inner().map(|inner| inner.own_addresses().len()), Some(1));
    }
}
