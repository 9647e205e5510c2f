//! The cached copy of the device memory, one block per address class.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::address::{Address, AddressClass, AddressKind};
use crate::error::Result;
use crate::expression::EvaluationContext;
use crate::memory::{DiscreteBlock, ModbusBlock, RegisterBlock};
use crate::value::{DiscreteValue, RawValue, ReadErrorState, RegisterValue};

fn block_mut<T: RawValue>(
    blocks: &mut BTreeMap<AddressClass, ModbusBlock<T>>,
    class: AddressClass,
) -> Result<&mut ModbusBlock<T>> {
    Ok(match blocks.entry(class) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(ModbusBlock::new(class)?),
    })
}

/// A snapshot of one slot, independent of its payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotState {
    pub word: Option<u16>,
    pub timestamp: Option<i64>,
    pub read_error: ReadErrorState,
    pub immutable: bool,
}

/// Registers and discretes of every class the schema has touched.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryImage {
    registers: BTreeMap<AddressClass, RegisterBlock>,
    discretes: BTreeMap<AddressClass, DiscreteBlock>,
}

impl MemoryImage {
    pub(crate) fn clear(&mut self) {
        self.registers.clear();
        self.discretes.clear();
    }

    pub(crate) fn register_blocks(&self) -> impl Iterator<Item = &RegisterBlock> + '_ {
        self.registers.values()
    }

    pub(crate) fn discrete_blocks(&self) -> impl Iterator<Item = &DiscreteBlock> + '_ {
        self.discretes.values()
    }

    pub(crate) fn merge_registers(&mut self, block: &RegisterBlock) -> Result<()> {
        block_mut(&mut self.registers, block.class())?.merge(block)
    }

    pub(crate) fn merge_discretes(&mut self, block: &DiscreteBlock) -> Result<()> {
        block_mut(&mut self.discretes, block.class())?.merge(block)
    }

    /// The state of `address`; a never seen address is absent with no error.
    pub(crate) fn slot(&self, address: Address) -> SlotState {
        fn of<T: RawValue>(value: Option<&crate::value::ModbusValue<T>>) -> SlotState {
            match value {
                Some(value) => SlotState {
                    word: value.value().map(RawValue::to_word),
                    timestamp: value.value().map(|_| value.timestamp()),
                    read_error: value.read_error(),
                    immutable: value.immutable,
                },
                None => SlotState {
                    word: None,
                    timestamp: None,
                    read_error: ReadErrorState::None,
                    immutable: false,
                },
            }
        }
        match address.class().kind() {
            AddressKind::Register => of(self.register(address)),
            AddressKind::Discrete => of(self.discrete(address)),
        }
    }

    /// Whether `address` must be fetched again, see
    /// [`crate::ModbusValue::needs_to_be_updated`].
    pub(crate) fn needs_update(&self, address: Address, now_ms: i64, max_age_ms: i64) -> bool {
        match address.class().kind() {
            AddressKind::Register => self
                .register(address)
                .map_or(true, |value| value.needs_to_be_updated(now_ms, max_age_ms)),
            AddressKind::Discrete => self
                .discrete(address)
                .map_or(true, |value| value.needs_to_be_updated(now_ms, max_age_ms)),
        }
    }

    pub(crate) fn is_read_error(&self, address: Address) -> bool {
        self.slot(address).read_error != ReadErrorState::None
    }

    /// Sets the `immutable` flag of `address`, creating the slot when needed.
    pub(crate) fn set_immutable(&mut self, address: Address, immutable: bool) -> Result<()> {
        match address.class().kind() {
            AddressKind::Register => {
                block_mut(&mut self.registers, address.class())?
                    .get_or_insert(address)?
                    .immutable = immutable;
            }
            AddressKind::Discrete => {
                block_mut(&mut self.discretes, address.class())?
                    .get_or_insert(address)?
                    .immutable = immutable;
            }
        }
        Ok(())
    }

    pub(crate) fn clear_soft_read_error(&mut self, address: Address) {
        match address.class().kind() {
            AddressKind::Register => {
                if let Some(value) = self
                    .registers
                    .get_mut(&address.class())
                    .and_then(|block| block.get_mut(address))
                {
                    value.clear_soft_read_error();
                }
            }
            AddressKind::Discrete => {
                if let Some(value) = self
                    .discretes
                    .get_mut(&address.class())
                    .and_then(|block| block.get_mut(address))
                {
                    value.clear_soft_read_error();
                }
            }
        }
    }

    /// Every address of `class` currently marked with a read error.
    pub(crate) fn read_error_addresses(&self, class: AddressClass) -> Vec<Address> {
        match class.kind() {
            AddressKind::Register => self
                .registers
                .get(&class)
                .map(RegisterBlock::read_error_addresses),
            AddressKind::Discrete => self
                .discretes
                .get(&class)
                .map(DiscreteBlock::read_error_addresses),
        }
        .unwrap_or_default()
    }
}

impl EvaluationContext for MemoryImage {
    fn register(&self, address: Address) -> Option<&RegisterValue> {
        self.registers.get(&address.class())?.get_ref(address)
    }

    fn discrete(&self, address: Address) -> Option<&DiscreteValue> {
        self.discretes.get(&address.class())?.get_ref(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hr(physical: u16) -> Address {
        Address::new(AddressClass::HoldingRegister, physical)
    }

    #[test]
    fn test_merge_and_lookup() {
        let mut image = MemoryImage::default();
        let block = RegisterBlock::from_text(hr(10), "0001 xxxx ----").unwrap();
        image.merge_registers(&block).unwrap();

        assert_eq!(image.register(hr(10)).and_then(RegisterValue::value), Some(1));
        assert!(image.is_read_error(hr(11)));
        assert!(!image.is_read_error(hr(12)));
        assert!(image.register(hr(99)).is_none());
        assert_eq!(image.read_error_addresses(AddressClass::HoldingRegister), vec![hr(11)]);
        assert!(image.read_error_addresses(AddressClass::Coil).is_empty());

        image.clear_soft_read_error(hr(11));
        assert!(!image.is_read_error(hr(11)));
    }

    #[test]
    fn test_staleness() {
        let mut image = MemoryImage::default();
        let block = RegisterBlock::from_text(hr(0), "1234").unwrap();
        image.merge_registers(&block).unwrap();
        let loaded = image.slot(hr(0)).timestamp.unwrap();

        assert!(!image.needs_update(hr(0), loaded + 100, 1000));
        assert!(image.needs_update(hr(0), loaded + 5000, 1000));
        assert!(image.needs_update(hr(1), loaded, 1000));

        image.set_immutable(hr(0), true).unwrap();
        assert!(!image.needs_update(hr(0), loaded + 5000, 1000));
        assert!(image.slot(hr(0)).immutable);
    }

    #[test]
    fn test_discretes() {
        let mut image = MemoryImage::default();
        let first = Address::new(AddressClass::Coil, 0);
        image
            .merge_discretes(&DiscreteBlock::from_text(first, "10x").unwrap())
            .unwrap();
        assert_eq!(image.slot(first).word, Some(1));
        assert!(image.is_read_error(Address::new(AddressClass::Coil, 2)));
        assert_eq!(image.discrete_blocks().count(), 1);
        assert_eq!(image.register_blocks().count(), 0);
    }
}
