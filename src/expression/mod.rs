//! Typed expression trees over Modbus registers and discretes.
//!
//! An [`Expression`] describes how one field value is computed: which
//! registers or discretes are read, how their bytes are decoded, and how the
//! results are combined. Every tree has a static [`ReturnType`], reports its
//! own validation [`Problem`]s and knows every address it needs, so a schema
//! can plan reads before anything is evaluated.
//!
//! | Family | Produces | Examples |
//! |--------|----------|----------|
//! | [`NumberExpr`] | [`FieldValue::Long`] or [`FieldValue::Double`] | `int32(hr:0 # 2)`, `(a+b)*10^-3` |
//! | [`StringExpr`] | [`FieldValue::String`] | `utf8(hr:0 # 8)`, `enum(hr:2 ; 0->'Off')` |
//! | [`StringListExpr`] | [`FieldValue::StringList`] | `bitset(hr:3 ; 0->'Alarm')` |
//! | [`BooleanExpr`] | [`FieldValue::Boolean`] | `boolean(c:0)`, `bitsetbit(hr:3 ; 4)` |
//!
//! Evaluation is total: an absent register, a read error, a matching
//! "not implemented" sentinel or an arithmetic failure yields `None`.
//!
//! # Example
//!
//! ```
//! use modbus_schema::expression::{EvaluationContext, NumberExpr, NumericDecoder, NotImplemented, RegistersExpr};
//! use modbus_schema::{Address, AddressClass, DiscreteValue, RegisterBlock, RegisterValue};
//!
//! struct Memory(RegisterBlock);
//!
//! impl EvaluationContext for Memory {
//!     fn register(&self, address: Address) -> Option<&RegisterValue> {
//!         self.0.get_ref(address)
//!     }
//!     fn discrete(&self, _address: Address) -> Option<&DiscreteValue> {
//!         None
//!     }
//! }
//!
//! let first = Address::new(AddressClass::HoldingRegister, 0);
//! let memory = Memory(RegisterBlock::from_text(first, "4996 02D2")?);
//! let expr = NumberExpr::decode(
//!     NumericDecoder::Int32,
//!     RegistersExpr::Modbus(vec![first, first.increment(1)?]),
//!     NotImplemented::none(),
//! );
//! assert_eq!(expr.as_long(&memory), Some(1_234_567_890));
//! assert_eq!(expr.to_string(), "int32(hr:00000 # 2)");
//! # Ok::<(), modbus_schema::ModbusError>(())
//! ```

mod booleans;
mod not_implemented;
mod numbers;
mod problem;
mod registers;
mod strings;

use std::collections::BTreeSet;
use std::fmt;

pub use booleans::{BooleanExpr, StringListExpr};
pub use not_implemented::NotImplemented;
pub use numbers::{BinaryOp, NumberExpr, NumericDecoder, ValueGuarantee};
pub use problem::{Problem, Severity};
pub use registers::RegistersExpr;
pub use strings::StringExpr;

use crate::address::Address;
use crate::utils::format_double;
use crate::value::{DiscreteValue, RawModbusValue, RegisterValue};

/// The static type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReturnType {
    /// Not known yet, for example a reference to an unresolved field.
    Unknown,
    /// `true` or `false`.
    Boolean,
    /// A 64 bit signed integer.
    Long,
    /// A 64 bit float.
    Double,
    /// Text.
    String,
    /// A list of texts.
    StringList,
    /// Raw registers; never the type of a field.
    Registers,
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReturnType::Unknown => "UNKNOWN",
            ReturnType::Boolean => "BOOLEAN",
            ReturnType::Long => "LONG",
            ReturnType::Double => "DOUBLE",
            ReturnType::String => "STRING",
            ReturnType::StringList => "STRINGLIST",
            ReturnType::Registers => "REGISTERS",
        };
        f.write_str(name)
    }
}

/// A computed field value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldValue {
    /// A boolean.
    Boolean(bool),
    /// An integer.
    Long(i64),
    /// A float.
    Double(f64),
    /// Text.
    String(String),
    /// A list of texts.
    StringList(Vec<String>),
}

impl FieldValue {
    /// The matching [`ReturnType`].
    pub fn return_type(&self) -> ReturnType {
        match self {
            FieldValue::Boolean(_) => ReturnType::Boolean,
            FieldValue::Long(_) => ReturnType::Long,
            FieldValue::Double(_) => ReturnType::Double,
            FieldValue::String(_) => ReturnType::String,
            FieldValue::StringList(_) => ReturnType::StringList,
        }
    }

    /// The integer, if this is a [`FieldValue::Long`].
    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Long(value) => Some(*value),
            _ => None,
        }
    }

    /// The number as a double; integers are converted.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            FieldValue::Long(value) => Some(*value as f64),
            FieldValue::Double(value) => Some(*value),
            _ => None,
        }
    }

    /// The boolean, if this is a [`FieldValue::Boolean`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    /// The text, if this is a [`FieldValue::String`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// The list, if this is a [`FieldValue::StringList`].
    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::StringList(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Boolean(value) => write!(f, "{value}"),
            FieldValue::Long(value) => write!(f, "{value}"),
            FieldValue::Double(value) => f.write_str(&format_double(*value)),
            FieldValue::String(value) => f.write_str(value),
            FieldValue::StringList(values) => write!(f, "[{}]", values.join(", ")),
        }
    }
}

/// Where expressions read their inputs from.
///
/// The schema implements this over its memory image; tests implement it over
/// plain blocks.
pub trait EvaluationContext {
    /// The register at `address`, if known.
    fn register(&self, address: Address) -> Option<&RegisterValue>;

    /// The discrete at `address`, if known.
    fn discrete(&self, address: Address) -> Option<&DiscreteValue>;

    /// The current value of the named field.
    fn field_value(&self, _name: &str) -> Option<FieldValue> {
        None
    }
}

/// What a field reference may point at, decided by its position in the
/// expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Inside arithmetic: integer or double fields.
    Number,
    /// Inside a string: string fields, or numbers converted to text.
    String,
    /// Inside a boolean position: boolean fields.
    Boolean,
}

impl ReferenceKind {
    /// Returns `true` if a field of type `return_type` fits here.
    pub fn accepts(self, return_type: ReturnType) -> bool {
        match self {
            ReferenceKind::Number => matches!(return_type, ReturnType::Long | ReturnType::Double),
            ReferenceKind::String => matches!(
                return_type,
                ReturnType::String | ReturnType::Long | ReturnType::Double
            ),
            ReferenceKind::Boolean => return_type == ReturnType::Boolean,
        }
    }
}

/// Resolution state of a [`FieldRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRefState {
    /// Not bound yet.
    Unresolved,
    /// Bound to a field of this type.
    Resolved {
        /// Type of the target field.
        return_type: ReturnType,
        /// Whether the target field never changes once read.
        immutable: bool,
    },
    /// No field with a fitting name and type exists.
    Missing,
}

/// A named reference to another field of the same schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    name: String,
    kind: ReferenceKind,
    state: FieldRefState,
}

impl FieldRef {
    /// Creates an unresolved reference.
    pub fn new(name: impl Into<String>, kind: ReferenceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            state: FieldRefState::Unresolved,
        }
    }

    /// The referenced field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The position kind.
    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    /// The resolution state.
    pub fn state(&self) -> FieldRefState {
        self.state
    }

    /// Binds the reference. Returns `false` and leaves it unresolved when the
    /// target type does not fit.
    pub fn resolve(&mut self, return_type: ReturnType, immutable: bool) -> bool {
        if !self.kind.accepts(return_type) {
            return false;
        }
        self.state = FieldRefState::Resolved {
            return_type,
            immutable,
        };
        true
    }

    /// Marks the reference as pointing nowhere.
    pub fn mark_missing(&mut self) {
        self.state = FieldRefState::Missing;
    }

    /// The target type, [`ReturnType::Unknown`] unless resolved.
    pub fn return_type(&self) -> ReturnType {
        match self.state {
            FieldRefState::Resolved { return_type, .. } => return_type,
            _ => ReturnType::Unknown,
        }
    }

    /// Missing references are immutable: they are always absent.
    pub fn is_immutable(&self) -> bool {
        match self.state {
            FieldRefState::Resolved { immutable, .. } => immutable,
            FieldRefState::Missing => true,
            FieldRefState::Unresolved => false,
        }
    }

    /// A warning when the reference is missing.
    pub fn problems(&self) -> Vec<Problem> {
        match self.state {
            FieldRefState::Missing => vec![Problem::warning(format!(
                "Field {} is missing",
                self.name
            ))],
            _ => Vec::new(),
        }
    }

    /// The current value of the target, only once resolved.
    pub fn value(&self, context: &dyn EvaluationContext) -> Option<FieldValue> {
        match self.state {
            FieldRefState::Resolved { .. } => context.field_value(&self.name),
            _ => None,
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            FieldRefState::Missing => write!(f, "<<MISSING FIELD: {}>>", self.name),
            _ => f.write_str(&self.name),
        }
    }
}

/// A complete, typed field expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// A number.
    Number(NumberExpr),
    /// A string.
    String(StringExpr),
    /// A list of strings.
    StringList(StringListExpr),
    /// A boolean.
    Boolean(BooleanExpr),
}

/// A borrowed node of any expression tree, registers included.
///
/// Used to walk trees generically: addresses, field names, immutability and
/// problems are all aggregated over [`ExpressionRef::sub_expressions`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpressionRef<'a> {
    /// A number node.
    Number(&'a NumberExpr),
    /// A string node.
    String(&'a StringExpr),
    /// A string list node.
    StringList(&'a StringListExpr),
    /// A boolean node.
    Boolean(&'a BooleanExpr),
    /// A registers node.
    Registers(&'a RegistersExpr),
}

impl<'a> ExpressionRef<'a> {
    /// The direct children of this node.
    pub fn sub_expressions(self) -> Vec<ExpressionRef<'a>> {
        match self {
            ExpressionRef::Number(number) => match number {
                NumberExpr::Decode { registers, .. } => vec![ExpressionRef::Registers(registers)],
                NumberExpr::Binary { left, right, .. } => {
                    vec![ExpressionRef::Number(left), ExpressionRef::Number(right)]
                }
                _ => Vec::new(),
            },
            ExpressionRef::String(string) => match string {
                StringExpr::Utf8(registers)
                | StringExpr::Hex(registers)
                | StringExpr::Eui48 { registers, .. }
                | StringExpr::Ipv4 { registers, .. }
                | StringExpr::Ipv6 { registers, .. }
                | StringExpr::Enum { registers, .. } => vec![ExpressionRef::Registers(registers)],
                StringExpr::Concat(parts) => parts.iter().map(ExpressionRef::String).collect(),
                StringExpr::FromNumber(number) => vec![ExpressionRef::Number(number)],
                StringExpr::FromBoolean { boolean, .. } => vec![ExpressionRef::Boolean(boolean)],
                StringExpr::Constant(_) | StringExpr::Field(_) => Vec::new(),
            },
            ExpressionRef::StringList(list) => vec![ExpressionRef::Registers(list.registers())],
            ExpressionRef::Boolean(boolean) => match boolean {
                BooleanExpr::BitsetBit { registers, .. } => {
                    vec![ExpressionRef::Registers(registers)]
                }
                _ => Vec::new(),
            },
            ExpressionRef::Registers(registers) => registers
                .inner()
                .map(ExpressionRef::Registers)
                .into_iter()
                .collect(),
        }
    }

    fn own_addresses(self) -> Vec<Address> {
        match self {
            ExpressionRef::Registers(registers) => registers.own_addresses().to_vec(),
            ExpressionRef::Boolean(BooleanExpr::Discrete(address)) => vec![*address],
            _ => Vec::new(),
        }
    }

    fn field_ref(self) -> Option<&'a FieldRef> {
        match self {
            ExpressionRef::Number(NumberExpr::Field(field))
            | ExpressionRef::String(StringExpr::Field(field))
            | ExpressionRef::Boolean(BooleanExpr::Field(field)) => Some(field),
            _ => None,
        }
    }

    /// Every address read by this node and its children, in tree order,
    /// without duplicates.
    pub fn required_addresses(self) -> Vec<Address> {
        let mut seen = BTreeSet::new();
        let mut addresses = Vec::new();
        self.collect_addresses(&mut seen, &mut addresses);
        addresses
    }

    fn collect_addresses(self, seen: &mut BTreeSet<Address>, out: &mut Vec<Address>) {
        for address in self.own_addresses() {
            if seen.insert(address) {
                out.push(address);
            }
        }
        for child in self.sub_expressions() {
            child.collect_addresses(seen, out);
        }
    }

    /// Names of every field referenced below this node, without duplicates.
    pub fn required_fields(self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_fields(&mut names);
        names
    }

    fn collect_fields(self, out: &mut Vec<String>) {
        if let Some(field) = self.field_ref() {
            if !out.iter().any(|name| name == field.name()) {
                out.push(field.name().to_string());
            }
        }
        for child in self.sub_expressions() {
            child.collect_fields(out);
        }
    }

    /// `true` when the value can never change once it is present: no device
    /// reads and only immutable field references.
    pub fn is_immutable(self) -> bool {
        if !self.own_addresses().is_empty() {
            return false;
        }
        if let Some(field) = self.field_ref() {
            return field.is_immutable();
        }
        self.sub_expressions()
            .into_iter()
            .all(ExpressionRef::is_immutable)
    }

    /// The static type of this node.
    pub fn return_type(self) -> ReturnType {
        match self {
            ExpressionRef::Number(number) => number.return_type(),
            ExpressionRef::String(string) => string.return_type(),
            ExpressionRef::StringList(list) => list.return_type(),
            ExpressionRef::Boolean(boolean) => boolean.return_type(),
            ExpressionRef::Registers(_) => ReturnType::Registers,
        }
    }

    /// Validation findings of this node and everything below it.
    pub fn problems(self) -> Vec<Problem> {
        match self {
            ExpressionRef::Number(number) => number.problems(),
            ExpressionRef::String(string) => string.problems(),
            ExpressionRef::StringList(list) => list.problems(),
            ExpressionRef::Boolean(boolean) => boolean.problems(),
            ExpressionRef::Registers(registers) => registers.problems(),
        }
    }

    /// The raw values this node and its children read, in tree order.
    /// Addresses the context does not know yield empty placeholders.
    pub fn modbus_values(self, context: &dyn EvaluationContext) -> Vec<RawModbusValue> {
        let mut values = match self {
            ExpressionRef::Registers(registers) => registers.own_values(context),
            ExpressionRef::Boolean(BooleanExpr::Discrete(address)) => {
                let value = context
                    .discrete(*address)
                    .cloned()
                    .unwrap_or_else(|| DiscreteValue::placeholder(*address));
                vec![RawModbusValue::Discrete(value)]
            }
            _ => Vec::new(),
        };
        for child in self.sub_expressions() {
            values.extend(child.modbus_values(context));
        }
        values
    }
}

impl fmt::Display for ExpressionRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpressionRef::Number(number) => write!(f, "{number}"),
            ExpressionRef::String(string) => write!(f, "{string}"),
            ExpressionRef::StringList(list) => write!(f, "{list}"),
            ExpressionRef::Boolean(boolean) => write!(f, "{boolean}"),
            ExpressionRef::Registers(registers) => write!(f, "{registers}"),
        }
    }
}

impl Expression {
    /// A borrowed view for generic traversal.
    pub fn root(&self) -> ExpressionRef<'_> {
        match self {
            Expression::Number(number) => ExpressionRef::Number(number),
            Expression::String(string) => ExpressionRef::String(string),
            Expression::StringList(list) => ExpressionRef::StringList(list),
            Expression::Boolean(boolean) => ExpressionRef::Boolean(boolean),
        }
    }

    /// See [`ExpressionRef::return_type`].
    pub fn return_type(&self) -> ReturnType {
        self.root().return_type()
    }

    /// See [`ExpressionRef::problems`].
    pub fn problems(&self) -> Vec<Problem> {
        self.root().problems()
    }

    /// `true` if any problem is fatal.
    pub fn has_fatal_problems(&self) -> bool {
        self.problems().iter().any(Problem::is_fatal)
    }

    /// See [`ExpressionRef::required_addresses`].
    pub fn required_addresses(&self) -> Vec<Address> {
        self.root().required_addresses()
    }

    /// See [`ExpressionRef::required_fields`].
    pub fn required_fields(&self) -> Vec<String> {
        self.root().required_fields()
    }

    /// See [`ExpressionRef::is_immutable`].
    pub fn is_immutable(&self) -> bool {
        self.root().is_immutable()
    }

    /// See [`ExpressionRef::modbus_values`].
    pub fn modbus_values(&self, context: &dyn EvaluationContext) -> Vec<RawModbusValue> {
        self.root().modbus_values(context)
    }

    /// Computes the value, or `None` when anything it needs is absent.
    pub fn evaluate(&self, context: &dyn EvaluationContext) -> Option<FieldValue> {
        match self {
            Expression::Number(number) => number.evaluate(context),
            Expression::String(string) => string.evaluate(context).map(FieldValue::String),
            Expression::StringList(list) => list.evaluate(context).map(FieldValue::StringList),
            Expression::Boolean(boolean) => boolean.evaluate(context).map(FieldValue::Boolean),
        }
    }

    /// Mutable access to every field reference in the tree.
    pub(crate) fn field_refs_mut(&mut self) -> Vec<&mut FieldRef> {
        let mut refs = Vec::new();
        match self {
            Expression::Number(number) => number.field_refs_mut(&mut refs),
            Expression::String(string) => string.field_refs_mut(&mut refs),
            Expression::StringList(_) => {}
            Expression::Boolean(boolean) => boolean.field_refs_mut(&mut refs),
        }
        refs
    }

    /// Binds unresolved references using `lookup`, which returns the type and
    /// immutability of a field that is itself resolved. Returns `true` when
    /// something changed.
    pub(crate) fn resolve_fields<F>(&mut self, mut lookup: F) -> bool
    where
        F: FnMut(&str) -> Option<(ReturnType, bool)>,
    {
        let mut changed = false;
        for field in self.field_refs_mut() {
            if let Some((return_type, immutable)) = lookup(field.name()) {
                let before = field.state();
                if field.resolve(return_type, immutable) && field.state() != before {
                    changed = true;
                }
            }
        }
        changed
    }

    /// Marks every reference that is still unresolved as missing.
    pub(crate) fn mark_unresolved_missing(&mut self) {
        for field in self.field_refs_mut() {
            if field.state() == FieldRefState::Unresolved {
                field.mark_missing();
            }
        }
    }

    /// Turns an expression that is nothing but an unresolved numeric field
    /// reference into a reference of the type of its target, so a field can
    /// alias a string or boolean field. Returns `true` when it was retyped.
    pub(crate) fn retype_alias(&mut self, target: ReturnType) -> bool {
        let Expression::Number(NumberExpr::Field(field)) = self else {
            return false;
        };
        if field.state() != FieldRefState::Unresolved {
            return false;
        }
        let name = field.name().to_string();
        *self = match target {
            ReturnType::String => {
                Expression::String(StringExpr::Field(FieldRef::new(name, ReferenceKind::String)))
            }
            ReturnType::Boolean => Expression::Boolean(BooleanExpr::Field(FieldRef::new(
                name,
                ReferenceKind::Boolean,
            ))),
            _ => return false,
        };
        true
    }

    /// `true` once no reference is [`FieldRefState::Unresolved`].
    pub fn is_resolved(&self) -> bool {
        let mut unresolved = false;
        self.visit_field_refs(&mut |field| {
            unresolved |= field.state() == FieldRefState::Unresolved;
        });
        !unresolved
    }

    fn visit_field_refs(&self, visit: &mut dyn FnMut(&FieldRef)) {
        fn walk(node: ExpressionRef<'_>, visit: &mut dyn FnMut(&FieldRef)) {
            if let Some(field) = node.field_ref() {
                visit(field);
            }
            for child in node.sub_expressions() {
                walk(child, visit);
            }
        }
        walk(self.root(), visit);
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root().fmt(f)
    }
}

impl From<NumberExpr> for Expression {
    fn from(number: NumberExpr) -> Self {
        Expression::Number(number)
    }
}

impl From<StringExpr> for Expression {
    fn from(string: StringExpr) -> Self {
        Expression::String(string)
    }
}

impl From<StringListExpr> for Expression {
    fn from(list: StringListExpr) -> Self {
        Expression::StringList(list)
    }
}

impl From<BooleanExpr> for Expression {
    fn from(boolean: BooleanExpr) -> Self {
        Expression::Boolean(boolean)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::*;
    use crate::address::AddressClass;
    use crate::memory::{DiscreteBlock, RegisterBlock};

    /// Plain blocks plus fixed field values.
    #[derive(Debug, Default)]
    pub(crate) struct TestContext {
        registers: BTreeMap<AddressClass, RegisterBlock>,
        discretes: BTreeMap<AddressClass, DiscreteBlock>,
        fields: HashMap<String, FieldValue>,
    }

    impl TestContext {
        pub(crate) fn empty() -> Self {
            Self::default()
        }

        pub(crate) fn registers(first: Address, text: &str) -> Self {
            Self::empty().with_registers(first, text)
        }

        pub(crate) fn with_registers(mut self, first: Address, text: &str) -> Self {
            let block = RegisterBlock::from_text(first, text).unwrap();
            self.registers.insert(first.class(), block);
            self
        }

        pub(crate) fn with_discretes(mut self, first: Address, text: &str) -> Self {
            let block = DiscreteBlock::from_text(first, text).unwrap();
            self.discretes.insert(first.class(), block);
            self
        }

        pub(crate) fn with_field(mut self, name: &str, value: FieldValue) -> Self {
            self.fields.insert(name.to_string(), value);
            self
        }
    }

    impl EvaluationContext for TestContext {
        fn register(&self, address: Address) -> Option<&RegisterValue> {
            self.registers.get(&address.class())?.get_ref(address)
        }

        fn discrete(&self, address: Address) -> Option<&DiscreteValue> {
            self.discretes.get(&address.class())?.get_ref(address)
        }

        fn field_value(&self, name: &str) -> Option<FieldValue> {
            self.fields.get(name).cloned()
        }
    }

    fn hr(physical: u16) -> Address {
        Address::new(AddressClass::HoldingRegister, physical)
    }

    fn int16(physical: u16) -> NumberExpr {
        NumberExpr::decode(
            NumericDecoder::Int16,
            RegistersExpr::Modbus(vec![hr(physical)]),
            NotImplemented::none(),
        )
    }

    #[test]
    fn test_required_addresses_and_fields() {
        let expr = Expression::Number(NumberExpr::binary(
            BinaryOp::Add,
            int16(3),
            NumberExpr::binary(
                BinaryOp::Multiply,
                int16(1),
                NumberExpr::binary(
                    BinaryOp::Add,
                    int16(3),
                    NumberExpr::Field(FieldRef::new("Factor", ReferenceKind::Number)),
                ),
            ),
        ));
        assert_eq!(expr.required_addresses(), vec![hr(3), hr(1)]);
        assert_eq!(expr.required_fields(), vec!["Factor".to_string()]);
        assert!(!expr.is_immutable());
        assert!(!expr.is_resolved());
    }

    #[test]
    fn test_immutability() {
        let constant = Expression::Number(NumberExpr::binary(
            BinaryOp::Add,
            NumberExpr::Long(1),
            NumberExpr::Double(2.5),
        ));
        assert!(constant.is_immutable());

        let mut reference = FieldRef::new("Serial", ReferenceKind::String);
        assert!(!reference.is_immutable());
        reference.resolve(ReturnType::String, true);
        assert!(Expression::String(StringExpr::Field(reference)).is_immutable());

        let constant_registers = Expression::String(StringExpr::Hex(RegistersExpr::Constant(vec![1])));
        assert!(constant_registers.is_immutable());
    }

    #[test]
    fn test_field_resolution() {
        let mut expr = Expression::Number(NumberExpr::binary(
            BinaryOp::Multiply,
            NumberExpr::Field(FieldRef::new("Value", ReferenceKind::Number)),
            NumberExpr::binary(
                BinaryOp::Power,
                NumberExpr::Long(10),
                NumberExpr::Field(FieldRef::new("Scale", ReferenceKind::Number)),
            ),
        ));
        assert_eq!(expr.return_type(), ReturnType::Double);

        let changed = expr.resolve_fields(|name| match name {
            "Value" => Some((ReturnType::Long, false)),
            "Scale" => Some((ReturnType::String, false)),
            _ => None,
        });
        assert!(changed);
        assert!(!expr.is_resolved());

        expr.mark_unresolved_missing();
        assert!(expr.is_resolved());
        let problems = expr.problems();
        assert_eq!(problems.len(), 1);
        assert!(!problems[0].is_fatal());
        assert_eq!(problems[0].explain(), "Multiply(Power(Field Scale is missing))");

        let context = TestContext::empty()
            .with_field("Value", FieldValue::Long(5))
            .with_field("Scale", FieldValue::Long(2));
        assert_eq!(expr.evaluate(&context), None);
    }

    #[test]
    fn test_evaluate_with_fields() {
        let mut expr = Expression::Number(NumberExpr::binary(
            BinaryOp::Add,
            NumberExpr::Field(FieldRef::new("A", ReferenceKind::Number)),
            NumberExpr::Long(1),
        ));
        assert!(expr.resolve_fields(|_| Some((ReturnType::Long, false))));
        assert!(!expr.resolve_fields(|_| Some((ReturnType::Long, false))));
        assert_eq!(expr.return_type(), ReturnType::Long);
        let context = TestContext::empty().with_field("A", FieldValue::Long(41));
        assert_eq!(expr.evaluate(&context), Some(FieldValue::Long(42)));
        assert_eq!(expr.to_string(), "A+1");
    }

    #[test]
    fn test_modbus_values() {
        let context = TestContext::registers(hr(0), "0001 ----");
        let expr = Expression::Number(NumberExpr::binary(BinaryOp::Add, int16(0), int16(5)));
        let values = expr.modbus_values(&context);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].to_string(), "hr:00000=0001");
        assert_eq!(values[1].address(), hr(5));
    }

    #[test]
    fn test_field_value_display() {
        assert_eq!(FieldValue::Double(1234.5670000001).to_string(), "1234.567");
        assert_eq!(FieldValue::Long(-3).to_string(), "-3");
        assert_eq!(
            FieldValue::StringList(vec!["a".to_string(), "b".to_string()]).to_string(),
            "[a, b]"
        );
        assert_eq!(FieldValue::Long(3).as_double(), Some(3.0));
        assert_eq!(FieldValue::String("x".to_string()).return_type(), ReturnType::String);
    }

    #[test]
    fn test_reference_kinds() {
        assert!(ReferenceKind::String.accepts(ReturnType::Double));
        assert!(!ReferenceKind::Number.accepts(ReturnType::String));
        assert!(!ReferenceKind::Boolean.accepts(ReturnType::Long));
        let mut missing = FieldRef::new("Nope", ReferenceKind::Boolean);
        missing.mark_missing();
        assert!(missing.is_immutable());
        assert_eq!(missing.problems()[0].explain(), "Field Nope is missing");
        assert_eq!(missing.to_string(), "<<MISSING FIELD: Nope>>");
    }
}
