//! A named value of a block, computed by one expression.

use crate::address::Address;
use crate::error::{ModbusError, Result};
use crate::expression::{Expression, Problem, ReturnType};
use crate::parser::parse;

/// Returns `true` for `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn is_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn check_identifier(kind: &str, id: &str) -> Result<()> {
    if is_identifier(id) {
        Ok(())
    } else {
        Err(ModbusError::invalid_parameter(
            kind,
            format!("\"{id}\" is not a valid identifier"),
        ))
    }
}

/// One field of a [`crate::Block`].
///
/// The expression is kept as text until the schema is initialized.
///
/// # Example
///
/// ```
/// use modbus_schema::Field;
///
/// let field = Field::new("Voltage", "int16(hr:0) / 10")?
///     .with_description("Line voltage")
///     .with_unit("V");
/// assert_eq!(field.id(), "Voltage");
/// assert_eq!(field.expression_text(), "int16(hr:0) / 10");
/// # Ok::<(), modbus_schema::ModbusError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Field {
    id: String,
    description: String,
    unit: String,
    immutable: bool,
    system: bool,
    fetch_group: Option<String>,
    expression_text: String,
    expression: Option<Expression>,
}

impl Field {
    /// Creates a field from its id and expression text.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidParameter` if `id` is not an identifier.
    pub fn new(id: impl Into<String>, expression: impl Into<String>) -> Result<Self> {
        let id = id.into();
        check_identifier("field id", &id)?;
        Ok(Self {
            id,
            description: String::new(),
            unit: String::new(),
            immutable: false,
            system: false,
            fetch_group: None,
            expression_text: expression.into(),
            expression: None,
        })
    }

    /// Sets the human readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the unit shown next to the value.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Declares that the value never changes once read (a serial number,
    /// a firmware version).
    pub fn with_immutable(mut self, immutable: bool) -> Self {
        self.immutable = immutable;
        self
    }

    /// Marks a helper field that only exists to compute other fields.
    pub fn with_system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }

    /// Puts the field in a named fetch group: all addresses of all fields
    /// in a group are always read together.
    pub fn with_fetch_group(mut self, fetch_group: impl Into<String>) -> Self {
        self.fetch_group = Some(fetch_group.into());
        self
    }

    /// The field id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The unit.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// `true` for helper fields.
    pub fn is_system(&self) -> bool {
        self.system
    }

    /// The explicit fetch group, if any.
    pub fn fetch_group(&self) -> Option<&str> {
        self.fetch_group.as_deref()
    }

    /// The expression as written.
    pub fn expression_text(&self) -> &str {
        &self.expression_text
    }

    /// The parsed expression, once the schema is initialized.
    pub fn expression(&self) -> Option<&Expression> {
        self.expression.as_ref()
    }

    pub(crate) fn expression_mut(&mut self) -> Option<&mut Expression> {
        self.expression.as_mut()
    }

    /// Declared immutable, or computed only from constants and immutable
    /// fields.
    pub fn is_immutable(&self) -> bool {
        self.immutable || self.expression.as_ref().is_some_and(Expression::is_immutable)
    }

    /// The type of the value; [`ReturnType::Unknown`] before initialization.
    pub fn return_type(&self) -> ReturnType {
        self.expression
            .as_ref()
            .map_or(ReturnType::Unknown, Expression::return_type)
    }

    /// The device addresses read by the expression itself.
    pub fn required_addresses(&self) -> Vec<Address> {
        self.expression
            .as_ref()
            .map(Expression::required_addresses)
            .unwrap_or_default()
    }

    /// The names of the fields the expression refers to.
    pub fn required_fields(&self) -> Vec<String> {
        self.expression
            .as_ref()
            .map(Expression::required_fields)
            .unwrap_or_default()
    }

    /// Problems found in the expression.
    pub fn problems(&self) -> Vec<Problem> {
        self.expression
            .as_ref()
            .map(Expression::problems)
            .unwrap_or_default()
    }

    /// Parses the expression text, replacing any earlier result.
    pub(crate) fn parse(&mut self, block: &str) -> Result<()> {
        let expression = parse(&self.expression_text).map_err(|error| match error {
            ModbusError::Parse { expression, reason } => {
                ModbusError::parse(expression, format!("{reason} (in {block}[{}])", self.id))
            }
            other => other,
        })?;
        self.expression = Some(expression);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressClass;

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("Name"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("with space"));
        assert!(Field::new("bad-id", "1").is_err());
    }

    #[test]
    fn test_before_and_after_parse() {
        let mut field = Field::new("Value", "int16(hr:2) * Scale")
            .unwrap()
            .with_unit("W")
            .with_fetch_group("meter");
        assert_eq!(field.return_type(), ReturnType::Unknown);
        assert!(field.required_addresses().is_empty());
        assert!(!field.is_immutable());

        field.parse("Block").unwrap();
        assert_eq!(
            field.required_addresses(),
            vec![Address::new(AddressClass::HoldingRegister, 2)]
        );
        assert_eq!(field.required_fields(), vec!["Scale".to_string()]);
        assert_eq!(field.fetch_group(), Some("meter"));
        assert_eq!(field.unit(), "W");
    }

    #[test]
    fn test_immutability() {
        let mut constant = Field::new("Constant", "42").unwrap();
        constant.parse("Block").unwrap();
        assert!(constant.is_immutable());
        assert_eq!(constant.return_type(), ReturnType::Long);

        let mut serial = Field::new("Serial", "utf8(hr:0#4)").unwrap().with_immutable(true);
        serial.parse("Block").unwrap();
        assert!(serial.is_immutable());
    }

    #[test]
    fn test_parse_error_names_field() {
        let mut field = Field::new("Broken", "int16(").unwrap();
        let error = field.parse("Block").unwrap_err();
        let text = error.to_string();
        assert!(text.contains(">>int16(<<"), "{text}");
        assert!(text.contains("Block[Broken]"), "{text}");
    }
}
