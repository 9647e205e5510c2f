//! A named group of fields.

use std::collections::{HashMap, HashSet};

use crate::error::{ModbusError, Result};
use crate::expression::{Expression, FieldRefState, NumberExpr, ReturnType};
use crate::schema::field::{check_identifier, Field};

/// A set of fields that belong together, such as everything describing one
/// phase of a power meter. Fields refer to each other by id within a block.
#[derive(Debug, Clone)]
pub struct Block {
    id: String,
    description: String,
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl Block {
    /// Creates an empty block.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidParameter` if `id` is not an identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        check_identifier("block id", &id)?;
        Ok(Self {
            id,
            description: String::new(),
            fields: Vec::new(),
            index: HashMap::new(),
        })
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a field.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Schema` if the block already has a field with
    /// the same id.
    pub fn with_field(mut self, field: Field) -> Result<Self> {
        self.add_field(field)?;
        Ok(self)
    }

    /// Adds a field, see [`Block::with_field`].
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Schema` for a duplicate field id.
    pub fn add_field(&mut self, field: Field) -> Result<()> {
        if self.index.contains_key(field.id()) {
            return Err(ModbusError::schema(format!(
                "Block {} already has a field {}",
                self.id,
                field.id()
            )));
        }
        self.index.insert(field.id().to_string(), self.fields.len());
        self.fields.push(field);
        Ok(())
    }

    /// The block id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The fields in the order they were added.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The field with this id.
    pub fn field(&self, id: &str) -> Option<&Field> {
        self.fields.get(self.position(id)?)
    }

    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Positions of the fields `field` refers to directly.
    pub(crate) fn dependencies(&self, field: usize) -> Vec<usize> {
        self.fields
            .get(field)
            .map(Field::required_fields)
            .unwrap_or_default()
            .iter()
            .filter_map(|name| self.position(name))
            .collect()
    }

    /// Parses every field and binds the field references.
    ///
    /// Binding runs to a fixed point: a reference is bound once its target is
    /// itself fully bound, so types flow through chains of fields. References
    /// that can never be bound (unknown name, wrong type) become missing
    /// fields, which may in turn unblock others.
    ///
    /// # Errors
    ///
    /// Fails on the first expression that does not parse, or with
    /// `ModbusError::Schema` when fields refer to each other in a circle.
    pub(crate) fn initialize(&mut self) -> Result<()> {
        for field in &mut self.fields {
            field.parse(&self.id)?;
        }
        self.check_circular()?;

        loop {
            while self.resolve_step() {}
            if self.fields.iter().all(is_resolved) {
                return Ok(());
            }
            if !self.mark_broken_references() {
                for field in &mut self.fields {
                    if let Some(expression) = field.expression_mut() {
                        expression.mark_unresolved_missing();
                    }
                }
            }
        }
    }

    /// Marks references to unknown fields, or to resolved fields of a type
    /// that does not fit, as missing. Returns `true` when any was marked.
    fn mark_broken_references(&mut self) -> bool {
        let resolved = self.resolved_types();
        let known: HashSet<String> = self.index.keys().cloned().collect();
        let mut changed = false;
        for field in &mut self.fields {
            let Some(expression) = field.expression_mut() else {
                continue;
            };
            for reference in expression.field_refs_mut() {
                if reference.state() != FieldRefState::Unresolved {
                    continue;
                }
                let broken = match resolved.get(reference.name()) {
                    Some((return_type, _)) => !reference.kind().accepts(*return_type),
                    None => !known.contains(reference.name()),
                };
                if broken {
                    reference.mark_missing();
                    changed = true;
                }
            }
        }
        changed
    }

    fn resolved_types(&self) -> HashMap<String, (ReturnType, bool)> {
        self.fields
            .iter()
            .filter(|field| is_resolved(field))
            .map(|field| {
                (
                    field.id().to_string(),
                    (field.return_type(), field.is_immutable()),
                )
            })
            .collect()
    }

    /// One binding pass over all fields; `true` when anything changed.
    fn resolve_step(&mut self) -> bool {
        let resolved = self.resolved_types();
        let mut changed = false;
        for field in &mut self.fields {
            let Some(expression) = field.expression_mut() else {
                continue;
            };
            if let Some(target) = alias_target(expression) {
                if let Some((return_type, _)) = resolved.get(target) {
                    changed |= expression.retype_alias(*return_type);
                }
            }
            changed |= expression.resolve_fields(|name| resolved.get(name).copied());
        }
        changed
    }

    fn check_circular(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(block: &Block, field: usize, marks: &mut [Mark]) -> Result<()> {
            match marks[field] {
                Mark::Done => return Ok(()),
                Mark::Active => {
                    return Err(ModbusError::schema(format!(
                        "Found circular reference starting with field {}[{}]",
                        block.id,
                        block.fields[field].id()
                    )))
                }
                Mark::New => {}
            }
            marks[field] = Mark::Active;
            for dependency in block.dependencies(field) {
                visit(block, dependency, marks)?;
            }
            marks[field] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::New; self.fields.len()];
        for field in 0..self.fields.len() {
            visit(self, field, &mut marks)?;
        }
        Ok(())
    }
}

fn is_resolved(field: &Field) -> bool {
    field.expression().map_or(true, Expression::is_resolved)
}

/// The target of an expression that is nothing but a numeric field
/// reference.
fn alias_target(expression: &Expression) -> Option<&str> {
    match expression {
        Expression::Number(NumberExpr::Field(field)) => Some(field.name()),
        _ => None,
    }
}
