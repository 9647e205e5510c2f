//! Schema files: a [`SchemaDevice`] with its test scenarios as YAML.
//!
//! ```yaml
//! description: 'Demo meter'
//! schemaFeatureLevel: 2
//! maxRegistersPerModbusRequest: 125
//! blocks:
//!   - id: 'Meter'
//!     fields:
//!       - id: 'Voltage'
//!         expression: 'int16(hr:00000) / 10'
//!         unit: 'V'
//! tests:
//!   - id: 'Idle'
//!     input:
//!       - firstRegisterAddress: 'hr:00000'
//!         registers: '08FC'
//!     blocks:
//!       - id: 'Meter'
//!         expected:
//!           Voltage: ['230.000']
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Block, Field, SchemaDevice, TestScenario};
use crate::address::Address;
use crate::device::MODBUS_MAX_REGISTERS_PER_REQUEST;
use crate::error::{ModbusError, Result};
use crate::memory::{DiscreteBlock, RegisterBlock};
use crate::value::RawValue;

/// The highest `schemaFeatureLevel` this library can load.
pub const CURRENT_SCHEMA_FEATURE_LEVEL: u32 = 2;

/// Values per line when writing memory blocks.
const VALUES_PER_LINE: usize = 10;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaFile {
    description: String,
    #[serde(default = "default_feature_level")]
    schema_feature_level: u32,
    #[serde(default = "default_max_registers")]
    max_registers_per_modbus_request: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_gap: Option<u16>,
    blocks: Vec<SchemaBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tests: Vec<SchemaTest>,
}

fn default_feature_level() -> u32 {
    CURRENT_SCHEMA_FEATURE_LEVEL
}

fn default_max_registers() -> u16 {
    MODBUS_MAX_REGISTERS_PER_REQUEST
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaBlock {
    id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
    fields: Vec<SchemaField>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaField {
    id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(default, skip_serializing_if = "is_false")]
    immutable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fetch_group: Option<String>,
    expression: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    unit: String,
}

fn is_false(flag: &bool) -> bool {
    !flag
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaTest {
    id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
    input: Vec<SchemaTestInput>,
    blocks: Vec<SchemaTestBlock>,
}

/// Either registers or discretes, each with the address of the first value.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaTestInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first_register_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first_discrete_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    discretes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemaTestBlock {
    id: String,
    expected: BTreeMap<String, Vec<String>>,
}

impl SchemaDevice {
    /// Loads a schema file, initializes it and runs its test scenarios.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Schema` for malformed YAML, a feature level
    /// newer than [`CURRENT_SCHEMA_FEATURE_LEVEL`], fatal expression problems
    /// or failing test scenarios; any error of [`SchemaDevice::initialize`]
    /// is passed on.
    ///
    /// # Example
    ///
    /// ```
    /// use modbus_schema::SchemaDevice;
    ///
    /// let schema = SchemaDevice::from_yaml(
    ///     "
    /// description: 'Demo'
    /// blocks:
    ///   - id: Main
    ///     fields:
    ///       - id: Value
    ///         expression: 'uint16(hr:0)'
    /// ",
    /// )?;
    /// assert_eq!(schema.blocks()[0].fields()[0].id(), "Value");
    /// # Ok::<(), modbus_schema::ModbusError>(())
    /// ```
    pub fn from_yaml(text: &str) -> Result<SchemaDevice> {
        let file: SchemaFile = serde_yaml::from_str(text)
            .map_err(|e| ModbusError::schema(format!("Invalid schema YAML: {e}")))?;
        if file.schema_feature_level > CURRENT_SCHEMA_FEATURE_LEVEL {
            return Err(ModbusError::schema(format!(
                "The schema requires feature level {} but at most {CURRENT_SCHEMA_FEATURE_LEVEL} is supported",
                file.schema_feature_level
            )));
        }

        let mut builder = SchemaDevice::builder()
            .description(file.description)
            .max_registers_per_request(file.max_registers_per_modbus_request);
        if let Some(gap) = file.allowed_gap {
            builder = builder.allowed_gap(gap);
        }
        for schema_block in file.blocks {
            let mut block = Block::new(schema_block.id)?.with_description(schema_block.description);
            for schema_field in schema_block.fields {
                block.add_field(field_from_file(schema_field)?)?;
            }
            builder = builder.block(block);
        }
        for test in file.tests {
            builder = builder.test_scenario(scenario_from_file(test)?);
        }
        let mut device = builder.build()?;

        if !device.initialize()? {
            let problems: Vec<String> = device
                .initialization_problems()
                .into_iter()
                .filter(|(_, problem)| problem.is_fatal())
                .map(|(field, problem)| format!("{field}: {problem}"))
                .collect();
            return Err(ModbusError::schema(format!(
                "Unable to initialize the schema: {}",
                problems.join("; ")
            )));
        }
        let report = device.verify_provided_tests()?;
        if !report.log_results() {
            let failures: Vec<String> = report
                .scenarios
                .iter()
                .filter(|scenario| !scenario.all_passed())
                .map(|scenario| scenario.to_table(true))
                .collect();
            return Err(ModbusError::schema(format!(
                "Schema tests failed: {}\n{}",
                report.failed_tests().join(", "),
                failures.join("\n")
            )));
        }
        debug!(blocks = device.blocks().len(), "loaded schema");
        Ok(device)
    }

    /// Writes the schema and its test scenarios as YAML.
    ///
    /// Expressions are written in their normalized form once the device is
    /// initialized, so writing a loaded schema again gives the same text.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Schema` if the YAML cannot be produced.
    pub fn to_yaml(&self) -> Result<String> {
        let file = SchemaFile {
            description: self.description().to_string(),
            schema_feature_level: CURRENT_SCHEMA_FEATURE_LEVEL,
            max_registers_per_modbus_request: self.max_registers_per_request(),
            allowed_gap: Some(self.allowed_gap()),
            blocks: self.blocks().iter().map(block_to_file).collect(),
            tests: self.test_scenarios().iter().map(scenario_to_file).collect(),
        };
        serde_yaml::to_string(&file)
            .map_err(|e| ModbusError::schema(format!("Unable to write schema YAML: {e}")))
    }
}

fn field_from_file(schema_field: SchemaField) -> Result<Field> {
    let field = Field::new(schema_field.id, schema_field.expression)?
        .with_description(schema_field.description)
        .with_unit(schema_field.unit)
        .with_immutable(schema_field.immutable)
        .with_system(schema_field.system);
    Ok(match schema_field.fetch_group {
        Some(group) => field.with_fetch_group(group),
        None => field,
    })
}

fn scenario_from_file(test: SchemaTest) -> Result<TestScenario> {
    let mut scenario = TestScenario::new(test.id).with_description(test.description);
    for input in test.input {
        match input {
            SchemaTestInput {
                first_register_address: Some(first),
                registers: Some(text),
                first_discrete_address: None,
                discretes: None,
            } => scenario.add_register_block(RegisterBlock::from_text(first, &text)?),
            SchemaTestInput {
                first_register_address: None,
                registers: None,
                first_discrete_address: Some(first),
                discretes: Some(text),
            } => scenario.add_discrete_block(DiscreteBlock::from_text(first, &text)?),
            _ => {
                return Err(ModbusError::schema(format!(
                    "Test {}: an input needs either firstRegisterAddress and registers \
                     or firstDiscreteAddress and discretes",
                    scenario.name()
                )))
            }
        }
    }
    for block in test.blocks {
        for (field, expected) in block.expected {
            scenario.set_expected(&block.id, &field, expected);
        }
    }
    Ok(scenario)
}

fn block_to_file(block: &Block) -> SchemaBlock {
    SchemaBlock {
        id: block.id().to_string(),
        description: block.description().to_string(),
        fields: block
            .fields()
            .iter()
            .map(|field| SchemaField {
                id: field.id().to_string(),
                description: field.description().to_string(),
                immutable: field.is_immutable(),
                system: field.is_system(),
                fetch_group: field.fetch_group().map(str::to_string),
                expression: field
                    .expression()
                    .map_or_else(|| field.expression_text().to_string(), ToString::to_string),
                unit: field.unit().to_string(),
            })
            .collect(),
    }
}

fn scenario_to_file(scenario: &TestScenario) -> SchemaTest {
    let registers = scenario.registers().iter().filter_map(|block| {
        Some(SchemaTestInput {
            first_register_address: Some(block.first_address()?),
            registers: Some(memory_lines(block)),
            ..SchemaTestInput::default()
        })
    });
    let discretes = scenario.discretes().iter().filter_map(|block| {
        Some(SchemaTestInput {
            first_discrete_address: Some(block.first_address()?),
            discretes: Some(memory_lines(block)),
            ..SchemaTestInput::default()
        })
    });
    SchemaTest {
        id: scenario.name().to_string(),
        description: scenario.description().to_string(),
        input: registers.chain(discretes).collect(),
        blocks: scenario
            .expected()
            .iter()
            .map(|(id, expected)| SchemaTestBlock {
                id: id.clone(),
                expected: expected.clone(),
            })
            .collect(),
    }
}

/// The gap free values of a block in the text format, a fixed number per line.
fn memory_lines<T: RawValue>(block: &crate::memory::ModbusBlock<T>) -> String {
    let values: Vec<String> = block
        .no_gaps_values()
        .iter()
        .map(|value| value.to_hex_string())
        .collect();
    values
        .chunks(VALUES_PER_LINE)
        .map(|line| line.join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressClass;

    fn hr(physical: u16) -> Address {
        Address::new(AddressClass::HoldingRegister, physical)
    }

    const SCHEMA: &str = r"
description: 'Test meter'
schemaFeatureLevel: 2
maxRegistersPerModbusRequest: 100
blocks:
  - id: 'Meter'
    description: 'Live values'
    fields:
      - id: 'Name'
        description: 'The model name'
        immutable: true
        expression: 'utf8(hr:0 # 2)'
      - id: 'Voltage'
        expression: 'uint16(hr:2) / Scale'
        unit: 'V'
      - id: 'Scale'
        system: true
        immutable: true
        expression: 'int16(hr:3)'
      - id: 'Running'
        fetchGroup: 'status'
        expression: 'boolean(c:0)'
tests:
  - id: 'Idle'
    description: 'Nothing connected'
    input:
      - firstRegisterAddress: 'hr:00000'
        registers: |
          # ABCD
          4142 4344
          08FC 000A
      - firstDiscreteAddress: 'c:00000'
        discretes: '1'
    blocks:
      - id: 'Meter'
        expected:
          Name: ['ABCD']
          Voltage: ['230.000']
          Running: ['true']
";

    #[test]
    fn test_from_yaml() {
        let device = SchemaDevice::from_yaml(SCHEMA).unwrap();
        assert!(device.is_initialized());
        assert_eq!(device.description(), "Test meter");
        assert_eq!(device.max_registers_per_request(), 100);

        let meter = device.block("Meter").unwrap();
        assert_eq!(meter.description(), "Live values");
        assert_eq!(meter.fields().len(), 4);
        let scale = device.field("Meter", "Scale").unwrap();
        assert!(scale.is_system() && scale.is_immutable());
        assert_eq!(device.field("Meter", "Voltage").unwrap().unit(), "V");
        assert_eq!(
            device.field("Meter", "Running").unwrap().fetch_group(),
            Some("status")
        );

        let scenario = &device.test_scenarios()[0];
        assert_eq!(scenario.description(), "Nothing connected");
        assert_eq!(scenario.registers()[0].value(hr(2)), Some(0x08FC));
        assert_eq!(scenario.discretes().len(), 1);
        assert!(device.verify_provided_tests().unwrap().all_passed());
    }

    #[test]
    fn test_yaml_cycle() {
        let original = SchemaDevice::from_yaml(SCHEMA).unwrap();
        let first = original.to_yaml().unwrap();
        let reloaded = SchemaDevice::from_yaml(&first).unwrap();
        let second = reloaded.to_yaml().unwrap();
        assert_eq!(first, second);

        assert!(first.contains("utf8(hr:00000 # 2)"));
        assert!(first.contains("firstDiscreteAddress"));
        let expressions = |device: &SchemaDevice| -> Vec<String> {
            device.blocks()[0]
                .fields()
                .iter()
                .map(|field| field.expression_text().to_string())
                .collect()
        };
        assert_eq!(
            expressions(&reloaded),
            expressions(&SchemaDevice::from_yaml(&second).unwrap())
        );
        assert_eq!(
            reloaded.test_scenarios()[0].expected(),
            original.test_scenarios()[0].expected()
        );
    }

    #[test]
    fn test_built_schema_to_yaml() {
        let block = Block::new("Main")
            .unwrap()
            .with_field(Field::new("Value", "uint16(hr:5)").unwrap())
            .unwrap();
        let scenario = TestScenario::new("Gaps")
            .with_registers(hr(0), "0001 ---- xxxx 0004 0005 0006 0007 0008 0009 000A 000B 002A")
            .unwrap()
            .with_expected("Main", "Value", ["6"]);
        let mut device = SchemaDevice::builder()
            .description("Built")
            .block(block)
            .test_scenario(scenario)
            .build()
            .unwrap();
        assert!(device.initialize_and_verify().unwrap());

        let yaml = device.to_yaml().unwrap();
        let loaded = SchemaDevice::from_yaml(&yaml).unwrap();
        let registers = &loaded.test_scenarios()[0].registers()[0];
        assert_eq!(
            registers.to_hex_string(),
            "0001 ---- xxxx 0004 0005 0006 0007 0008 0009 000A 000B 002A"
        );
    }

    #[test]
    fn test_rejected_schemas() {
        let newer = SCHEMA.replace("schemaFeatureLevel: 2", "schemaFeatureLevel: 3");
        let error = SchemaDevice::from_yaml(&newer).unwrap_err();
        assert!(error.to_string().contains("feature level 3"));

        let failing = SCHEMA.replace("Voltage: ['230.000']", "Voltage: ['231.000']");
        let error = SchemaDevice::from_yaml(&failing).unwrap_err();
        assert!(error.to_string().contains("Idle"));

        let broken = SCHEMA.replace("'int16(hr:3)'", "'int16(hr:3 # 2)'");
        assert!(matches!(
            SchemaDevice::from_yaml(&broken),
            Err(ModbusError::Schema { .. })
        ));

        let mixed = SCHEMA.replace(
            "firstDiscreteAddress: 'c:00000'",
            "firstDiscreteAddress: 'c:00000'\n        registers: '0001'",
        );
        let error = SchemaDevice::from_yaml(&mixed).unwrap_err();
        assert!(error.to_string().contains("Test Idle"));

        assert!(SchemaDevice::from_yaml("blocks: 7").is_err());
    }
}
