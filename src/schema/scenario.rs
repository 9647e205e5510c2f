//! Test scenarios shipped with a schema: recorded device memory plus the
//! field values it must decode to.

use std::collections::BTreeMap;

use tracing::{error, info};

use crate::address::Address;
use crate::error::Result;
use crate::memory::{DiscreteBlock, RegisterBlock};
use crate::mock::MockedModbusDevice;
use crate::utils::StringTable;

/// Memory contents and the expected values of some fields.
///
/// # Example
///
/// ```
/// use modbus_schema::{Address, AddressClass, TestScenario};
///
/// let scenario = TestScenario::new("Idle")
///     .with_registers(Address::new(AddressClass::HoldingRegister, 0), "0001 0002")?
///     .with_expected("Main", "Value", ["258"]);
/// assert_eq!(scenario.expected()["Main"]["Value"], vec!["258".to_string()]);
/// # Ok::<(), modbus_schema::ModbusError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TestScenario {
    name: String,
    description: String,
    registers: Vec<RegisterBlock>,
    discretes: Vec<DiscreteBlock>,
    expected: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl TestScenario {
    /// Creates an empty scenario.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            registers: Vec::new(),
            discretes: Vec::new(),
            expected: BTreeMap::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds registers in the text format of [`RegisterBlock::from_text`].
    ///
    /// # Errors
    ///
    /// Fails for a discrete class or malformed text.
    pub fn with_registers(mut self, first: Address, text: &str) -> Result<Self> {
        self.registers.push(RegisterBlock::from_text(first, text)?);
        Ok(self)
    }

    /// Adds discretes in the text format of [`DiscreteBlock::from_text`].
    ///
    /// # Errors
    ///
    /// Fails for a register class or malformed text.
    pub fn with_discretes(mut self, first: Address, text: &str) -> Result<Self> {
        self.discretes.push(DiscreteBlock::from_text(first, text)?);
        Ok(self)
    }

    /// Adds a register block.
    pub fn add_register_block(&mut self, block: RegisterBlock) {
        self.registers.push(block);
    }

    /// Adds a discrete block.
    pub fn add_discrete_block(&mut self, block: DiscreteBlock) {
        self.discretes.push(block);
    }

    /// Sets the expected comparison values of one field; see
    /// [`crate::SchemaDevice::test_compare_value`].
    pub fn with_expected<I, S>(mut self, block: &str, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_expected(block, field, values);
        self
    }

    /// See [`TestScenario::with_expected`].
    pub fn set_expected<I, S>(&mut self, block: &str, field: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected
            .entry(block.to_string())
            .or_default()
            .insert(field.to_string(), values.into_iter().map(Into::into).collect());
    }

    /// The name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The register blocks.
    pub fn registers(&self) -> &[RegisterBlock] {
        &self.registers
    }

    /// The discrete blocks.
    pub fn discretes(&self) -> &[DiscreteBlock] {
        &self.discretes
    }

    /// Expected values by block id and field id.
    pub fn expected(&self) -> &BTreeMap<String, BTreeMap<String, Vec<String>>> {
        &self.expected
    }

    /// A mocked device holding the memory of this scenario.
    ///
    /// # Errors
    ///
    /// Never fails for blocks built through this type.
    pub fn mocked_device(&self) -> Result<MockedModbusDevice> {
        let mut device = MockedModbusDevice::new();
        for block in &self.registers {
            device.add_register_block(block)?;
        }
        for block in &self.discretes {
            device.add_discrete_block(block)?;
        }
        Ok(device)
    }
}

/// The outcome for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    /// What the scenario expects.
    pub expected: Vec<String>,
    /// What the field produced.
    pub actual: Vec<String>,
    /// `expected == actual`.
    pub passed: bool,
}

impl TestResult {
    pub(crate) fn new(expected: Vec<String>, actual: Vec<String>) -> Self {
        let passed = expected == actual;
        Self {
            expected,
            actual,
            passed,
        }
    }
}

/// The results of one scenario, by block id and field id.
#[derive(Debug, Clone, Default)]
pub struct ScenarioResults {
    /// The scenario name.
    pub name: String,
    /// Results by block id and field id.
    pub results: BTreeMap<String, BTreeMap<String, TestResult>>,
}

impl ScenarioResults {
    /// `true` when something was checked and everything passed.
    pub fn all_passed(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .values()
                .all(|fields| fields.values().all(|result| result.passed))
    }

    /// A table of the results, optionally of the failures only.
    pub fn to_table(&self, only_failed: bool) -> String {
        let mut table = StringTable::new(["Test", "Block", "Field", "Expected", "Actual", "Good?"]);
        for (block, fields) in &self.results {
            for (field, result) in fields {
                if only_failed && result.passed {
                    continue;
                }
                table.add_row([
                    self.name.clone(),
                    block.clone(),
                    field.clone(),
                    format!("{:?}", result.expected),
                    format!("{:?}", result.actual),
                    result.passed.to_string(),
                ]);
            }
        }
        table.to_string()
    }
}

/// The results of every scenario of a schema.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    /// One entry per scenario, in the order they were added.
    pub scenarios: Vec<ScenarioResults>,
}

impl VerificationReport {
    /// `true` when no scenario failed; also for a schema without scenarios.
    pub fn all_passed(&self) -> bool {
        self.scenarios.iter().all(ScenarioResults::all_passed)
    }

    /// The names of the failed scenarios.
    pub fn failed_tests(&self) -> Vec<&str> {
        self.scenarios
            .iter()
            .filter(|scenario| !scenario.all_passed())
            .map(|scenario| scenario.name.as_str())
            .collect()
    }

    /// Logs a line per scenario and the failed fields; returns
    /// [`VerificationReport::all_passed`].
    pub fn log_results(&self) -> bool {
        for scenario in &self.scenarios {
            if scenario.all_passed() {
                info!(test = %scenario.name, "schema test passed");
            } else {
                error!(
                    test = %scenario.name,
                    "schema test failed\n{}",
                    scenario.to_table(true)
                );
            }
        }
        self.all_passed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressClass;
    use crate::device::ModbusDevice;

    fn hr(physical: u16) -> Address {
        Address::new(AddressClass::HoldingRegister, physical)
    }

    #[test]
    fn test_mocked_device() {
        let scenario = TestScenario::new("Basic")
            .with_description("Two registers and a coil")
            .with_registers(hr(10), "0102 0304")
            .unwrap()
            .with_discretes(Address::new(AddressClass::Coil, 0), "1")
            .unwrap();
        let mut device = scenario.mocked_device().unwrap();
        let block = device.get_registers(hr(10), 2).unwrap();
        assert_eq!(block.to_hex_string(), "0102 0304");
        let coils = device.get_discretes(Address::new(AddressClass::Coil, 0), 1).unwrap();
        assert_eq!(coils.value(Address::new(AddressClass::Coil, 0)), Some(true));
    }

    #[test]
    fn test_results() {
        let mut results = ScenarioResults {
            name: "Basic".into(),
            ..ScenarioResults::default()
        };
        assert!(!results.all_passed());

        results.results.entry("Block".into()).or_default().insert(
            "Matches".into(),
            TestResult::new(vec!["1".into()], vec!["1".into()]),
        );
        assert!(results.all_passed());
        results.results.entry("Block".into()).or_default().insert(
            "Differs".into(),
            TestResult::new(vec!["1".into()], vec![]),
        );
        assert!(!results.all_passed());

        let table = results.to_table(true);
        assert!(table.contains("Differs"));
        assert!(!table.contains("Matches"));
        assert!(results.to_table(false).contains("Matches"));

        let report = VerificationReport {
            scenarios: vec![results],
        };
        assert_eq!(report.failed_tests(), vec!["Basic"]);
        assert!(!report.log_results());
        assert!(VerificationReport::default().all_passed());
    }
}
