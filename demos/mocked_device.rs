//! Example: Decoding a schema against a mocked device
//!
//! Run with: cargo run --example mocked_device
//! More logging: RUST_LOG=modbus_schema=debug cargo run --example mocked_device
//!
//! This example demonstrates:
//! - Describing blocks and fields
//! - Reading only what the needed fields require
//! - Read errors that leave other fields intact
//! - Verifying a schema against recorded test scenarios

use modbus_schema::{
    Address, AddressClass, Block, Field, MockedModbusDevice, SchemaDevice, TestScenario,
};
use tracing_subscriber::EnvFilter;

fn hr(physical: u16) -> Address {
    Address::new(AddressClass::HoldingRegister, physical)
}

fn main() -> modbus_schema::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // =========================================================================
    // Describe the device
    // =========================================================================

    let identity = Block::new("Identity")?
        .with_description("Who is this device")
        .with_field(Field::new("Vendor", "utf8(hr:0 # 4)")?.with_immutable(true))?
        .with_field(Field::new("Serial", "hexstring(hr:4 # 2)")?.with_immutable(true))?;

    let meter = Block::new("Meter")?
        .with_description("Live measurements")
        .with_field(Field::new("Voltage", "uint16(hr:10) / Scale")?.with_unit("V"))?
        .with_field(Field::new("Current", "int16(hr:11) / Scale")?.with_unit("A"))?
        .with_field(Field::new("Power", "Voltage * Current")?.with_unit("W"))?
        .with_field(Field::new("State", "enum(hr:12 ; 0->'Idle' ; 1->'Running')")?)?
        .with_field(Field::new("Broken", "int32(hr:14 # 2)")?)?
        .with_field(Field::new("Scale", "int16(hr:20)")?.with_system(true))?;

    let idle = TestScenario::new("Idle")
        .with_registers(hr(10), "08FC 0000 0000")?
        .with_registers(hr(20), "000A")?
        .with_expected("Meter", "Voltage", ["230.000"])
        .with_expected("Meter", "Power", ["0.000"])
        .with_expected("Meter", "State", ["Idle"]);

    let mut schema = SchemaDevice::builder()
        .description("Demo power meter")
        .max_registers_per_request(16)
        .allowed_gap(4)
        .block(identity)
        .block(meter)
        .test_scenario(idle)
        .build()?;

    if !schema.initialize_and_verify()? {
        println!("The schema has problems:");
        for (field, problem) in schema.initialization_problems() {
            println!("  {field}: {problem}");
        }
    }

    // =========================================================================
    // Connect and read
    // =========================================================================

    let device = MockedModbusDevice::new()
        .with_log_requests(true)
        .with_registers(hr(0), "4465 6D6F 4D65 7465 1234 ABCD")?
        .with_registers(hr(10), "0906 FFF6 0001 0000 xxxx xxxx")?
        .with_registers(hr(20), "000A")?;
    schema.connect(device);

    println!("=== Immutable fields ===\n");
    for query in schema.resolve_all_immutable_fields()? {
        println!("{query}");
    }

    println!("\n=== Power only ===\n");
    schema.need("Meter", "Power")?;
    for query in schema.update(1_000)? {
        println!("{query}");
    }
    println!("Power = {:?} W", schema.double_value("Meter", "Power"));

    println!("\n=== Everything ===\n");
    schema.need_all();
    for query in schema.update(1_000)? {
        println!("{query}: {:?}", query.status());
    }
    println!(
        "Broken reads from {:?}",
        schema.used_read_error_addresses("Meter", "Broken")
    );
    println!("\n{schema}");

    // =========================================================================
    // Record what we saw as a new test scenario
    // =========================================================================

    let recorded = schema.snapshot_scenario("Running");
    println!(
        "Recorded {} register blocks, State = {:?}",
        recorded.registers().len(),
        recorded.expected()["Meter"]["State"]
    );

    schema.close()
}
