//! Parser and schema benchmarks using Criterion.rs
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use modbus_schema::{Address, AddressClass, Block, Field, MockedModbusDevice, SchemaDevice};

const EXPRESSIONS: [&str; 6] = [
    "int16(hr:141) / Scale",
    "utf8(hr:101 # 13)",
    "ieee754_32(ir:3 # 2) * 10 ^ Factor",
    "enum(hr:7 ; 0->'Off' ; 1->'On' ; 2->'Fault')",
    "bitset(hr:8 # 2 ; 0->'Low' ; 3->'High' ; 17->'Broken')",
    "boolean(c:1 ; 'Closed' ; 'Open')",
];

fn meter(count: u16) -> SchemaDevice {
    let mut block = Block::new("Meter").expect("valid block id");
    for index in 0..count {
        let field = Field::new(
            format!("Value{index}"),
            format!("int32(hr:{} # 2) / Scale", index * 2),
        )
        .expect("valid field");
        block.add_field(field).expect("unique field");
    }
    block
        .add_field(Field::new("Scale", "10").expect("valid field"))
        .expect("unique field");

    let mut device = SchemaDevice::builder()
        .description("Benchmark meter")
        .block(block)
        .build()
        .expect("valid schema");
    device.initialize().expect("schema initializes");
    device
}

fn memory(count: u16) -> MockedModbusDevice {
    let words: Vec<String> = (0..count * 2).map(|word| format!("{word:04X}")).collect();
    MockedModbusDevice::new()
        .with_registers(
            Address::new(AddressClass::HoldingRegister, 0),
            &words.join(" "),
        )
        .expect("valid memory text")
}

/// Benchmark expression parsing
fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_expressions", |b| {
        b.iter(|| {
            for expression in EXPRESSIONS {
                black_box(modbus_schema::parse(black_box(expression)).ok());
            }
        });
    });
}

/// Benchmark reading and evaluating a whole schema
fn bench_update(c: &mut Criterion) {
    c.bench_function("update_50_fields", |b| {
        b.iter_batched(
            || {
                let device = meter(50);
                device.connect(memory(50));
                device.need_all();
                device
            },
            |device| black_box(device.update(0).map(|queries| queries.len()).ok()),
            BatchSize::SmallInput,
        );
    });

    let device = meter(50);
    device.connect(memory(50));
    device.update_all(0).expect("mocked update");
    c.bench_function("cached_values_50_fields", |b| {
        b.iter(|| {
            for index in 0..50 {
                black_box(device.double_value("Meter", &format!("Value{index}")));
            }
        });
    });
}

criterion_group!(benches, bench_parse, bench_update);
criterion_main!(benches);
