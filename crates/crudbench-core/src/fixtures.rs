//! Test data generation for benchmarks.
//!
//! Generators are seeded so repeated runs insert the same records.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::record::{Dataset, PersonRecord, Record, RecordShape, ValueRecord};

/// Default seed for [`FakeDataGenerator`].
pub const DEFAULT_SEED: u64 = 12345;

/// Produces the dataset for one iteration.
pub trait DatasetGenerator: Send + Sync {
    /// Generate `records_per_client` records for each of `clients` clients,
    /// ordered by client id.
    fn generate(&self, records_per_client: usize, clients: usize, shape: RecordShape) -> Dataset;
}

const FIRST_NAMES: [&str; 12] = [
    "Alice", "Bob", "Charlie", "David", "Eve", "Frank", "Grace", "Henry", "Ivy", "Jack", "Karen",
    "Leo",
];

const LAST_NAMES: [&str; 10] = [
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Miller", "Davis", "Wilson", "Moore",
    "Taylor",
];

const STREETS: [&str; 8] = [
    "Main St", "Oak Ave", "Pine Rd", "Maple Dr", "Cedar Ln", "Elm St", "Lake View", "Hill Rd",
];

const CITIES: [&str; 6] = ["Springfield", "Riverside", "Fairview", "Franklin", "Greenville", "Salem"];

/// Deterministic fake record generator.
///
/// One base list of records is generated and copied once per client with
/// that client's id, so every client owns an identical payload.
#[derive(Debug, Clone)]
pub struct FakeDataGenerator {
    seed: u64,
}

impl FakeDataGenerator {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn base_records(&self, count: usize, shape: RecordShape) -> Vec<Record> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..count)
            .map(|i| match shape {
                RecordShape::Big => Record::Full(generate_person(&mut rng, i)),
                RecordShape::Small => Record::Minimal(ValueRecord {
                    value: rng.gen_range(0..1_000_000),
                    client_id: 0,
                }),
            })
            .collect()
    }
}

impl Default for FakeDataGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl DatasetGenerator for FakeDataGenerator {
    fn generate(&self, records_per_client: usize, clients: usize, shape: RecordShape) -> Dataset {
        let base = self.base_records(records_per_client, shape);
        let mut records = Vec::with_capacity(records_per_client * clients);
        for client_id in 0..clients {
            records.extend(base.iter().map(|r| r.with_client_id(client_id as i64)));
        }
        tracing::info!(
            records = records.len(),
            clients,
            shape = %shape,
            "generated test records"
        );
        Dataset::new(shape, clients, records)
    }
}

fn generate_person(rng: &mut StdRng, index: usize) -> PersonRecord {
    let first_name = FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())];
    let last_name = LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())];
    let email = format!(
        "{}.{}{}@example.com",
        first_name.to_lowercase(),
        last_name.to_lowercase(),
        index
    );
    let address = format!(
        "{} {}, {}",
        rng.gen_range(1..10_000),
        STREETS[rng.gen_range(0..STREETS.len())],
        CITIES[rng.gen_range(0..CITIES.len())]
    );

    PersonRecord {
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        email,
        address,
        age: rng.gen_range(18..=80),
        client_id: 0,
    }
}
