//! Record storage and aggregation.
use super::{Record, RecordValue};
use std::collections::HashSet;
use xxhash_rust::xxh3::Xxh3Builder;

/// Collects records, e.g. one per minibatch, and reduces them.
///
/// Scalars are averaged. For other value types the most recent value is kept.
#[derive(Debug, Default)]
pub struct RecordStorage {
    data: Vec<Record>,
}

fn mean(vs: &[f32]) -> f32 {
    vs.iter().sum::<f32>() / vs.len() as f32
}

impl RecordStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self { data: vec![] }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Stores a record.
    pub fn store(&mut self, record: Record) {
        self.data.push(record);
    }

    fn get_keys(&self) -> HashSet<String, Xxh3Builder> {
        let mut keys = HashSet::<String, Xxh3Builder>::default();
        for record in self.data.iter() {
            for k in record.keys() {
                keys.insert(k.clone());
            }
        }
        keys
    }

    fn latest(&self, key: &str) -> Option<RecordValue> {
        self.data
            .iter()
            .rev()
            .find_map(|record| record.get(key).cloned())
    }

    /// Reduces all stored records into one and clears the storage.
    pub fn aggregate_mean(&mut self) -> Record {
        let mut record = Record::empty();

        for key in self.get_keys().iter() {
            let scalars: Vec<f32> = self
                .data
                .iter()
                .filter_map(|r| match r.get(key) {
                    Some(RecordValue::Scalar(v)) => Some(*v),
                    _ => None,
                })
                .collect();

            if !scalars.is_empty() {
                record.insert(key.clone(), RecordValue::Scalar(mean(&scalars)));
            } else if let Some(value) = self.latest(key) {
                record.insert(key.clone(), value);
            }
        }

        self.data.clear();
        record
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_aggregate_mean() {
        let mut storage = RecordStorage::new();
        storage.store(Record::from_scalar("loss", 1.0));
        storage.store(Record::from_scalar("loss", 3.0));
        storage.store(Record::from_slice(&[(
            "phase",
            RecordValue::String("encoder".to_string()),
        )]));

        let record = storage.aggregate_mean();
        assert_eq!(record.get_scalar("loss").unwrap(), 2.0);
        assert_eq!(record.get_string("phase").unwrap(), "encoder");
        assert!(storage.is_empty());
    }
}
