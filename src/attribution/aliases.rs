use std::sync::Arc;

use rand::rngs::StdRng;

use super::measurement_service::MeasurementService;
use crate::storage::hashmap_datastore::HashMapDatastore;

// === In-memory aliases ===

pub type InMemoryMeasurementService<R = StdRng> = MeasurementService<HashMapDatastore, R>;

/// Service over a datastore shared with other workers.
pub type SharedMeasurementService<R = StdRng> = MeasurementService<Arc<HashMapDatastore>, R>;
