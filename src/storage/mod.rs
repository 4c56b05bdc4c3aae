pub mod hashmap_datastore;
pub mod traits;
