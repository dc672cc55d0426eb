pub mod instrument_store;
pub mod manager;
pub mod models;
pub mod schema;

pub use instrument_store::{BootstrapOutcome, InstrumentStore, WriteReport};
pub use manager::{InitOutcome, SchemaManager};
pub use schema::{Schema, StoreConfig};
