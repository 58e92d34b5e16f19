mod schema;

pub use schema::{RunSummary, TaxonomyStore};
