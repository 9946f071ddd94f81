mod articles;
mod schema;
mod snapshot;
mod types;

pub use schema::Database;
pub use types::DatabaseError;
