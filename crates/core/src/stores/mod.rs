pub mod memory;
pub mod pgvector;

pub use memory::InMemoryStore;
pub use pgvector::PgVectorStore;
