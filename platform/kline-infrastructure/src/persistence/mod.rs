pub mod dead_letter_jsonl;
pub mod memory_derived;
pub mod memory_store;
pub mod postgres_derived;
pub mod postgres_store;

pub use dead_letter_jsonl::JsonlDeadLetterSink;
pub use memory_derived::InMemoryDerivedStore;
pub use memory_store::InMemoryCandleStore;
pub use postgres_derived::PostgresDerivedStore;
pub use postgres_store::PostgresCandleStore;
