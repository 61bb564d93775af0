// Waterfall - Core Library
// Cascading foreign-key merges: fold an obsolete record into a surviving one
// and repoint everything that referenced it.
// Exposes all modules for use in the CLI, the API server, and tests

pub mod error;
pub mod record;
pub mod catalog;    // Schema Catalog - referential graph discovery
pub mod fk_index;   // Foreign-Key Index - cached relations per entity type
pub mod store;      // Record Store - persistence boundary
pub mod finder;     // Related-Record Finder
pub mod rewriter;   // Key Rewriter / Conflict Resolver
pub mod merge;      // Merge Orchestrator
pub mod db;         // SQLite setup + merge audit trail
pub mod config;
pub mod logging;
pub mod plan;       // CSV merge plans

// Re-export commonly used types
pub use error::{MergeError, MergeStage, StoreError, StoreResult};
pub use record::{Record, Value};
pub use catalog::{EntityType, FieldDescriptor, ForeignKeyTarget, SchemaCatalog, SqliteCatalog};
pub use fk_index::{ForeignKeyIndex, ForeignKeyRelation};
pub use store::{RecordStore, SqliteStore};
pub use finder::{find_related, RelatedRecord, RelatedRecords};
pub use rewriter::{rewrite, RecordOutcome, RewriteOutcome};
pub use merge::{MergeEngine, MergeOptions, MergeReport, TransactionScope};
pub use db::{
    Event, open_database, setup_database, insert_event, get_events_for_entity, record_merge,
};
pub use config::{Config, LogFormat};
pub use plan::{MergeInstruction, load_merge_plan};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
