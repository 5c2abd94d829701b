pub mod admission;
pub mod auth;
pub mod catalog;
pub mod collection;
pub mod config;
pub mod embed;
pub mod engine;
pub mod error;
pub mod filter;
pub mod metastore;
pub mod opslog;
pub mod preprocess;
pub mod sidecar;
pub mod store;
pub mod types;

// Re-export the primary surface for transports and the CLI
pub use auth::{AuthContext, Role};
pub use config::PatchvecConfig;
pub use engine::{build_engine, Engine};
pub use error::{EngineError, EngineResult};
pub use filter::FilterMap;
pub use preprocess::{CsvOptions, SourceDocument};
pub use types::{
    CollectionStats, DeleteReceipt, DocMeta, IngestReceipt, SearchMatch, SearchResponse,
};
