//! Database access layer.
//!
//! Repositories hold a clone of the shared pool and run synchronous Diesel
//! closures through the blocking bridge in [`pool`].

pub mod documents;
pub mod init;
pub mod models;
pub mod pool;
pub mod tenders;
pub mod users;

pub use documents::{DocumentRepository, FetchedDocument, NewSegment, TenderQuality};
pub use init::init_schema;
pub use pool::{create_pool, create_pool_from_url, run_blocking, DieselError, SqlitePool};
pub use tenders::{prepare_payload, tender_info, SavedTender, TenderRepository};
pub use users::{UserRepository, UserUpsert};
