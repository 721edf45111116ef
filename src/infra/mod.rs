// Adapters behind the ports in `app::ports`

pub mod authority_client;
pub mod credentials;
pub mod document_store;
pub mod job_queue;
pub mod signer_client;
pub mod sqlite;

pub use authority_client::MhClient;
pub use credentials::StaticCredentials;
pub use document_store::SqliteDocumentStore;
pub use job_queue::SqliteJobQueue;
pub use signer_client::SigningServiceClient;
pub use sqlite::Database;
