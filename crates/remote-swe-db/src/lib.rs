pub mod blob_store;
pub mod content_codec;
pub mod message_store;
pub mod token_ledger;

pub use blob_store::{BlobStore, FsBlobStore};
pub use content_codec::ContentCodec;
pub use message_store::{MessageStore, SqliteMessageStore};
pub use token_ledger::{TokenLedger, TokenLedgerEntry};
