//! Crypto store orchestration
//!
//! Ties the opaque cryptographic engine to the transaction discipline every
//! mutation must follow. Protocol managers live in `core_proteus` and
//! `core_mls`; they are only reachable through a transaction opened here.

pub mod engine;
pub mod errors;
pub mod transaction;
pub mod types;

pub use engine::{CryptoEngine, MemoryCryptoEngine};
pub use errors::{CryptoError, CryptoResult};
pub use transaction::{TransactionContext, TransactionProvider, TransactionScope};
pub use types::{
    ApplicationMessage, ClientId, CommitBundle, CommitMessage, GroupId, MlsMessage, PreKey,
    QualifiedClientId, QualifiedId, WelcomeMessage, LAST_RESORT_PREKEY_ID,
};
