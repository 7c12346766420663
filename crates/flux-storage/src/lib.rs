//! The `Repository` trait and its backends (in-memory, Postgres), plus
//! the secrets vault layered on top of it.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod vault;

pub mod prelude {
    pub use crate::error::StoreError;
    pub use crate::memory::InMemoryRepository;
    pub use crate::postgres::PgRepository;
    pub use crate::repository::{Repository, WorkerRecord};
    pub use crate::vault::{generate_encryption_key, SecretsVault, VaultError};
}
