use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database stayed locked after {attempts} retries")]
    RetriesExhausted { attempts: u32 },
}

pub type StoreResult<T> = Result<T, StoreError>;
