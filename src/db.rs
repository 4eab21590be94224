//! Embedded credential store.
//!
//! A single redb database file with one `users` table mapping username to
//! password bytes. The table is created on open. Reads for an absent user
//! yield an empty password rather than an error, which the authentication
//! path relies on; see the auth handling in [`crate::network`].

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};
use thiserror::Error;

const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Credential store errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Database(String),
}

/// A stored user credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub password: Vec<u8>,
}

/// Handle to the credential database. Cloning is cheap and all clones are
/// safe for concurrent use.
#[derive(Clone)]
pub struct Db {
    db: Arc<Database>,
}

impl Db {
    /// Open (or create) the database and ensure the `users` table exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let db = Database::create(path).map_err(|e| DbError::Database(e.to_string()))?;
        let write_txn = db.begin_write().map_err(|e| DbError::Database(e.to_string()))?;
        write_txn
            .open_table(USERS)
            .map_err(|e| DbError::Database(e.to_string()))?;
        write_txn
            .commit()
            .map_err(|e| DbError::Database(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Fetch a user. An absent user comes back with an empty password.
    pub fn get_user(&self, name: &str) -> Result<User, DbError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| DbError::Database(e.to_string()))?;
        let table = read_txn
            .open_table(USERS)
            .map_err(|e| DbError::Database(e.to_string()))?;
        let password = table
            .get(name)
            .map_err(|e| DbError::Database(e.to_string()))?
            .map(|guard| guard.value().to_vec())
            .unwrap_or_default();
        Ok(User {
            name: name.to_string(),
            password,
        })
    }

    /// Insert or replace a credential.
    pub fn upsert_user(&self, user: &User) -> Result<(), DbError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| DbError::Database(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(USERS)
                .map_err(|e| DbError::Database(e.to_string()))?;
            table
                .insert(user.name.as_str(), user.password.as_slice())
                .map_err(|e| DbError::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| DbError::Database(e.to_string()))?;
        Ok(())
    }

    /// Remove a credential by name. Removing an absent user is not an error.
    pub fn delete_user(&self, name: &str) -> Result<(), DbError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| DbError::Database(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(USERS)
                .map_err(|e| DbError::Database(e.to_string()))?;
            table
                .remove(name)
                .map_err(|e| DbError::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| DbError::Database(e.to_string()))?;
        Ok(())
    }
}
