//! Benchmarked data stores.
//!
//! A relational backend (MySQL, or SQLite for local runs) and a document
//! backend (MongoDB) share the same repository contract.

pub mod mongo;
pub mod sql;

pub use self::mongo::{MongoBackend, MongoRepository};
pub use self::sql::{SqlBackend, SqlConnection, SqlConnector, SqlDialect, SqlRepository};

use crate::error::{Error, Result};

/// Table and collection names are interpolated into statements, so only
/// ASCII letters, digits and underscores are accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid table or collection name: {:?}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("test_table_test_foreign_key_iter_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1table").is_err());
        assert!(validate_identifier("users; DROP TABLE x").is_err());
        assert!(validate_identifier(&"a".repeat(65)).is_err());
    }
}
