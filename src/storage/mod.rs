mod backend;

use crate::config::CONFIG;

use std::io;
use std::path::Path;

pub use backend::{DiskManager, FileStorage, StorageError};

/// Creates the backing file for a new database under the configured root.
pub fn create_database(name: &str) -> Result<FileStorage, StorageError> {
    let path = Path::new(CONFIG.ROOT_DIRECTORY.as_str()).join(name);

    if path.exists() {
        Err(StorageError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "database file already exists",
        )))
    } else {
        FileStorage::create(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_database_refuses_to_clobber() {
        let name = format!("marmotdb_{}", uuid::Uuid::new_v4());
        let created = create_database(&name);
        assert!(created.is_ok());
        assert!(create_database(&name).is_err());

        let path = Path::new(CONFIG.ROOT_DIRECTORY.as_str()).join(&name);
        let _ = std::fs::remove_file(path);
    }
}
