//! IID persistence for agents and viewers.
//!
//! The file holds the decimal IID followed by a newline.

use super::{IdentityError, Iid};
use std::path::Path;

/// Load a previously assigned IID, if the file exists.
pub fn load_iid(path: &Path) -> Result<Option<Iid>, IdentityError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(IdentityError::File {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let trimmed = contents.trim();
    let value: u32 = trimmed.parse().map_err(|_| IdentityError::MalformedFile {
        path: path.to_path_buf(),
        content: trimmed.to_string(),
    })?;

    let iid = Iid::new(value);
    Ok(if iid.is_unset() { None } else { Some(iid) })
}

/// Persist an assigned IID.
pub fn store_iid(path: &Path, iid: Iid) -> Result<(), IdentityError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| IdentityError::File {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
    }
    std::fs::write(path, format!("{}\n", iid)).map_err(|e| IdentityError::File {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(load_iid(&dir.path().join("iid")).unwrap().is_none());
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("iid");
        store_iid(&path, Iid::new(1000)).unwrap();
        assert_eq!(load_iid(&path).unwrap(), Some(Iid::new(1000)));
    }

    #[test]
    fn test_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("iid");
        std::fs::write(&path, "not-a-number").unwrap();
        assert!(matches!(
            load_iid(&path),
            Err(IdentityError::MalformedFile { .. })
        ));
    }
}
