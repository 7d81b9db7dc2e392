//! An in-process `CasRepo` backed by a real temp-directory filesystem, for tests that need
//! working publish semantics without the real repo tooling installed. Write-then-rename on
//! success mirrors the `FileGuard` idiom in `peoci::blobcache`: an ingest stages its tar into
//! the destination directly (there is no concurrent reader in tests), and an uncommitted
//! transaction simply leaves that write in place until `abort` removes it.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::repo::{CasRepo, Error};

pub struct MemCasRepo {
    root: PathBuf,
    in_transaction: AtomicBool,
    last_ingested: std::sync::Mutex<Option<PathBuf>>,
}

impl MemCasRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            in_transaction: AtomicBool::new(false),
            last_ingested: std::sync::Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl CasRepo for MemCasRepo {
    fn begin(&self) -> Result<(), Error> {
        if self
            .in_transaction
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::TransactionConflict);
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), Error> {
        if !self.in_transaction.swap(false, Ordering::SeqCst) {
            return Err(Error::NoTransaction);
        }
        Ok(())
    }

    fn abort(&self) -> Result<(), Error> {
        // matches the real driver: aborting with nothing in progress is not an error, it is
        // the expected outcome of the recovery path's unconditional abort-then-delete
        self.in_transaction.store(false, Ordering::SeqCst);
        if let Some(path) = self.last_ingested.lock().unwrap().take() {
            let _ = std::fs::remove_dir_all(self.full(&path));
        }
        Ok(())
    }

    fn ingest_tar(&self, dest_path: &Path, tar_stream: &mut dyn Read) -> Result<(), Error> {
        if !self.in_transaction.load(Ordering::SeqCst) {
            return Err(Error::NoTransaction);
        }
        let dest = self.full(dest_path);
        std::fs::create_dir_all(&dest)?;
        let mut archive = tar::Archive::new(tar_stream);
        archive.unpack(&dest)?;
        *self.last_ingested.lock().unwrap() = Some(dest_path.to_path_buf());
        Ok(())
    }

    fn ingest_delete(&self, path: &Path) -> Result<(), Error> {
        let full = self.full(path);
        if full.exists() {
            std::fs::remove_dir_all(full)?;
        }
        Ok(())
    }

    fn create_catalog_marker(&self, dir: &Path) -> Result<(), Error> {
        let full = self.full(dir);
        std::fs::create_dir_all(&full)?;
        std::fs::write(full.join(".cvmfscatalog"), b"")?;
        Ok(())
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.full(path).exists()
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), Error> {
        if !self.in_transaction.load(Ordering::SeqCst) {
            return Err(Error::NoTransaction);
        }
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, data)?;
        *self.last_ingested.lock().unwrap() = Some(path.to_path_buf());
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, Error> {
        std::fs::read(self.full(path)).map_err(Error::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn empty_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.finish().unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_begin_rejects_concurrent_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let repo = MemCasRepo::new(dir.path());
        repo.begin().unwrap();
        assert!(matches!(repo.begin(), Err(Error::TransactionConflict)));
        repo.commit().unwrap();
        repo.begin().unwrap();
        repo.commit().unwrap();
    }

    #[test]
    fn test_ingest_requires_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let repo = MemCasRepo::new(dir.path());
        let mut data = Cursor::new(empty_tar());
        assert!(matches!(
            repo.ingest_tar(Path::new(".layers/ab/abcd"), &mut data),
            Err(Error::NoTransaction)
        ));
    }

    #[test]
    fn test_ingest_then_commit_persists_and_abort_removes() {
        let dir = tempfile::tempdir().unwrap();
        let repo = MemCasRepo::new(dir.path());
        let path = Path::new(".layers/ab/abcd");

        repo.begin().unwrap();
        let mut data = Cursor::new(empty_tar());
        repo.ingest_tar(path, &mut data).unwrap();
        repo.commit().unwrap();
        assert!(repo.path_exists(path));

        repo.begin().unwrap();
        let mut data = Cursor::new(empty_tar());
        let other = Path::new(".layers/cd/cdef");
        repo.ingest_tar(other, &mut data).unwrap();
        repo.abort().unwrap();
        assert!(!repo.path_exists(other));
        assert!(repo.path_exists(path));
    }

    #[test]
    fn test_catalog_marker() {
        let dir = tempfile::tempdir().unwrap();
        let repo = MemCasRepo::new(dir.path());
        repo.create_catalog_marker(Path::new(".layers/ab")).unwrap();
        assert!(dir.path().join(".layers/ab/.cvmfscatalog").exists());
    }
}
