//! CAS Repo Driver: the publish-transaction control plane a content-addressed repo exposes
//! (begin/commit/abort/ingest), plus the path layout conventions the Ingestion Pipeline and
//! Chain Builder rely on.

pub mod layout;
pub mod mem;
pub mod process;
pub mod repo;

pub use mem::MemCasRepo;
pub use process::ProcessCasRepo;
pub use repo::{CasRepo, Error};
