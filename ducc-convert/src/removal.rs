//! Removal scheduler (spec.md §4.6 `scheduleRemoval`): when a reconversion finds the stored
//! manifest's config digest no longer matches (`Verdict::NotMatch`), the prior manifest is
//! enqueued here rather than deleted outright. Ported from `AddManifestToRemoveScheduler` in
//! `original_source/ducc/lib/conversion.go`, called right after the new manifest is committed
//! when `alreadyConverted == ConversionNotMatch`. The core only enqueues; an external sweeper
//! (out of scope here, per spec.md §4.6) is responsible for actually reclaiming the old layers.

use ducc_cas::{CasRepo, layout, repo};

use crate::model::ImageMetadata;
use crate::Error;

/// External collaborator recording manifests superseded by a `NotMatch` reconversion.
pub trait RemovalScheduler {
    fn schedule(&self, simple_name: &str, prior_manifest: &ImageMetadata) -> Result<(), Error>;
}

/// Default scheduler: appends one JSON line per superseded manifest to
/// `.metadata/<simple_name>/pending_removal.json` in the same CAS repo.
pub struct CasRemovalScheduler<'a> {
    repo_driver: &'a dyn CasRepo,
}

impl<'a> CasRemovalScheduler<'a> {
    pub fn new(repo_driver: &'a dyn CasRepo) -> Self {
        Self { repo_driver }
    }
}

impl RemovalScheduler for CasRemovalScheduler<'_> {
    fn schedule(&self, simple_name: &str, prior_manifest: &ImageMetadata) -> Result<(), Error> {
        let path = layout::pending_removal_path(simple_name);
        let mut lines = if self.repo_driver.path_exists(&path) {
            self.repo_driver.read_file(&path)?
        } else {
            Vec::new()
        };
        lines.extend_from_slice(serde_json::to_vec(prior_manifest)?.as_slice());
        lines.push(b'\n');

        self.repo_driver.begin()?;
        match self.repo_driver.write_file(&path, &lines) {
            Ok(()) => {
                self.repo_driver.commit()?;
                Ok(())
            }
            Err(e) => Err(Error::Cas(repo::recover(self.repo_driver, &path, e))),
        }
    }
}
