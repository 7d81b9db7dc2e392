//! Backlink persistence (SPEC_FULL.md §4.4 supplemental detail): records which layer digests
//! an image's conversion pulled in, so a later garbage-collection pass can tell what a layer
//! is still referenced by. Grounded on `SaveLayersBacklink` in
//! `original_source/ducc/lib/conversion.go`, called once per conversion just before the
//! idempotency record is written.

use oci_spec::image::Digest;

use ducc_cas::{CasRepo, layout, repo};

use crate::Error;

/// External collaborator recording `simpleName -> layerDigests` backlinks. A trait so
/// callers in tests can swap in a no-op or in-memory sink without a real `CasRepo`.
pub trait BacklinkSink {
    fn record(&self, simple_name: &str, layer_digests: &[Digest]) -> Result<(), Error>;
}

/// Default sink: appends one JSON line per layer digest to
/// `.metadata/<simple_name>/backlinks.json` in the same CAS repo the layers were ingested
/// into.
pub struct CasBacklinkSink<'a> {
    repo_driver: &'a dyn CasRepo,
}

impl<'a> CasBacklinkSink<'a> {
    pub fn new(repo_driver: &'a dyn CasRepo) -> Self {
        Self { repo_driver }
    }
}

impl BacklinkSink for CasBacklinkSink<'_> {
    fn record(&self, simple_name: &str, layer_digests: &[Digest]) -> Result<(), Error> {
        let path = layout::backlinks_path(simple_name);
        let mut lines = if self.repo_driver.path_exists(&path) {
            self.repo_driver.read_file(&path)?
        } else {
            Vec::new()
        };
        for digest in layer_digests {
            lines.extend_from_slice(serde_json::to_vec(&digest.to_string())?.as_slice());
            lines.push(b'\n');
        }

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

#[cfg(test)]
mod tests {
    use super::*;
    use ducc_cas::MemCasRepo;
    use std::str::FromStr;

    #[test]
    fn test_record_appends_one_line_per_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_driver = MemCasRepo::new(tmp.path());
        let sink = CasBacklinkSink::new(&repo_driver);

        let d = Digest::from_str(
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        sink.record("library/debian", &[d.clone()]).unwrap();
        sink.record("library/debian", &[d]).unwrap();

        let path = layout::backlinks_path("library/debian");
        let contents = repo_driver.read_file(&path).unwrap();
        let lines = String::from_utf8(contents).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }
}
