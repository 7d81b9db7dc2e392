//! Overlay compositor for the Chain Builder (spec.md §4.5, supplemental detail in
//! SPEC_FULL.md §4.5). Generalizes the whiteout/opaque-tracking two-pass algorithm in
//! `peimage::squash::squash` from "N compressed layer tars" to "one already-materialized
//! parent chain directory (walked and synthesized into tar entries) plus one new layer's
//! already-decompressed tar": the new layer is read first so its whiteouts and real entries
//! win, then the parent directory is walked and anything not deleted or shadowed is emitted.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use tar::{Archive, Builder as ArchiveBuilder, Entry, EntryType, Header};
use walkdir::WalkDir;

use crate::Error;

#[derive(PartialEq, Debug)]
enum Whiteout {
    File(PathBuf),
    Opaque(PathBuf),
}

#[derive(Default)]
struct Deletions {
    files: BTreeSet<PathBuf>,
    opaques: BTreeSet<PathBuf>,
    files_q: Vec<PathBuf>,
    opaques_q: Vec<PathBuf>,
}

impl Deletions {
    fn push_file(&mut self, p: PathBuf) {
        self.files_q.push(p);
    }
    fn push_opaque(&mut self, p: PathBuf) {
        self.opaques_q.push(p);
    }
    fn is_deleted<P: AsRef<Path>>(&self, p: P) -> bool {
        self.files.contains(p.as_ref()) || opaque_deleted(&self.opaques, p)
    }
    fn end_of_layer(&mut self) {
        self.files.extend(self.files_q.drain(..));
        self.opaques.extend(self.opaques_q.drain(..));
    }
}

fn opaque_deleted<P: AsRef<Path>>(opaques: &BTreeSet<PathBuf>, path: P) -> bool {
    if let Some(prefix) = lower_bound(opaques, path.as_ref()) {
        path.as_ref().starts_with(prefix)
    } else {
        false
    }
}

fn lower_bound<'a, K, T>(set: &'a BTreeSet<T>, key: &K) -> Option<&'a T>
where
    T: Borrow<K> + Ord,
    K: Ord + ?Sized,
{
    set.range((Bound::Unbounded, Bound::Excluded(key))).next_back()
}

fn whiteout<R: Read>(entry: &Entry<R>) -> Result<Option<Whiteout>, Error> {
    let path = entry.path().map_err(Error::Io)?;
    let Some(name) = path.file_name().and_then(|x| x.to_str()) else {
        return Ok(None);
    };
    if name.starts_with(".wh..wh..opq") {
        return match path.parent() {
            Some(parent) => Ok(Some(Whiteout::Opaque(parent.into()))),
            None => Err(Error::OpaqueWhiteoutNoParent),
        };
    }
    if let Some(trimmed) = name.strip_prefix(".wh.") {
        return Ok(Some(Whiteout::File(path.with_file_name(trimmed))));
    }
    Ok(None)
}

/// Builds a tar archive of `dir`'s contents relative to `dir`, used to treat an
/// already-materialized parent chain directory as a synthetic bottom layer. Mirrors
/// `pelib::archive::archive_path`'s `WalkDir` + `strip_prefix` convention, extended to
/// directories and symlinks since a full chain overlay (unlike `pelib`'s flat-file archive)
/// needs to preserve the whole tree shape.
fn synthesize_parent_tar(dir: &Path) -> Result<Vec<u8>, Error> {
    let mut builder = ArchiveBuilder::new(Vec::new());
    for entry in WalkDir::new(dir).min_depth(1).into_iter().filter_map(Result::ok) {
        let rel = entry.path().strip_prefix(dir).map_err(|_| Error::BadChainOverlay)?;
        let metadata = entry.metadata().map_err(|_| Error::BadChainOverlay)?;
        let mut header = Header::new_gnu();
        if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(Error::Io)?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_path(rel).map_err(Error::Io)?;
            header.set_link_name(&target).map_err(Error::Io)?;
            header.set_cksum();
            builder.append(&header, std::io::empty()).map_err(Error::Io)?;
        } else if metadata.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_path(rel).map_err(Error::Io)?;
            header.set_cksum();
            builder.append(&header, std::io::empty()).map_err(Error::Io)?;
        } else {
            let mut file = std::fs::File::open(entry.path()).map_err(Error::Io)?;
            header.set_entry_type(EntryType::Regular);
            header.set_size(metadata.len());
            header.set_path(rel).map_err(Error::Io)?;
            header.set_cksum();
            builder.append(&header, &mut file).map_err(Error::Io)?;
        }
    }
    builder.into_inner().map_err(Error::Io)
}

/// Composes one chain artifact's tar: the new layer's entries win, then anything from the
/// parent chain directory that survives the new layer's whiteouts. `parent_dir` is `None`
/// for the first layer in a chain (there is no parent to overlay).
pub fn build_chain_tar<W: Write>(
    new_layer_tar: &[u8],
    parent_dir: Option<&Path>,
    out: &mut W,
) -> Result<(), Error> {
    let parent_tar = match parent_dir {
        Some(dir) => Some(synthesize_parent_tar(dir)?),
        None => None,
    };

    let mut deletions = Deletions::default();
    let mut aw = ArchiveBuilder::new(out);

    // top (new layer) first, then bottom (synthesized parent), matching squash()'s
    // iterate-in-reverse-application-order convention
    let readers: Vec<&[u8]> = std::iter::once(new_layer_tar)
        .chain(parent_tar.as_deref())
        .collect();

    for data in readers {
        let mut cursor = Cursor::new(data);
        {
            let mut archive = Archive::new(&mut cursor);
            for entry in archive.entries().map_err(Error::Io)? {
                let entry = entry.map_err(Error::Io)?;
                match whiteout(&entry)? {
                    Some(Whiteout::File(path)) => {
                        deletions.push_file(path);
                        continue;
                    }
                    Some(Whiteout::Opaque(path)) => {
                        deletions.push_opaque(path);
                        continue;
                    }
                    None => {}
                }
            }
        }
        cursor.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        {
            let mut archive = Archive::new(&mut cursor);
            for entry in archive.entries().map_err(Error::Io)? {
                let mut entry = entry.map_err(Error::Io)?;
                if whiteout(&entry)?.is_some() {
                    continue;
                }
                let path = entry.path().map_err(Error::Io)?.into_owned();
                if deletions.is_deleted(&path) {
                    continue;
                }
                aw.append(&entry.header().clone(), &mut entry).map_err(Error::Io)?;
                deletions.push_file(path);
            }
        }
        deletions.end_of_layer();
    }

    aw.finish().map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor as IoCursor;
    use tempfile::tempdir;

    fn one_file_tar(path: &str, data: &[u8]) -> Vec<u8> {
        let mut b = ArchiveBuilder::new(Vec::new());
        let mut h = Header::new_gnu();
        h.set_path(path).unwrap();
        h.set_entry_type(EntryType::Regular);
        h.set_size(data.len() as u64);
        h.set_cksum();
        b.append(&h, data).unwrap();
        b.into_inner().unwrap()
    }

    fn whiteout_tar(name: &str) -> Vec<u8> {
        one_file_tar(name, b"")
    }

    fn list_paths(tar_bytes: &[u8]) -> BTreeSet<PathBuf> {
        let mut archive = Archive::new(IoCursor::new(tar_bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().into_owned())
            .collect()
    }

    #[test]
    fn test_first_layer_no_parent_passes_through() {
        let layer = one_file_tar("a", b"hi");
        let mut out = Vec::new();
        build_chain_tar(&layer, None, &mut out).unwrap();
        assert_eq!(list_paths(&out), list_paths(&layer));
    }

    #[test]
    fn test_new_layer_whiteout_hides_parent_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"old").unwrap();

        let layer = whiteout_tar(".wh.a");
        let mut out = Vec::new();
        build_chain_tar(&layer, Some(dir.path()), &mut out).unwrap();
        assert!(list_paths(&out).is_empty());
    }

    #[test]
    fn test_parent_survives_when_not_whited_out() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("keep"), b"old").unwrap();

        let layer = one_file_tar("new", b"fresh");
        let mut out = Vec::new();
        build_chain_tar(&layer, Some(dir.path()), &mut out).unwrap();
        let paths = list_paths(&out);
        assert!(paths.contains(&PathBuf::from("new")));
        assert!(paths.contains(&PathBuf::from("keep")));
    }

    #[test]
    fn test_opaque_whiteout_hides_parent_dir_contents_but_not_the_dir_itself() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/old"), b"old").unwrap();

        let layer = whiteout_tar("sub/.wh..wh..opq");
        let mut out = Vec::new();
        build_chain_tar(&layer, Some(dir.path()), &mut out).unwrap();
        let paths = list_paths(&out);
        assert!(!paths.contains(&PathBuf::from("sub/old")));
        assert!(paths.contains(&PathBuf::from("sub")));
    }
}
