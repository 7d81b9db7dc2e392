//! Shells out to the repo's publish tooling, the idiomatic equivalent of
//! `original_source/ducc/lib/conversion.go`'s `ExecCommand("cvmfs_server", ...)` calls.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use log::trace;

use crate::repo::{CasRepo, Error};

pub struct ProcessCasRepo {
    repo_name: String,
    mount_root: std::path::PathBuf,
}

impl ProcessCasRepo {
    pub fn new(repo_name: impl Into<String>, mount_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            repo_name: repo_name.into(),
            mount_root: mount_root.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<(), Error> {
        trace!("cvmfs_server {}", args.join(" "));
        let status = Command::new("cvmfs_server")
            .args(args)
            .stdin(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed(format!(
                "cvmfs_server {} exited with {status}",
                args.join(" ")
            )))
        }
    }
}

impl CasRepo for ProcessCasRepo {
    fn begin(&self) -> Result<(), Error> {
        self.run(&["transaction", &self.repo_name])
    }

    fn commit(&self) -> Result<(), Error> {
        self.run(&["publish", &self.repo_name])
    }

    fn abort(&self) -> Result<(), Error> {
        self.run(&["abort", "-f", &self.repo_name])
    }

    fn ingest_tar(&self, dest_path: &Path, tar_stream: &mut dyn Read) -> Result<(), Error> {
        let dest = dest_path.to_string_lossy().into_owned();
        trace!("cvmfs_server ingest --catalog -t - -b {dest} {}", self.repo_name);
        let mut child = Command::new("cvmfs_server")
            .args(["ingest", "--catalog", "-t", "-", "-b", &dest, &self.repo_name])
            .stdin(Stdio::piped())
            .spawn()?;
        let mut stdin = child.stdin.take().expect("stdin piped above");
        std::io::copy(tar_stream, &mut stdin)?;
        drop(stdin);
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed(format!(
                "cvmfs_server ingest -b {dest} exited with {status}"
            )))
        }
    }

    fn ingest_delete(&self, path: &Path) -> Result<(), Error> {
        self.run(&[
            "ingest",
            "--delete",
            &path.to_string_lossy(),
            &self.repo_name,
        ])
    }

    fn create_catalog_marker(&self, dir: &Path) -> Result<(), Error> {
        let full = self.mount_root.join(dir).join(".cvmfscatalog");
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(full)?.write_all(b"")?;
        Ok(())
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.mount_root.join(path).exists()
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), Error> {
        let name = path
            .file_name()
            .ok_or_else(|| Error::CommandFailed(format!("no file name in {}", path.display())))?;
        let dir = path.parent().unwrap_or_else(|| Path::new(""));

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, name, data)
            .map_err(Error::Io)?;
        let tar_bytes = builder.into_inner().map_err(Error::Io)?;

        self.ingest_tar(dir, &mut std::io::Cursor::new(tar_bytes))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, Error> {
        std::fs::read(self.mount_root.join(path)).map_err(Error::Io)
    }
}
