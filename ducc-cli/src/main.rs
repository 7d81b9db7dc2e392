//! Drives one image conversion end to end: resolve `input`'s manifest, download and chain
//! whatever layers aren't already present in `repo`, and record the result. Grounded on
//! `peoci::ocidist`'s command-line binary for its args/auth-file/env-var conventions; does
//! not implement wildcard tag expansion, thin-image push, or the Singularity conversion path.

use std::collections::BTreeMap;
use std::path::Path;

use clap::Parser;
use log::info;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use ducc_cas::ProcessCasRepo;
use ducc_convert::ingest::{self, Outcome};
use ducc_convert::model::ImageRef;
use ducc_registry::auth::resolve_env_auth;
use ducc_registry::{Auth, AuthMap, Client};

#[derive(Deserialize)]
struct AuthEntry {
    username: String,
    password: String,
}

type StoredAuth = BTreeMap<String, AuthEntry>;

fn load_stored_auth(p: impl AsRef<Path>) -> anyhow::Result<AuthMap> {
    let stored: StoredAuth = serde_json::from_str(&std::fs::read_to_string(p)?)?;
    Ok(stored
        .into_iter()
        .map(|(k, v)| (k, Auth::UserPass(v.username, v.password)))
        .collect())
}

/// Converts one OCI/Docker image into a content-addressed chain layout in a CernVM-FS repo.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Image reference to convert, e.g. `registry.io/library/debian:bookworm`.
    input: String,

    /// Name of the CernVM-FS repository to ingest into.
    repo: String,

    /// Path the repository is mounted at, e.g. `/cvmfs/<repo>`.
    #[arg(long, default_value = "/cvmfs")]
    mount_root: String,

    /// Re-ingest layers and chains even if their content-addressed path already exists.
    #[arg(long)]
    force: bool,

    /// JSON file of `{"registry": {"username": ..., "password": ...}}` entries, also
    /// loadable via the `DUCC_AUTH_FILE` env var.
    #[arg(long)]
    auth_file: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let image = ImageRef::parse(&args.input)?;

    let auth_file = args.auth_file.or_else(|| std::env::var("DUCC_AUTH_FILE").ok());
    let mut auth: AuthMap = match auth_file {
        Some(path) => load_stored_auth(path)?,
        None => AuthMap::new(),
    };
    // credential source (b) from spec.md §4.1/§6: env vars fill in for any registry the
    // auth file didn't already cover explicitly.
    if !auth.contains_key(image.registry()) {
        let env_auth = resolve_env_auth(image.registry());
        if !matches!(env_auth, Auth::None) {
            auth.insert(image.registry().to_string(), env_auth);
        }
    }

    let client = Client::new()?;
    client.set_auth(auth);

    let mount_root = Path::new(&args.mount_root).join(&args.repo);
    let repo_driver = ProcessCasRepo::new(args.repo.clone(), mount_root);
    let cancel = CancellationToken::new();

    match ingest::convert(&client, &repo_driver, &image, args.force, &cancel).await? {
        Outcome::Skipped => info!("{image} already converted, nothing to do"),
        Outcome::Converted(metadata) => {
            info!(
                "converted {} into {} layers, {} chains",
                metadata.whole_name,
                metadata.layers.len(),
                metadata.chains.len()
            );
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
    }

    Ok(())
}
