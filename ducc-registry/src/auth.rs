//! Credential storage and the env-var resolution order used when a request's
//! `ImageRef` doesn't carry its own credentials.

use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub enum Auth {
    None,
    UserPass(String, String),
}

pub type AuthMap = BTreeMap<String, Auth>;

const DOCKERHUB_REGISTRIES: &[&str] = &["index.docker.io", "registry-1.docker.io", "docker.io"];
const GITLAB_REGISTRY_SUFFIX: &str = "gitlab.com";

/// Resolves credentials for `registry` using the same three-tier order as
/// `original_source/ducc/lib/conversion.go`'s `GetPassword`: an explicit
/// per-conversion override, then a registry-specific `DUCC_*` env pair, then
/// anonymous.
pub fn resolve_env_auth(registry: &str) -> Auth {
    if DOCKERHUB_REGISTRIES.contains(&registry) {
        if let (Ok(user), Ok(pass)) = (
            std::env::var("DUCC_DOCKERHUB_USER"),
            std::env::var("DUCC_DOCKERHUB_PASS"),
        ) {
            return Auth::UserPass(user, pass);
        }
    }
    if registry.ends_with(GITLAB_REGISTRY_SUFFIX) {
        if let (Ok(user), Ok(pass)) = (
            std::env::var("DUCC_GITLAB_REGISTRY_USER"),
            std::env::var("DUCC_GITLAB_REGISTRY_PASS"),
        ) {
            return Auth::UserPass(user, pass);
        }
    }
    if let Ok(pass) = std::env::var("DUCC_DOCKER_REGISTRY_PASS") {
        if let Ok(user) = std::env::var("DUCC_DOCKER_REGISTRY_USER") {
            return Auth::UserPass(user, pass);
        }
    }
    Auth::None
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_VARS: &[&str] = &[
        "DUCC_DOCKERHUB_USER",
        "DUCC_DOCKERHUB_PASS",
        "DUCC_GITLAB_REGISTRY_USER",
        "DUCC_GITLAB_REGISTRY_PASS",
        "DUCC_DOCKER_REGISTRY_USER",
        "DUCC_DOCKER_REGISTRY_PASS",
    ];

    fn clear_all() {
        for k in ALL_VARS {
            // SAFETY: single test function, no other test in this crate touches these vars
            unsafe { std::env::remove_var(k) };
        }
    }

    // env vars are process-global and cargo runs tests in one process, so every scenario is
    // exercised from this one test function rather than spread across tests that could race.
    #[test]
    fn test_resolve_env_auth_order_and_fallback() {
        clear_all();
        assert!(matches!(resolve_env_auth("index.docker.io"), Auth::None));

        // SAFETY: see clear_all
        unsafe {
            std::env::set_var("DUCC_DOCKERHUB_USER", "hub-user");
            std::env::set_var("DUCC_DOCKERHUB_PASS", "hub-pass");
        }
        match resolve_env_auth("index.docker.io") {
            Auth::UserPass(u, p) => {
                assert_eq!(u, "hub-user");
                assert_eq!(p, "hub-pass");
            }
            Auth::None => panic!("expected dockerhub credentials"),
        }
        clear_all();

        // SAFETY: see clear_all
        unsafe {
            std::env::set_var("DUCC_GITLAB_REGISTRY_USER", "gl-user");
            std::env::set_var("DUCC_GITLAB_REGISTRY_PASS", "gl-pass");
        }
        match resolve_env_auth("registry.gitlab.com") {
            Auth::UserPass(u, p) => {
                assert_eq!(u, "gl-user");
                assert_eq!(p, "gl-pass");
            }
            Auth::None => panic!("expected gitlab credentials"),
        }
        clear_all();

        // SAFETY: see clear_all
        unsafe {
            std::env::set_var("DUCC_DOCKER_REGISTRY_USER", "generic-user");
            std::env::set_var("DUCC_DOCKER_REGISTRY_PASS", "generic-pass");
        }
        match resolve_env_auth("registry.example.com") {
            Auth::UserPass(u, p) => {
                assert_eq!(u, "generic-user");
                assert_eq!(p, "generic-pass");
            }
            Auth::None => panic!("expected generic registry credentials"),
        }
        clear_all();
    }
}
