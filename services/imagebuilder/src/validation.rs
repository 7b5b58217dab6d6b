//! Synchronous admission-time checks. Every problem found is reported, each
//! message prefixed with the path of the offending field.

use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;

use crate::job_store::JobStore;
use crate::repo_store::{AccessMode, RepositoryStore};
use crate::types_jobs::{BuildSpec, ExportSpec, ImageTarget, JobKind, UserConfiguration};

static RESOURCE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("resource name regex")
});

static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("username regex"));

const SSH_KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

const MAX_RESOURCE_NAME: usize = 253;

pub fn validate_name(name: &str, errs: &mut Vec<String>) {
    if name.is_empty() {
        errs.push("metadata.name is required".to_string());
    } else if name.len() > MAX_RESOURCE_NAME || !RESOURCE_NAME.is_match(name) {
        errs.push(format!(
            "metadata.name: {name:?} must consist of lower case alphanumeric characters, '-' or '.', \
             and must start and end with an alphanumeric character"
        ));
    }
}

fn validate_target(section: &str, t: &ImageTarget, errs: &mut Vec<String>) {
    for (field, value) in [
        ("repository", &t.repository),
        ("imageName", &t.image_name),
        ("imageTag", &t.image_tag),
    ] {
        if value.is_empty() {
            errs.push(format!("spec.{section}.{field} is required"));
        }
    }
    if !t.image_name.is_empty() && !ociref::is_valid_name(&t.image_name) {
        errs.push(format!("spec.{section}.imageName: must match OCI repository name format"));
    }
    if !t.image_tag.is_empty() && !ociref::is_valid_tag(&t.image_tag) {
        errs.push(format!("spec.{section}.imageTag: must match OCI tag format"));
    }
}

pub fn is_valid_username(name: &str) -> bool {
    USERNAME.is_match(name)
}

/// One OpenSSH `authorized_keys` entry: `<type> <base64 blob> [comment]`.
/// The blob must decode and carry the same key type it is labelled with.
pub fn is_valid_ssh_public_key(key: &str) -> bool {
    if key.contains(['\n', '\r']) {
        return false;
    }
    let mut parts = key.trim().splitn(3, ' ');
    let (Some(key_type), Some(blob)) = (parts.next(), parts.next()) else {
        return false;
    };
    if !SSH_KEY_TYPES.contains(&key_type) {
        return false;
    }
    let Ok(raw) = STANDARD.decode(blob) else {
        return false;
    };
    if raw.len() < 4 {
        return false;
    }
    let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let Some(end) = 4usize.checked_add(len) else {
        return false;
    };
    raw.get(4..end).is_some_and(|embedded| embedded == key_type.as_bytes())
}

fn validate_user_config(uc: &UserConfiguration, errs: &mut Vec<String>) {
    if uc.username.is_empty() {
        errs.push("spec.userConfig.username is required".to_string());
    } else if !is_valid_username(&uc.username) {
        errs.push("spec.userConfig.username: must be a valid user name".to_string());
    }
    if uc.ssh_public_key.is_empty() {
        errs.push("spec.userConfig.sshPublicKey is required".to_string());
    } else if !is_valid_ssh_public_key(&uc.ssh_public_key) {
        errs.push("spec.userConfig.sshPublicKey: must be a valid SSH public key".to_string());
    }
}

/// Field checks plus repository existence. The upstream image itself is not
/// looked up here; a missing image fails the job when it runs.
pub async fn validate_build(
    name: &str,
    spec: &BuildSpec,
    repos: &dyn RepositoryStore,
) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    validate_name(name, &mut errs);
    validate_target("source", &spec.source, &mut errs);
    validate_target("destination", &spec.destination, &mut errs);
    if let Some(uc) = &spec.user_config {
        validate_user_config(uc, &mut errs);
    }

    if !spec.source.repository.is_empty() && repos.get(&spec.source.repository).await.is_none() {
        errs.push(format!(
            "spec.source.repository: Repository {:?} not found",
            spec.source.repository
        ));
    }
    if !spec.destination.repository.is_empty() {
        match repos.get(&spec.destination.repository).await {
            None => errs.push(format!(
                "spec.destination.repository: Repository {:?} not found",
                spec.destination.repository
            )),
            Some(r) if r.access_mode != AccessMode::ReadWrite => errs.push(format!(
                "spec.destination.repository: Repository {:?} must have 'ReadWrite' access mode, got {:?}",
                r.name,
                r.access_mode.as_str()
            )),
            Some(_) => {}
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

pub async fn validate_export(
    name: &str,
    spec: &ExportSpec,
    jobs: &dyn JobStore,
) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    validate_name(name, &mut errs);

    if spec.source_build_name.is_empty() {
        errs.push("spec.sourceBuildName is required".to_string());
    } else {
        match jobs.get(JobKind::Build, &spec.source_build_name).await {
            Ok(Some(_)) => {}
            Ok(None) => errs.push(format!(
                "spec.sourceBuildName: ImageBuild {:?} not found",
                spec.source_build_name
            )),
            Err(e) => errs.push(format!("spec.sourceBuildName: lookup failed: {e}")),
        }
    }
    if spec.format.is_none() {
        errs.push("spec.format is required".to_string());
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}
