//! Image rewriting done between pull and push.
//!
//! Every pushed manifest carries the binding type as an annotation. Early
//! binding additionally appends a layer that provisions the configured user
//! through systemd `sysusers.d` and `tmpfiles.d` drop-ins, so the account and
//! its `authorized_keys` exist on first boot.

use bytes::Bytes;
use ociref::{Descriptor, Digest, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_LAYER};

use crate::registry::Image;
use crate::types_jobs::{BindingType, UserConfiguration};

pub const ANNOTATION_BINDING: &str = "io.flightctl.imagebuild.binding-type";
pub const ANNOTATION_SOURCE: &str = "io.flightctl.imagebuild.source";

const SYSUSERS_PATH: &str = "usr/lib/sysusers.d/imagebuilder-user.conf";
const TMPFILES_PATH: &str = "usr/lib/tmpfiles.d/imagebuilder-user.conf";

pub fn user_layer(uc: &UserConfiguration) -> std::io::Result<Vec<u8>> {
    let user = &uc.username;
    let sysusers = format!("u {user} - \"Provisioned by imagebuilder\" /home/{user} /bin/bash\nm {user} wheel\n");
    let tmpfiles = format!(
        "d /home/{user}/.ssh 0700 {user} {user} -\n\
         f+ /home/{user}/.ssh/authorized_keys 0600 {user} {user} - {key}\n",
        key = uc.ssh_public_key.trim()
    );

    let mut builder = tar::Builder::new(Vec::new());
    for dir in ["usr/", "usr/lib/", "usr/lib/sysusers.d/", "usr/lib/tmpfiles.d/"] {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(0);
        builder.append_data(&mut header, dir, std::io::empty())?;
    }
    for (path, contents) in [(SYSUSERS_PATH, sysusers), (TMPFILES_PATH, tmpfiles)] {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(contents.len() as u64);
        header.set_mtime(0);
        builder.append_data(&mut header, path, contents.as_bytes())?;
    }
    builder.into_inner()
}

/// Rewrites `image` for the requested binding. The result has a new manifest
/// and, for early binding, a new config and one extra layer.
pub fn apply_binding(
    mut image: Image,
    binding: BindingType,
    user: Option<&UserConfiguration>,
    source_ref: &str,
) -> Result<Image, String> {
    if let (BindingType::Early, Some(uc)) = (binding, user) {
        let layer = Bytes::from(user_layer(uc).map_err(|e| format!("building user layer: {e}"))?);
        let layer_desc = Descriptor::for_blob(MEDIA_TYPE_IMAGE_LAYER, &layer);

        let config_bytes = image
            .blobs
            .get(&image.manifest.config.digest)
            .ok_or_else(|| "image config blob missing".to_string())?;
        let mut config: serde_json::Value =
            serde_json::from_slice(config_bytes).map_err(|e| format!("image config is not JSON: {e}"))?;

        // Uncompressed layer: diff id equals the blob digest.
        let diff_id = serde_json::Value::String(layer_desc.digest.to_string());
        match config.pointer_mut("/rootfs/diff_ids").and_then(|v| v.as_array_mut()) {
            Some(ids) => ids.push(diff_id),
            None => return Err("image config has no rootfs.diff_ids".to_string()),
        }
        let history = serde_json::json!({
            "created_by": format!("imagebuilder: provision user {}", uc.username),
            "comment": "early binding",
        });
        match config.get_mut("history").and_then(|v| v.as_array_mut()) {
            Some(h) => h.push(history),
            None => config["history"] = serde_json::json!([history]),
        }

        let new_config = Bytes::from(serde_json::to_vec(&config).map_err(|e| e.to_string())?);
        let mut config_desc = Descriptor::for_blob(MEDIA_TYPE_IMAGE_CONFIG, &new_config);
        config_desc.media_type = image.manifest.config.media_type.clone();

        image.blobs.insert(config_desc.digest.clone(), new_config);
        image.blobs.insert(layer_desc.digest.clone(), layer);
        image.manifest.config = config_desc;
        image.manifest.layers.push(layer_desc);
    }

    image
        .manifest
        .annotations
        .insert(ANNOTATION_BINDING.to_string(), binding.as_str().to_string());
    image
        .manifest
        .annotations
        .insert(ANNOTATION_SOURCE.to_string(), source_ref.to_string());

    // Blobs not referenced anymore (the old config) are not pushed.
    let referenced: Vec<Digest> = image.manifest.blobs().map(|d| d.digest.clone()).collect();
    image.blobs.retain(|d, _| referenced.contains(d));
    Ok(Image::from_parts(image.manifest, image.blobs))
}
