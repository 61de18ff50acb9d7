//! Resource resolver (§4.6).
//!
//! Grounded on `examples/original_source/discover/resource.c`'s
//! `resource_resolve`/`resource_device_match` matching rules, generalized
//! to the `Resource` enum's three pending variants.

use crate::model::{DiscoverDevice, Resource};
use crate::url::file_url;

/// Match a `device_spec` (`uuid=X`, `label=X`, or a bare id) against a
/// device, per §4.6's matching rules.
pub fn device_matches_spec(device: &DiscoverDevice, spec: &str) -> bool {
    if let Some(uuid) = spec.strip_prefix("uuid=") {
        device.matches_uuid(uuid)
    } else if let Some(label) = spec.strip_prefix("label=") {
        device.matches_label(label)
    } else {
        device.matches_bare_id(spec)
    }
}

/// Generic resolution shared by every format parser's `DevPathPending` and
/// `Grub2Pending` resources (§4.6): called once per unresolved resource for
/// each candidate device until one matches.
pub fn resolve_generic(device: &DiscoverDevice, resource: &Resource) -> Option<Resource> {
    match resource {
        Resource::DevPathPending { device_spec, path } => {
            if device_matches_spec(device, device_spec) {
                let mount_path = device.mount.mount_path.as_ref()?;
                Some(Resource::Resolved(file_url(mount_path.as_str(), path)))
            } else {
                None
            }
        }
        Resource::Grub2Pending { root_uuid, path } => {
            if device.matches_uuid(root_uuid) {
                let mount_path = device.mount.mount_path.as_ref()?;
                Some(Resource::Resolved(file_url(mount_path.as_str(), path)))
            } else {
                None
            }
        }
        Resource::UrlPending { path } => {
            let mount_path = device.mount.mount_path.as_ref()?;
            Some(Resource::Resolved(file_url(mount_path.as_str(), path)))
        }
        Resource::Resolved(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceType, MountState};
    use camino::Utf8PathBuf;

    fn device_with_mount(id: &str, uuid: Option<&str>, mount: &str) -> DiscoverDevice {
        let mut d = DiscoverDevice::new(id, DeviceType::Disk);
        d.uuid = uuid.map(|s| s.to_string());
        d.mount = MountState {
            mounted: true,
            mount_path: Some(Utf8PathBuf::from(mount)),
            mounted_rw: false,
            unmount_on_drop: true,
        };
        d
    }

    #[test]
    fn devpath_pending_resolves_against_bare_id() {
        let dev = device_with_mount("sda1", None, "/mnt/sda1");
        let r = Resource::DevPathPending {
            device_spec: "sda1".into(),
            path: "/vmlinux".into(),
        };
        let resolved = resolve_generic(&dev, &r).unwrap();
        assert_eq!(resolved.resolved_url().unwrap().render(), "/mnt/sda1/vmlinux");
    }

    #[test]
    fn grub2_pending_resolves_against_uuid() {
        let dev = device_with_mount("sdb1", Some("BBB"), "/mnt/sdb1");
        let r = Resource::Grub2Pending {
            root_uuid: "BBB".into(),
            path: "/vm".into(),
        };
        assert!(resolve_generic(&dev, &r).is_some());
        let r2 = Resource::Grub2Pending {
            root_uuid: "CCC".into(),
            path: "/vm".into(),
        };
        assert!(resolve_generic(&dev, &r2).is_none());
    }

    #[test]
    fn sweep_unresolved_is_idempotent() {
        let dev = device_with_mount("sda1", None, "/mnt/sda1");
        let r = Resource::DevPathPending {
            device_spec: "nomatch".into(),
            path: "/x".into(),
        };
        assert!(resolve_generic(&dev, &r).is_none());
        assert!(resolve_generic(&dev, &r).is_none());
    }
}
