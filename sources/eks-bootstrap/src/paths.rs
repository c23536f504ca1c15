//! Fixed locations of the files the bootstrap reads and writes.

use std::path::{Path, PathBuf};

const CA_CERTIFICATE_PATH: &str = "/etc/kubernetes/pki/ca.crt";
const KUBECONFIG_PATH: &str = "/var/lib/kubelet/kubeconfig";
const KUBELET_DROPIN_DIR: &str = "/etc/systemd/system/kubelet.service.d";
const CONTAINER_RUNTIME_ENV_PATH: &str = "/etc/sysconfig/docker";
const SHELL_PROFILE_PATH: &str = "/etc/profile.d/proxy.sh";
const ENI_MAX_PODS_PATH: &str = "/etc/eks/eni-max-pods.txt";

/// Where each artifact lives. `Paths::default()` is the real filesystem layout; tests use
/// `Paths::under` to move everything below a scratch directory.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Paths {
    pub(crate) ca_certificate: PathBuf,
    pub(crate) kubeconfig: PathBuf,
    pub(crate) kubelet_dropin_dir: PathBuf,
    pub(crate) container_runtime_env: PathBuf,
    pub(crate) shell_profile: PathBuf,
    pub(crate) eni_max_pods: PathBuf,
}

impl Paths {
    pub(crate) fn under<P>(root: P) -> Self
    where
        P: AsRef<Path>,
    {
        let root = root.as_ref();
        let rooted = |path: &str| root.join(path.trim_start_matches('/'));
        Self {
            ca_certificate: rooted(CA_CERTIFICATE_PATH),
            kubeconfig: rooted(KUBECONFIG_PATH),
            kubelet_dropin_dir: rooted(KUBELET_DROPIN_DIR),
            container_runtime_env: rooted(CONTAINER_RUNTIME_ENV_PATH),
            shell_profile: rooted(SHELL_PROFILE_PATH),
            eni_max_pods: rooted(ENI_MAX_PODS_PATH),
        }
    }

    /// Path of a drop-in for the kubelet unit, e.g. `10-kubelet-args.conf`.
    pub(crate) fn kubelet_dropin(&self, name: &str) -> PathBuf {
        self.kubelet_dropin_dir.join(name)
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::under("/")
    }
}
