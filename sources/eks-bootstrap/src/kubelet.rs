//! Kubelet runtime flags, delivered as systemd drop-ins for the kubelet unit. The unit's
//! `ExecStart` expands `$KUBELET_ARGS $KUBELET_MAX_PODS $KUBELET_EXTRA_ARGS`.

use crate::files;
use crate::paths::Paths;
use lazy_static::lazy_static;
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;

const DROPIN_MODE: u32 = 0o644;

const KUBELET_ARGS_DROPIN: &str = "10-kubelet-args.conf";
const MAX_PODS_DROPIN: &str = "20-max-pods.conf";
const EXTRA_ARGS_DROPIN: &str = "30-kubelet-extra-args.conf";

const PAUSE_IMAGE: &str = "eks/pause-amd64:3.1";

lazy_static! {
    /// Registry account hosting the pause image in each region.
    static ref PAUSE_CONTAINER_MAP: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("af-south-1", "877085696533");
        m.insert("ap-east-1", "800184023465");
        m.insert("ap-northeast-1", "602401143452");
        m.insert("ap-northeast-2", "602401143452");
        m.insert("ap-northeast-3", "602401143452");
        m.insert("ap-south-1", "602401143452");
        m.insert("ap-southeast-1", "602401143452");
        m.insert("ap-southeast-2", "602401143452");
        m.insert("ca-central-1", "602401143452");
        m.insert("cn-north-1", "918309763551");
        m.insert("cn-northwest-1", "961992271922");
        m.insert("eu-central-1", "602401143452");
        m.insert("eu-north-1", "602401143452");
        m.insert("eu-south-1", "590381155156");
        m.insert("eu-west-1", "602401143452");
        m.insert("eu-west-2", "602401143452");
        m.insert("eu-west-3", "602401143452");
        m.insert("me-south-1", "558608220178");
        m.insert("sa-east-1", "602401143452");
        m.insert("us-east-1", "602401143452");
        m.insert("us-east-2", "602401143452");
        m.insert("us-gov-east-1", "151742754352");
        m.insert("us-gov-west-1", "013241004608");
        m.insert("us-west-1", "602401143452");
        m.insert("us-west-2", "602401143452");
        m
    };
}

/// Registry account for regions missing from the map.
const PAUSE_FALLBACK_REGISTRY: &str = "602401143452";

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("Failed to write kubelet drop-in '{}': {}", name, source))]
    WriteDropin {
        name: &'static str,
        source: files::Error,
    },

    #[snafu(display("Failed to remove stale kubelet drop-in '{}': {}", name, source))]
    RemoveDropin {
        name: &'static str,
        source: files::Error,
    },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Fully qualified pause (pod infra container) image for `region`. The image is always pulled
/// from the node's own region.
pub(crate) fn pause_image(region: &str) -> String {
    let registry_id = PAUSE_CONTAINER_MAP
        .get(region)
        .copied()
        .unwrap_or(PAUSE_FALLBACK_REGISTRY);
    format!(
        "{}.dkr.ecr.{}.amazonaws.com/{}",
        registry_id, region, PAUSE_IMAGE
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KubeletFlags {
    pub(crate) node_ip: String,
    pub(crate) cluster_dns: String,
    pub(crate) pod_infra_container_image: String,
    pub(crate) max_pods: Option<u32>,
    pub(crate) extra_args: Option<String>,
}

impl KubeletFlags {
    /// The flags that are always set.
    pub(crate) fn args(&self) -> String {
        format!(
            "--node-ip={} --cluster-dns={} --pod-infra-container-image={}",
            self.node_ip, self.cluster_dns, self.pod_infra_container_image
        )
    }

    pub(crate) fn max_pods_flag(&self) -> Option<String> {
        self.max_pods.map(|count| format!("--max-pods={}", count))
    }
}

fn environment_dropin(variable: &str, value: &str) -> String {
    format!("[Service]\nEnvironment='{}={}'\n", variable, value)
}

fn write_dropin(paths: &Paths, name: &'static str, variable: &str, value: &str) -> Result<()> {
    let path = paths.kubelet_dropin(name);
    debug!("Writing {} to '{}'", variable, path.display());
    files::write_atomic(&path, environment_dropin(variable, value), DROPIN_MODE)
        .context(WriteDropinSnafu { name })
}

/// Writes the optional drop-in when there's a value, and otherwise removes one left over from an
/// earlier run.
fn write_or_remove_dropin(
    paths: &Paths,
    name: &'static str,
    variable: &str,
    value: Option<&str>,
) -> Result<()> {
    match value {
        Some(value) => write_dropin(paths, name, variable, value),
        None => {
            if files::remove_if_exists(paths.kubelet_dropin(name))
                .context(RemoveDropinSnafu { name })?
            {
                info!("Removed stale kubelet drop-in '{}'", name);
            }
            Ok(())
        }
    }
}

pub(crate) fn write_dropins(paths: &Paths, flags: &KubeletFlags) -> Result<()> {
    info!(
        "Writing kubelet drop-ins to '{}'",
        paths.kubelet_dropin_dir.display()
    );
    write_dropin(paths, KUBELET_ARGS_DROPIN, "KUBELET_ARGS", &flags.args())?;
    write_or_remove_dropin(
        paths,
        MAX_PODS_DROPIN,
        "KUBELET_MAX_PODS",
        flags.max_pods_flag().as_deref(),
    )?;
    write_or_remove_dropin(
        paths,
        EXTRA_ARGS_DROPIN,
        "KUBELET_EXTRA_ARGS",
        flags.extra_args.as_deref().filter(|args| !args.is_empty()),
    )?;
    Ok(())
}
