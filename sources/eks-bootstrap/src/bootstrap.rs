//! The bootstrap procedure. Steps run in order and the first failure ends the run; files already
//! written are left in place.

use crate::args::Settings;
use crate::eks::{self, ClusterConnection, ControlPlane};
use crate::imds::{self, region_from_zone, InstanceMetadata};
use crate::kubeconfig;
use crate::kubelet::{self, pause_image, KubeletFlags};
use crate::max_pods::{self, resolve_max_pods};
use crate::network::{self, NodeNetwork};
use crate::paths::Paths;
use crate::proxy::{self, write_proxy_settings};
use crate::systemd::{self, ServiceManager, KUBELET_UNIT};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("Failed to read instance metadata: {}", source))]
    InstanceMetadata { source: imds::Error },

    #[snafu(display("Failed to discover cluster connection: {}", source))]
    Discovery { source: eks::Error },

    #[snafu(display("{}", source))]
    Kubeconfig { source: kubeconfig::Error },

    #[snafu(display("{}", source))]
    Network { source: network::Error },

    #[snafu(display("{}", source))]
    MaxPods { source: max_pods::Error },

    #[snafu(display("{}", source))]
    Kubelet { source: kubelet::Error },

    #[snafu(display("{}", source))]
    Proxy { source: proxy::Error },

    #[snafu(display("Failed to start kubelet: {}", source))]
    Service { source: systemd::Error },
}

impl Error {
    /// A failed `systemctl` passes its own exit code through; everything else exits 1.
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            Error::Service { source } => source.command_exit_code().unwrap_or(1),
            _ => 1,
        }
    }
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// What a successful run configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Summary {
    pub(crate) region: String,
    pub(crate) endpoint: String,
    pub(crate) node_ip: String,
    pub(crate) dns_cluster_ip: String,
    pub(crate) max_pods: Option<u32>,
}

pub(crate) async fn bootstrap<M, C, S>(
    settings: &Settings,
    paths: &Paths,
    metadata: &mut M,
    control_plane: &C,
    services: &S,
) -> Result<Summary>
where
    M: InstanceMetadata + ?Sized,
    C: ControlPlane + ?Sized,
    S: ServiceManager + ?Sized,
{
    let zone = metadata
        .availability_zone()
        .await
        .context(InstanceMetadataSnafu)?;
    let region = region_from_zone(&zone).context(InstanceMetadataSnafu)?;
    info!("Running in region {}", region);

    let connection = match &settings.cluster_connection {
        Some(connection) => {
            info!("Using the supplied cluster CA and API server endpoint");
            connection.clone()
        }
        None => {
            info!(
                "Describing cluster '{}' to find its CA and API server endpoint",
                settings.cluster_name
            );
            control_plane
                .describe_cluster(&region, &settings.cluster_name)
                .await
                .context(DiscoverySnafu)?
        }
    };
    let ClusterConnection { b64_ca, endpoint } = connection;
    debug!("API server endpoint is {}", endpoint);

    kubeconfig::write_ca_certificate(paths, &b64_ca).context(KubeconfigSnafu)?;
    kubeconfig::write_kubeconfig(paths, &settings.cluster_name, &endpoint)
        .context(KubeconfigSnafu)?;

    let local_ipv4 = metadata.local_ipv4().await.context(InstanceMetadataSnafu)?;
    let node_network =
        NodeNetwork::new(&local_ipv4, settings.dns_cluster_ip).context(NetworkSnafu)?;
    info!(
        "Node IP is {}, cluster DNS is {}",
        node_network.internal_ip, node_network.dns_cluster_ip
    );

    let instance_type = metadata
        .instance_type()
        .await
        .context(InstanceMetadataSnafu)?;
    let max_pods = resolve_max_pods(settings.use_max_pods, &paths.eni_max_pods, &instance_type)
        .context(MaxPodsSnafu)?;

    let flags = KubeletFlags {
        node_ip: node_network.internal_ip.clone(),
        cluster_dns: node_network.dns_cluster_ip.clone(),
        pod_infra_container_image: pause_image(&region),
        max_pods,
        extra_args: settings.kubelet_extra_args.clone(),
    };
    kubelet::write_dropins(paths, &flags).context(KubeletSnafu)?;
    write_proxy_settings(paths, &settings.proxy).context(ProxySnafu)?;

    info!("Reloading systemd and starting {}", KUBELET_UNIT);
    services.daemon_reload().await.context(ServiceSnafu)?;
    services.enable(KUBELET_UNIT).await.context(ServiceSnafu)?;
    services.start(KUBELET_UNIT).await.context(ServiceSnafu)?;

    Ok(Summary {
        region,
        endpoint,
        node_ip: node_network.internal_ip,
        dns_cluster_ip: node_network.dns_cluster_ip,
        max_pods,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proxy::ProxySettings;
    use async_trait::async_trait;
    use base64::Engine;
    use simplelog::LevelFilter;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const CA: &str = "-----BEGIN CERTIFICATE-----\nZmFrZQ==\n-----END CERTIFICATE-----\n";
    const ENDPOINT: &str = "https://ABCDEF.gr7.us-west-2.eks.amazonaws.com";
    const DISCOVERED_ENDPOINT: &str = "https://DISCOVERED.yl4.us-west-2.eks.amazonaws.com";

    struct FakeMetadata {
        zone: &'static str,
        local_ipv4: &'static str,
        instance_type: &'static str,
        calls: Vec<&'static str>,
    }

    impl FakeMetadata {
        fn new(local_ipv4: &'static str) -> Self {
            Self {
                zone: "us-west-2a",
                local_ipv4,
                instance_type: "m5.large",
                calls: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl InstanceMetadata for FakeMetadata {
        async fn availability_zone(&mut self) -> imds::Result<String> {
            self.calls.push("availability_zone");
            Ok(self.zone.to_string())
        }

        async fn local_ipv4(&mut self) -> imds::Result<String> {
            self.calls.push("local_ipv4");
            Ok(self.local_ipv4.to_string())
        }

        async fn instance_type(&mut self) -> imds::Result<String> {
            self.calls.push("instance_type");
            Ok(self.instance_type.to_string())
        }
    }

    /// Answers with the discovered connection, or fails when `connection` is `None`.
    struct FakeControlPlane {
        connection: Option<ClusterConnection>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeControlPlane {
        fn new(connection: Option<ClusterConnection>) -> Self {
            Self {
                connection,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn describe_cluster(
            &self,
            region: &str,
            cluster_name: &str,
        ) -> eks::Result<ClusterConnection> {
            self.calls
                .lock()
                .unwrap()
                .push((region.to_string(), cluster_name.to_string()));
            self.connection
                .clone()
                .ok_or(eks::Error::Missing { field: "cluster" })
        }
    }

    /// Records each call; `fail_on` names an operation that exits with code 5.
    #[derive(Default)]
    struct FakeServices {
        fail_on: Option<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeServices {
        fn record(&self, call: String, operation: &str) -> systemd::Result<()> {
            self.calls.lock().unwrap().push(call.clone());
            if self.fail_on == Some(operation) {
                return Err(systemd::Error::SystemdCommandFailure {
                    args: call,
                    code: Some(5),
                    stderr: "Unit kubelet.service not found.".to_string(),
                });
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServiceManager for FakeServices {
        async fn daemon_reload(&self) -> systemd::Result<()> {
            self.record("daemon-reload".to_string(), "daemon-reload")
        }

        async fn enable(&self, unit: &str) -> systemd::Result<()> {
            self.record(format!("enable {}", unit), "enable")
        }

        async fn start(&self, unit: &str) -> systemd::Result<()> {
            self.record(format!("start {}", unit), "start")
        }
    }

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    fn supplied() -> ClusterConnection {
        ClusterConnection {
            b64_ca: b64(CA),
            endpoint: ENDPOINT.to_string(),
        }
    }

    fn discovered() -> ClusterConnection {
        ClusterConnection {
            b64_ca: b64(CA),
            endpoint: DISCOVERED_ENDPOINT.to_string(),
        }
    }

    fn settings(cluster_connection: Option<ClusterConnection>) -> Settings {
        Settings {
            cluster_name: "prod".to_string(),
            use_max_pods: true,
            cluster_connection,
            kubelet_extra_args: None,
            proxy: ProxySettings::default(),
            dns_cluster_ip: None,
            log_level: LevelFilter::Info,
        }
    }

    fn paths_with_table(dir: &TempDir, table: &str) -> Paths {
        let paths = Paths::under(dir.path());
        fs::create_dir_all(paths.eni_max_pods.parent().unwrap()).unwrap();
        fs::write(&paths.eni_max_pods, table).unwrap();
        paths
    }

    #[tokio::test]
    async fn supplied_connection_skips_discovery() {
        let dir = TempDir::new().unwrap();
        let paths = paths_with_table(&dir, "m5.large 29\n");
        let mut metadata = FakeMetadata::new("192.168.1.2");
        let control_plane = FakeControlPlane::new(Some(discovered()));
        let services = FakeServices::default();

        let summary = bootstrap(
            &settings(Some(supplied())),
            &paths,
            &mut metadata,
            &control_plane,
            &services,
        )
        .await
        .unwrap();

        assert!(control_plane.calls().is_empty());
        assert_eq!(
            metadata.calls,
            vec!["availability_zone", "local_ipv4", "instance_type"]
        );
        assert_eq!(
            summary,
            Summary {
                region: "us-west-2".to_string(),
                endpoint: ENDPOINT.to_string(),
                node_ip: "192.168.1.2".to_string(),
                dns_cluster_ip: "10.100.0.10".to_string(),
                max_pods: Some(29),
            }
        );
        assert_eq!(fs::read_to_string(&paths.ca_certificate).unwrap(), CA);
        let kubeconfig = fs::read_to_string(&paths.kubeconfig).unwrap();
        assert!(kubeconfig.contains(&format!("server: {}\n", ENDPOINT)));
        assert_eq!(
            fs::read_to_string(paths.kubelet_dropin("20-max-pods.conf")).unwrap(),
            "[Service]\nEnvironment='KUBELET_MAX_PODS=--max-pods=29'\n"
        );
    }

    #[tokio::test]
    async fn discovery_called_once_with_region_and_name() {
        let dir = TempDir::new().unwrap();
        let paths = paths_with_table(&dir, "m5.large 29\n");
        let mut metadata = FakeMetadata::new("10.5.1.2");
        let control_plane = FakeControlPlane::new(Some(discovered()));
        let services = FakeServices::default();

        let summary = bootstrap(
            &settings(None),
            &paths,
            &mut metadata,
            &control_plane,
            &services,
        )
        .await
        .unwrap();

        assert_eq!(
            control_plane.calls(),
            vec![("us-west-2".to_string(), "prod".to_string())]
        );
        assert_eq!(summary.endpoint, DISCOVERED_ENDPOINT);
        assert_eq!(summary.dns_cluster_ip, "172.20.0.10");
        assert_eq!(fs::read_to_string(&paths.ca_certificate).unwrap(), CA);
        let kubeconfig = fs::read_to_string(&paths.kubeconfig).unwrap();
        assert!(kubeconfig.contains(&format!("server: {}\n", DISCOVERED_ENDPOINT)));
        let args = fs::read_to_string(paths.kubelet_dropin("10-kubelet-args.conf")).unwrap();
        assert!(args.contains("--node-ip=10.5.1.2 --cluster-dns=172.20.0.10 "));
    }

    #[tokio::test]
    async fn instance_type_without_entry_sets_no_max_pods() {
        let dir = TempDir::new().unwrap();
        let paths = paths_with_table(&dir, "c5.xlarge 58\n");
        let mut metadata = FakeMetadata::new("192.168.1.2");
        let control_plane = FakeControlPlane::new(None);
        let services = FakeServices::default();

        let summary = bootstrap(
            &settings(Some(supplied())),
            &paths,
            &mut metadata,
            &control_plane,
            &services,
        )
        .await
        .unwrap();

        assert_eq!(summary.max_pods, None);
        assert!(!paths.kubelet_dropin("20-max-pods.conf").exists());
        assert_eq!(services.calls().len(), 3);
    }

    #[tokio::test]
    async fn max_pods_disabled_sets_no_flag() {
        let dir = TempDir::new().unwrap();
        let mut paths = Paths::under(dir.path());
        // Reading a directory as the table would fail the run
        paths.eni_max_pods = dir.path().to_path_buf();
        let mut metadata = FakeMetadata::new("192.168.1.2");
        let control_plane = FakeControlPlane::new(None);
        let services = FakeServices::default();
        let mut settings = settings(Some(supplied()));
        settings.use_max_pods = false;

        let summary = bootstrap(&settings, &paths, &mut metadata, &control_plane, &services)
            .await
            .unwrap();

        assert_eq!(summary.max_pods, None);
        assert!(!paths.kubelet_dropin("20-max-pods.conf").exists());
    }

    #[tokio::test]
    async fn dns_override_and_extra_args() {
        let dir = TempDir::new().unwrap();
        let paths = paths_with_table(&dir, "");
        let mut metadata = FakeMetadata::new("10.5.1.2");
        let control_plane = FakeControlPlane::new(None);
        let services = FakeServices::default();
        let mut settings = settings(Some(supplied()));
        settings.dns_cluster_ip = Some("10.200.0.10".parse().unwrap());
        settings.kubelet_extra_args = Some("--node-labels=role=worker".to_string());

        let summary = bootstrap(&settings, &paths, &mut metadata, &control_plane, &services)
            .await
            .unwrap();

        assert_eq!(summary.dns_cluster_ip, "10.200.0.10");
        assert_eq!(
            fs::read_to_string(paths.kubelet_dropin("30-kubelet-extra-args.conf")).unwrap(),
            "[Service]\nEnvironment='KUBELET_EXTRA_ARGS=--node-labels=role=worker'\n"
        );
    }

    #[tokio::test]
    async fn only_given_proxy_variables_are_written() {
        let dir = TempDir::new().unwrap();
        let paths = paths_with_table(&dir, "");
        let mut metadata = FakeMetadata::new("192.168.1.2");
        let control_plane = FakeControlPlane::new(None);
        let services = FakeServices::default();
        let mut settings = settings(Some(supplied()));
        settings.proxy.https_proxy = Some("http://proxy.local:3128".to_string());

        bootstrap(&settings, &paths, &mut metadata, &control_plane, &services)
            .await
            .unwrap();

        assert!(paths.kubelet_dropin("40-https-proxy.conf").exists());
        assert!(!paths.kubelet_dropin("40-http-proxy.conf").exists());
        assert!(!paths.kubelet_dropin("40-no-proxy.conf").exists());
        assert_eq!(
            fs::read_to_string(&paths.shell_profile).unwrap(),
            "export HTTPS_PROXY=http://proxy.local:3128\nexport https_proxy=http://proxy.local:3128\n"
        );
    }

    #[tokio::test]
    async fn services_reload_enable_start_in_order() {
        let dir = TempDir::new().unwrap();
        let paths = paths_with_table(&dir, "");
        let mut metadata = FakeMetadata::new("192.168.1.2");
        let control_plane = FakeControlPlane::new(None);
        let services = FakeServices::default();

        bootstrap(
            &settings(Some(supplied())),
            &paths,
            &mut metadata,
            &control_plane,
            &services,
        )
        .await
        .unwrap();

        assert_eq!(
            services.calls(),
            vec!["daemon-reload", "enable kubelet", "start kubelet"]
        );
    }

    #[tokio::test]
    async fn start_failure_keeps_files_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let paths = paths_with_table(&dir, "");
        let mut metadata = FakeMetadata::new("192.168.1.2");
        let control_plane = FakeControlPlane::new(None);
        let services = FakeServices {
            fail_on: Some("start"),
            ..Default::default()
        };

        let err = bootstrap(
            &settings(Some(supplied())),
            &paths,
            &mut metadata,
            &control_plane,
            &services,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Service { .. }));
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().contains("Unit kubelet.service not found."));
        assert!(paths.kubeconfig.exists());
        assert!(paths.kubelet_dropin("10-kubelet-args.conf").exists());
    }

    #[tokio::test]
    async fn discovery_failure_stops_before_writing() {
        let dir = TempDir::new().unwrap();
        let paths = paths_with_table(&dir, "");
        let mut metadata = FakeMetadata::new("192.168.1.2");
        let control_plane = FakeControlPlane::new(None);
        let services = FakeServices::default();

        let err = bootstrap(
            &settings(None),
            &paths,
            &mut metadata,
            &control_plane,
            &services,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Discovery { .. }));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(control_plane.calls().len(), 1);
        assert!(!paths.ca_certificate.exists());
        assert!(!paths.kubeconfig.exists());
        assert!(services.calls().is_empty());
    }

    #[tokio::test]
    async fn bad_node_ip_is_fatal() {
        let dir = TempDir::new().unwrap();
        let paths = paths_with_table(&dir, "");
        let mut metadata = FakeMetadata::new("not-an-ip");
        let control_plane = FakeControlPlane::new(None);
        let services = FakeServices::default();

        let err = bootstrap(
            &settings(Some(supplied())),
            &paths,
            &mut metadata,
            &control_plane,
            &services,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Network { .. }));
        assert!(services.calls().is_empty());
    }

    #[tokio::test]
    async fn unreadable_max_pods_table_is_fatal() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        let mut metadata = FakeMetadata::new("192.168.1.2");
        let control_plane = FakeControlPlane::new(None);
        let services = FakeServices::default();

        let err = bootstrap(
            &settings(Some(supplied())),
            &paths,
            &mut metadata,
            &control_plane,
            &services,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::MaxPods { .. }));
        assert_eq!(err.exit_code(), 1);
        assert!(!paths.kubelet_dropin("10-kubelet-args.conf").exists());
        assert!(services.calls().is_empty());
    }
}
