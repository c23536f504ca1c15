use crate::aws::sdk_config;
use async_trait::async_trait;
use aws_sdk_eks::types::Cluster;
use aws_smithy_types::error::display::DisplayErrorContext;
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display(
        "Error describing cluster '{}': {}",
        cluster_name,
        DisplayErrorContext(source)
    ))]
    DescribeCluster {
        cluster_name: String,
        source: aws_sdk_eks::error::SdkError<
            aws_sdk_eks::operation::describe_cluster::DescribeClusterError,
        >,
    },

    #[snafu(display("Missing field '{}' in EKS response", field))]
    Missing { field: &'static str },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// What the kubelet needs to reach the cluster: the base64-encoded CA bundle and the API server
/// endpoint. Always handled as a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClusterConnection {
    pub(crate) b64_ca: String,
    pub(crate) endpoint: String,
}

/// The cluster control plane, queried by cluster name.
#[async_trait]
pub(crate) trait ControlPlane {
    async fn describe_cluster(&self, region: &str, cluster_name: &str)
        -> Result<ClusterConnection>;
}

/// `ControlPlane` backed by the EKS `DescribeCluster` API.
pub(crate) struct EksClient;

#[async_trait]
impl ControlPlane for EksClient {
    async fn describe_cluster(
        &self,
        region: &str,
        cluster_name: &str,
    ) -> Result<ClusterConnection> {
        let config = sdk_config(region).await;
        let client = aws_sdk_eks::Client::new(&config);

        debug!("Describing cluster '{}' in {}", cluster_name, region);
        let cluster = client
            .describe_cluster()
            .name(cluster_name)
            .send()
            .await
            .context(DescribeClusterSnafu { cluster_name })?
            .cluster
            .context(MissingSnafu { field: "cluster" })?;

        connection_from_cluster(&cluster)
    }
}

fn connection_from_cluster(cluster: &Cluster) -> Result<ClusterConnection> {
    let b64_ca = cluster
        .certificate_authority()
        .and_then(|ca| ca.data())
        .filter(|data| !data.is_empty())
        .context(MissingSnafu {
            field: "certificateAuthority.data",
        })?;
    let endpoint = cluster
        .endpoint()
        .filter(|endpoint| !endpoint.is_empty())
        .context(MissingSnafu { field: "endpoint" })?;

    Ok(ClusterConnection {
        b64_ca: b64_ca.to_string(),
        endpoint: endpoint.to_string(),
    })
}
