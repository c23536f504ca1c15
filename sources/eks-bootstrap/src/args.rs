//! Command line parsing. Everything the bootstrap does is decided here, before any call to IMDS,
//! EKS, the filesystem, or systemd.

use crate::eks::ClusterConnection;
use crate::proxy::ProxySettings;
use argh::FromArgs;
use simplelog::LevelFilter;
use snafu::{ensure, ResultExt, Snafu};
use std::net::IpAddr;
use url::Url;

#[derive(FromArgs, PartialEq, Debug)]
/// Join this instance to an EKS cluster and start the kubelet.
struct Args {
    /// name of the EKS cluster to join
    #[argh(positional)]
    cluster_name: Option<String>,

    /// set the kubelet's max pods from the instance type table (default: true)
    #[argh(option, default = "true")]
    use_max_pods: bool,

    /// base64-encoded cluster CA bundle; requires --apiserver-endpoint
    #[argh(option)]
    b64_cluster_ca: Option<String>,

    /// cluster API server endpoint; requires --b64-cluster-ca
    #[argh(option)]
    apiserver_endpoint: Option<String>,

    /// extra arguments passed to the kubelet as-is
    #[argh(option)]
    kubelet_extra_args: Option<String>,

    /// proxy for HTTP traffic from the kubelet and container runtime
    #[argh(option)]
    http_proxy: Option<String>,

    /// proxy for HTTPS traffic from the kubelet and container runtime
    #[argh(option)]
    https_proxy: Option<String>,

    /// hosts that bypass the proxy
    #[argh(option)]
    no_proxy: Option<String>,

    /// cluster DNS address, instead of the one derived from the node IP
    #[argh(option)]
    dns_cluster_ip: Option<IpAddr>,

    /// log level: off, error, warn, info, debug, or trace (default: info)
    #[argh(option, default = "LevelFilter::Info")]
    log_level: LevelFilter,
}

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("{}", usage))]
    Help { usage: String },

    #[snafu(display("{}", message))]
    Usage { message: String },

    #[snafu(display("Missing required cluster name"))]
    MissingClusterName,

    #[snafu(display("--{} was given without --{}; pass both or neither", given, missing))]
    HalfClusterConnection {
        given: &'static str,
        missing: &'static str,
    },

    #[snafu(display("Invalid --apiserver-endpoint '{}': {}", endpoint, source))]
    EndpointParse {
        endpoint: String,
        source: url::ParseError,
    },

    #[snafu(display(
        "Invalid --apiserver-endpoint '{}': expected an https URL, found scheme '{}'",
        endpoint,
        scheme
    ))]
    EndpointScheme { endpoint: String, scheme: String },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Everything the bootstrap was asked to do. Built once, never changed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settings {
    pub(crate) cluster_name: String,
    pub(crate) use_max_pods: bool,
    pub(crate) cluster_connection: Option<ClusterConnection>,
    pub(crate) kubelet_extra_args: Option<String>,
    pub(crate) proxy: ProxySettings,
    pub(crate) dns_cluster_ip: Option<IpAddr>,
    pub(crate) log_level: LevelFilter,
}

/// Usage text for `program`.
pub(crate) fn usage(program: &str) -> String {
    match Args::from_args(&[program], &["--help"]) {
        Err(early_exit) => early_exit.output,
        Ok(_) => String::new(),
    }
}

/// Parses `args` (without the program name) into `Settings`.
pub(crate) fn parse_args(program: &str, args: &[&str]) -> Result<Settings> {
    let args = Args::from_args(&[program], args).map_err(|early_exit| {
        if early_exit.status.is_ok() {
            Error::Help {
                usage: early_exit.output,
            }
        } else {
            Error::Usage {
                message: early_exit.output.trim_end().to_string(),
            }
        }
    })?;

    Settings::try_from(args)
}

/// Empty strings are treated the same as absent values.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let url = Url::parse(endpoint).context(EndpointParseSnafu { endpoint })?;
    ensure!(
        url.scheme() == "https",
        EndpointSchemeSnafu {
            endpoint,
            scheme: url.scheme(),
        }
    );
    Ok(())
}

impl TryFrom<Args> for Settings {
    type Error = Error;

    fn try_from(args: Args) -> Result<Self> {
        let cluster_name = non_empty(args.cluster_name).ok_or(Error::MissingClusterName)?;

        let cluster_connection = match (
            non_empty(args.b64_cluster_ca),
            non_empty(args.apiserver_endpoint),
        ) {
            (Some(b64_ca), Some(endpoint)) => {
                validate_endpoint(&endpoint)?;
                Some(ClusterConnection { b64_ca, endpoint })
            }
            (None, None) => None,
            (Some(_), None) => {
                return HalfClusterConnectionSnafu {
                    given: "b64-cluster-ca",
                    missing: "apiserver-endpoint",
                }
                .fail()
            }
            (None, Some(_)) => {
                return HalfClusterConnectionSnafu {
                    given: "apiserver-endpoint",
                    missing: "b64-cluster-ca",
                }
                .fail()
            }
        };

        Ok(Settings {
            cluster_name,
            use_max_pods: args.use_max_pods,
            cluster_connection,
            kubelet_extra_args: non_empty(args.kubelet_extra_args),
            proxy: ProxySettings {
                http_proxy: non_empty(args.http_proxy),
                https_proxy: non_empty(args.https_proxy),
                no_proxy: non_empty(args.no_proxy),
            },
            dns_cluster_ip: args.dns_cluster_ip,
            log_level: args.log_level,
        })
    }
}
