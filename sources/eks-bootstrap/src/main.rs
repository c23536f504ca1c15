/*!
# Introduction

eks-bootstrap joins an EC2 instance to an existing EKS cluster and starts the kubelet.

It uses IMDS to get information such as:

- Availability zone (and from it, the AWS region)
- Node IP
- Instance type

It uses EKS to get the cluster's CA bundle and API server endpoint, unless both are given on the
command line.

# Interface

```text
eks-bootstrap <cluster-name> [--b64-cluster-ca <ca> --apiserver-endpoint <url>]
    [--use-max-pods <bool>] [--kubelet-extra-args <args>]
    [--http-proxy <url>] [--https-proxy <url>] [--no-proxy <hosts>]
    [--dns-cluster-ip <ip>] [--log-level <level>]
```

The CA certificate and kubeconfig are written under `/etc/kubernetes` and `/var/lib/kubelet`.
Kubelet flags and proxy variables are written as drop-ins for `kubelet.service`, and proxy
variables are also appended to the container runtime's environment and a login shell profile.
Then systemd is reloaded and the kubelet is enabled and started.

The run stops at the first failure and exits 1, leaving any files already written in place. If
`systemctl` itself fails, its exit code is used instead.
*/

#![deny(rust_2018_idioms)]

#[macro_use]
extern crate log;

mod args;
mod aws;
mod bootstrap;
mod eks;
mod files;
mod imds;
mod kubeconfig;
mod kubelet;
mod max_pods;
mod network;
mod paths;
mod proxy;
mod systemd;

use crate::eks::EksClient;
use crate::paths::Paths;
use crate::systemd::Systemctl;
use imdsclient::ImdsClient;
use simplelog::{Config as LogConfig, SimpleLogger};
use snafu::ResultExt;
use std::{env, process};

const DEFAULT_PROGRAM_NAME: &str = "eks-bootstrap";

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let settings = args::parse_args(program, args).context(error::ArgsSnafu)?;
    SimpleLogger::init(settings.log_level, LogConfig::default()).context(error::LoggerSnafu)?;

    info!("Bootstrapping node for cluster '{}'", settings.cluster_name);
    let mut imds_client = ImdsClient::new().await.context(error::ImdsClientSnafu)?;
    let summary = bootstrap::bootstrap(
        &settings,
        &Paths::default(),
        &mut imds_client,
        &EksClient,
        &Systemctl::default(),
    )
    .await
    .context(error::BootstrapSnafu)?;

    info!(
        "Node joined cluster '{}' in {}: endpoint {}, node IP {}, cluster DNS {}, max pods {}",
        settings.cluster_name,
        summary.region,
        summary.endpoint,
        summary.node_ip,
        summary.dns_cluster_ip,
        summary
            .max_pods
            .map(|count| count.to_string())
            .unwrap_or_else(|| "unset".to_string()),
    );
    Ok(())
}

// Returning a Result from main makes it print a Debug representation of the error, but with Snafu
// we have nice Display representations of the error, so we wrap "main" (run) and print any error.
// https://github.com/shepmaster/snafu/issues/110
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mut argv = env::args();
    let program = argv
        .next()
        .unwrap_or_else(|| DEFAULT_PROGRAM_NAME.to_string());
    let args: Vec<String> = argv.collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    if let Err(e) = run(&program, &args).await {
        match &e {
            error::Error::Args {
                source: args::Error::Help { usage },
            } => eprintln!("{}", usage),
            error::Error::Args { .. } => eprintln!("{}\n\n{}", e, args::usage(&program)),
            _ => eprintln!("{}", e),
        }
        process::exit(e.exit_code());
    }
}

mod error {
    use crate::{args, bootstrap};
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(display("{}", source))]
        Args { source: args::Error },

        #[snafu(display("Failed to setup logger: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("Failed to create IMDS client: {}", source))]
        ImdsClient { source: imdsclient::Error },

        #[snafu(display("{}", source))]
        Bootstrap { source: bootstrap::Error },
    }

    impl Error {
        pub(super) fn exit_code(&self) -> i32 {
            match self {
                Error::Bootstrap { source } => source.exit_code(),
                _ => 1,
            }
        }
    }
}

type Result<T> = std::result::Result<T, error::Error>;
