//! Writes the kubelet's view of the cluster: the CA certificate and the kubeconfig that points at
//! the API server with that CA.

use crate::files;
use crate::paths::Paths;
use base64::Engine;
use handlebars::Handlebars;
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use std::path::Path;

const CA_CERTIFICATE_MODE: u32 = 0o644;
const KUBECONFIG_MODE: u32 = 0o600;

const KUBECONFIG_TEMPLATE_NAME: &str = "kubeconfig";
const KUBECONFIG_TEMPLATE: &str = r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority: {{ca_file}}
    server: {{endpoint}}
  name: kubernetes
contexts:
- context:
    cluster: kubernetes
    user: kubelet
  name: kubelet
current-context: kubelet
users:
- name: kubelet
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: /usr/bin/aws-iam-authenticator
      args:
        - "token"
        - "-i"
        - "{{cluster_name}}"
"#;

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("Unable to decode base64 cluster CA: {}", source))]
    Base64Decode { source: base64::DecodeError },

    #[snafu(display("Failed to write CA certificate: {}", source))]
    WriteCaCertificate { source: files::Error },

    #[snafu(display("Failed to register kubeconfig template: {}", source))]
    TemplateRegister {
        #[snafu(source(from(handlebars::TemplateError, Box::new)))]
        source: Box<handlebars::TemplateError>,
    },

    #[snafu(display("Failed to render kubeconfig: {}", source))]
    TemplateRender {
        #[snafu(source(from(handlebars::RenderError, Box::new)))]
        source: Box<handlebars::RenderError>,
    },

    #[snafu(display("Failed to write kubeconfig: {}", source))]
    WriteKubeconfig { source: files::Error },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Serialize)]
struct KubeconfigData<'a> {
    cluster_name: &'a str,
    endpoint: &'a str,
    ca_file: String,
}

/// Decodes the CA bundle. Whitespace is ignored, so wrapped base64 is accepted.
pub(crate) fn decode_ca(b64_ca: &str) -> Result<Vec<u8>> {
    let compact: String = b64_ca
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .context(Base64DecodeSnafu)
}

pub(crate) fn write_ca_certificate(paths: &Paths, b64_ca: &str) -> Result<()> {
    let ca = decode_ca(b64_ca)?;
    info!(
        "Writing cluster CA certificate to '{}'",
        paths.ca_certificate.display()
    );
    files::write_atomic(&paths.ca_certificate, ca, CA_CERTIFICATE_MODE)
        .context(WriteCaCertificateSnafu)
}

pub(crate) fn render_kubeconfig(
    cluster_name: &str,
    endpoint: &str,
    ca_file: &Path,
) -> Result<String> {
    let mut registry = Handlebars::new();
    // Fail on any template key missing from the data
    registry.set_strict_mode(true);
    // YAML, not HTML
    registry.register_escape_fn(handlebars::no_escape);
    registry
        .register_template_string(KUBECONFIG_TEMPLATE_NAME, KUBECONFIG_TEMPLATE)
        .context(TemplateRegisterSnafu)?;

    let data = KubeconfigData {
        cluster_name,
        endpoint,
        ca_file: ca_file.display().to_string(),
    };
    registry
        .render(KUBECONFIG_TEMPLATE_NAME, &data)
        .context(TemplateRenderSnafu)
}

pub(crate) fn write_kubeconfig(paths: &Paths, cluster_name: &str, endpoint: &str) -> Result<()> {
    let kubeconfig = render_kubeconfig(cluster_name, endpoint, &paths.ca_certificate)?;
    info!("Writing kubeconfig to '{}'", paths.kubeconfig.display());
    files::write_atomic(&paths.kubeconfig, kubeconfig, KUBECONFIG_MODE)
        .context(WriteKubeconfigSnafu)
}
