//! Proxy environment for the node.
//!
//! Each proxy variable is set in both cases (`HTTP_PROXY` and `http_proxy`) in three places: a
//! drop-in for the kubelet unit, the container runtime's environment file, and a login shell
//! profile script. Variables are handled independently of each other.

use crate::files;
use crate::paths::Paths;
use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

const DROPIN_MODE: u32 = 0o644;
const ENV_FILE_MODE: u32 = 0o644;

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("Failed to write {} to '{}': {}", variable, path.display(), source))]
    WriteProxy {
        variable: &'static str,
        path: PathBuf,
        source: files::Error,
    },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Proxy settings given on the command line. Empty values are stored as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ProxySettings {
    pub(crate) http_proxy: Option<String>,
    pub(crate) https_proxy: Option<String>,
    pub(crate) no_proxy: Option<String>,
}

struct ProxyVariable<'a> {
    upper: &'static str,
    lower: &'static str,
    dropin: &'static str,
    value: &'a str,
}

impl ProxySettings {
    fn variables(&self) -> Vec<ProxyVariable<'_>> {
        [
            ("HTTP_PROXY", "http_proxy", "40-http-proxy.conf", &self.http_proxy),
            ("HTTPS_PROXY", "https_proxy", "40-https-proxy.conf", &self.https_proxy),
            ("NO_PROXY", "no_proxy", "40-no-proxy.conf", &self.no_proxy),
        ]
        .into_iter()
        .filter_map(|(upper, lower, dropin, value)| {
            value
                .as_deref()
                .filter(|value| !value.is_empty())
                .map(|value| ProxyVariable {
                    upper,
                    lower,
                    dropin,
                    value,
                })
        })
        .collect()
    }
}

impl ProxyVariable<'_> {
    fn dropin(&self) -> String {
        format!(
            "[Service]\nEnvironment=\"{}={}\"\nEnvironment=\"{}={}\"\n",
            self.upper, self.value, self.lower, self.value
        )
    }

    fn env_lines(&self) -> [String; 2] {
        [
            format!("{}={}", self.upper, self.value),
            format!("{}={}", self.lower, self.value),
        ]
    }

    fn profile_lines(&self) -> [String; 2] {
        [
            format!("export {}={}", self.upper, self.value),
            format!("export {}={}", self.lower, self.value),
        ]
    }

    fn write(&self, paths: &Paths) -> Result<()> {
        let variable = self.upper;

        let dropin_path = paths.kubelet_dropin(self.dropin);
        files::write_atomic(&dropin_path, self.dropin(), DROPIN_MODE).context(
            WriteProxySnafu {
                variable,
                path: &dropin_path,
            },
        )?;

        files::append_missing_lines(&paths.container_runtime_env, &self.env_lines(), ENV_FILE_MODE)
            .context(WriteProxySnafu {
                variable,
                path: &paths.container_runtime_env,
            })?;

        files::append_missing_lines(&paths.shell_profile, &self.profile_lines(), ENV_FILE_MODE)
            .context(WriteProxySnafu {
                variable,
                path: &paths.shell_profile,
            })?;
        Ok(())
    }
}

/// Writes the environment for every proxy variable that has a value.
pub(crate) fn write_proxy_settings(paths: &Paths, proxy: &ProxySettings) -> Result<()> {
    for variable in proxy.variables() {
        info!("Configuring {} for kubelet and container runtime", variable.upper);
        debug!("{}={}", variable.upper, variable.value);
        variable.write(paths)?;
    }
    Ok(())
}
