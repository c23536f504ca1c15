use async_trait::async_trait;
use snafu::{ensure, ResultExt, Snafu};
use std::path::PathBuf;
use tokio::process::Command;

const SYSTEMCTL_BIN: &str = "/bin/systemctl";

pub(crate) const KUBELET_UNIT: &str = "kubelet";

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("Failed to execute '{} {}': {}", bin.display(), args, source))]
    ExecutionFailure {
        bin: PathBuf,
        args: String,
        source: std::io::Error,
    },

    #[snafu(display("'systemctl {}' failed - stderr: {}", args, stderr))]
    SystemdCommandFailure {
        args: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl Error {
    /// The exit code of the failed command, if it ran and exited normally.
    pub(crate) fn command_exit_code(&self) -> Option<i32> {
        match self {
            Error::SystemdCommandFailure { code, .. } => *code,
            Error::ExecutionFailure { .. } => None,
        }
    }
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// The service manager that runs the kubelet.
#[async_trait]
pub(crate) trait ServiceManager {
    /// Reloads unit definitions so new drop-ins take effect.
    async fn daemon_reload(&self) -> Result<()>;
    async fn enable(&self, unit: &str) -> Result<()>;
    async fn start(&self, unit: &str) -> Result<()>;
}

/// `ServiceManager` that shells out to `systemctl`.
pub(crate) struct Systemctl {
    bin: PathBuf,
}

impl Systemctl {
    pub(crate) fn new<P>(bin: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self { bin: bin.into() }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        let joined = args.join(" ");
        debug!("Running systemctl {}", joined);
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .context(ExecutionFailureSnafu {
                bin: &self.bin,
                args: &joined,
            })?;

        ensure!(
            output.status.success(),
            SystemdCommandFailureSnafu {
                args: joined,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            }
        );
        Ok(())
    }
}

impl Default for Systemctl {
    fn default() -> Self {
        Self::new(SYSTEMCTL_BIN)
    }
}

#[async_trait]
impl ServiceManager for Systemctl {
    async fn daemon_reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"]).await
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        self.systemctl(&["enable", unit]).await
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.systemctl(&["start", unit]).await
    }
}
