use async_trait::async_trait;
use imdsclient::ImdsClient;
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("IMDS request for {} failed: {}", what, source))]
    ImdsRequest {
        what: &'static str,
        source: imdsclient::Error,
    },

    #[snafu(display("IMDS request failed: No '{}' found", what))]
    ImdsNone { what: &'static str },

    #[snafu(display("Unable to derive region from availability zone '{}'", zone))]
    Region { zone: String },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Facts about the running instance.
#[async_trait]
pub(crate) trait InstanceMetadata {
    async fn availability_zone(&mut self) -> Result<String>;
    async fn local_ipv4(&mut self) -> Result<String>;
    async fn instance_type(&mut self) -> Result<String>;
}

#[async_trait]
impl InstanceMetadata for ImdsClient {
    async fn availability_zone(&mut self) -> Result<String> {
        let what = "availability zone";
        self.fetch_zone()
            .await
            .context(ImdsRequestSnafu { what })?
            .context(ImdsNoneSnafu { what })
    }

    async fn local_ipv4(&mut self) -> Result<String> {
        let what = "local ipv4 address";
        self.fetch_local_ipv4_address()
            .await
            .context(ImdsRequestSnafu { what })?
            .context(ImdsNoneSnafu { what })
    }

    async fn instance_type(&mut self) -> Result<String> {
        let what = "instance type";
        self.fetch_instance_type()
            .await
            .context(ImdsRequestSnafu { what })?
            .context(ImdsNoneSnafu { what })
    }
}

/// The region is the availability zone without its trailing zone letter, `us-west-2a` becomes
/// `us-west-2`.
pub(crate) fn region_from_zone(zone: &str) -> Result<String> {
    let zone = zone.trim();
    let mut chars = zone.chars();
    match chars.next_back() {
        Some(letter) if letter.is_ascii_alphabetic() && !chars.as_str().is_empty() => {
            Ok(chars.as_str().to_string())
        }
        _ => RegionSnafu { zone }.fail(),
    }
}
