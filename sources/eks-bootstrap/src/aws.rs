use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_config::{imds, BehaviorVersion};
use aws_smithy_types::retry::RetryConfig;
use aws_types::region::Region;
use aws_types::SdkConfig;
use std::time::Duration;

// Credentials come from the instance profile through IMDS
const IMDS_MAX_ATTEMPTS: u32 = 3;
const IMDS_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

fn sdk_imds_client() -> imds::Client {
    imds::Client::builder()
        .max_attempts(IMDS_MAX_ATTEMPTS)
        .connect_timeout(IMDS_CONNECT_TIMEOUT)
        .build()
}

/// Builds the SDK config for calls made on behalf of the node. SDK-level retries are disabled;
/// a failed API call fails the bootstrap.
pub(crate) async fn sdk_config(region: &str) -> SdkConfig {
    let provider = DefaultCredentialsChain::builder()
        .imds_client(sdk_imds_client())
        .build()
        .await;
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_owned()))
        .credentials_provider(provider)
        .retry_config(RetryConfig::disabled())
        .load()
        .await
}
