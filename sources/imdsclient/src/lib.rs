/*!
`imdsclient` reads the instance facts a node needs to join a cluster from the AWS Instance
Metadata Service (IMDS).

Requests are IMDSv2 (session-oriented) against a pinned schema. The session token is fetched
when the client is created and refreshed if a request receives a `401` response.

For example, `fetch_instance_type` sends a request to:

`http://169.254.169.254/2021-01-03/meta-data/instance-type`

and returns the body as a `String` _(ex. m5.large)_. A `404` from IMDS is returned as `None`.
*/

#![deny(rust_2018_idioms)]

use http::StatusCode;
use log::{debug, info, trace};
use reqwest::Client;
use snafu::{ensure, ResultExt};
use std::time::Duration;
use tokio::time;

const BASE_URI: &str = "http://169.254.169.254";
const PINNED_SCHEMA: &str = "2021-01-03";

// Session tokens can only be fetched from `latest`
const SESSION_TARGET: &str = "latest/api/token";
const SESSION_TTL_SECONDS: &str = "60";

const MAX_ATTEMPTS: u8 = 3;

/// A client for making IMDSv2 queries.
/// It obtains a session token when it is instantiated and reuses it between requests.
pub struct ImdsClient {
    client: Client,
    imds_base_uri: String,
    session_token: String,
}

impl ImdsClient {
    pub async fn new() -> Result<Self> {
        Self::new_impl(BASE_URI.to_string()).await
    }

    async fn new_impl(imds_base_uri: String) -> Result<Self> {
        let client = Client::new();
        let session_token = fetch_token(&client, &imds_base_uri).await?;
        Ok(Self {
            client,
            imds_base_uri,
            session_token,
        })
    }

    /// Gets the availability zone the instance runs in, e.g. `us-west-2a`.
    pub async fn fetch_zone(&mut self) -> Result<Option<String>> {
        self.fetch_string("meta-data/placement/availability-zone")
            .await
    }

    /// Gets the local IPv4 address of the primary network interface.
    pub async fn fetch_local_ipv4_address(&mut self) -> Result<Option<String>> {
        self.fetch_string("meta-data/local-ipv4").await
    }

    /// Gets the instance type, e.g. `m5.large`.
    pub async fn fetch_instance_type(&mut self) -> Result<Option<String>> {
        self.fetch_string("meta-data/instance-type").await
    }

    /// Helper to fetch a trimmed string from IMDS using the pinned schema version.
    async fn fetch_string<S>(&mut self, end_target: S) -> Result<Option<String>>
    where
        S: AsRef<str>,
    {
        match self.fetch_imds(PINNED_SCHEMA, end_target).await? {
            Some(response_body) => {
                let body =
                    String::from_utf8(response_body).context(error::NonUtf8ResponseSnafu)?;
                Ok(Some(body.trim().to_string()))
            }
            None => Ok(None),
        }
    }

    /// Fetch data from IMDS.
    async fn fetch_imds<S1, S2>(
        &mut self,
        schema_version: S1,
        target: S2,
    ) -> Result<Option<Vec<u8>>>
    where
        S1: AsRef<str>,
        S2: AsRef<str>,
    {
        let uri = format!(
            "{}/{}/{}",
            self.imds_base_uri,
            schema_version.as_ref(),
            target.as_ref()
        );
        debug!("Requesting {}", &uri);
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            ensure!(
                attempt <= MAX_ATTEMPTS,
                error::FailedFetchImdsSnafu { attempt: MAX_ATTEMPTS }
            );
            if attempt > 1 {
                time::sleep(Duration::from_secs(1)).await;
            }
            let response = self
                .client
                .get(&uri)
                .header("X-aws-ec2-metadata-token", &self.session_token)
                .send()
                .await
                .context(error::RequestSnafu {
                    method: "GET",
                    uri: &uri,
                })?;
            trace!("IMDS response: {:?}", &response);

            match response.status() {
                code @ StatusCode::OK => {
                    info!("Received {}", target.as_ref());
                    let response_body = response
                        .bytes()
                        .await
                        .context(error::ResponseBodySnafu {
                            method: "GET",
                            uri: &uri,
                            code,
                        })?
                        .to_vec();
                    trace!("Response: {:?}", printable_string(&response_body));
                    return Ok(Some(response_body));
                }

                // IMDS returns 404 for paths that have no data on this instance
                StatusCode::NOT_FOUND => return Ok(None),

                // IMDS returns 401 if the session token is expired or invalid
                StatusCode::UNAUTHORIZED => {
                    info!("Session token is invalid or expired");
                    self.refresh_token().await?;
                    info!("Refreshed session token");
                    continue;
                }

                StatusCode::REQUEST_TIMEOUT => {
                    info!("Retrying request");
                    continue;
                }

                code => {
                    let response_body = response
                        .bytes()
                        .await
                        .context(error::ResponseBodySnafu {
                            method: "GET",
                            uri: &uri,
                            code,
                        })?
                        .to_vec();
                    return error::ResponseSnafu {
                        method: "GET",
                        uri: &uri,
                        code,
                        response_body: printable_string(&response_body),
                    }
                    .fail();
                }
            }
        }
    }

    /// Fetches a new session token and stores it on the client.
    async fn refresh_token(&mut self) -> Result<()> {
        self.session_token = fetch_token(&self.client, &self.imds_base_uri).await?;
        Ok(())
    }
}

/// Converts `bytes` to a `String` if it is UTF-8, truncating it if it is too long for printing.
fn printable_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.len() < 2048 => s.to_string(),
        Ok(s) => {
            // Cut on a char boundary so multibyte text can't split
            let end = (0..=2034)
                .rev()
                .find(|i| s.is_char_boundary(*i))
                .unwrap_or(0);
            format!("{}<truncated...>", &s[..end])
        }
        Err(_) => "<binary>".to_string(),
    }
}

/// Helper to fetch an IMDSv2 session token.
async fn fetch_token(client: &Client, imds_base_uri: &str) -> Result<String> {
    let uri = format!("{}/{}", imds_base_uri, SESSION_TARGET);
    let mut attempt: u8 = 0;
    loop {
        attempt += 1;
        ensure!(
            attempt <= MAX_ATTEMPTS,
            error::FailedFetchTokenSnafu { attempt: MAX_ATTEMPTS }
        );
        if attempt > 1 {
            time::sleep(Duration::from_secs(1)).await;
        }
        let response = client
            .put(&uri)
            .header("X-aws-ec2-metadata-token-ttl-seconds", SESSION_TTL_SECONDS)
            .send()
            .await
            .context(error::RequestSnafu {
                method: "PUT",
                uri: &uri,
            })?;

        let code = response.status();
        if code == StatusCode::OK {
            return response.text().await.context(error::ResponseBodySnafu {
                method: "PUT",
                uri: &uri,
                code,
            });
        }
        info!("Retrying token request after {}", code);
    }
}

mod error {
    use http::StatusCode;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("IMDS fetch failed after {} attempts", attempt))]
        FailedFetchImds { attempt: u8 },

        #[snafu(display("Failed to fetch IMDSv2 session token after {} attempts", attempt))]
        FailedFetchToken { attempt: u8 },

        #[snafu(display("Response was not UTF-8: {}", source))]
        NonUtf8Response { source: std::string::FromUtf8Error },

        #[snafu(display("Error {}ing '{}': {}", method, uri, source))]
        Request {
            method: String,
            uri: String,
            source: reqwest::Error,
        },

        #[snafu(display("Error {} when {}ing '{}': {}", code, method, uri, response_body))]
        Response {
            method: String,
            uri: String,
            code: StatusCode,
            response_body: String,
        },

        #[snafu(display(
            "Unable to read response body when {}ing '{}' (code {}) - {}",
            method,
            uri,
            code,
            source
        ))]
        ResponseBody {
            method: String,
            uri: String,
            code: StatusCode,
            source: reqwest::Error,
        },
    }
}

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
