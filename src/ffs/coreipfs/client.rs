//! HTTP client for the IPFS node API (`/api/v0/...`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::IpfsError;
use crate::lotus::Cid;

/// Subset of the IPFS node API used by the hot storage and the cold
/// storage piece-size estimation.
#[async_trait]
pub trait IpfsApi: Send + Sync {
    /// Adds raw bytes and returns the root cid without pinning it.
    async fn add(&self, data: Vec<u8>) -> Result<Cid, IpfsError>;
    async fn pin_add(&self, cid: &Cid) -> Result<(), IpfsError>;
    async fn pin_rm(&self, cid: &Cid) -> Result<(), IpfsError>;
    /// Moves a recursive pin from `from` to `to` keeping shared blocks.
    async fn pin_update(&self, from: &Cid, to: &Cid) -> Result<(), IpfsError>;
    /// Cumulative DAG size in bytes.
    async fn dag_size(&self, cid: &Cid) -> Result<u64, IpfsError>;
    async fn cat(&self, cid: &Cid) -> Result<Vec<u8>, IpfsError>;
}

pub type SharedIpfs = Arc<dyn IpfsApi>;

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Deserialize)]
struct DagStatResponse {
    #[serde(rename = "Size", alias = "TotalSize", default)]
    size: u64,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Message", default)]
    message: String,
}

pub struct IpfsHttpClient {
    http: reqwest::Client,
    base: Url,
}

impl IpfsHttpClient {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, IpfsError> {
        let mut base = Url::parse(api_url).map_err(|err| IpfsError::InvalidUrl(err.to_string()))?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, command: &str) -> Result<Url, IpfsError> {
        self.base
            .join(&format!("api/v0/{command}"))
            .map_err(|err| IpfsError::InvalidUrl(err.to_string()))
    }

    async fn call(
        &self,
        command: &str,
        args: &[(&str, &str)],
    ) -> Result<reqwest::Response, IpfsError> {
        let url = self.endpoint(command)?;
        debug!(command, "ipfs api call");
        let response = self.http.post(url).query(args).send().await?;
        check_status(command, response).await
    }
}

async fn check_status(
    command: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, IpfsError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) if !body.message.is_empty() => body.message,
        _ => format!("status {status}"),
    };
    Err(IpfsError::Api {
        command: command.to_string(),
        message,
    })
}

#[async_trait]
impl IpfsApi for IpfsHttpClient {
    #[instrument(skip_all)]
    async fn add(&self, data: Vec<u8>) -> Result<Cid, IpfsError> {
        let url = self.endpoint("add")?;
        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(data).file_name("data"));
        let response = self
            .http
            .post(url)
            .query(&[("pin", "false"), ("cid-version", "1")])
            .multipart(form)
            .send()
            .await?;
        let body: AddResponse = check_status("add", response).await?.json().await?;
        Ok(Cid::new(body.hash))
    }

    async fn pin_add(&self, cid: &Cid) -> Result<(), IpfsError> {
        self.call("pin/add", &[("arg", cid.as_str()), ("recursive", "true")])
            .await?;
        Ok(())
    }

    async fn pin_rm(&self, cid: &Cid) -> Result<(), IpfsError> {
        self.call("pin/rm", &[("arg", cid.as_str())]).await?;
        Ok(())
    }

    async fn pin_update(&self, from: &Cid, to: &Cid) -> Result<(), IpfsError> {
        self.call(
            "pin/update",
            &[("arg", from.as_str()), ("arg", to.as_str()), ("unpin", "true")],
        )
        .await?;
        Ok(())
    }

    async fn dag_size(&self, cid: &Cid) -> Result<u64, IpfsError> {
        let body: DagStatResponse = self
            .call("dag/stat", &[("arg", cid.as_str()), ("progress", "false")])
            .await?
            .json()
            .await?;
        Ok(body.size)
    }

    async fn cat(&self, cid: &Cid) -> Result<Vec<u8>, IpfsError> {
        let bytes = self.call("cat", &[("arg", cid.as_str())]).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}
