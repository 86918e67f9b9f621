//! Control channel client

use anyhow::{Context, Result};
use sealkeep_core::model::{Keypair, KeypairId};
use sealkeep_core::protocol::{
    GenerateReport, KeypairList, OpenReport, Request, Response, SealReport, StatusReport,
};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

/// Client for the sealkeep daemon. One connection per request.
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send a request and decode the result payload. A daemon-side failure
    /// comes back as a [`WireError`](sealkeep_core::protocol::WireError)
    /// inside the `anyhow::Error`.
    async fn send<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        debug!("Sending {} to {}", request.name(), self.socket_path.display());
        let stream = match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Connect to {} failed: {}", self.socket_path.display(), e);
                return Err(e).context("Failed to connect to daemon. Start it with: sealkeepd run");
            }
        };
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;

        let reply = BufReader::new(reader)
            .lines()
            .next_line()
            .await?
            .context("Daemon closed the connection")?;
        let response: Response =
            serde_json::from_str(&reply).context("Failed to parse daemon response")?;

        let value = response.into_result().map_err(|e| {
            debug!("{} failed: {}", request.name(), e.kind);
            e
        })?;
        serde_json::from_value(value).context("Unexpected daemon response")
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.send(&Request::Status).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<StatusReport> {
        self.send(&Request::Login {
            email: email.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn logout(&self) -> Result<StatusReport> {
        self.send(&Request::Logout).await
    }

    pub async fn lock(&self) -> Result<StatusReport> {
        self.send(&Request::Lock).await
    }

    pub async fn list_keypairs(&self, org: &str) -> Result<KeypairList> {
        self.send(&Request::ListKeypairs {
            org: org.to_string(),
        })
        .await
    }

    pub async fn generate_keypairs(&self, org: Option<&str>, all: bool) -> Result<GenerateReport> {
        self.send(&Request::GenerateKeypairs {
            org: org.map(str::to_string),
            all,
        })
        .await
    }

    pub async fn revoke_keypair(&self, keypair_id: KeypairId) -> Result<Keypair> {
        self.send(&Request::RevokeKeypair { keypair_id }).await
    }

    pub async fn seal(&self, org: &str, path: &str, secret: &[u8]) -> Result<SealReport> {
        self.send(&Request::Seal {
            org: org.to_string(),
            path: path.to_string(),
            secret: sealkeep_core::encoding::to_base64(secret),
        })
        .await
    }

    pub async fn open(&self, org: &str, path: &str) -> Result<OpenReport> {
        self.send(&Request::Open {
            org: org.to_string(),
            path: path.to_string(),
        })
        .await
    }
}
