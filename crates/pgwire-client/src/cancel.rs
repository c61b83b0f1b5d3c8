//! Out-of-band query cancellation.
//!
//! PostgreSQL cancels a running statement through a `CancelRequest` sent on
//! a *separate* connection, identified by the process id and secret key the
//! server handed out during startup. The server answers by closing that
//! connection; success is never confirmed.
//!
//! The driver uses this when a wait on the main session fails: the session
//! is closed regardless, and the cancel keeps the backend from finishing
//! work nobody is waiting for.

use std::sync::Arc;
use std::time::Duration;

use pgwire_codec::{MessageIo, Stream};
use pgwire_protocol::{BackendKeyData, FrontendMessage};
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};

/// Deadline for connecting and writing the cancel request.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Send a `CancelRequest` for the backend identified by `key`.
pub async fn cancel_request(config: &Config, key: BackendKeyData) -> Result<()> {
    let deadline = Instant::now() + CANCEL_TIMEOUT;
    let stream = tokio::time::timeout_at(deadline, open(config))
        .await
        .map_err(|_| Error::Timeout("cancel connect"))??;

    let mut io = MessageIo::new(stream);
    io.queue(FrontendMessage::CancelRequest {
        process_id: key.process_id,
        secret_key: key.secret_key,
    })?;
    io.flush(deadline).await?;
    tracing::debug!(backend_pid = key.process_id, "cancel request sent");
    Ok(())
}

/// Fire a cancel request in the background and forget it.
pub fn spawn_cancel(config: Arc<Config>, key: BackendKeyData) {
    tokio::spawn(async move {
        if let Err(e) = cancel_request(&config, key).await {
            tracing::debug!(backend_pid = key.process_id, error = %e, "cancel request failed");
        }
    });
}

pub(crate) async fn open(config: &Config) -> Result<Stream> {
    #[cfg(unix)]
    if let Some(path) = config.socket_path() {
        return Ok(Stream::connect_unix(&path).await?);
    }
    Ok(Stream::connect_tcp(&config.host, config.port).await?)
}
