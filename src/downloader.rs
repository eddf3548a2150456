//! Downloader (component A).
//!
//! Fetches a firmware image over HTTP or HTTPS into the inactive
//! partition, retrying transient failures a bounded number of times. The
//! two transports are unified behind [`HttpClientPort`]'s streaming
//! reader, so the retry/progress/finalise logic below has exactly one
//! implementation regardless of scheme.

use log::{info, warn};

use crate::config::{BLOCK_SIZE, HTTP_TIMEOUT_MS, MAX_RETRIES, RETRY_DELAY_MS};
use crate::error::{OtaError, Result};
use crate::ports::{ClockPort, HttpClientPort, PartitionPort, PartitionSlot, WriteHandle};
use crate::version_gate;

/// State of the single process-wide download session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownloadState {
    Idle,
    Downloading { progress: f32 },
    Succeeded,
    Failed(OtaError),
}

pub struct Downloader {
    state: DownloadState,
    cancelled: bool,
}

impl Downloader {
    pub fn new() -> Self {
        Self {
            state: DownloadState::Idle,
            cancelled: false,
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn progress(&self) -> f32 {
        match self.state {
            DownloadState::Downloading { progress } => progress,
            DownloadState::Succeeded => 1.0,
            _ => 0.0,
        }
    }

    /// Fetch `url` into the inactive partition, validate its version, and
    /// leave `state()` at `Succeeded` or `Failed`.
    pub fn download<P, H, C>(
        &mut self,
        url: &str,
        partition: &mut P,
        http: &mut H,
        clock: &C,
        running_version: &str,
    ) -> Result<()>
    where
        P: PartitionPort,
        H: HttpClientPort,
        C: ClockPort,
    {
        if matches!(self.state, DownloadState::Downloading { .. }) {
            return Err(OtaError::InvalidState);
        }

        let scheme_ok = {
            let lower = url.get(..8).map(str::to_ascii_lowercase).unwrap_or_default();
            lower.starts_with("http://") || lower.starts_with("https://")
        };
        if !scheme_ok {
            self.state = DownloadState::Failed(OtaError::InvalidArg);
            return Err(OtaError::InvalidArg);
        }

        self.cancelled = false;
        self.state = DownloadState::Downloading { progress: 0.0 };

        let mut attempt = 0u8;
        loop {
            match self.attempt_once(url, partition, http, running_version) {
                Ok(()) => {
                    self.state = DownloadState::Succeeded;
                    info!("downloader: succeeded after {} attempt(s)", attempt + 1);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES && !self.cancelled => {
                    attempt += 1;
                    warn!("downloader: attempt {attempt} failed ({e}), retrying");
                    self.state = DownloadState::Downloading { progress: 0.0 };
                    clock.sleep_ms(RETRY_DELAY_MS);
                }
                Err(e) => {
                    self.state = DownloadState::Failed(e);
                    return Err(e);
                }
            }
        }
    }

    fn attempt_once<P, H>(
        &mut self,
        url: &str,
        partition: &mut P,
        http: &mut H,
        running_version: &str,
    ) -> Result<()>
    where
        P: PartitionPort,
        H: HttpClientPort,
    {
        let info = http.open(url, HTTP_TIMEOUT_MS)?;
        if info.status != 200 {
            http.close();
            return Err(if (400..500).contains(&info.status) {
                OtaError::InvalidArg
            } else {
                OtaError::TransportTransient
            });
        }

        let capacity = partition.identity(PartitionSlot::Inactive)?.1;
        let handle = match partition.open_write(info.content_length.unwrap_or(capacity)) {
            Ok(h) => h,
            Err(e) => {
                http.close();
                return Err(e);
            }
        };

        let result = self.pump(partition, http, handle, info.content_length);
        match &result {
            Ok(()) => {}
            Err(_) => partition.abort(handle),
        }
        http.close();
        result?;

        version_gate::check(partition, PartitionSlot::Inactive, running_version)
    }

    fn pump<P, H>(
        &mut self,
        partition: &mut P,
        http: &mut H,
        handle: WriteHandle,
        content_length: Option<u32>,
    ) -> Result<()>
    where
        P: PartitionPort,
        H: HttpClientPort,
    {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut bytes_read: u32 = 0;

        loop {
            if self.cancelled {
                return Err(OtaError::InvalidState);
            }
            let n = http.read(&mut buf)?;
            if n == 0 {
                break;
            }
            partition.write(handle, &buf[..n])?;
            bytes_read += n as u32;

            self.state = DownloadState::Downloading {
                progress: match content_length {
                    Some(total) if total > 0 => (bytes_read as f32 / total as f32).min(1.0),
                    _ => 0.5,
                },
            };
        }

        if let Some(expected) = content_length {
            if bytes_read != expected {
                return Err(OtaError::InvalidSize);
            }
        }

        partition.finish(handle)?;
        self.state = DownloadState::Downloading { progress: 1.0 };
        Ok(())
    }

    /// Abort the in-progress download, if any. Idempotent.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        if matches!(self.state, DownloadState::Downloading { .. }) {
            self.state = DownloadState::Idle;
        }
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}
