use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use thiserror::Error;
use tokio::net::{UdpSocket, lookup_host};
use tracing::{debug, info, instrument, warn};

/// Seconds between the NTP epoch (1900) and the unix epoch
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;
const NTP_PACKET_LEN: usize = 48;

/// Unix time of 2024-01-01T00:00:00Z. A wall clock behind this was never set.
const TRUSTED_FLOOR_SECS: i64 = 1_704_067_200;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no trusted time source, the clock must be synced first")]
pub struct ClockUnsyncedError;

#[derive(Debug, Error)]
pub enum TimeSyncError {
    #[error("no time server configured")]
    NoServer,

    #[error("could not resolve time server {0}")]
    Resolve(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid time server response: {0}")]
    InvalidResponse(&'static str),

    #[error("no answer from time server after {0} attempts")]
    Exhausted(u32),
}

/// A source of wall clock time that knows whether it can be trusted
pub trait TimeSource {
    fn now(&self) -> Result<DateTime<Utc>, ClockUnsyncedError>;

    /// Learn the current time from the network
    fn sync(&mut self) -> impl Future<Output = Result<(), TimeSyncError>>;
}

/// The system clock, corrected by the last successful sync
#[derive(Debug, Clone)]
pub struct SystemClock {
    offset: Option<TimeDelta>,
    sntp: Option<SntpClient>,
}

impl SystemClock {
    pub fn new(sntp: Option<SntpClient>) -> Self {
        Self { offset: None, sntp }
    }

    pub fn is_synced(&self) -> bool {
        self.offset.is_some()
    }
}

impl TimeSource for SystemClock {
    fn now(&self) -> Result<DateTime<Utc>, ClockUnsyncedError> {
        let now = Utc::now();
        match self.offset {
            Some(offset) => Ok(now + offset),
            None if now.timestamp() >= TRUSTED_FLOOR_SECS => Ok(now),
            None => Err(ClockUnsyncedError),
        }
    }

    async fn sync(&mut self) -> Result<(), TimeSyncError> {
        let sntp = self.sntp.as_ref().ok_or(TimeSyncError::NoServer)?;
        let server_time = sntp.query().await?;
        let offset = server_time - Utc::now();
        info!(offset_ms = offset.num_milliseconds(), "clock synced");
        self.offset = Some(offset);
        Ok(())
    }
}

/// Minimal SNTP v4 client
#[derive(Debug, Clone)]
pub struct SntpClient {
    server: String,
    timeout: Duration,
    attempts: u32,
}

impl SntpClient {
    /// `server` is a `host:port` pair, e.g. `pool.ntp.org:123`
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            timeout: Duration::from_secs(2),
            attempts: 5,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn with_attempts(self, attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..self
        }
    }

    /// Ask the server for the current time
    #[instrument(skip_all, fields(server = %self.server))]
    pub async fn query(&self) -> Result<DateTime<Utc>, TimeSyncError> {
        let addr = lookup_host(self.server.as_str())
            .await?
            .next()
            .ok_or_else(|| TimeSyncError::Resolve(self.server.clone()))?;

        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.timeout, Self::try_query(addr)).await {
                Ok(Ok(time)) => return Ok(time),
                Ok(Err(e)) => warn!(attempt, "time sync failed: {e}"),
                Err(_) => warn!(attempt, "time sync timed out"),
            }
        }
        Err(TimeSyncError::Exhausted(self.attempts))
    }

    async fn try_query(addr: SocketAddr) -> Result<DateTime<Utc>, TimeSyncError> {
        let local: SocketAddr = if addr.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        let mut request = [0u8; NTP_PACKET_LEN];
        // LI = 0, version 4, mode 3 (client)
        request[0] = 0x23;
        socket.send(&request).await?;

        let mut response = [0u8; NTP_PACKET_LEN];
        let len = socket.recv(&mut response).await?;
        debug!(len, "time server replied");
        parse_response(&response[..len])
    }
}

/// Read the transmit timestamp of a server reply
fn parse_response(packet: &[u8]) -> Result<DateTime<Utc>, TimeSyncError> {
    if packet.len() < NTP_PACKET_LEN {
        return Err(TimeSyncError::InvalidResponse("short packet"));
    }
    // mode 4 (server)
    if packet[0] & 0x07 != 4 {
        return Err(TimeSyncError::InvalidResponse("not a server reply"));
    }
    // stratum 0 is a kiss-of-death
    if packet[1] == 0 {
        return Err(TimeSyncError::InvalidResponse("kiss-of-death"));
    }

    let secs = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]);
    if secs == 0 {
        return Err(TimeSyncError::InvalidResponse("empty transmit timestamp"));
    }

    // era 1 starts in 2036 when the seconds counter wraps
    let mut secs = secs as i64;
    if secs < 0x8000_0000 {
        secs += 1 << 32;
    }
    let nanos = ((fraction as u64 * 1_000_000_000) >> 32) as u32;

    Utc.timestamp_opt(secs - NTP_UNIX_OFFSET, nanos)
        .single()
        .ok_or(TimeSyncError::InvalidResponse("timestamp out of range"))
}
