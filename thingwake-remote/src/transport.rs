use std::time::Duration;

use futures_lite::StreamExt;
use thiserror::Error;
use tracing::{Span, debug, field, instrument, warn};

use crate::clock::{ClockUnsyncedError, TimeSource};
use crate::config::{RequestConfig, ThingIdentity};
use crate::signer::{CanonicalRequest, RequestSigner};
use crate::state::models::{Acknowledgement, ReportDocument, ShadowDocument};
use crate::util::http::{Client, HeaderMap, Method, Response, StatusCode, Uri};

#[derive(Debug, Error)]
pub enum TransportError {
    /// Connect, send or receive failed on every attempt
    #[error("network failure: {0}")]
    Network(String),

    /// The server did not accept the signature. Either the clock or the
    /// credentials are wrong, retrying will not help.
    #[error("request not authorized, server replied: {0}")]
    Auth(StatusCode),

    /// The response framing or content cannot be trusted
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request rejected, server replied: {0}")]
    Rejected(StatusCode),

    #[error(transparent)]
    ClockUnsynced(#[from] ClockUnsyncedError),

    #[error("failed to build request: {0}")]
    Encoding(String),
}

/// Internal errors of a single attempt
#[derive(Debug, Error)]
enum TryError {
    #[error("request failed with: {0}")]
    WillRetry(String, Option<Duration>),

    #[error(transparent)]
    Fatal(#[from] TransportError),
}

/// Exponential backoff between attempts of one exchange
struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    fn new(config: &RequestConfig) -> Self {
        Self {
            current: config.min_backoff,
            max: config.max_backoff,
        }
    }

    /// Time to wait before the next attempt. A `Retry-After` from the
    /// server wins over the backoff but never exceeds the maximum backoff.
    fn next(&mut self, retry_after: Option<Duration>) -> Duration {
        if let Some(duration) = retry_after {
            return duration.min(self.max);
        }
        let wait = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        wait
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn content_length(headers: &HeaderMap) -> Result<usize, TransportError> {
    let value = headers
        .get("content-length")
        .ok_or_else(|| TransportError::Protocol("missing Content-Length header".into()))?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .ok_or_else(|| TransportError::Protocol(format!("malformed Content-Length: {value:?}")))
}

/// Read exactly as many bytes as the `Content-Length` header declares.
///
/// The peer may keep the connection open after the body, so the declared
/// length is the only thing that ends the read.
async fn read_body(response: Response, max_len: usize) -> Result<Vec<u8>, TryError> {
    let length = content_length(response.headers())?;
    if length > max_len {
        return Err(TransportError::Protocol(format!(
            "declared body of {length} bytes is over the {max_len} bytes limit"
        ))
        .into());
    }

    let mut body = Vec::with_capacity(length);
    let stream = response.stream();
    futures_lite::pin!(stream);
    while body.len() < length {
        match stream.next().await {
            Some(Ok(chunk)) => {
                let chunk = chunk.as_ref();
                let wanted = length - body.len();
                body.extend_from_slice(&chunk[..chunk.len().min(wanted)]);
            }
            Some(Err(e)) if e.is_timeout() => {
                return Err(TryError::WillRetry(e.to_string(), None));
            }
            Some(Err(e)) => {
                return Err(TransportError::Protocol(format!(
                    "body truncated after {} of {length} bytes: {e}",
                    body.len()
                ))
                .into());
            }
            None => {
                return Err(TransportError::Protocol(format!(
                    "body truncated after {} of {length} bytes",
                    body.len()
                ))
                .into());
            }
        }
    }

    Ok(body)
}

/// Signed shadow exchanges with retries.
///
/// Every attempt is signed right before it is sent, so a retry never reuses
/// a signature.
#[derive(Debug, Clone)]
pub struct ShadowTransport {
    client: Client,
    config: RequestConfig,
}

impl ShadowTransport {
    pub fn new(config: RequestConfig) -> Self {
        Self {
            client: Client::new(Some(config.timeout)),
            config,
        }
    }

    /// Fetch the shadow of the thing
    #[instrument(skip_all, fields(thing = %identity.thing_name))]
    pub async fn fetch<C: TimeSource + ?Sized>(
        &self,
        identity: &ThingIdentity,
        clock: &C,
    ) -> Result<ShadowDocument, TransportError> {
        let body = self.exchange(identity, clock, Method::GET, None).await?;
        let doc: ShadowDocument = serde_json::from_slice(&body)
            .map_err(|e| TransportError::Protocol(format!("invalid shadow document: {e}")))?;
        debug!(version = doc.version(), "shadow fetched");
        Ok(doc)
    }

    /// Send a report for the thing.
    ///
    /// The report carries the version of the document it answers, the
    /// server is the only one to increment it.
    #[instrument(skip_all, fields(thing = %identity.thing_name, version = report.version()))]
    pub async fn report<C: TimeSource + ?Sized>(
        &self,
        identity: &ThingIdentity,
        clock: &C,
        report: &ReportDocument,
    ) -> Result<Acknowledgement, TransportError> {
        let payload =
            serde_json::to_vec(report).map_err(|e| TransportError::Encoding(e.to_string()))?;
        let body = self
            .exchange(identity, clock, Method::POST, Some(payload))
            .await?;

        if body.is_empty() {
            return Ok(Acknowledgement::default());
        }
        let ack = serde_json::from_slice(&body).unwrap_or_else(|e| {
            warn!("ignoring unreadable acknowledgement: {e}");
            Acknowledgement::default()
        });
        Ok(ack)
    }

    #[instrument(level = "debug", skip_all, fields(method = %method, retries = field::Empty))]
    async fn exchange<C: TimeSource + ?Sized>(
        &self,
        identity: &ThingIdentity,
        clock: &C,
        method: Method,
        payload: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, TransportError> {
        let uri = identity
            .shadow_uri()
            .map_err(|e| TransportError::Encoding(e.to_string()))?;
        let host = uri
            .authority()
            .ok_or_else(|| TransportError::Encoding("endpoint has no host".into()))?
            .to_owned();

        let signer = RequestSigner::new(identity.remote.region.as_str());
        let mut request = CanonicalRequest::new(method, host, uri.path());
        if let Some(payload) = payload {
            request = request
                .with_header("content-type", "application/json")
                .with_body(payload);
        }

        let mut backoff = Backoff::new(&self.config);
        let mut tries = 1;
        loop {
            match self
                .try_exchange(&signer, &request, identity, clock, &uri)
                .await
            {
                Ok(body) => {
                    Span::current().record("retries", tries - 1);
                    return Ok(body);
                }
                Err(TryError::WillRetry(reason, retry_after)) => {
                    if tries >= self.config.attempts {
                        Span::current().record("retries", tries - 1);
                        return Err(TransportError::Network(reason));
                    }
                    let wait = backoff.next(retry_after);
                    warn!("request failed with: {reason} ... will retry in {wait:#?}");
                    tokio::time::sleep(wait).await;
                    tries += 1;
                }
                Err(TryError::Fatal(e)) => return Err(e),
            }
        }
    }

    #[instrument(level = "trace", skip_all, fields(response = field::Empty), err(level = "debug"))]
    async fn try_exchange<C: TimeSource + ?Sized>(
        &self,
        signer: &RequestSigner,
        request: &CanonicalRequest,
        identity: &ThingIdentity,
        clock: &C,
        uri: &Uri,
    ) -> Result<Vec<u8>, TryError> {
        let signed = signer
            .sign_request(request, &identity.credentials, clock)
            .map_err(TransportError::from)?;

        let response = self
            .client
            .request(signed.method.clone(), uri, |mut builder| {
                for (name, value) in &signed.headers {
                    // the client derives it from the uri
                    if name != "host" {
                        builder = builder.header(name, value);
                    }
                }
                if !signed.body.is_empty() {
                    builder = builder.body(signed.body.clone());
                }
                Ok(builder)
            })
            .await
            .map_err(|e| {
                if e.is_malformed_response() {
                    TryError::Fatal(TransportError::Protocol(e.to_string()))
                } else {
                    TryError::WillRetry(e.to_string(), None)
                }
            })?;

        let status = response.status();
        Span::current().record("response", field::display(status));

        match status {
            status if status.is_success() => read_body(response, self.config.max_body_bytes).await,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(TransportError::Auth(status).into())
            }
            StatusCode::TOO_MANY_REQUESTS => Err(TryError::WillRetry(
                format!("server responded with {status}"),
                parse_retry_after(response.headers()),
            )),
            status if status.is_server_error() => Err(TryError::WillRetry(
                format!("server responded with {status}"),
                parse_retry_after(response.headers()),
            )),
            _ => Err(TransportError::Rejected(status).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeSyncError;
    use crate::config::RemoteConfig;
    use crate::signer::{Credentials, SecretKey};
    use chrono::{DateTime, TimeZone, Utc};
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::cell::Cell;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A trusted clock that ticks one second on every read
    struct TestClock {
        calls: Cell<i64>,
    }

    impl TestClock {
        fn new() -> Self {
            Self {
                calls: Cell::new(0),
            }
        }
    }

    impl TimeSource for TestClock {
        fn now(&self) -> Result<DateTime<Utc>, ClockUnsyncedError> {
            let calls = self.calls.get();
            self.calls.set(calls + 1);
            Ok(Utc.timestamp_opt(1_710_490_500 + calls, 0).unwrap())
        }

        async fn sync(&mut self) -> Result<(), TimeSyncError> {
            Ok(())
        }
    }

    struct Unsynced;

    impl TimeSource for Unsynced {
        fn now(&self) -> Result<DateTime<Utc>, ClockUnsyncedError> {
            Err(ClockUnsyncedError)
        }

        async fn sync(&mut self) -> Result<(), TimeSyncError> {
            Err(TimeSyncError::NoServer)
        }
    }

    fn test_config() -> RequestConfig {
        RequestConfig {
            timeout: Duration::from_secs(5),
            attempts: 3,
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            max_body_bytes: 16 * 1024,
        }
    }

    fn identity(endpoint: Uri) -> ThingIdentity {
        ThingIdentity::new(
            "shade-01".parse().unwrap(),
            RemoteConfig {
                endpoint,
                region: "eu-west-1".into(),
                request: test_config(),
            },
            Credentials::new("AKIDEXAMPLE", SecretKey::from("secret")),
        )
    }

    const SHADOW: &str = r#"{"state":{"desired":{"position":50},"reported":{"position":30}},"version":7,"timestamp":1710490500}"#;

    #[tokio::test]
    async fn it_fetches_a_signed_shadow() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("GET", "/things/shade-01/shadow")
            .match_header(
                "authorization",
                Matcher::Regex(
                    r"^AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240315/eu-west-1/iotdata/aws4_request, SignedHeaders=host;x-amz-date, Signature=[0-9a-f]{64}$".into(),
                ),
            )
            .match_header("x-amz-date", "20240315T081500Z")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(SHADOW)
            .create_async()
            .await;

        let transport = ShadowTransport::new(test_config());
        let doc = transport
            .fetch(&identity(endpoint), &TestClock::new())
            .await
            .unwrap();

        assert_eq!(doc.version(), 7);
        assert_eq!(doc.desired.get("position"), Some(&json!(50)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn it_reports_echoing_the_version() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("POST", "/things/shade-01/shadow")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "state": {"reported": {"position": 48}},
                "version": 7
            })))
            .with_status(200)
            .with_body(r#"{"state":{"reported":{"position":48}},"version":8,"timestamp":1710490510}"#)
            .create_async()
            .await;

        let doc: ShadowDocument = serde_json::from_str(SHADOW).unwrap();
        let mut reported = serde_json::Map::new();
        reported.insert("position".into(), json!(48));
        let report = ReportDocument::new(reported, &doc);

        let transport = ShadowTransport::new(test_config());
        let ack = transport
            .report(&identity(endpoint), &TestClock::new(), &report)
            .await
            .unwrap();

        assert_eq!(ack.version, Some(8));
        assert_eq!(ack.timestamp, Some(1710490510));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn it_does_not_retry_auth_errors() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("GET", "/things/shade-01/shadow")
            .with_status(403)
            .expect(1)
            .create_async()
            .await;

        let transport = ShadowTransport::new(test_config());
        let res = transport
            .fetch(&identity(endpoint), &TestClock::new())
            .await;

        assert!(matches!(res, Err(TransportError::Auth(StatusCode::FORBIDDEN))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn it_retries_server_errors_with_a_new_signature() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let failing = server
            .mock("GET", "/things/shade-01/shadow")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let working = server
            .mock("GET", "/things/shade-01/shadow")
            .with_status(200)
            .with_body(SHADOW)
            .create_async()
            .await;

        let clock = TestClock::new();
        let transport = ShadowTransport::new(test_config());
        let doc = transport.fetch(&identity(endpoint), &clock).await.unwrap();

        assert_eq!(doc.version(), 7);
        // one timestamp per attempt
        assert_eq!(clock.calls.get(), 2);
        failing.assert_async().await;
        working.assert_async().await;
    }

    #[tokio::test]
    async fn it_gives_up_after_the_configured_attempts() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("GET", "/things/shade-01/shadow")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let transport = ShadowTransport::new(test_config());
        let res = transport
            .fetch(&identity(endpoint), &TestClock::new())
            .await;

        assert!(matches!(res, Err(TransportError::Network(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn it_honors_retry_after() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let limited = server
            .mock("GET", "/things/shade-01/shadow")
            .with_status(429)
            .with_header("retry-after", "1")
            .create_async()
            .await;
        let working = server
            .mock("GET", "/things/shade-01/shadow")
            .with_status(200)
            .with_body(SHADOW)
            .create_async()
            .await;

        let transport = ShadowTransport::new(RequestConfig {
            max_backoff: Duration::from_secs(2),
            ..test_config()
        });
        let start = std::time::Instant::now();
        transport
            .fetch(&identity(endpoint), &TestClock::new())
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(900));
        limited.assert_async().await;
        working.assert_async().await;
    }

    #[test]
    fn retry_after_is_capped_by_the_maximum_backoff() {
        let mut backoff = Backoff::new(&test_config());
        assert_eq!(
            backoff.next(Some(Duration::from_secs(86_400))),
            Duration::from_millis(40)
        );
        assert_eq!(
            backoff.next(Some(Duration::from_millis(25))),
            Duration::from_millis(25)
        );
    }

    #[test]
    fn backoff_doubles_up_to_the_maximum() {
        let mut backoff = Backoff::new(&test_config());
        let waits: Vec<Duration> = (0..4).map(|_| backoff.next(None)).collect();
        assert_eq!(
            waits,
            [10, 20, 40, 40].map(Duration::from_millis).to_vec()
        );
    }

    #[tokio::test]
    async fn it_does_not_retry_other_client_errors() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("GET", "/things/shade-01/shadow")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let transport = ShadowTransport::new(test_config());
        let res = transport
            .fetch(&identity(endpoint), &TestClock::new())
            .await;

        assert!(matches!(
            res,
            Err(TransportError::Rejected(StatusCode::NOT_FOUND))
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn it_rejects_shadows_without_desired_state() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        server
            .mock("GET", "/things/shade-01/shadow")
            .with_status(200)
            .with_body(r#"{"state":{"reported":{"position":30}},"version":7,"timestamp":1}"#)
            .create_async()
            .await;

        let transport = ShadowTransport::new(test_config());
        let res = transport
            .fetch(&identity(endpoint), &TestClock::new())
            .await;

        assert!(matches!(res, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn it_does_not_send_without_a_trusted_clock() {
        let mut server = Server::new_async().await;
        let endpoint: Uri = server.url().try_into().unwrap();

        let mock = server
            .mock("GET", "/things/shade-01/shadow")
            .expect(0)
            .create_async()
            .await;

        let transport = ShadowTransport::new(test_config());
        let res = transport.fetch(&identity(endpoint), &Unsynced).await;

        assert!(matches!(res, Err(TransportError::ClockUnsynced(_))));
        mock.assert_async().await;
    }

    /// Serve `response` to every request. With `hold_open` the connection is
    /// kept open after the response, like the shadow service does.
    async fn raw_server(response: Vec<u8>, hold_open: bool) -> Uri {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                socket.write_all(&response).await.unwrap();
                socket.flush().await.unwrap();
                if hold_open {
                    tokio::spawn(async move {
                        let _socket = socket;
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    });
                }
            }
        });
        format!("http://{addr}").parse().unwrap()
    }

    fn http_response(headers: &str, body: &str) -> Vec<u8> {
        format!("HTTP/1.1 200 OK\r\n{headers}\r\n{body}").into_bytes()
    }

    #[tokio::test]
    async fn it_stops_reading_at_content_length_on_open_connections() {
        let response = http_response(
            &format!(
                "Content-Type: application/json\r\nContent-Length: {}\r\n",
                SHADOW.len()
            ),
            SHADOW,
        );
        let endpoint = raw_server(response, true).await;

        let transport = ShadowTransport::new(test_config());
        let doc = tokio::time::timeout(
            Duration::from_secs(2),
            transport.fetch(&identity(endpoint), &TestClock::new()),
        )
        .await
        .expect("fetch should not wait for the connection to close")
        .unwrap();

        assert_eq!(doc.version(), 7);
    }

    #[tokio::test]
    async fn it_rejects_responses_without_content_length() {
        let response = http_response("Connection: close\r\n", SHADOW);
        let endpoint = raw_server(response, false).await;

        let transport = ShadowTransport::new(test_config());
        let res = transport
            .fetch(&identity(endpoint), &TestClock::new())
            .await;

        assert!(matches!(res, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn it_rejects_malformed_content_length() {
        let response = http_response("Content-Length: lots\r\n", SHADOW);
        let endpoint = raw_server(response, true).await;

        let transport = ShadowTransport::new(test_config());
        let res = transport
            .fetch(&identity(endpoint), &TestClock::new())
            .await;

        assert!(matches!(res, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn it_rejects_bodies_over_the_limit() {
        let response = http_response("Content-Length: 20000\r\n", SHADOW);
        let endpoint = raw_server(response, true).await;

        let transport = ShadowTransport::new(test_config());
        let res = transport
            .fetch(&identity(endpoint), &TestClock::new())
            .await;

        assert!(matches!(res, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn it_rejects_truncated_bodies() {
        let response = http_response("Content-Length: 500\r\n", SHADOW);
        let endpoint = raw_server(response, false).await;

        let transport = ShadowTransport::new(test_config());
        let res = transport
            .fetch(&identity(endpoint), &TestClock::new())
            .await;

        assert!(matches!(res, Err(TransportError::Protocol(_))));
    }
}
