pub use client::{Client, ClientError, HeaderMap, Method, Response, StatusCode};
pub use uri::{InvalidUriError, Uri};

mod uri {
    use std::fmt::Display;
    use std::str::FromStr;

    use http::uri::PathAndQuery;
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("invalid uri: {0}")]
    pub struct InvalidUriError(String);

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            Self(value.to_string())
        }
    }

    impl From<http::uri::InvalidUriParts> for InvalidUriError {
        fn from(value: http::uri::InvalidUriParts) -> Self {
            Self(value.to_string())
        }
    }

    /// An absolute URI with scheme and host, eg.
    /// `https://abc123.iot.us-east-1.amazonaws.com`
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        /// Host and non-default port, as they go into the `host` header
        pub fn authority(&self) -> Option<&str> {
            self.0.authority().map(|a| a.as_str())
        }

        pub fn path(&self) -> &str {
            self.0.path()
        }

        pub fn query(&self) -> Option<&str> {
            self.0.query()
        }

        /// The same endpoint with its path and query replaced
        pub fn join(&self, path_and_query: &str) -> Result<Self, InvalidUriError> {
            let mut parts = self.0.clone().into_parts();
            parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>()?);
            Ok(Self(http::Uri::from_parts(parts)?))
        }
    }

    impl Display for Uri {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for Uri {
        type Err = InvalidUriError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let uri = http::Uri::from_str(s)?;
            if uri.scheme().is_none() || uri.authority().is_none() {
                return Err(InvalidUriError(format!(
                    "expected scheme and host in '{s}'"
                )));
            }
            Ok(Self(uri))
        }
    }

    impl TryFrom<String> for Uri {
        type Error = InvalidUriError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            value.parse()
        }
    }

    impl Serialize for Uri {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    impl<'de> Deserialize<'de> for Uri {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn it_replaces_the_path() {
            let base: Uri = "https://abc.iot.eu-west-1.amazonaws.com".parse().unwrap();
            let uri = base.join("/things/lamp/shadow?name=main").unwrap();
            assert_eq!(
                uri.to_string(),
                "https://abc.iot.eu-west-1.amazonaws.com/things/lamp/shadow?name=main"
            );
            assert_eq!(uri.path(), "/things/lamp/shadow");
            assert_eq!(uri.query(), Some("name=main"));
            assert_eq!(uri.authority(), Some("abc.iot.eu-west-1.amazonaws.com"));
        }

        #[test]
        fn it_keeps_the_port_in_the_authority() {
            let base: Uri = "http://127.0.0.1:8080".parse().unwrap();
            assert_eq!(base.authority(), Some("127.0.0.1:8080"));
        }

        #[test]
        fn it_rejects_relative_uris() {
            assert!("/things/lamp".parse::<Uri>().is_err());
        }

        #[test]
        fn it_deserializes_from_a_string() {
            let uri: Uri = serde_json::from_str(r#""https://shadow.example.com""#).unwrap();
            assert_eq!(uri.authority(), Some("shadow.example.com"));
            assert!(serde_json::from_str::<Uri>(r#""not a uri""#).is_err());
        }
    }
}

mod client {
    use std::error::Error;
    use std::time::Duration;

    use futures_lite::{Stream, StreamExt};
    use reqwest::RequestBuilder;

    use super::uri::Uri;

    pub type Method = reqwest::Method;
    pub type StatusCode = reqwest::StatusCode;
    pub type HeaderMap = reqwest::header::HeaderMap;

    #[derive(Debug, thiserror::Error)]
    pub enum ClientError {
        #[error("failed to build request: {0}")]
        Request(String),

        #[error(transparent)]
        Client(reqwest::Error),

        #[error(transparent)]
        Server(reqwest::Error),
    }

    impl ClientError {
        /// The request did not complete in time
        pub fn is_timeout(&self) -> bool {
            match self {
                ClientError::Client(e) | ClientError::Server(e) => e.is_timeout(),
                ClientError::Request(_) => false,
            }
        }

        /// The peer answered with a response that could not be parsed, e.g.
        /// a malformed `Content-Length` header
        pub fn is_malformed_response(&self) -> bool {
            let (ClientError::Client(e) | ClientError::Server(e)) = self else {
                return false;
            };
            let mut source: Option<&(dyn Error + 'static)> = Some(e);
            while let Some(err) = source {
                if let Some(err) = err.downcast_ref::<hyper::Error>()
                    && err.is_parse()
                {
                    return true;
                }
                source = err.source();
            }
            false
        }
    }

    #[derive(Debug)]
    pub struct Response(reqwest::Response);

    impl Response {
        pub fn status(&self) -> StatusCode {
            self.0.status()
        }

        pub fn headers(&self) -> &HeaderMap {
            self.0.headers()
        }

        /// The body as it arrives from the peer, without waiting for the
        /// connection to close
        pub fn stream(self) -> impl Stream<Item = Result<impl AsRef<[u8]>, ClientError>> {
            self.0
                .bytes_stream()
                .map(|res| res.map_err(ClientError::Server))
        }
    }

    #[derive(Debug, Clone)]
    pub struct Client {
        client: reqwest::Client,
        timeout: Option<Duration>,
    }

    impl Default for Client {
        /// Default client with a timeout of 30 seconds.
        fn default() -> Self {
            Self::new(Some(Duration::from_secs(30)))
        }
    }

    impl Client {
        pub fn new(timeout: Option<Duration>) -> Self {
            Self {
                client: reqwest::Client::new(),
                timeout,
            }
        }

        /// Thin wrapper around [reqwest::Request]. The decorator adds the
        /// headers and body of the request.
        pub async fn request<D>(
            &self,
            method: Method,
            uri: &Uri,
            decorator: D,
        ) -> Result<Response, ClientError>
        where
            D: FnOnce(RequestBuilder) -> Result<RequestBuilder, ClientError>,
        {
            let mut request = self.client.request(method, uri.to_string());

            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }

            request = decorator(request)?;

            Ok(Response(request.send().await.map_err(ClientError::Client)?))
        }
    }
}
