//! HTTP client for scraping apiserver metric endpoints.

use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::header::{ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING};
use reqwest::{Certificate, Url};

use crate::error::ScrapeError;
use crate::parse::sum_counter;

/// SNI name upstream apiservers present regardless of the address they are
/// scraped at.
pub const DEFAULT_TLS_SERVER_NAME: &str = "kube-apiserver";

/// Fetches and sums the request counter of a single target.
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Scrapes `url` and returns the sum of all series of the configured
    /// counter from the response.
    ///
    /// `token` is presented as a bearer credential. `ca_pem` is the only
    /// trust anchor used to verify the endpoint's certificate.
    async fn total_request_count(
        &self,
        url: &str,
        token: &str,
        ca_pem: &[u8],
    ) -> Result<i64, ScrapeError>;
}

/// Production client: per-tenant trust, TLS 1.3 minimum, pinned SNI, and
/// explicit gzip handling so the parser owns the decompression path.
pub struct HttpMetricsClient {
    counter_name: String,
    tls_server_name: Option<String>,
}

impl HttpMetricsClient {
    pub fn new(counter_name: &str) -> Self {
        Self {
            counter_name: counter_name.to_owned(),
            tls_server_name: Some(DEFAULT_TLS_SERVER_NAME.to_owned()),
        }
    }

    /// Overrides the pinned TLS server name; `None` disables pinning and
    /// verifies against the URL host instead.
    pub fn with_tls_server_name(mut self, name: Option<&str>) -> Self {
        self.tls_server_name = name.map(str::to_owned);
        self
    }

    /// Scrape URLs address pods by IP while their certificates carry a fixed
    /// name. Rewrites an IP-host URL to the pinned name and resolves that
    /// name back to the original address, so verification sees the expected
    /// SNI.
    fn pin_server_name(
        &self,
        url: Url,
        builder: reqwest::ClientBuilder,
    ) -> (Url, reqwest::ClientBuilder) {
        let Some(name) = &self.tls_server_name else {
            return (url, builder);
        };
        let Some(host) = url.host_str() else {
            return (url, builder);
        };
        let Ok(ip) = host.parse::<IpAddr>() else {
            return (url, builder);
        };
        let Some(port) = url.port_or_known_default() else {
            return (url, builder);
        };

        let mut pinned = url.clone();
        if pinned.set_host(Some(name)).is_err() {
            return (url, builder);
        }
        (pinned, builder.resolve(name, SocketAddr::new(ip, port)))
    }
}

#[async_trait]
impl MetricsClient for HttpMetricsClient {
    async fn total_request_count(
        &self,
        url: &str,
        token: &str,
        ca_pem: &[u8],
    ) -> Result<i64, ScrapeError> {
        let parsed = Url::parse(url).map_err(|e| ScrapeError::InvalidUrl {
            url: url.to_owned(),
            reason: e.to_string(),
        })?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_3);
        if !ca_pem.is_empty() {
            builder = builder
                .add_root_certificate(Certificate::from_pem(ca_pem)?)
                .tls_built_in_root_certs(false);
        }

        let (target, builder) = if parsed.scheme() == "https" {
            self.pin_server_name(parsed, builder)
        } else {
            (parsed, builder)
        };

        let client = builder.build()?;
        let response = client
            .get(target)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(ACCEPT_ENCODING, "gzip")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status(status.as_u16()));
        }

        let gzipped = response
            .headers()
            .get(CONTENT_ENCODING)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"gzip"));
        let body = response.bytes().await?;

        // The body is fully owned here; both paths drop it on return.
        let total = if gzipped {
            sum_counter(
                BufReader::new(GzDecoder::new(body.as_ref())),
                &self.counter_name,
            )?
        } else {
            sum_counter(body.as_ref(), &self.counter_name)?
        };
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::DEFAULT_COUNTER_NAME;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    /// Serves exactly one plain-HTTP connection with a canned response and
    /// returns the raw request bytes it saw.
    async fn serve_once(response: Vec<u8>) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
                if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            stream.write_all(&response).await.unwrap();
            stream.shutdown().await.unwrap();
            request
        });
        (addr, handle)
    }

    fn http_response(status: &str, extra_headers: &str, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{extra_headers}Connection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    fn client() -> HttpMetricsClient {
        HttpMetricsClient::new(DEFAULT_COUNTER_NAME)
    }

    #[tokio::test]
    async fn sums_counters_from_plain_response() {
        let body = b"apiserver_request_total{code=\"200\"} 15\napiserver_request_total 20\n";
        let (addr, server) = serve_once(http_response("200 OK", "", body)).await;

        let total = client()
            .total_request_count(&format!("http://{addr}/metrics"), "secret", b"")
            .await
            .unwrap();

        assert_eq!(total, 35);
        let request = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(request.contains("authorization: Bearer secret"));
        assert!(request.contains("accept-encoding: gzip"));
    }

    #[tokio::test]
    async fn decodes_gzip_encoded_response() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(b"apiserver_request_total{code=\"500\"} 1.0056e4\n")
            .unwrap();
        let compressed = encoder.finish().unwrap();
        let (addr, _server) = serve_once(http_response(
            "200 OK",
            "Content-Encoding: gzip\r\n",
            &compressed,
        ))
        .await;

        let total = client()
            .total_request_count(&format!("http://{addr}/metrics"), "secret", b"")
            .await
            .unwrap();

        assert_eq!(total, 10056);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (addr, _server) = serve_once(http_response("503 Service Unavailable", "", b"")).await;

        let result = client()
            .total_request_count(&format!("http://{addr}/metrics"), "secret", b"")
            .await;

        assert!(matches!(result, Err(ScrapeError::Status(503))));
    }

    #[tokio::test]
    async fn body_without_counters_is_an_error() {
        let (addr, _server) = serve_once(http_response("200 OK", "", b"other_metric 5\n")).await;

        let result = client()
            .total_request_count(&format!("http://{addr}/metrics"), "secret", b"")
            .await;

        assert!(matches!(
            result,
            Err(ScrapeError::Parse(crate::error::ParseError::NoCountersFound { .. }))
        ));
    }

    #[tokio::test]
    async fn invalid_url_is_reported() {
        let result = client().total_request_count("not a url", "secret", b"").await;
        assert!(matches!(result, Err(ScrapeError::InvalidUrl { .. })));
    }

    #[test]
    fn pin_rewrites_ip_hosts_only() {
        let client = client();
        let builder = reqwest::Client::builder();
        let (url, _) = client.pin_server_name(
            Url::parse("https://10.0.0.7/metrics").unwrap(),
            builder,
        );
        assert_eq!(url.host_str(), Some(DEFAULT_TLS_SERVER_NAME));

        let builder = reqwest::Client::builder();
        let (url, _) = client.pin_server_name(
            Url::parse("https://example.com/metrics").unwrap(),
            builder,
        );
        assert_eq!(url.host_str(), Some("example.com"));
    }
}
