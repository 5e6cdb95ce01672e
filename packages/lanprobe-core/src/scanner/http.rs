//! HTTP fingerprinting of open web ports

use super::gate::Gate;
use super::ports::http_targets;
use super::ScanError;
use reqwest::header::{HeaderMap, HeaderName, SERVER, WWW_AUTHENTICATE};
use reqwest::Client;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

/// What one GET of `/` revealed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFingerprint {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub status: Option<u16>,
    pub server: Option<String>,
    pub auth: Option<String>,
    pub title: Option<String>,
}

/// Shared HTTP client for title fetches and the fingerprint sweep.
///
/// Certificate validation is off: cameras and NVRs ship self-signed certs.
#[derive(Debug, Clone)]
pub struct HttpFingerprinter {
    client: Client,
}

impl HttpFingerprinter {
    pub fn new(timeout: Duration) -> Result<Self, ScanError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent(concat!("lanprobe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScanError::General(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// GET `scheme://ip:port/`. `None` when nothing answered.
    pub async fn fingerprint(&self, ip: Ipv4Addr, port: u16, scheme: &str) -> Option<HttpFingerprint> {
        let url = format!("{}://{}:{}/", scheme, ip, port);
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("HTTP {} failed: {}", url, e);
                return None;
            }
        };

        let status = Some(response.status().as_u16());
        let server = header_value(response.headers(), SERVER);
        let auth = header_value(response.headers(), WWW_AUTHENTICATE);
        let body = response.text().await.unwrap_or_default();

        Some(HttpFingerprint {
            ip,
            port,
            status,
            server,
            auth,
            title: extract_title(&body),
        })
    }

    /// Lightweight title fetch: plain HTTP ports first, then HTTPS; first non-empty title wins.
    pub async fn fetch_title(&self, ip: Ipv4Addr, open_ports: &BTreeSet<u16>) -> Option<String> {
        for (port, scheme) in http_targets(open_ports) {
            if let Some(title) = self.fingerprint(ip, port, scheme).await.and_then(|f| f.title) {
                return Some(title);
            }
        }
        None
    }

    /// One GET per open web port, each holding the HTTP gate.
    pub async fn sweep(&self, ip: Ipv4Addr, open_ports: &BTreeSet<u16>, gate: &Gate) -> Vec<HttpFingerprint> {
        let fetches = http_targets(open_ports)
            .into_iter()
            .map(|(port, scheme)| async move {
                gate.run(self.fingerprint(ip, port, scheme)).await.ok().flatten()
            });
        futures::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

fn header_value(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Contents of the first `<title>` element, entity-decoded with whitespace collapsed
pub fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;

    let title = decode_entities(&html[start..end])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    (!title.is_empty()).then_some(title)
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &rest[1..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            }?;
            Some((ch, semi))
        });

        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_extract_title() {
        assert_eq!(
            extract_title("<html><head><TITLE>  Web\n  Client </TITLE></head></html>").as_deref(),
            Some("Web Client")
        );
        assert_eq!(
            extract_title(r#"<title id="t">NVR &amp; DVR &#8211; Login</title>"#).as_deref(),
            Some("NVR & DVR \u{2013} Login")
        );
        assert_eq!(extract_title("<title></title>"), None);
        assert_eq!(extract_title("<html>no title</html>"), None);
    }

    #[test]
    fn test_decode_leaves_stray_ampersands() {
        assert_eq!(decode_entities("R&D &bogus; &#x41;"), "R&D &bogus; A");
    }

    async fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_fingerprint_reads_headers_and_title() {
        let body = "<html><title>Network Camera</title></html>";
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 401 Unauthorized\r\nServer: App-webs/\r\nWWW-Authenticate: Digest realm=\"IP Camera\"\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let port = serve_once(response).await;

        let fp = HttpFingerprinter::new(Duration::from_secs(2)).unwrap();
        let result = fp
            .fingerprint(Ipv4Addr::LOCALHOST, port, "http")
            .await
            .unwrap();
        assert_eq!(result.status, Some(401));
        assert_eq!(result.server.as_deref(), Some("App-webs/"));
        assert_eq!(result.auth.as_deref(), Some("Digest realm=\"IP Camera\""));
        assert_eq!(result.title.as_deref(), Some("Network Camera"));
    }

    #[tokio::test]
    async fn test_fingerprint_unreachable_is_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let fp = HttpFingerprinter::new(Duration::from_millis(500)).unwrap();
        assert!(fp.fingerprint(Ipv4Addr::LOCALHOST, port, "http").await.is_none());
    }
}
