//! ONVIF SOAP client resolving a device's RTSP stream URI.
//!
//! Sequence: `GetCapabilities` (Media XAddr) -> `GetProfiles` (first profile
//! token) -> `GetStreamUri` (RTP-Unicast over RTSP). Every SOAP call holds the
//! ONVIF-SOAP gate; callers hold the ONVIF-RTSP gate around the whole sequence.

use super::discovery::url_ipv4;
use super::gate::Gate;
use super::xml;
use super::Credentials;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use sha1::{Digest, Sha1};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnvifRtspRequest {
    pub ip: Ipv4Addr,
    pub xaddrs: Vec<String>,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnvifRtspOutcome {
    Resolved(String),
    AuthRequired,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OnvifError {
    #[error("Auth required")]
    AuthRequired,

    #[error("No usable XAddr")]
    NoXAddrs,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("SOAP fault: {0}")]
    Fault(String),

    #[error("Missing {0} in response")]
    MissingField(&'static str),

    #[error("Request cancelled")]
    Cancelled,
}

impl From<Result<String, OnvifError>> for OnvifRtspOutcome {
    fn from(result: Result<String, OnvifError>) -> Self {
        match result {
            Ok(uri) => OnvifRtspOutcome::Resolved(uri),
            Err(OnvifError::AuthRequired) => OnvifRtspOutcome::AuthRequired,
            Err(e) => OnvifRtspOutcome::Failed(e.to_string()),
        }
    }
}

const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
const PASSWORD_DIGEST: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest";
const BASE64_BINARY: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

/// PasswordDigest = Base64(SHA1(nonce + created + password))
pub fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// WS-Security UsernameToken header with a fresh nonce
pub fn ws_security_header(credentials: &Credentials) -> String {
    let nonce: [u8; 16] = rand::random();
    let created = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let digest = password_digest(&nonce, &created, &credentials.password);

    format!(
        r#"<wsse:Security s:mustUnderstand="1" xmlns:wsse="{WSSE_NS}" xmlns:wsu="{WSU_NS}">
      <wsse:UsernameToken>
        <wsse:Username>{}</wsse:Username>
        <wsse:Password Type="{PASSWORD_DIGEST}">{}</wsse:Password>
        <wsse:Nonce EncodingType="{BASE64_BINARY}">{}</wsse:Nonce>
        <wsu:Created>{}</wsu:Created>
      </wsse:UsernameToken>
    </wsse:Security>"#,
        escape(&credentials.username),
        digest,
        STANDARD.encode(nonce),
        created
    )
}

fn envelope(body: &str, credentials: Option<&Credentials>) -> String {
    let header = credentials.map(ws_security_header).unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:tds="http://www.onvif.org/ver10/device/wsdl" xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema">
  <s:Header>{}</s:Header>
  <s:Body>{}</s:Body>
</s:Envelope>"#,
        header, body
    )
}

const GET_CAPABILITIES: &str =
    "<tds:GetCapabilities><tds:Category>Media</tds:Category></tds:GetCapabilities>";
const GET_PROFILES: &str = "<trt:GetProfiles/>";

fn get_stream_uri(profile_token: &str) -> String {
    format!(
        "<trt:GetStreamUri><trt:StreamSetup><tt:Stream>RTP-Unicast</tt:Stream>\
         <tt:Transport><tt:Protocol>RTSP</tt:Protocol></tt:Transport></trt:StreamSetup>\
         <trt:ProfileToken>{}</trt:ProfileToken></trt:GetStreamUri>",
        escape(profile_token)
    )
}

/// Map a SOAP reply to its body or the error it represents
pub fn check_response(status: StatusCode, body: String) -> Result<String, OnvifError> {
    if status == StatusCode::UNAUTHORIZED || body.contains("NotAuthorized") {
        return Err(OnvifError::AuthRequired);
    }
    if xml::has_element(&body, "Fault") {
        let reason = xml::first_element_text(&body, "Text")
            .or_else(|| xml::first_element_text(&body, "Value"))
            .unwrap_or_else(|| "unknown".to_string());
        return Err(OnvifError::Fault(reason));
    }
    if !status.is_success() {
        return Err(OnvifError::Status(status.as_u16()));
    }
    Ok(body)
}

pub fn parse_media_xaddr(body: &str) -> Option<String> {
    xml::nested_text(body, "Media", "XAddr")
}

pub fn parse_profile_token(body: &str) -> Option<String> {
    xml::first_attribute(body, "Profiles", "token")
}

pub fn parse_stream_uri(body: &str) -> Option<String> {
    xml::first_element_text(body, "Uri")
}

/// Device service endpoint to talk to: IPv4 XAddrs first
fn device_service(xaddrs: &[String]) -> Option<&String> {
    xaddrs
        .iter()
        .find(|x| url_ipv4(x).is_some())
        .or_else(|| xaddrs.first())
}

/// SOAP client bound to one HTTP client and the ONVIF-SOAP gate
pub struct OnvifRtspResolver<'a> {
    client: &'a Client,
    soap_gate: &'a Gate,
}

impl<'a> OnvifRtspResolver<'a> {
    pub fn new(client: &'a Client, soap_gate: &'a Gate) -> Self {
        Self { client, soap_gate }
    }

    async fn call(&self, url: &str, body: &str, credentials: Option<&Credentials>) -> Result<String, OnvifError> {
        let _permit = self.soap_gate.acquire().await.map_err(|_| OnvifError::Cancelled)?;
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .body(envelope(body, credentials))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        check_response(status, text)
    }

    /// Resolve the first profile's RTSP URI
    pub async fn resolve(&self, request: &OnvifRtspRequest) -> Result<String, OnvifError> {
        let device_url = device_service(&request.xaddrs).ok_or(OnvifError::NoXAddrs)?;
        let credentials = request.credentials.as_ref();

        let caps = self.call(device_url, GET_CAPABILITIES, credentials).await?;
        let media_url = parse_media_xaddr(&caps).unwrap_or_else(|| device_url.clone());
        tracing::debug!("[ONVIF] {} media service at {}", request.ip, media_url);

        let profiles = self.call(&media_url, GET_PROFILES, credentials).await?;
        let token = parse_profile_token(&profiles).ok_or(OnvifError::MissingField("profile token"))?;

        let stream = self.call(&media_url, &get_stream_uri(&token), credentials).await?;
        let uri = parse_stream_uri(&stream).ok_or(OnvifError::MissingField("stream URI"))?;

        tracing::info!("[ONVIF] {} profile {} streams at {}", request.ip, token, uri);
        Ok(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CAPABILITIES: &str = r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><tds:GetCapabilitiesResponse><tds:Capabilities><tt:Media><tt:XAddr>MEDIA_URL</tt:XAddr></tt:Media></tds:Capabilities></tds:GetCapabilitiesResponse></s:Body></s:Envelope>"#;
    const PROFILES: &str = r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><trt:GetProfilesResponse><trt:Profiles token="Profile_1" fixed="true"><tt:Name>main</tt:Name></trt:Profiles></trt:GetProfilesResponse></s:Body></s:Envelope>"#;
    const STREAM: &str = r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><trt:GetStreamUriResponse><trt:MediaUri><tt:Uri>rtsp://192.168.1.64:554/Streaming/Channels/101?transportmode=unicast&amp;profile=Profile_1</tt:Uri></trt:MediaUri></trt:GetStreamUriResponse></s:Body></s:Envelope>"#;
    const NOT_AUTHORIZED: &str = r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:ter="http://www.onvif.org/ver10/error"><s:Body><s:Fault><s:Code><s:Value>s:Sender</s:Value><s:Subcode><s:Value>ter:NotAuthorized</s:Value></s:Subcode></s:Code><s:Reason><s:Text xml:lang="en">Sender not Authorized</s:Text></s:Reason></s:Fault></s:Body></s:Envelope>"#;

    #[test]
    fn test_password_digest_vector() {
        let nonce: Vec<u8> = (0u8..16).collect();
        assert_eq!(
            password_digest(&nonce, "2024-01-01T00:00:00Z", "secret"),
            "vhkNh82r7E2rA9qMKzvKdpwqvjc="
        );
    }

    #[test]
    fn test_security_header_shape() {
        let creds = Credentials {
            username: "ad<min".to_string(),
            password: "pw".to_string(),
        };
        let header = ws_security_header(&creds);
        assert!(header.contains("<wsse:Username>ad&lt;min</wsse:Username>"));
        assert!(header.contains("#PasswordDigest"));
        assert!(!header.contains(">pw<"));
    }

    #[test]
    fn test_parse_sequence_bodies() {
        assert_eq!(
            parse_media_xaddr(&CAPABILITIES.replace("MEDIA_URL", "http://10.0.0.2/onvif/media")).as_deref(),
            Some("http://10.0.0.2/onvif/media")
        );
        assert_eq!(parse_profile_token(PROFILES).as_deref(), Some("Profile_1"));
        assert_eq!(
            parse_stream_uri(STREAM).as_deref(),
            Some("rtsp://192.168.1.64:554/Streaming/Channels/101?transportmode=unicast&profile=Profile_1")
        );
    }

    #[test]
    fn test_check_response_classifies_errors() {
        assert!(matches!(
            check_response(StatusCode::UNAUTHORIZED, String::new()),
            Err(OnvifError::AuthRequired)
        ));
        assert!(matches!(
            check_response(StatusCode::BAD_REQUEST, NOT_AUTHORIZED.to_string()),
            Err(OnvifError::AuthRequired)
        ));
        let fault = NOT_AUTHORIZED.replace("ter:NotAuthorized", "ter:ActionNotSupported");
        match check_response(StatusCode::INTERNAL_SERVER_ERROR, fault) {
            Err(OnvifError::Fault(reason)) => assert_eq!(reason, "Sender not Authorized"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            check_response(StatusCode::NOT_FOUND, "<html/>".to_string()),
            Err(OnvifError::Status(404))
        ));
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(
            OnvifRtspOutcome::from(Err(OnvifError::AuthRequired)),
            OnvifRtspOutcome::AuthRequired
        );
        assert_eq!(
            OnvifRtspOutcome::from(Err(OnvifError::MissingField("profile token"))),
            OnvifRtspOutcome::Failed("Missing profile token in response".to_string())
        );
    }

    #[test]
    fn test_device_service_prefers_ipv4() {
        let xaddrs = vec![
            "http://[fe80::1]/onvif/device_service".to_string(),
            "http://192.168.1.64/onvif/device_service".to_string(),
        ];
        assert_eq!(device_service(&xaddrs), Some(&xaddrs[1]));
        assert_eq!(device_service(&[]), None);
    }

    /// Minimal SOAP endpoint: answers each connection by the action in the request body
    async fn fake_device(unauthorized: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let media = format!("{}/onvif/media", base);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let media = media.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                        if String::from_utf8_lossy(&request).contains("</s:Envelope>") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&request);
                    let (status, body) = if unauthorized {
                        ("401 Unauthorized", String::new())
                    } else if request.contains("GetCapabilities") {
                        ("200 OK", CAPABILITIES.replace("MEDIA_URL", &media))
                    } else if request.contains("GetProfiles") {
                        ("200 OK", PROFILES.to_string())
                    } else {
                        ("200 OK", STREAM.to_string())
                    };
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/soap+xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        format!("{}/onvif/device_service", base)
    }

    fn client() -> Client {
        Client::builder()
            .timeout(Duration::from_secs(2))
            .no_proxy()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_against_fake_device() {
        let xaddr = fake_device(false).await;
        let client = client();
        let gate = Gate::new("onvif-soap", 2);
        let request = OnvifRtspRequest {
            ip: Ipv4Addr::LOCALHOST,
            xaddrs: vec![xaddr],
            credentials: Some(Credentials {
                username: "admin".to_string(),
                password: "12345".to_string(),
            }),
        };

        let uri = OnvifRtspResolver::new(&client, &gate).resolve(&request).await.unwrap();
        assert!(uri.starts_with("rtsp://192.168.1.64:554/Streaming/Channels/101"));
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_resolve_maps_401_to_auth_required() {
        let xaddr = fake_device(true).await;
        let client = client();
        let gate = Gate::new("onvif-soap", 2);
        let request = OnvifRtspRequest {
            ip: Ipv4Addr::LOCALHOST,
            xaddrs: vec![xaddr],
            credentials: None,
        };

        let result = OnvifRtspResolver::new(&client, &gate).resolve(&request).await;
        assert_eq!(OnvifRtspOutcome::from(result), OnvifRtspOutcome::AuthRequired);
    }
}
