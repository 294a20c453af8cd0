//! The HTTP tracker client.
//!
//! Trackers speak a small bencoded request/response protocol over HTTP GET.
//! This client only implements the compact peer list form (BEP 23) since
//! every tracker in practice supports it and it's dramatically smaller on
//! the wire than the original dictionary-of-peers form.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::{PeerId, Sha1Hash};

/// Bytes that must be percent-encoded in a tracker query string beyond the
/// default control-character set: anything that isn't a URL-safe
/// unreserved character, since `info_hash` and `peer_id` are raw 20 byte
/// binary blobs, not text.
const QUERY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|');

/// The announce event accompanying a request, per BEP 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Started,
    Stopped,
    Completed,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }
}

/// A single announce request.
pub(crate) struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    pub numwant: Option<usize>,
}

/// The parsed contents of a tracker's announce response.
#[derive(Debug, Clone)]
pub(crate) struct AnnounceResponse {
    /// Seconds to wait before the next announce, absent a failure.
    pub interval: u64,
    /// The tracker's requested minimum re-announce interval, if given.
    pub min_interval: Option<u64>,
    /// The peers the tracker knows about, decoded from the compact form.
    pub peers: Vec<SocketAddr>,
    pub seeder_count: Option<u64>,
    pub leecher_count: Option<u64>,
}

/// The raw bencode shape of an announce response, before the compact peer
/// list is decoded into socket addresses.
#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    #[serde(deserialize_with = "deserialize_compact_peers", default)]
    peers: Vec<SocketAddr>,
    complete: Option<u64>,
    incomplete: Option<u64>,
}

/// Decodes the compact peer list: a byte string that is a concatenation of
/// 6 byte chunks, each a 4 byte big endian IPv4 address followed by a 2
/// byte big endian port.
fn deserialize_compact_peers<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
    if bytes.len() % 6 != 0 {
        return Err(de::Error::custom("compact peers field length is not a multiple of 6"));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

/// A tracker HTTP client bound to a single torrent's announce URL.
pub(crate) struct Tracker {
    client: reqwest::Client,
    announce_url: String,
}

impl Tracker {
    pub fn new(announce_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Tracker(e.to_string()))?;
        Ok(Self { client, announce_url })
    }

    /// Sends one announce request, retrying up to `retry_count` additional
    /// times with exponential backoff starting at `retry_base_delay` if the
    /// request fails or times out.
    pub async fn announce(
        &self,
        req: AnnounceRequest,
        retry_count: usize,
        retry_base_delay: Duration,
    ) -> Result<AnnounceResponse> {
        let url = self.build_url(&req);
        let mut attempt = 0;
        loop {
            match self.send(&url).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < retry_count => {
                    log::warn!(
                        "Tracker announce attempt {} failed: {}, retrying",
                        attempt + 1,
                        e
                    );
                    tokio::time::delay_for(retry_base_delay * 2u32.pow(attempt as u32)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&self, url: &str) -> Result<AnnounceResponse> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let raw: RawAnnounceResponse =
            serde_bencode::from_bytes(&bytes).map_err(|e| Error::Tracker(e.to_string()))?;

        if let Some(reason) = raw.failure_reason {
            return Err(Error::Tracker(reason));
        }

        Ok(AnnounceResponse {
            interval: raw.interval.unwrap_or(1800),
            min_interval: raw.min_interval,
            peers: raw.peers,
            seeder_count: raw.complete,
            leecher_count: raw.incomplete,
        })
    }

    fn build_url(&self, req: &AnnounceRequest) -> String {
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.announce_url,
            if self.announce_url.contains('?') { '&' } else { '?' },
            percent_encode(&req.info_hash, QUERY_ENCODE_SET),
            percent_encode(&req.peer_id, QUERY_ENCODE_SET),
            req.port,
            req.uploaded,
            req.downloaded,
            req.left,
        );
        if let Some(event) = req.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }
        if let Some(numwant) = req.numwant {
            url.push_str(&format!("&numwant={}", numwant));
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_url_contains_required_fields() {
        let tracker = Tracker::new("http://tracker.example.com/announce".into(), Duration::from_secs(5)).unwrap();
        let req = AnnounceRequest {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: Some(Event::Started),
            numwant: Some(50),
        };
        let url = tracker.build_url(&req);
        assert!(url.starts_with("http://tracker.example.com/announce?"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("left=1000"));
        assert!(url.contains("event=started"));
        assert!(url.contains("numwant=50"));
        assert!(url.contains("compact=1"));
    }

    #[test]
    fn test_decode_compact_peers() {
        // two peers: 1.2.3.4:6881 and 5.6.7.8:51413, hand-encoded as bencode
        let mut peers = Vec::new();
        peers.extend_from_slice(&[1, 2, 3, 4]);
        peers.extend_from_slice(&6881u16.to_be_bytes());
        peers.extend_from_slice(&[5, 6, 7, 8]);
        peers.extend_from_slice(&51413u16.to_be_bytes());

        let mut bencoded = Vec::new();
        bencoded.extend_from_slice(b"d8:intervali1800e5:peers12:");
        bencoded.extend_from_slice(&peers);
        bencoded.extend_from_slice(b"e");

        let raw: RawAnnounceResponse = serde_bencode::from_bytes(&bencoded).unwrap();
        assert_eq!(raw.peers.len(), 2);
        assert_eq!(raw.peers[0], "1.2.3.4:6881".parse().unwrap());
        assert_eq!(raw.peers[1], "5.6.7.8:51413".parse().unwrap());
    }

    /// mockito 0.28 runs a single global mock server per process; these
    /// tests would otherwise race each other's mocks if `cargo test` ran
    /// them concurrently.
    static MOCKITO_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn sample_request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: Some(Event::Started),
            numwant: Some(50),
        }
    }

    /// A bencoded announce response with a 900s interval and one compact
    /// peer, 10.0.0.1:6881.
    fn bencode_peers_response() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali900e5:peers6:");
        body.extend_from_slice(&[10, 0, 0, 1]);
        body.extend_from_slice(&6881u16.to_be_bytes());
        body.push(b'e');
        body
    }

    #[tokio::test]
    async fn test_announce_decodes_live_http_response() {
        let _guard = MOCKITO_LOCK.lock().unwrap();
        let _mock = mockito::mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(bencode_peers_response())
            .create();

        let tracker =
            Tracker::new(format!("{}/announce", mockito::server_url()), Duration::from_secs(5)).unwrap();
        let response = tracker
            .announce(sample_request(), 0, Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(response.interval, 900);
        assert_eq!(response.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_announce_surfaces_failure_reason() {
        let _guard = MOCKITO_LOCK.lock().unwrap();
        let _mock = mockito::mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(&b"d14:failure reason22:torrent not registerede"[..])
            .create();

        let tracker =
            Tracker::new(format!("{}/announce", mockito::server_url()), Duration::from_secs(5)).unwrap();
        let err = tracker
            .announce(sample_request(), 0, Duration::from_millis(1))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("torrent not registered"));
    }

    #[tokio::test]
    async fn test_announce_retries_the_configured_number_of_times() {
        let _guard = MOCKITO_LOCK.lock().unwrap();
        let mock = mockito::mock("GET", mockito::Matcher::Any)
            .with_status(500)
            .expect(3)
            .create();

        let tracker =
            Tracker::new(format!("{}/announce", mockito::server_url()), Duration::from_secs(5)).unwrap();
        let result = tracker.announce(sample_request(), 2, Duration::from_millis(1)).await;

        assert!(result.is_err());
        mock.assert();
    }
}
