//! HTTP/1.1 client for the image service.
//!
//! GET and HEAD over plain TCP or TLS with a streaming body callback. The
//! response headers the wake cycle cares about are captured on the way
//! through: the content validator (`ETag`, falling back to `Last-Modified`)
//! that serves as the integrity token, and the server `Date` used to sync
//! the wall clock.

use core::fmt::Write as FmtWrite;
use core::str;

use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::Stack;
use embedded_io_async::{Read, Write};
use embedded_tls::{Aes128GcmSha256, TlsConfig, TlsConnection, TlsContext, UnsecureProvider};
use heapless::String;
use inkcycle_core::time::parse_http_date;
use log::debug;
use rand_core::{CryptoRng, RngCore};

/// TLS record buffer sizes required by embedded-tls.
pub const TLS_READ_BUF_SIZE: usize = 16_640;
pub const TLS_WRITE_BUF_SIZE: usize = 4_096;

const MAX_VALIDATOR_LEN: usize = 64;

#[derive(Debug)]
pub enum HttpError {
    InvalidUrl,
    Dns,
    Connect,
    Write,
    Read,
    Parse,
    Status(u16),
    TooLarge,
    Tls,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scheme {
    Http,
    Https,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Method {
    Get,
    Head,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
        }
    }
}

/// Parsed URL components.
pub struct Url<'a> {
    pub scheme: Scheme,
    pub host: &'a str,
    pub port: u16,
    pub path: &'a str,
}

impl<'a> Url<'a> {
    /// Accepts `http://host[:port]/path` and `https://host[:port]/path`.
    pub fn parse(url: &'a str) -> Result<Self, HttpError> {
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            return Err(HttpError::InvalidUrl);
        };

        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if host_port.is_empty() {
            return Err(HttpError::InvalidUrl);
        }

        let (host, port) = match host_port.find(':') {
            Some(idx) => {
                let port = host_port[idx + 1..].parse().map_err(|_| HttpError::InvalidUrl)?;
                (&host_port[..idx], port)
            }
            None => {
                let default = match scheme {
                    Scheme::Http => 80,
                    Scheme::Https => 443,
                };
                (host_port, default)
            }
        };

        Ok(Url { scheme, host, port, path })
    }
}

/// Response metadata captured from the status line and headers.
pub struct ResponseInfo {
    pub status: u16,
    pub content_length: Option<usize>,
    /// `ETag` if present, else `Last-Modified`.
    pub validator: Option<String<MAX_VALIDATOR_LEN>>,
    /// Server `Date` header as Unix epoch seconds.
    pub date_epoch: Option<u64>,
    pub body_read: usize,
}

/// Perform one request. The body, if any, is streamed into `on_body` in
/// chunks; HEAD requests return after the headers.
pub async fn request<F>(
    stack: Stack<'_>,
    url: &Url<'_>,
    method: Method,
    tls_read_buf: &mut [u8],
    tls_write_buf: &mut [u8],
    tls_seed: u64,
    on_body: F,
) -> Result<ResponseInfo, HttpError>
where
    F: FnMut(&[u8]),
{
    let ip = resolve_host(stack, url.host).await?;
    debug!("{} {}:{}{}", method.as_str(), url.host, url.port, url.path);

    let mut rx_buf = [0u8; 4096];
    let mut tx_buf = [0u8; 1024];
    let mut socket = TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
    socket.set_timeout(Some(embassy_time::Duration::from_secs(30)));
    socket
        .connect((ip, url.port))
        .await
        .map_err(|_| HttpError::Connect)?;

    let mut header_buf = [0u8; 2048];
    let result = match url.scheme {
        Scheme::Http => exchange(&mut socket, url, method, &mut header_buf, on_body).await,
        Scheme::Https => {
            let config = TlsConfig::new().with_server_name(url.host);
            let mut tls = TlsConnection::new(socket, tls_read_buf, tls_write_buf);
            tls.open(TlsContext::new(
                &config,
                UnsecureProvider::new::<Aes128GcmSha256>(TlsRng::new(tls_seed)),
            ))
            .await
            .map_err(|_| HttpError::Tls)?;
            exchange(&mut tls, url, method, &mut header_buf, on_body).await
        }
    };

    result
}

/// Send the request and consume the response on any byte transport.
async fn exchange<T, F>(
    conn: &mut T,
    url: &Url<'_>,
    method: Method,
    header_buf: &mut [u8],
    mut on_body: F,
) -> Result<ResponseInfo, HttpError>
where
    T: Read + Write,
    F: FnMut(&[u8]),
{
    let mut request: String<256> = String::new();
    write!(
        &mut request,
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        method.as_str(),
        url.path,
        url.host
    )
    .map_err(|_| HttpError::TooLarge)?;

    conn.write_all(request.as_bytes())
        .await
        .map_err(|_| HttpError::Write)?;
    conn.flush().await.map_err(|_| HttpError::Write)?;

    // Accumulate until the blank line that ends the headers.
    let mut total_read = 0;
    let headers_end = loop {
        if total_read >= header_buf.len() {
            return Err(HttpError::TooLarge);
        }
        let n = conn
            .read(&mut header_buf[total_read..])
            .await
            .map_err(|_| HttpError::Read)?;
        if n == 0 {
            return Err(HttpError::Read);
        }
        total_read += n;
        if let Some(pos) = find_header_end(&header_buf[..total_read]) {
            break pos;
        }
    };

    let header_str =
        str::from_utf8(&header_buf[..headers_end]).map_err(|_| HttpError::Parse)?;
    let status = parse_status(header_str)?;

    let mut info = ResponseInfo {
        status,
        content_length: parse_header(header_str, "content-length").and_then(|v| v.parse().ok()),
        validator: parse_header(header_str, "etag")
            .or_else(|| parse_header(header_str, "last-modified"))
            .map(truncate_validator),
        date_epoch: parse_header(header_str, "date").and_then(parse_http_date),
        body_read: 0,
    };

    if status >= 400 {
        return Err(HttpError::Status(status));
    }
    if method == Method::Head {
        return Ok(info);
    }

    // Body bytes that arrived with the header read.
    let body_start = headers_end + 4;
    if total_read > body_start {
        let initial = &header_buf[body_start..total_read];
        on_body(initial);
        info.body_read += initial.len();
    }

    loop {
        if let Some(length) = info.content_length {
            if info.body_read >= length {
                break;
            }
        }
        let n = conn.read(header_buf).await.map_err(|_| HttpError::Read)?;
        if n == 0 {
            break;
        }
        on_body(&header_buf[..n]);
        info.body_read += n;
    }

    Ok(info)
}

async fn resolve_host(stack: Stack<'_>, host: &str) -> Result<core::net::Ipv4Addr, HttpError> {
    if let Ok(ip) = parse_ipv4(host) {
        return Ok(ip);
    }

    let addrs = stack
        .dns_query(host, DnsQueryType::A)
        .await
        .map_err(|_| HttpError::Dns)?;
    if let Some(embassy_net::IpAddress::Ipv4(v4)) = addrs.first() {
        let o = v4.octets();
        return Ok(core::net::Ipv4Addr::new(o[0], o[1], o[2], o[3]));
    }
    Err(HttpError::Dns)
}

fn truncate_validator(value: &str) -> String<MAX_VALIDATOR_LEN> {
    let mut out = String::new();
    for ch in value.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Position of `\r\n\r\n` in the buffer.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Status code from an `HTTP/1.1 200 OK` status line.
pub fn parse_status(headers: &str) -> Result<u16, HttpError> {
    let line = headers.lines().next().ok_or(HttpError::Parse)?;
    line.split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or(HttpError::Parse)
}

/// Case-insensitive header lookup.
pub fn parse_header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    for line in headers.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Numeric IPv4 literal, for URLs that skip DNS.
pub fn parse_ipv4(host: &str) -> Result<core::net::Ipv4Addr, HttpError> {
    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in host.split('.') {
        if count == 4 {
            return Err(HttpError::InvalidUrl);
        }
        octets[count] = part.parse().map_err(|_| HttpError::InvalidUrl)?;
        count += 1;
    }
    if count != 4 {
        return Err(HttpError::InvalidUrl);
    }
    Ok(core::net::Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
}

/// Deterministic xorshift generator seeding the TLS handshake; the seed
/// comes from the hardware RNG at boot.
struct TlsRng {
    state: u64,
}

impl TlsRng {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }
}

impl RngCore for TlsRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for TlsRng {}
