//! WebSocket handshake replay towards the backend.
//!
//! The client's upgrade request has already been parsed by the HTTP server,
//! so its request line and headers are re-serialized onto the fresh backend
//! connection. The backend's response head is then read back so it can be
//! returned to the client before the connection switches to raw bytes.

use axum::http::{header, request, HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::BackendTarget;

/// Upper bound on the backend's response head.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;
/// Upper bound on a non-101 response body relayed back to the client.
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Failure while exchanging the handshake with the backend.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to send handshake to backend: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to read backend handshake response: {0}")]
    Read(#[source] std::io::Error),
    #[error("backend closed the connection before completing its response head")]
    Closed,
    #[error("backend response head exceeds {MAX_HEAD_BYTES} bytes")]
    TooLarge,
    #[error("malformed backend response: {0}")]
    Parse(#[from] httparse::Error),
    #[error("invalid header in backend response")]
    InvalidHeader,
}

/// The backend's answer to the replayed handshake.
#[derive(Debug)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Bytes received after the response head. For a 101 these already belong
    /// to the upgraded protocol and must reach the client first.
    pub remainder: Bytes,
}

/// Serialize the inbound upgrade request for the backend.
///
/// `Host` is rewritten to the target authority; every other header, including
/// `Upgrade`, `Connection` and `Sec-WebSocket-*`, is passed through verbatim.
pub fn encode_request(parts: &request::Parts, target: &BackendTarget) -> Vec<u8> {
    let path = target.rewrite_path_and_query(parts.uri.path(), parts.uri.query());

    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(parts.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    out.extend_from_slice(target.authority().as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in parts.headers.iter() {
        if name == header::HOST {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Send the handshake and read the backend's response head.
pub async fn exchange<S>(
    stream: &mut S,
    parts: &request::Parts,
    target: &BackendTarget,
) -> Result<BackendResponse, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = encode_request(parts, target);
    stream.write_all(&head).await.map_err(HandshakeError::Write)?;
    stream.flush().await.map_err(HandshakeError::Write)?;

    let mut response = read_response_head(stream).await?;
    if response.status != StatusCode::SWITCHING_PROTOCOLS {
        read_rejection_body(stream, &mut response).await?;
    }
    Ok(response)
}

/// Read and parse an HTTP/1.x response head.
pub async fn read_response_head<S>(stream: &mut S) -> Result<BackendResponse, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(HandshakeError::TooLarge);
        }
        let n = stream.read_buf(&mut buf).await.map_err(HandshakeError::Read)?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        let head_len = match parsed.parse(&buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => continue,
        };

        let status = parsed
            .code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or(HandshakeError::InvalidHeader)?;

        let mut header_map = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|_| HandshakeError::InvalidHeader)?;
            let value =
                HeaderValue::from_bytes(h.value).map_err(|_| HandshakeError::InvalidHeader)?;
            header_map.append(name, value);
        }

        let remainder = buf.split_off(head_len).freeze();
        return Ok(BackendResponse {
            status,
            headers: header_map,
            remainder,
        });
    }
}

/// Complete a rejection body declared by `Content-Length`, bounded in size.
async fn read_rejection_body<S>(
    stream: &mut S,
    response: &mut BackendResponse,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let declared = response
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());

    let Some(len) = declared.filter(|len| *len <= MAX_REJECTION_BODY) else {
        response.remainder = Bytes::new();
        return Ok(());
    };

    let mut body = BytesMut::from(&response.remainder[..response.remainder.len().min(len)]);
    while body.len() < len {
        let n = stream.read_buf(&mut body).await.map_err(HandshakeError::Read)?;
        if n == 0 {
            break;
        }
    }
    body.truncate(len);
    response.remainder = body.freeze();
    Ok(())
}
