/*
 * Copyright (C) 2025-2026 Aerys Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::buffer::RefRead;
use crate::error::ProtocolError;
use crate::headers::HeaderMap;
use crate::options::{Options, SERVER_TOKEN};
use crate::pipeline::{EntityLength, ResponseHead};
use crate::request::Protocol;
use crate::response::status_phrase;
use crate::ticker::Ticker;
use std::cmp;
use std::convert::TryFrom;
use std::io::Write;
use std::str;

pub const HEADERS_MAX: usize = 64;
pub const URI_SIZE_MAX: usize = 8192;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BodySize {
    NoBody,
    Known(usize),
    Unknown,
}

// a parsed request head, detached from the read buffer
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
    pub trace: Vec<u8>,
    pub protocol: Protocol,
    pub body_size: BodySize,
    pub expect_100: bool,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ServerState {
    // call: recv_request
    // next: ReceivingRequest, ReceivingBody, AwaitingResponse
    ReceivingRequest,

    // call: recv_body
    // next: ReceivingBody, AwaitingResponse
    ReceivingBody,

    // request fully received; response may still be in flight
    AwaitingResponse,
}

// streaming parser for the request side of one HTTP/1.x connection.
// chunk-fed: callers pass whatever bytes have arrived and get back
// either a complete item or a signal to read more
pub struct ServerProtocol {
    state: ServerState,
    ver_min: u8,
    body_size: BodySize,
    chunk_left: Option<usize>,
    chunk_size: usize,
    persistent: bool,
}

impl ServerProtocol {
    pub fn new() -> Self {
        Self {
            state: ServerState::ReceivingRequest,
            ver_min: 0,
            body_size: BodySize::NoBody,
            chunk_left: None,
            chunk_size: 0,
            persistent: false,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    // begin the next keep-alive exchange
    pub fn reset(&mut self) {
        assert_eq!(self.state, ServerState::AwaitingResponse);

        self.state = ServerState::ReceivingRequest;
        self.body_size = BodySize::NoBody;
        self.chunk_left = None;
        self.chunk_size = 0;
    }

    // parse a request head out of buf. returns the parsed request and
    // the bytes consumed, or None when more bytes are needed
    pub fn recv_request(
        &mut self,
        buf: &[u8],
        opts: &Options,
    ) -> Result<Option<(ParsedRequest, usize)>, ProtocolError> {
        assert_eq!(self.state, ServerState::ReceivingRequest);

        let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
        let mut req = httparse::Request::new(&mut headers);

        let size = match req.parse(buf) {
            Ok(httparse::Status::Complete(size)) => size,
            Ok(httparse::Status::Partial) => {
                // don't let an unbounded head accumulate
                if buf.len() > opts.max_header_size {
                    return Err(ProtocolError::HeadersTooLarge);
                }

                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(ProtocolError::HeadersTooLarge);
            }
            Err(_) => return Err(ProtocolError::BadRequest),
        };

        if size > opts.max_header_size {
            return Err(ProtocolError::HeadersTooLarge);
        }

        let target = req.path.unwrap();

        if target.len() > URI_SIZE_MAX {
            return Err(ProtocolError::UriTooLong);
        }

        let mut method = req.method.unwrap().to_string();

        if method.bytes().any(|b| b.is_ascii_lowercase()) {
            if opts.normalize_method_case {
                method.make_ascii_uppercase();
            } else {
                return Err(ProtocolError::UnknownMethod);
            }
        }

        if !opts.method_allowed(&method) {
            return Err(ProtocolError::MethodNotAllowed);
        }

        let version = req.version.unwrap();

        let mut hmap = HeaderMap::new();

        for h in req.headers.iter() {
            hmap.add(h.name, String::from_utf8_lossy(h.value).into_owned());
        }

        let (body_size, expect_100) = self.process_request(version, &hmap)?;

        let parsed = ParsedRequest {
            method,
            target: target.to_string(),
            headers: hmap,
            trace: buf[..size].to_vec(),
            protocol: if version >= 1 {
                Protocol::Http11
            } else {
                Protocol::Http10
            },
            body_size,
            expect_100,
        };

        Ok(Some((parsed, size)))
    }

    fn process_request(
        &mut self,
        version: u8,
        headers: &HeaderMap,
    ) -> Result<(BodySize, bool), ProtocolError> {
        let mut content_len = None;
        let mut chunked = false;

        if let Some(value) = headers.get("content-length") {
            let len: usize = value
                .trim()
                .parse()
                .map_err(|_| ProtocolError::InvalidContentLength)?;

            content_len = Some(len);
        }

        for value in headers.get_all("transfer-encoding") {
            if value.trim().eq_ignore_ascii_case("chunked") {
                chunked = true;
            } else {
                return Err(ProtocolError::UnsupportedTransferEncoding);
            }
        }

        let keep_alive = headers.has_token("connection", "keep-alive");
        let close = headers.has_token("connection", "close");

        let expect_100 = version >= 1 && headers.has_token("expect", "100-continue");

        self.ver_min = version;

        self.body_size = if chunked {
            BodySize::Unknown
        } else {
            match content_len {
                Some(0) | None => BodySize::NoBody,
                Some(len) => {
                    self.chunk_left = Some(len);

                    BodySize::Known(len)
                }
            }
        };

        self.persistent = if version >= 1 {
            !close
        } else {
            keep_alive && !close
        };

        self.state = match self.body_size {
            BodySize::NoBody => ServerState::AwaitingResponse,
            _ => ServerState::ReceivingBody,
        };

        let expect_100 = expect_100 && self.body_size != BodySize::NoBody;

        Ok((self.body_size, expect_100))
    }

    // drain body bytes out of rbuf into dest. the second return value
    // carries trailing headers once a chunked body completes. (0, None)
    // with state still ReceivingBody means more bytes are needed
    pub fn recv_body(
        &mut self,
        rbuf: &mut dyn RefRead,
        dest: &mut [u8],
    ) -> Result<(usize, Option<HeaderMap>), ProtocolError> {
        assert_eq!(self.state, ServerState::ReceivingBody);

        match self.body_size {
            BodySize::Known(_) => {
                let mut chunk_left = self.chunk_left.unwrap();
                let read_size = cmp::min(cmp::min(chunk_left, dest.len()), RefRead::len(rbuf));

                dest[..read_size].copy_from_slice(&rbuf.get_ref()[..read_size]);
                rbuf.consume(read_size);

                chunk_left -= read_size;

                if chunk_left == 0 {
                    self.chunk_left = None;
                    self.state = ServerState::AwaitingResponse;
                } else {
                    self.chunk_left = Some(chunk_left);
                }

                Ok((read_size, None))
            }
            BodySize::Unknown => self.recv_chunked_body(rbuf, dest),
            BodySize::NoBody => unreachable!(),
        }
    }

    fn recv_chunked_body(
        &mut self,
        rbuf: &mut dyn RefRead,
        dest: &mut [u8],
    ) -> Result<(usize, Option<HeaderMap>), ProtocolError> {
        if self.chunk_left.is_none() {
            match httparse::parse_chunk_size(rbuf.get_ref()) {
                Ok(httparse::Status::Complete((pos, size))) => {
                    let size =
                        usize::try_from(size).map_err(|_| ProtocolError::InvalidChunk)?;

                    rbuf.consume(pos);

                    self.chunk_left = Some(size);
                    self.chunk_size = size;
                }
                Ok(httparse::Status::Partial) => return Ok((0, None)),
                Err(_) => return Err(ProtocolError::InvalidChunk),
            }
        }

        let mut chunk_left = self.chunk_left.unwrap();

        let size = if chunk_left > 0 {
            let read_size = cmp::min(cmp::min(chunk_left, dest.len()), RefRead::len(rbuf));

            dest[..read_size].copy_from_slice(&rbuf.get_ref()[..read_size]);
            rbuf.consume(read_size);

            chunk_left -= read_size;
            self.chunk_left = Some(chunk_left);

            read_size
        } else {
            0
        };

        let mut trailing_headers = None;

        if chunk_left == 0 {
            if self.chunk_size == 0 {
                // last chunk: trailer section ends the body
                let mut scratch = [httparse::EMPTY_HEADER; HEADERS_MAX];

                match httparse::parse_headers(rbuf.get_ref(), &mut scratch) {
                    Ok(httparse::Status::Complete((pos, headers))) => {
                        let mut hmap = HeaderMap::new();

                        for h in headers.iter() {
                            hmap.add(h.name, String::from_utf8_lossy(h.value).into_owned());
                        }

                        rbuf.consume(pos);

                        trailing_headers = Some(hmap);
                    }
                    Ok(httparse::Status::Partial) => return Ok((size, None)),
                    Err(_) => return Err(ProtocolError::BadHeader),
                }

                self.state = ServerState::AwaitingResponse;
            } else {
                let buf = rbuf.get_ref();

                if buf.len() < 2 {
                    return Ok((size, None));
                }

                if &buf[..2] != b"\r\n" {
                    return Err(ProtocolError::InvalidChunk);
                }

                rbuf.consume(2);
            }

            self.chunk_left = None;
            self.chunk_size = 0;
        }

        Ok((size, trailing_headers))
    }
}

impl Default for ServerProtocol {
    fn default() -> Self {
        Self::new()
    }
}

pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

// serialize a response head for the wire. the codec has already shaped
// the headers (transfer-encoding from the chunked filter, content
// encodings from deflate); this maps the entity length and connection
// semantics and stamps Date/Server
pub fn serialize_response_head(
    head: &ResponseHead,
    protocol: Protocol,
    persistent: bool,
    ticker: &Ticker,
    send_server_token: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);

    let reason = match &head.reason {
        Some(reason) => reason.as_str(),
        None => status_phrase(head.status),
    };

    let version = match protocol {
        Protocol::Http10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };

    write!(&mut out, "{} {} {}\r\n", version, head.status, reason).unwrap();

    let is_upgrade = head.status == 101;

    for (name, value) in head.headers.iter() {
        // connection semantics and entity length are driver-owned
        if (name == "connection" && !is_upgrade) || name == "content-length" {
            continue;
        }

        write!(&mut out, "{}: {}\r\n", name, value).unwrap();
    }

    match head.entity_length {
        EntityLength::Known(n) => {
            write!(&mut out, "Content-Length: {}\r\n", n).unwrap();
        }
        EntityLength::NoBody | EntityLength::Unknown => {}
    }

    if !head.headers.contains("date") {
        write!(&mut out, "Date: {}\r\n", ticker.http_date()).unwrap();
    }

    if send_server_token && !head.headers.contains("server") {
        write!(&mut out, "Server: {}\r\n", SERVER_TOKEN).unwrap();
    }

    if !is_upgrade {
        if persistent && protocol == Protocol::Http10 {
            out.extend_from_slice(b"Connection: keep-alive\r\n");
        } else if !persistent && protocol != Protocol::Http10 {
            out.extend_from_slice(b"Connection: close\r\n");
        }
    }

    out.extend_from_slice(b"\r\n");

    out
}

// whether the response forces the connection closed afterwards: an
// unknown-length body on http/1.0 can only be delimited by eof
pub fn response_forces_close(head: &ResponseHead, protocol: Protocol) -> bool {
    protocol == Protocol::Http10 && head.entity_length == EntityLength::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn opts() -> Options {
        Options::default()
    }

    #[test]
    fn test_recv_request_simple() {
        let mut p = ServerProtocol::new();

        let buf = b"GET /echo?x=1&x=2 HTTP/1.1\r\nHost: h\r\nX-A: 1\r\n\r\nleftover";

        let (req, size) = p.recv_request(buf, &opts()).unwrap().unwrap();

        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/echo?x=1&x=2");
        assert_eq!(req.protocol, Protocol::Http11);
        assert_eq!(req.headers.get("host"), Some("h"));
        assert_eq!(req.body_size, BodySize::NoBody);
        assert!(!req.expect_100);
        assert_eq!(&buf[size..], b"leftover");
        assert_eq!(req.trace, &buf[..size]);

        assert_eq!(p.state(), ServerState::AwaitingResponse);
        assert!(p.is_persistent());
    }

    #[test]
    fn test_recv_request_partial() {
        let mut p = ServerProtocol::new();

        assert!(p
            .recv_request(b"GET / HTTP/1.1\r\nHost:", &opts())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_recv_request_malformed() {
        let mut p = ServerProtocol::new();

        assert_eq!(
            p.recv_request(b"NOT A REQUEST\r\n\r\n", &opts()).unwrap_err(),
            ProtocolError::BadRequest
        );
    }

    #[test]
    fn test_method_case() {
        let mut p = ServerProtocol::new();

        assert_eq!(
            p.recv_request(b"get / HTTP/1.1\r\nHost: h\r\n\r\n", &opts())
                .unwrap_err(),
            ProtocolError::UnknownMethod
        );

        let mut p = ServerProtocol::new();

        let normalizing = Options {
            normalize_method_case: true,
            ..Options::default()
        };

        let (req, _) = p
            .recv_request(b"get / HTTP/1.1\r\nHost: h\r\n\r\n", &normalizing)
            .unwrap()
            .unwrap();

        assert_eq!(req.method, "GET");
    }

    #[test]
    fn test_method_not_allowed() {
        let mut p = ServerProtocol::new();

        assert_eq!(
            p.recv_request(b"BREW /pot HTTP/1.1\r\nHost: h\r\n\r\n", &opts())
                .unwrap_err(),
            ProtocolError::MethodNotAllowed
        );
    }

    #[test]
    fn test_uri_too_long() {
        let mut p = ServerProtocol::new();

        let mut buf = b"GET /".to_vec();
        buf.extend_from_slice(&vec![b'a'; URI_SIZE_MAX + 1]);
        buf.extend_from_slice(b" HTTP/1.1\r\nHost: h\r\n\r\n");

        assert_eq!(
            p.recv_request(&buf, &opts()).unwrap_err(),
            ProtocolError::UriTooLong
        );
    }

    #[test]
    fn test_headers_too_large() {
        let mut p = ServerProtocol::new();

        let small = Options {
            max_header_size: 64,
            ..Options::default()
        };

        let mut buf = b"GET / HTTP/1.1\r\nHost: h\r\nX-Big: ".to_vec();
        buf.extend_from_slice(&vec![b'a'; 128]);
        buf.extend_from_slice(b"\r\n\r\n");

        assert_eq!(
            p.recv_request(&buf, &small).unwrap_err(),
            ProtocolError::HeadersTooLarge
        );
    }

    #[test]
    fn test_expect_100() {
        let mut p = ServerProtocol::new();

        let buf = b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n";

        let (req, _) = p.recv_request(buf, &opts()).unwrap().unwrap();

        assert_eq!(req.body_size, BodySize::Known(5));
        assert!(req.expect_100);
        assert_eq!(p.state(), ServerState::ReceivingBody);
    }

    #[test]
    fn test_fixed_length_body() {
        let mut p = ServerProtocol::new();

        let buf = b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\n\r\n";

        let (req, size) = p.recv_request(buf, &opts()).unwrap().unwrap();
        assert_eq!(req.body_size, BodySize::Known(10));
        assert_eq!(size, buf.len());

        let mut body = b"helloworldEXTRA".to_vec();
        let mut rbuf = Cursor::new(&mut body[..]);

        let mut dest = [0; 6];

        let (n, trailers) = p.recv_body(&mut rbuf, &mut dest).unwrap();
        assert_eq!(&dest[..n], b"hellow");
        assert!(trailers.is_none());
        assert_eq!(p.state(), ServerState::ReceivingBody);

        let (n, _) = p.recv_body(&mut rbuf, &mut dest).unwrap();
        assert_eq!(&dest[..n], b"orld");
        assert_eq!(p.state(), ServerState::AwaitingResponse);

        // pipelined bytes stay in the buffer
        assert_eq!(RefRead::get_ref(&rbuf), b"EXTRA");
    }

    #[test]
    fn test_chunked_body_with_trailers() {
        let mut p = ServerProtocol::new();

        let head = b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n";

        let (req, _) = p.recv_request(head, &opts()).unwrap().unwrap();
        assert_eq!(req.body_size, BodySize::Unknown);

        let mut body = b"5\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n".to_vec();
        let mut rbuf = Cursor::new(&mut body[..]);

        let mut dest = [0; 64];
        let mut collected = Vec::new();
        let mut trailers = None;

        while p.state() == ServerState::ReceivingBody {
            let (n, t) = p.recv_body(&mut rbuf, &mut dest).unwrap();

            collected.extend_from_slice(&dest[..n]);

            if let Some(t) = t {
                trailers = Some(t);
            }
        }

        assert_eq!(collected, b"hello world");
        assert_eq!(trailers.unwrap().get("x-trailer"), Some("yes"));
    }

    #[test]
    fn test_chunked_body_arbitrary_split() {
        // feed the wire bytes in every possible two-part split and make
        // sure the reassembled body always matches
        let wire = b"3\r\nabc\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n";

        for split in 1..wire.len() {
            let mut p = ServerProtocol::new();

            let head = b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n";
            p.recv_request(head, &opts()).unwrap().unwrap();

            let mut collected = Vec::new();
            let mut dest = [0; 64];

            let mut pending: Vec<u8> = wire[..split].to_vec();
            let mut fed_rest = false;

            loop {
                let before = pending.len();

                {
                    let mut rbuf = Cursor::new(&mut pending[..]);

                    while p.state() == ServerState::ReceivingBody {
                        let (n, _) = p.recv_body(&mut rbuf, &mut dest).unwrap();

                        if n == 0 && RefRead::len(&rbuf) == before {
                            break;
                        }

                        collected.extend_from_slice(&dest[..n]);

                        if n == 0 {
                            break;
                        }
                    }

                    let consumed = rbuf.position() as usize;
                    pending.drain(..consumed);
                }

                if p.state() != ServerState::ReceivingBody {
                    break;
                }

                if !fed_rest {
                    pending.extend_from_slice(&wire[split..]);
                    fed_rest = true;
                } else if pending.len() == before {
                    panic!("no progress at split {}", split);
                }
            }

            assert_eq!(collected, b"abc0123456789abcdef", "split {}", split);
        }
    }

    #[test]
    fn test_persistence() {
        // 1.1 default keep-alive
        let mut p = ServerProtocol::new();
        p.recv_request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n", &opts())
            .unwrap();
        assert!(p.is_persistent());

        // 1.1 with close
        let mut p = ServerProtocol::new();
        p.recv_request(
            b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
            &opts(),
        )
        .unwrap();
        assert!(!p.is_persistent());

        // 1.0 default close
        let mut p = ServerProtocol::new();
        p.recv_request(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n", &opts())
            .unwrap();
        assert!(!p.is_persistent());

        // 1.0 with keep-alive
        let mut p = ServerProtocol::new();
        p.recv_request(
            b"GET / HTTP/1.0\r\nHost: h\r\nConnection: keep-alive\r\n\r\n",
            &opts(),
        )
        .unwrap();
        assert!(p.is_persistent());
    }

    #[test]
    fn test_serialize_response_head() {
        let ticker = Ticker::new();
        ticker.set_time(784111777);

        let mut head = ResponseHead::new(200);
        head.headers.add("content-type", "text/plain");
        head.entity_length = EntityLength::Known(7);

        let out = serialize_response_head(&head, Protocol::Http11, true, &ticker, true);
        let text = str::from_utf8(&out).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.contains("Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n"));
        assert!(text.contains(&format!("Server: {}\r\n", SERVER_TOKEN)));
        assert!(!text.contains("Connection:"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_serialize_close_and_keep_alive() {
        let ticker = Ticker::new();
        ticker.set_time(0);

        let head = ResponseHead::new(200);

        // 1.1 non-persistent gets an explicit close
        let out = serialize_response_head(&head, Protocol::Http11, false, &ticker, false);
        assert!(str::from_utf8(&out).unwrap().contains("Connection: close\r\n"));

        // 1.0 persistent gets an explicit keep-alive
        let out = serialize_response_head(&head, Protocol::Http10, true, &ticker, false);
        assert!(str::from_utf8(&out)
            .unwrap()
            .contains("Connection: keep-alive\r\n"));

        // server token suppressed
        assert!(!str::from_utf8(&out).unwrap().contains("Server:"));
    }

    #[test]
    fn test_serialize_reason_override() {
        let ticker = Ticker::new();
        ticker.set_time(0);

        let mut head = ResponseHead::new(200);
        head.reason = Some("Fine".to_string());

        let out = serialize_response_head(&head, Protocol::Http11, true, &ticker, false);
        assert!(str::from_utf8(&out).unwrap().starts_with("HTTP/1.1 200 Fine\r\n"));
    }

    #[test]
    fn test_http10_unknown_length_forces_close() {
        let mut head = ResponseHead::new(200);
        head.entity_length = EntityLength::Unknown;

        assert!(response_forces_close(&head, Protocol::Http10));
        assert!(!response_forces_close(&head, Protocol::Http11));
    }
}
