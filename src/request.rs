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

use crate::body::Message;
use crate::cookie::parse_cookie_header;
use crate::error::Error;
use crate::headers::HeaderMap;
use crate::options::{Options, OptionValue, UnknownOptionError};
use crate::query::{first_param, parse_query};
use crate::ticker::Ticker;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Protocol {
    Http10,
    Http11,
    Http2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "1.0",
            Self::Http11 => "1.1",
            Self::Http2 => "2.0",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub is_encrypted: bool,
    // e.g. the negotiated ALPN identifier
    pub crypto_info: Option<String>,
}

// the exact request head as received, for wire fidelity. http/1 keeps
// the raw header block; http/2 keeps the decoded field list in order
// with original casing
#[derive(Debug, Clone)]
pub enum Trace {
    Raw(Vec<u8>),
    Pairs(Vec<(String, String)>),
}

// what a protocol driver hands over when a request head is complete
pub struct RequestParts {
    pub method: String,
    pub target: String,
    pub protocol: Protocol,
    pub headers: HeaderMap,
    pub trace: Trace,
    pub stream_id: u32,
}

struct InternalRequest {
    method: String,
    uri: String,
    uri_scheme: String,
    uri_host: String,
    uri_port: u16,
    uri_path: String,
    uri_query: String,
    protocol: Protocol,
    headers: HeaderMap,
    cookies: Vec<(String, String)>,
    trace: Trace,
    stream_id: u32,
    time: u64,
    http_date: Rc<String>,
    body: Message,
    options: Rc<Options>,
    connection: ConnectionInfo,
    locals: HashMap<String, Rc<dyn Any>>,
    params: Option<Vec<(String, String)>>,
    middleware_index: usize,
    bad_filter_keys: Vec<&'static str>,
}

// server-side canonical request handle. cheap to clone; clones share
// state
#[derive(Clone)]
pub struct Request {
    data: Rc<RefCell<InternalRequest>>,
}

impl Request {
    pub fn new(
        parts: RequestParts,
        body: Message,
        options: Rc<Options>,
        connection: ConnectionInfo,
        ticker: &Ticker,
    ) -> Self {
        let RequestParts {
            method,
            target,
            protocol,
            headers,
            trace,
            stream_id,
        } = parts;

        let uri_scheme = if connection.is_encrypted {
            "https".to_string()
        } else {
            "http".to_string()
        };

        let default_port = if connection.is_encrypted { 443 } else { 80 };

        // origin-form targets take their authority from the Host
        // header; absolute-form targets carry their own
        let (uri_host, uri_port, uri_path, uri_query) = if target.starts_with('/') {
            let (path, query) = match target.split_once('?') {
                Some((p, q)) => (p.to_string(), q.to_string()),
                None => (target.clone(), String::new()),
            };

            let (host, port) = split_authority(
                headers.get("host").unwrap_or(""),
                default_port,
            );

            (host, port, path, query)
        } else if let Ok(url) = url::Url::parse(&target) {
            let host = url.host_str().unwrap_or("").to_string();
            let port = url.port().unwrap_or(default_port);
            let path = url.path().to_string();
            let query = url.query().unwrap_or("").to_string();

            (host, port, path, query)
        } else {
            // e.g. asterisk-form
            let (host, port) = split_authority(
                headers.get("host").unwrap_or(""),
                default_port,
            );

            (host, port, target.clone(), String::new())
        };

        let mut cookies = Vec::new();

        for value in headers.get_all("cookie") {
            cookies.extend(parse_cookie_header(value));
        }

        Self {
            data: Rc::new(RefCell::new(InternalRequest {
                method,
                uri: target,
                uri_scheme,
                uri_host,
                uri_port,
                uri_path,
                uri_query,
                protocol,
                headers,
                cookies,
                trace,
                stream_id,
                time: ticker.unix_time(),
                http_date: ticker.http_date(),
                body,
                options,
                connection,
                locals: HashMap::new(),
                params: None,
                middleware_index: 0,
                bad_filter_keys: Vec::new(),
            })),
        }
    }

    pub fn get_method(&self) -> String {
        self.data.borrow().method.clone()
    }

    pub fn get_uri(&self) -> String {
        self.data.borrow().uri.clone()
    }

    pub fn uri_scheme(&self) -> String {
        self.data.borrow().uri_scheme.clone()
    }

    pub fn uri_host(&self) -> String {
        self.data.borrow().uri_host.clone()
    }

    pub fn uri_port(&self) -> u16 {
        self.data.borrow().uri_port
    }

    pub fn uri_path(&self) -> String {
        self.data.borrow().uri_path.clone()
    }

    pub fn uri_query(&self) -> String {
        self.data.borrow().uri_query.clone()
    }

    // authority as used for same-origin checks
    pub fn authority(&self) -> String {
        let data = self.data.borrow();

        format!("{}:{}", data.uri_host, data.uri_port)
    }

    pub fn get_protocol_version(&self) -> &'static str {
        self.data.borrow().protocol.as_str()
    }

    pub fn protocol(&self) -> Protocol {
        self.data.borrow().protocol
    }

    pub fn get_header(&self, name: &str) -> Option<String> {
        self.data.borrow().headers.get(name).map(str::to_string)
    }

    pub fn get_header_array(&self, name: &str) -> Vec<String> {
        self.data.borrow().headers.get_all(name).to_vec()
    }

    pub fn get_all_headers(&self) -> Vec<(String, String)> {
        self.data
            .borrow()
            .headers
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    pub fn trace(&self) -> Trace {
        self.data.borrow().trace.clone()
    }

    // trailing header fields of a chunked body join the regular set
    pub fn merge_trailers(&self, trailers: &HeaderMap) {
        let data = &mut *self.data.borrow_mut();

        for (name, value) in trailers.iter() {
            data.headers.add(name, value.to_string());
        }
    }

    // the request body. a non-negative limit raises (never lowers) the
    // effective body size, the recovery path for oversize bodies
    pub fn get_body(&self, limit: i64) -> Message {
        let data = self.data.borrow();

        if limit >= 0 {
            data.body.set_limit(limit as usize);
        }

        data.body.clone()
    }

    pub fn upgrade_body_size(&self, size: usize) {
        self.data.borrow().body.set_limit(size);
    }

    pub fn get_param(&self, name: &str) -> Result<Option<String>, Error> {
        let params = self.params()?;

        Ok(first_param(&params, name).map(str::to_string))
    }

    pub fn get_all_params(&self) -> Result<Vec<(String, String)>, Error> {
        self.params()
    }

    fn params(&self) -> Result<Vec<(String, String)>, Error> {
        let data = &mut *self.data.borrow_mut();

        if data.params.is_none() {
            let params = parse_query(
                &data.uri_query,
                data.options.max_input_vars,
                data.options.max_field_len,
            )?;

            data.params = Some(params);
        }

        Ok(data.params.as_ref().unwrap().clone())
    }

    pub fn get_cookie(&self, name: &str) -> Option<String> {
        self.data
            .borrow()
            .cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    pub fn get_local_var(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.data.borrow().locals.get(name).cloned()
    }

    pub fn set_local_var(&self, name: &str, value: Rc<dyn Any>) {
        self.data.borrow_mut().locals.insert(name.to_string(), value);
    }

    pub fn get_connection_info(&self) -> ConnectionInfo {
        self.data.borrow().connection.clone()
    }

    pub fn get_option(&self, name: &str) -> Result<OptionValue, UnknownOptionError> {
        self.data.borrow().options.get(name)
    }

    pub fn options(&self) -> Rc<Options> {
        Rc::clone(&self.data.borrow().options)
    }

    pub fn stream_id(&self) -> u32 {
        self.data.borrow().stream_id
    }

    pub fn time(&self) -> u64 {
        self.data.borrow().time
    }

    pub fn http_date(&self) -> Rc<String> {
        Rc::clone(&self.data.borrow().http_date)
    }

    pub fn set_middleware_index(&self, index: usize) {
        self.data.borrow_mut().middleware_index = index;
    }

    pub fn middleware_index(&self) -> usize {
        self.data.borrow().middleware_index
    }

    pub fn record_bad_filter(&self, key: &'static str) {
        self.data.borrow_mut().bad_filter_keys.push(key);
    }

    pub fn filter_error(&self) -> bool {
        !self.data.borrow().bad_filter_keys.is_empty()
    }

    pub fn bad_filter_keys(&self) -> Vec<&'static str> {
        self.data.borrow().bad_filter_keys.clone()
    }
}

fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    // bracketed ipv6 literals keep their colons
    if let Some(end) = authority.find(']') {
        let host = authority[..=end].to_string();

        let port = authority[(end + 1)..]
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .unwrap_or(default_port);

        return (host, port);
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), default_port),
        },
        None => (authority.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::body_pair;

    fn make_request(method: &str, target: &str, headers: Vec<(&str, &str)>) -> Request {
        let mut hmap = HeaderMap::new();

        for (name, value) in headers {
            hmap.add(name, value);
        }

        let trace = Trace::Raw(b"GET / HTTP/1.1\r\n\r\n".to_vec());

        let (_emitter, message) = body_pair(1024, 1024);

        let ticker = Ticker::new();
        ticker.set_time(784111777);

        Request::new(
            RequestParts {
                method: method.to_string(),
                target: target.to_string(),
                protocol: Protocol::Http11,
                headers: hmap,
                trace,
                stream_id: 0,
            },
            message,
            Rc::new(Options::default()),
            ConnectionInfo {
                client_addr: "127.0.0.1:12345".parse().unwrap(),
                server_addr: "127.0.0.1:80".parse().unwrap(),
                is_encrypted: false,
                crypto_info: None,
            },
            &ticker,
        )
    }

    #[test]
    fn test_uri_parts_origin_form() {
        let req = make_request("GET", "/echo?x=1&x=2", vec![("Host", "example.com:8080")]);

        assert_eq!(req.get_method(), "GET");
        assert_eq!(req.uri_scheme(), "http");
        assert_eq!(req.uri_host(), "example.com");
        assert_eq!(req.uri_port(), 8080);
        assert_eq!(req.uri_path(), "/echo");
        assert_eq!(req.uri_query(), "x=1&x=2");
        assert_eq!(req.authority(), "example.com:8080");
    }

    #[test]
    fn test_uri_parts_absolute_form() {
        let req = make_request("GET", "http://other.example/a/b?q=1", vec![]);

        assert_eq!(req.uri_host(), "other.example");
        assert_eq!(req.uri_port(), 80);
        assert_eq!(req.uri_path(), "/a/b");
        assert_eq!(req.uri_query(), "q=1");
    }

    #[test]
    fn test_params_repeated_keys() {
        let req = make_request("GET", "/echo?x=1&x=2", vec![("Host", "h")]);

        let params = req.get_all_params().unwrap();
        assert_eq!(
            params,
            vec![
                ("x".to_string(), "1".to_string()),
                ("x".to_string(), "2".to_string()),
            ]
        );

        assert_eq!(req.get_param("x").unwrap(), Some("1".to_string()));
    }

    #[test]
    fn test_header_case_insensitive() {
        let req = make_request("GET", "/", vec![("Host", "h"), ("X-Thing", "v")]);

        assert_eq!(req.get_header("x-thing"), Some("v".to_string()));
        assert_eq!(req.get_header("X-THING"), Some("v".to_string()));

        let all = req.get_all_headers();
        assert!(all.iter().any(|(n, _)| n == "x-thing"));
    }

    #[test]
    fn test_cookies() {
        let req = make_request("GET", "/", vec![("Host", "h"), ("Cookie", "a=1; b=2")]);

        assert_eq!(req.get_cookie("a"), Some("1".to_string()));
        assert_eq!(req.get_cookie("b"), Some("2".to_string()));
        assert_eq!(req.get_cookie("c"), None);
    }

    #[test]
    fn test_local_vars() {
        let req = make_request("GET", "/", vec![("Host", "h")]);

        req.set_local_var("n", Rc::new(42u32));

        let v = req.get_local_var("n").unwrap();
        assert_eq!(*v.downcast_ref::<u32>().unwrap(), 42);
    }

    #[test]
    fn test_time_from_ticker() {
        let req = make_request("GET", "/", vec![("Host", "h")]);

        assert_eq!(req.time(), 784111777);
        assert_eq!(req.http_date().as_str(), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
