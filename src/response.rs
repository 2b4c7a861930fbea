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

use crate::channel::LocalSender;
use crate::cookie::{format_set_cookie, CookieAttribute};
use crate::error::Error;
use crate::headers::HeaderMap;
use crate::pipeline::{Codec, CodecItem, EntityLength, ResponseHead};
use crate::request::Protocol;
use crate::ticker::Ticker;
use std::cell::RefCell;
use std::fmt::Write;
use std::rc::Rc;

pub fn status_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

pub struct GenericBodyParams<'a> {
    pub reason: Option<&'a str>,
    pub sub_heading: Option<&'a str>,
    pub msg: Option<&'a str>,
    pub server_token: Option<&'a str>,
    pub http_date: Option<&'a str>,
}

impl Default for GenericBodyParams<'_> {
    fn default() -> Self {
        Self {
            reason: None,
            sub_heading: None,
            msg: None,
            server_token: None,
            http_date: None,
        }
    }
}

// plain html body for client-facing error responses
pub fn make_generic_body(status: u16, params: &GenericBodyParams) -> String {
    let reason = params.reason.unwrap_or_else(|| status_phrase(status));

    let mut out = String::new();

    out.push_str("<html>\n<head>\n");
    write!(&mut out, "<title>{} {}</title>\n", status, reason).unwrap();
    out.push_str("</head>\n<body>\n");
    write!(&mut out, "<h1>{} {}</h1>\n", status, reason).unwrap();

    if let Some(sub_heading) = params.sub_heading {
        write!(&mut out, "<h3>{}</h3>\n", sub_heading).unwrap();
    }

    if let Some(msg) = params.msg {
        write!(&mut out, "<p>{}</p>\n", msg).unwrap();
    }

    if params.server_token.is_some() || params.http_date.is_some() {
        out.push_str("<hr/>\n<em>");

        if let Some(token) = params.server_token {
            out.push_str(token);
        }

        if let Some(date) = params.http_date {
            if params.server_token.is_some() {
                out.push_str(" @ ");
            }

            out.push_str(date);
        }

        out.push_str("</em>\n");
    }

    out.push_str("</body>\n</html>\n");

    out
}

const STARTED: u8 = 0x01;
const STREAMING: u8 = 0x02;
const ENDED: u8 = 0x04;

// request-side facts the response stage needs: protocol for framing
// decisions, authority for push validation
#[derive(Debug, Clone)]
pub struct ResponseCtx {
    pub protocol: Protocol,
    pub request_method: String,
    pub request_authority: String,
    pub push_enabled: bool,
}

struct ResponseData {
    status: u16,
    reason: Option<String>,
    headers: HeaderMap,
    cookies: Vec<(String, String, Vec<CookieAttribute>)>,
    entity_length: Option<EntityLength>,
    pushes: Vec<(String, Vec<(String, String)>)>,
    state: u8,
    // whether any item actually reached the driver; a filter may hold
    // everything back even after the response started
    flushed: bool,
    codec: Codec,
    sender: LocalSender<CodecItem>,
    ctx: ResponseCtx,
    ticker: Ticker,
}

// user-visible response builder plus streaming writer. mutations are
// allowed until the headers flush on the first write/end; writing
// after end is a programmer error
#[derive(Clone)]
pub struct Response {
    data: Rc<RefCell<ResponseData>>,
}

impl Response {
    pub fn new(
        codec: Codec,
        sender: LocalSender<CodecItem>,
        ctx: ResponseCtx,
        ticker: Ticker,
    ) -> Self {
        Self {
            data: Rc::new(RefCell::new(ResponseData {
                status: 200,
                reason: None,
                headers: HeaderMap::new(),
                cookies: Vec::new(),
                entity_length: None,
                pushes: Vec::new(),
                state: 0,
                flushed: false,
                codec,
                sender,
                ctx,
                ticker,
            })),
        }
    }

    pub fn started(&self) -> bool {
        self.data.borrow().state & STARTED != 0
    }

    pub fn streaming(&self) -> bool {
        self.data.borrow().state & STREAMING != 0
    }

    pub fn ended(&self) -> bool {
        self.data.borrow().state & ENDED != 0
    }

    pub fn flushed(&self) -> bool {
        self.data.borrow().flushed
    }

    pub fn status(&self) -> u16 {
        self.data.borrow().status
    }

    pub fn set_status(&self, status: u16) -> Result<(), Error> {
        if !(100..=599).contains(&status) {
            return Err(Error::Internal(format!("invalid status code {}", status)));
        }

        let data = &mut *self.data.borrow_mut();

        if data.state & STARTED != 0 {
            return Err(Error::Internal("status set after headers sent".into()));
        }

        data.status = status;

        Ok(())
    }

    pub fn set_reason(&self, reason: &str) -> Result<(), Error> {
        let data = &mut *self.data.borrow_mut();

        if data.state & STARTED != 0 {
            return Err(Error::Internal("reason set after headers sent".into()));
        }

        data.reason = Some(reason.to_string());

        Ok(())
    }

    pub fn add_header(&self, name: &str, value: &str) -> Result<(), Error> {
        if name.starts_with(':') {
            return self.set_pseudo_header(name, value);
        }

        let data = &mut *self.data.borrow_mut();

        if data.state & STARTED != 0 {
            return Err(Error::Internal("header added after headers sent".into()));
        }

        data.headers.add(name, value);

        Ok(())
    }

    pub fn set_header(&self, name: &str, value: &str) -> Result<(), Error> {
        if name.starts_with(':') {
            return self.set_pseudo_header(name, value);
        }

        let data = &mut *self.data.borrow_mut();

        if data.state & STARTED != 0 {
            return Err(Error::Internal("header set after headers sent".into()));
        }

        data.headers.set(name, value);

        Ok(())
    }

    // pseudo-headers are control data, never emitted on the wire
    fn set_pseudo_header(&self, name: &str, value: &str) -> Result<(), Error> {
        match name {
            ":status" => {
                let status = value
                    .parse()
                    .map_err(|_| Error::Internal(format!("bad :status value {}", value)))?;

                self.set_status(status)
            }
            ":reason" => self.set_reason(value),
            ":aerys-entity-length" => {
                let entity = match value {
                    "@" => EntityLength::NoBody,
                    "*" => EntityLength::Unknown,
                    n => EntityLength::Known(
                        n.parse()
                            .map_err(|_| Error::Internal(format!("bad entity length {}", n)))?,
                    ),
                };

                let data = &mut *self.data.borrow_mut();

                if data.state & STARTED != 0 {
                    return Err(Error::Internal("entity length set after headers sent".into()));
                }

                data.entity_length = Some(entity);

                Ok(())
            }
            ":aerys-push" => self.push(value, &[]),
            _ => Err(Error::Internal(format!("unknown pseudo-header {}", name))),
        }
    }

    pub fn get_header(&self, name: &str) -> Option<String> {
        self.data.borrow().headers.get(name).map(str::to_string)
    }

    pub fn set_cookie(
        &self,
        name: &str,
        value: &str,
        attributes: &[CookieAttribute],
    ) -> Result<(), Error> {
        let data = &mut *self.data.borrow_mut();

        if data.state & STARTED != 0 {
            return Err(Error::Internal("cookie set after headers sent".into()));
        }

        data.cookies
            .push((name.to_string(), value.to_string(), attributes.to_vec()));

        Ok(())
    }

    // register a server push. restricted to the authority of the
    // originating request; extra headers must not smuggle a host or
    // pseudo fields
    pub fn push(&self, url: &str, extra_headers: &[(String, String)]) -> Result<(), Error> {
        let data = &mut *self.data.borrow_mut();

        if data.state & STARTED != 0 {
            return Err(Error::Internal("push after headers sent".into()));
        }

        let path = if url.starts_with('/') {
            url.to_string()
        } else {
            let parsed = url::Url::parse(url)
                .map_err(|_| Error::Internal(format!("bad push url {}", url)))?;

            let default_port = match parsed.scheme() {
                "https" => 443,
                _ => 80,
            };

            let authority = format!(
                "{}:{}",
                parsed.host_str().unwrap_or(""),
                parsed.port().unwrap_or(default_port)
            );

            if authority != data.ctx.request_authority {
                return Err(Error::Internal(format!(
                    "push target {} is not same-origin",
                    url
                )));
            }

            match parsed.query() {
                Some(q) => format!("{}?{}", parsed.path(), q),
                None => parsed.path().to_string(),
            }
        };

        for (name, _) in extra_headers {
            if name.starts_with(':') || name.eq_ignore_ascii_case("host") {
                return Err(Error::Internal(format!(
                    "push header {} not allowed",
                    name
                )));
            }
        }

        if data.ctx.push_enabled {
            data.pushes.push((path, extra_headers.to_vec()));
        }

        Ok(())
    }

    // run an item through the codec under the borrow, then forward the
    // transformed output without holding it
    async fn send_item(&self, item: CodecItem) -> Result<(), Error> {
        let (sender, items) = {
            let data = &mut *self.data.borrow_mut();

            let items = data.codec.apply(item)?;

            if !items.is_empty() {
                data.flushed = true;
            }

            (data.sender.clone(), items)
        };

        for item in items {
            if sender.send(item).await.is_err() {
                return Err(Error::Client);
            }
        }

        Ok(())
    }

    fn build_head(&self, entity_length: EntityLength) -> ResponseHead {
        let data = &mut *self.data.borrow_mut();

        let mut headers = data.headers.clone();

        let now = data.ticker.unix_time();

        for (name, value, attrs) in &data.cookies {
            headers.add("set-cookie", format_set_cookie(name, value, attrs, now));
        }

        data.state |= STARTED;

        ResponseHead {
            status: data.status,
            reason: data.reason.clone(),
            headers,
            entity_length,
            pushes: std::mem::take(&mut data.pushes),
        }
    }

    async fn start(&self, entity_length: EntityLength) -> Result<(), Error> {
        let head = self.build_head(entity_length);

        self.send_item(CodecItem::Headers(head)).await
    }

    // stream a chunk of body. flushes headers with unknown entity
    // length on first use. the returned future completes when the
    // chunk was accepted downstream, which is the backpressure point
    pub async fn write(&self, body: Vec<u8>) -> Result<(), Error> {
        if self.ended() {
            return Err(Error::Internal("write after end".into()));
        }

        if !self.started() {
            let entity = self
                .data
                .borrow()
                .entity_length
                .unwrap_or(EntityLength::Unknown);

            self.start(entity).await?;
        }

        self.data.borrow_mut().state |= STREAMING;

        self.send_item(CodecItem::Chunk(body)).await
    }

    // ask the codec and driver to flush buffered output now
    pub async fn flush(&self) -> Result<(), Error> {
        if !self.started() || self.ended() {
            return Err(Error::Internal("flush outside streaming".into()));
        }

        self.send_item(CodecItem::Flush).await
    }

    // finish the response. a repeat end() with no body is a no-op;
    // a repeat end() with a body is a programmer error
    pub async fn end(&self, body: Option<Vec<u8>>) -> Result<(), Error> {
        if self.ended() {
            return match body {
                None => Ok(()),
                Some(b) if b.is_empty() => Ok(()),
                Some(_) => Err(Error::Internal("end with body after end".into())),
            };
        }

        if !self.started() {
            let entity = match self.data.borrow().entity_length {
                Some(entity) => entity,
                None => EntityLength::Known(body.as_ref().map(|b| b.len()).unwrap_or(0)),
            };

            self.start(entity).await?;
        }

        if let Some(body) = body {
            if !body.is_empty() {
                self.send_item(CodecItem::Chunk(body)).await?;
            }
        }

        self.data.borrow_mut().state |= ENDED;

        self.send_item(CodecItem::End).await
    }
}
