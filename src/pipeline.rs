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
use crate::error::Error;
use crate::headers::HeaderMap;
use crate::request::Request;
use crate::response::Response;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

// how much entity the response carries. drivers map this onto
// Content-Length, chunked framing, or connection close
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityLength {
    // no body will follow the headers
    NoBody,
    // streaming, length not known up front
    Unknown,
    Known(usize),
}

// response header block plus the control data that never reaches the
// wire as header fields
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub entity_length: EntityLength,
    // server push targets: (path, extra request headers)
    pub pushes: Vec<(String, Vec<(String, String)>)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
            entity_length: EntityLength::Unknown,
            pushes: Vec::new(),
        }
    }
}

// one element of a response stream: exactly one Headers, any number of
// Chunk/Flush, then exactly one End
#[derive(Debug, Clone)]
pub enum CodecItem {
    Headers(ResponseHead),
    Chunk(Vec<u8>),
    Flush,
    End,
}

// a stateful transducer over the response stream. receives one item,
// appends zero or more transformed items. a filter may buffer chunks
// and release them later, but End must eventually produce End
pub trait Filter {
    fn key(&self) -> &'static str;

    fn apply(&mut self, item: CodecItem, out: &mut Vec<CodecItem>) -> Result<(), Error>;
}

// composed filter chain in front of a protocol driver. items put in via
// apply() come out protocol-ready; the caller forwards them into the
// driver channel
pub struct Codec {
    filters: Vec<Box<dyn Filter>>,
    headers_sent: bool,
    ended: bool,
}

impl Codec {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self {
            filters,
            headers_sent: false,
            ended: false,
        }
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn apply(&mut self, item: CodecItem) -> Result<Vec<CodecItem>, Error> {
        match &item {
            CodecItem::Headers(_) => {
                assert!(!self.headers_sent, "response headers already sent");
                self.headers_sent = true;
            }
            CodecItem::End => {
                assert!(!self.ended, "response already ended");
                self.ended = true;
            }
            _ => assert!(self.headers_sent, "body before headers"),
        }

        let mut items = vec![item];

        for f in self.filters.iter_mut() {
            let mut next = Vec::new();

            for item in items.drain(..) {
                if let Err(e) = f.apply(item, &mut next) {
                    let key = f.key();

                    return Err(match e {
                        e @ Error::Client | e @ Error::ClientSize => e,
                        e => Error::Filter {
                            key,
                            msg: e.to_string(),
                        },
                    });
                }
            }

            items = next;
        }

        Ok(items)
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), Error>>>>;

// terminal stage of a request pipeline
pub trait Responder {
    fn respond(&self, req: Request, resp: Response) -> HandlerFuture;
}

impl<F> Responder for F
where
    F: Fn(Request, Response) -> HandlerFuture,
{
    fn respond(&self, req: Request, resp: Response) -> HandlerFuture {
        self(req, resp)
    }
}

// wraps the next pipeline stage. calling submit() runs the rest of the
// chain; the middleware may inspect the response handle before or
// after
pub trait Middleware {
    fn apply(&self, req: Request, resp: Response, next: Next) -> HandlerFuture;
}

impl<F> Middleware for F
where
    F: Fn(Request, Response, Next) -> HandlerFuture,
{
    fn apply(&self, req: Request, resp: Response, next: Next) -> HandlerFuture {
        self(req, resp, next)
    }
}

#[derive(Clone)]
pub struct Next {
    middlewares: Rc<Vec<Rc<dyn Middleware>>>,
    index: usize,
    responder: Rc<dyn Responder>,
}

impl Next {
    pub fn submit(self, req: Request, resp: Response) -> HandlerFuture {
        req.set_middleware_index(self.index);

        if self.index < self.middlewares.len() {
            let mw = Rc::clone(&self.middlewares[self.index]);

            let next = Next {
                middlewares: self.middlewares,
                index: self.index + 1,
                responder: self.responder,
            };

            mw.apply(req, resp, next)
        } else {
            self.responder.respond(req, resp)
        }
    }
}

// run middlewares[0] wrapping ... wrapping the responder, then make
// sure the response stream terminated. errors surface to the caller,
// which owns the substitution policy (generic 500 vs stream abort)
pub async fn run(
    middlewares: Rc<Vec<Rc<dyn Middleware>>>,
    responder: Rc<dyn Responder>,
    req: Request,
    resp: Response,
) -> Result<(), Error> {
    let next = Next {
        middlewares,
        index: 0,
        responder,
    };

    next.submit(req, resp.clone()).await?;

    if !resp.ended() {
        resp.end(None).await?;
    }

    Ok(())
}

// forward a raw item stream to the driver, bypassing filters. used for
// substituted error responses
pub async fn send_raw(
    sender: &LocalSender<CodecItem>,
    items: Vec<CodecItem>,
) -> Result<(), Error> {
    for item in items {
        if sender.send(item).await.is_err() {
            return Err(Error::Client);
        }
    }

    Ok(())
}
