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

use crate::body::{body_pair, BodyEmitter, Message};
use crate::buffer::RingBuffer;
use crate::channel::{local_channel, LocalReceiver, LocalSender};
use crate::client::{UpgradeHandler, UpgradeIo, UpgradeToken, UPGRADE_LOCAL_KEY};
use crate::error::Error;
use crate::executor::Executor;
use crate::future::{io_split, select_3, write_all, AsyncReadExt, Select3, Timeout};
use crate::pipeline::HandlerFuture;
use crate::reactor::Reactor;
use crate::request::Request;
use crate::response::Response;
use crate::websocket::{
    self, build_close_frame, build_frame, parse_close_payload, RecvStatus, State,
    CLOSE_ABNORMAL, CLOSE_NORMAL, OPCODE_BINARY, OPCODE_CLOSE, OPCODE_PING, OPCODE_PONG,
    OPCODE_TEXT, WS_ACCEPT_MAX,
};
use arrayvec::ArrayString;
use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

const OUT_QUEUE_DEPTH: usize = 32;
const READ_SIZE: usize = 16_384;

#[derive(Debug, Clone)]
pub struct WebsocketOptions {
    // idle seconds before a ping goes out
    pub heartbeat_period: u64,
    // seconds to wait for the pong (or a close echo) before aborting
    pub close_period: u64,
    pub max_frame_size: usize,
    pub max_message_size: usize,
}

impl Default for WebsocketOptions {
    fn default() -> Self {
        Self {
            heartbeat_period: 10,
            close_period: 3,
            max_frame_size: 2 << 20,
            max_message_size: 2 << 20,
        }
    }
}

// one incoming message: the payload resolves incrementally as its
// fragments arrive
pub struct WsMessage {
    pub binary: bool,
    pub body: Message,
}

pub type CallbackFuture = Pin<Box<dyn Future<Output = ()>>>;

// per-application callbacks. invocations for one client are serialized:
// the next on_data does not start before the previous one resolved
pub trait WebsocketHandler {
    // called once, before the first client; the endpoint handle is how
    // the application sends
    fn on_start(&self, _endpoint: Rfc6455Gateway) {}

    // inspect the upgrade request; may set response headers (e.g. a
    // selected sub-protocol) or reject with a status code
    fn on_handshake(&self, _req: &Request, _resp: &Response) -> Result<(), u16> {
        Ok(())
    }

    fn on_open(&self, client_id: u64);

    fn on_data(&self, client_id: u64, message: WsMessage) -> CallbackFuture;

    fn on_close(&self, client_id: u64, code: u16, reason: String);

    fn on_error(&self, _client_id: u64, msg: &str) {
        debug!("websocket: {}", msg);
    }
}

enum OutItem {
    // a prebuilt frame; broadcasts share one buffer across recipients
    Frame(Rc<Vec<u8>>),
    Close(u16, String),
}

struct ClientEntry {
    sender: LocalSender<OutItem>,
}

struct GatewayInner {
    handler: Rc<dyn WebsocketHandler>,
    options: WebsocketOptions,
    clients: RefCell<HashMap<u64, ClientEntry>>,
    next_id: Cell<u64>,
    started: Cell<bool>,
}

// RFC 6455 endpoint: performs the HTTP upgrade as a responder, then
// owns each accepted socket's frame loop and callback dispatch
#[derive(Clone)]
pub struct Rfc6455Gateway {
    inner: Rc<GatewayInner>,
}

impl Rfc6455Gateway {
    pub fn new(handler: Rc<dyn WebsocketHandler>, options: WebsocketOptions) -> Self {
        Self {
            inner: Rc::new(GatewayInner {
                handler,
                options,
                clients: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
                started: Cell::new(false),
            }),
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.borrow().len()
    }

    fn sender_for(&self, client_id: u64) -> Option<LocalSender<OutItem>> {
        self.inner
            .clients
            .borrow()
            .get(&client_id)
            .map(|entry| entry.sender.clone())
    }

    pub async fn send(
        &self,
        client_id: u64,
        payload: Vec<u8>,
        binary: bool,
    ) -> Result<(), Error> {
        let opcode = if binary { OPCODE_BINARY } else { OPCODE_TEXT };

        let frame = Rc::new(build_frame(opcode, &payload, None, true));

        let sender = self.sender_for(client_id).ok_or(Error::Client)?;

        sender
            .send(OutItem::Frame(frame))
            .await
            .map_err(|_| Error::Client)
    }

    // send to every connected client except the listed ones. the frame
    // is built once and shared
    pub async fn broadcast(
        &self,
        payload: Vec<u8>,
        binary: bool,
        except: &[u64],
    ) -> Result<(), Error> {
        let opcode = if binary { OPCODE_BINARY } else { OPCODE_TEXT };

        let frame = Rc::new(build_frame(opcode, &payload, None, true));

        let targets: Vec<LocalSender<OutItem>> = self
            .inner
            .clients
            .borrow()
            .iter()
            .filter(|(id, _)| !except.contains(id))
            .map(|(_, entry)| entry.sender.clone())
            .collect();

        for sender in targets {
            // a peer going away mid-broadcast is not an error for the
            // others
            let _ = sender.send(OutItem::Frame(Rc::clone(&frame))).await;
        }

        Ok(())
    }

    pub async fn close(&self, client_id: u64, code: u16, reason: &str) -> Result<(), Error> {
        let sender = self.sender_for(client_id).ok_or(Error::Client)?;

        sender
            .send(OutItem::Close(code, reason.to_string()))
            .await
            .map_err(|_| Error::Client)
    }

    fn validate_upgrade(req: &Request) -> Result<ArrayString<WS_ACCEPT_MAX>, u16> {
        if req.get_method() != "GET" {
            return Err(400);
        }

        let upgrade_ok = req
            .get_header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);

        if !upgrade_ok {
            return Err(400);
        }

        let connection_ok = {
            let mut found = false;

            for value in req.get_header_array("connection") {
                for token in value.split(',') {
                    if token.trim().eq_ignore_ascii_case("upgrade") {
                        found = true;
                    }
                }
            }

            found
        };

        if !connection_ok {
            return Err(400);
        }

        if req.get_header("sec-websocket-version").as_deref() != Some("13") {
            return Err(426);
        }

        match req.get_header("sec-websocket-key") {
            Some(key) if !key.is_empty() => Ok(websocket::calculate_accept(key.as_bytes())),
            _ => Err(400),
        }
    }

    async fn respond_inner(self, req: Request, resp: Response) -> Result<(), Error> {
        if !self.inner.started.get() {
            self.inner.started.set(true);
            self.inner.handler.on_start(self.clone());
        }

        let accept = match Self::validate_upgrade(&req) {
            Ok(accept) => accept,
            Err(status) => {
                resp.set_status(status)?;

                if status == 426 {
                    resp.set_header("sec-websocket-version", "13")?;
                }

                return resp.end(Some(b"websocket handshake failed".to_vec())).await;
            }
        };

        if let Err(status) = self.inner.handler.on_handshake(&req, &resp) {
            resp.set_status(status)?;

            return resp.end(None).await;
        }

        resp.set_status(101)?;
        resp.set_header("upgrade", "websocket")?;
        resp.set_header("connection", "Upgrade")?;
        resp.set_header("sec-websocket-accept", &accept)?;
        resp.set_header(":aerys-entity-length", "@")?;

        // the driver picks this up after flushing the 101 and hands
        // the socket over
        req.set_local_var(
            UPGRADE_LOCAL_KEY,
            Rc::new(UpgradeToken(Rc::new(self.clone()))),
        );

        resp.end(None).await
    }

    async fn run_client(self, io: UpgradeIo, _req: Request) {
        let options = self.inner.options.clone();

        let client_id = self.inner.next_id.get();
        self.inner.next_id.set(client_id + 1);

        let (out_s, out_r) = local_channel::<OutItem>(OUT_QUEUE_DEPTH);

        self.inner
            .clients
            .borrow_mut()
            .insert(client_id, ClientEntry { sender: out_s });

        self.inner.handler.on_open(client_id);

        let close_info = self.drive_client(client_id, &io, out_r, &options).await;

        self.inner.clients.borrow_mut().remove(&client_id);

        let (code, reason) = close_info;

        self.inner.handler.on_close(client_id, code, reason);

        io.stream.shutdown_write();
    }

    // frame loop for one connection. returns the close code/reason to
    // report
    async fn drive_client(
        &self,
        client_id: u64,
        io: &UpgradeIo,
        out_r: LocalReceiver<OutItem>,
        options: &WebsocketOptions,
    ) -> (u16, String) {
        let handler = Rc::clone(&self.inner.handler);

        let (mut read_half, mut write_half) = io_split(&io.stream);

        let mut rbuf = RingBuffer::new(READ_SIZE * 2);

        if std::io::Write::write(&mut rbuf, &io.leftover).is_err() {
            return (CLOSE_ABNORMAL, String::new());
        }

        let mut protocol = websocket::Protocol::new(
            true,
            options.max_frame_size,
            options.max_message_size,
        );

        let mut dest = vec![0; READ_SIZE];

        let heartbeat = Timeout::new(
            Reactor::current().unwrap().now() + Duration::from_secs(options.heartbeat_period),
        );
        let mut awaiting_pong = false;

        // server-initiated close bookkeeping
        let mut local_close: Option<(u16, String)> = None;

        // current incoming message
        let mut emitter: Option<BodyEmitter> = None;
        let mut prev_callback: Option<LocalReceiver<()>> = None;

        let result = 'main: loop {
            // drain already-buffered frames before waiting
            while rbuf.read_avail() > 0 {
                rbuf.align();

                match protocol.recv(&mut rbuf, &mut dest) {
                    Ok(RecvStatus::NeedMore) => break,
                    Ok(RecvStatus::Content {
                        opcode,
                        size,
                        message_end,
                    }) => {
                        if emitter.is_none() {
                            let (e, body) =
                                body_pair(options.max_frame_size, options.max_message_size);

                            emitter = Some(e);

                            // serialize callback invocations per
                            // connection
                            if let Some(done) = prev_callback.take() {
                                let _ = done.recv().await;
                            }

                            let fut = handler.on_data(
                                client_id,
                                WsMessage {
                                    binary: opcode == OPCODE_BINARY,
                                    body,
                                },
                            );

                            let (done_s, done_r) = local_channel::<()>(1);

                            prev_callback = Some(done_r);

                            Executor::current()
                                .unwrap()
                                .spawn(async move {
                                    fut.await;

                                    drop(done_s);
                                })
                                .ok();
                        }

                        if size > 0 {
                            let e = emitter.as_ref().unwrap();

                            if e.emit(dest[..size].to_vec()).await.is_err() {
                                // the callback dropped the message;
                                // keep consuming the wire
                            }
                        }

                        if message_end {
                            if let Some(e) = emitter.take() {
                                e.complete();
                            }
                        }
                    }
                    Ok(RecvStatus::Control { opcode, payload }) => {
                        match opcode {
                            OPCODE_PING => {
                                let pong = build_frame(OPCODE_PONG, &payload, None, true);

                                if write_all(&mut write_half, &pong).await.is_err() {
                                    break 'main (CLOSE_ABNORMAL, String::new());
                                }
                            }
                            OPCODE_PONG => {
                                awaiting_pong = false;
                            }
                            OPCODE_CLOSE => {
                                let (code, reason) = match parse_close_payload(&payload) {
                                    Ok((code, reason)) => (code, reason),
                                    Err(reply_code) => {
                                        let frame =
                                            build_close_frame(reply_code, "", None);

                                        let _ = write_all(&mut write_half, &frame).await;

                                        break 'main (reply_code, String::new());
                                    }
                                };

                                if let Some((local_code, local_reason)) = local_close.take() {
                                    // peer echoed our close
                                    break 'main (local_code, local_reason);
                                }

                                // echo the code back
                                let echo_code = if code == websocket::CLOSE_NO_STATUS {
                                    CLOSE_NORMAL
                                } else {
                                    code
                                };

                                let frame = build_close_frame(echo_code, "", None);
                                let _ = write_all(&mut write_half, &frame).await;

                                protocol.sent_close();

                                break 'main (echo_code, reason);
                            }
                            _ => {}
                        }
                    }
                    Err(close_code) => {
                        let frame = build_close_frame(close_code, "", None);
                        let _ = write_all(&mut write_half, &frame).await;

                        handler.on_error(
                            client_id,
                            &format!("protocol violation, closing with {}", close_code),
                        );

                        break 'main (close_code, String::new());
                    }
                }
            }

            if protocol.state() == State::Finished {
                break 'main local_close.take().unwrap_or((CLOSE_NORMAL, String::new()));
            }

            if rbuf.write_avail() == 0 {
                rbuf.align();
            }

            match select_3(
                heartbeat.elapsed(),
                out_r.recv(),
                read_half.read(rbuf.write_buf()),
            )
            .await
            {
                Select3::R1(_) => {
                    if awaiting_pong || local_close.is_some() {
                        // no pong (or no close echo) in time
                        break 'main local_close
                            .take()
                            .unwrap_or((CLOSE_ABNORMAL, String::new()));
                    }

                    let ping = build_frame(OPCODE_PING, b"", None, true);

                    if write_all(&mut write_half, &ping).await.is_err() {
                        break 'main (CLOSE_ABNORMAL, String::new());
                    }

                    awaiting_pong = true;

                    heartbeat.set_deadline(
                        Reactor::current().unwrap().now()
                            + Duration::from_secs(options.close_period),
                    );
                }
                Select3::R2(Ok(item)) => match item {
                    OutItem::Frame(frame) => {
                        if write_all(&mut write_half, &frame).await.is_err() {
                            break 'main (CLOSE_ABNORMAL, String::new());
                        }
                    }
                    OutItem::Close(code, reason) => {
                        let frame = build_close_frame(code, &reason, None);

                        if write_all(&mut write_half, &frame).await.is_err() {
                            break 'main (CLOSE_ABNORMAL, String::new());
                        }

                        protocol.sent_close();
                        local_close = Some((code, reason));

                        // wait only so long for the echo
                        heartbeat.set_deadline(
                            Reactor::current().unwrap().now()
                                + Duration::from_secs(options.close_period),
                        );
                    }
                },
                Select3::R2(Err(_)) => {
                    // all senders gone; nothing else will be written
                }
                Select3::R3(Ok(0)) => {
                    break 'main (CLOSE_ABNORMAL, String::new());
                }
                Select3::R3(Ok(size)) => {
                    rbuf.write_commit(size);

                    if !awaiting_pong && local_close.is_none() {
                        heartbeat.set_deadline(
                            Reactor::current().unwrap().now()
                                + Duration::from_secs(options.heartbeat_period),
                        );
                    }
                }
                Select3::R3(Err(e)) => {
                    warn!("websocket: read failed: {}", e);

                    break 'main (CLOSE_ABNORMAL, String::new());
                }
            }
        };

        // release an unfinished message first so its callback cannot
        // hang on it, then let the callback settle so on_close stays
        // ordered behind it
        if let Some(e) = emitter.take() {
            e.fail(&Error::Client);
        }

        if let Some(done) = prev_callback.take() {
            let _ = done.recv().await;
        }

        result
    }
}

impl crate::pipeline::Responder for Rfc6455Gateway {
    fn respond(&self, req: Request, resp: Response) -> HandlerFuture {
        let gateway = self.clone();

        Box::pin(gateway.respond_inner(req, resp))
    }
}

impl UpgradeHandler for Rfc6455Gateway {
    fn upgrade(&self, io: UpgradeIo, req: Request) -> Pin<Box<dyn Future<Output = ()>>> {
        let gateway = self.clone();

        Box::pin(gateway.run_client(io, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::body_pair;
    use crate::channel::local_channel as test_channel;
    use crate::headers::HeaderMap;
    use crate::options::Options;
    use crate::pipeline::{Codec, CodecItem};
    use crate::request::{ConnectionInfo, Protocol, RequestParts, Trace};
    use crate::response::ResponseCtx;
    use crate::ticker::Ticker;

    struct EchoHandler;

    impl WebsocketHandler for EchoHandler {
        fn on_open(&self, _client_id: u64) {}

        fn on_data(&self, _client_id: u64, _message: WsMessage) -> CallbackFuture {
            Box::pin(async {})
        }

        fn on_close(&self, _client_id: u64, _code: u16, _reason: String) {}
    }

    fn make_upgrade_request(headers: Vec<(&str, &str)>) -> Request {
        let mut hmap = HeaderMap::new();

        for (name, value) in headers {
            hmap.add(name, value);
        }

        let (_emitter, message) = body_pair(1024, 1024);

        Request::new(
            RequestParts {
                method: "GET".to_string(),
                target: "/chat".to_string(),
                protocol: Protocol::Http11,
                headers: hmap,
                trace: Trace::Raw(Vec::new()),
                stream_id: 0,
            },
            message,
            Rc::new(Options::default()),
            ConnectionInfo {
                client_addr: "127.0.0.1:5000".parse().unwrap(),
                server_addr: "127.0.0.1:80".parse().unwrap(),
                is_encrypted: false,
                crypto_info: None,
            },
            &Ticker::new(),
        )
    }

    #[test]
    fn test_validate_upgrade() {
        let req = make_upgrade_request(vec![
            ("Host", "h"),
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);

        assert_eq!(
            Rfc6455Gateway::validate_upgrade(&req).unwrap().as_str(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );

        // missing upgrade header
        let req = make_upgrade_request(vec![
            ("Host", "h"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);

        assert_eq!(Rfc6455Gateway::validate_upgrade(&req), Err(400));

        // wrong version
        let req = make_upgrade_request(vec![
            ("Host", "h"),
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Version", "8"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);

        assert_eq!(Rfc6455Gateway::validate_upgrade(&req), Err(426));
    }

    #[test]
    fn test_handshake_response() {
        let executor = crate::executor::Executor::new(4);

        let gateway = Rfc6455Gateway::new(Rc::new(EchoHandler), WebsocketOptions::default());

        let req = make_upgrade_request(vec![
            ("Host", "h"),
            ("Upgrade", "websocket"),
            ("Connection", "keep-alive, Upgrade"),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);

        let (sender, receiver) = test_channel::<CodecItem>(16);

        let resp = Response::new(
            Codec::new(Vec::new()),
            sender,
            ResponseCtx {
                protocol: Protocol::Http11,
                request_method: "GET".to_string(),
                request_authority: "h:80".to_string(),
                push_enabled: false,
            },
            Ticker::new(),
        );

        {
            let req = req.clone();
            let gateway = gateway.clone();

            executor
                .spawn(async move {
                    gateway.respond_inner(req, resp).await.unwrap();
                })
                .unwrap();
        }

        executor.run(|| Ok(())).unwrap();

        match receiver.try_recv().unwrap() {
            CodecItem::Headers(head) => {
                assert_eq!(head.status, 101);
                assert_eq!(head.headers.get("upgrade"), Some("websocket"));
                assert_eq!(
                    head.headers.get("sec-websocket-accept"),
                    Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
                );
            }
            other => panic!("unexpected item: {:?}", other),
        }

        // the upgrade token was stashed for the driver
        assert!(req.get_local_var(UPGRADE_LOCAL_KEY).is_some());
    }
}
