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

use crate::body::{body_pair, BodyEmitter};
use crate::buffer::RingBuffer;
use crate::channel::{local_channel, LocalReceiver, LocalSender};
use crate::error::{Error, ProtocolError};
use crate::executor::Executor;
use crate::filters::standard_filters;
use crate::future::{
    io_split, select_2, select_3, write_all, AsyncReadExt, AsyncTcpStream, CancellationToken,
    ReadHalf, Select2, Select3, Timeout, WriteHalf,
};
use crate::headers::HeaderMap;
use crate::http1;
use crate::http2;
use crate::options::{Options, SERVER_TOKEN};
use crate::pipeline::{self, Codec, CodecItem, EntityLength, ResponseHead};
use crate::reactor::Reactor;
use crate::request::{ConnectionInfo, Protocol, Request, RequestParts, Trace};
use crate::response::{make_generic_body, GenericBodyParams, Response, ResponseCtx};
use crate::ticker::Ticker;
use crate::vhost::VhostContainer;
use log::{debug, warn};
use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::mpsc::TryRecvError;
use std::time::Duration;

pub const CLOSED_RD: u8 = 0x1;
pub const CLOSED_WR: u8 = 0x2;

// how many pipelined requests may be in flight per connection
const PIPELINE_DEPTH: usize = 8;

// per-response codec channel depth
const RESPONSE_CHANNEL_BOUND: usize = 4;

const BODY_READ_SIZE: usize = 16_384;

// per-connection record shared by the protocol drivers and the
// websocket gateway: identity, options, clock, liveness
pub struct Client {
    pub info: ConnectionInfo,
    pub options: Rc<Options>,
    pub ticker: Ticker,
    dead: Cell<u8>,
}

impl Client {
    pub fn new(info: ConnectionInfo, options: Rc<Options>, ticker: Ticker) -> Self {
        Self {
            info,
            options,
            ticker,
            dead: Cell::new(0),
        }
    }

    pub fn mark_dead(&self, flags: u8) {
        self.dead.set(self.dead.get() | flags);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.get() & (CLOSED_RD | CLOSED_WR) == (CLOSED_RD | CLOSED_WR)
    }
}

// a responder that produced a 101 stashes one of these in the request
// locals; the driver hands the socket over after flushing the response
pub struct UpgradeIo {
    pub stream: AsyncTcpStream,
    // bytes already read past the request head
    pub leftover: Vec<u8>,
    pub client: Rc<Client>,
}

pub trait UpgradeHandler {
    fn upgrade(&self, io: UpgradeIo, req: Request) -> Pin<Box<dyn Future<Output = ()>>>;
}

pub const UPGRADE_LOCAL_KEY: &str = "aerys.upgrade";

pub struct UpgradeToken(pub Rc<dyn UpgradeHandler>);

fn take_upgrade_handler(req: &Request) -> Option<Rc<dyn UpgradeHandler>> {
    let value: Rc<dyn Any> = req.get_local_var(UPGRADE_LOCAL_KEY)?;

    value
        .downcast::<UpgradeToken>()
        .ok()
        .map(|token| Rc::clone(&token.0))
}

fn idle_deadline(options: &Options) -> std::time::Instant {
    Reactor::current().unwrap().now() + Duration::from_secs(options.connection_timeout)
}

// ---- shared dispatch ----

fn generic_error_items(status: u16, options: &Options, ticker: &Ticker) -> Vec<CodecItem> {
    let date = ticker.http_date();

    let body = make_generic_body(
        status,
        &GenericBodyParams {
            server_token: if options.send_server_token {
                Some(SERVER_TOKEN)
            } else {
                None
            },
            http_date: Some(&date),
            ..Default::default()
        },
    );

    let mut head = ResponseHead::new(status);
    head.headers.set("content-type", "text/html; charset=utf-8");
    head.entity_length = EntityLength::Known(body.len());

    vec![
        CodecItem::Headers(head),
        CodecItem::Chunk(body.into_bytes()),
        CodecItem::End,
    ]
}

// run the middleware/responder pipeline for one request. on failure,
// substitute a generic error response if nothing was flushed yet;
// otherwise drop the channel so the driver aborts the stream
async fn dispatch(
    vhosts: Rc<VhostContainer>,
    req: Request,
    resp: Response,
    sender: LocalSender<CodecItem>,
    ticker: Ticker,
) {
    let host = req.uri_host();

    let vhost = match vhosts.select(&host) {
        Some(vhost) => vhost,
        None => {
            let items = generic_error_items(400, &req.options(), &ticker);

            let _ = pipeline::send_raw(&sender, items).await;

            return;
        }
    };

    let result = pipeline::run(
        vhost.middlewares(),
        vhost.responder(),
        req.clone(),
        resp.clone(),
    )
    .await;

    match result {
        Ok(()) => {}
        Err(Error::Client) => {
            // peer went away; nothing to write
            debug!("client: request aborted by peer");
        }
        Err(e) => {
            if let Error::Filter { key, ref msg } = e {
                req.record_bad_filter(key);
                warn!("client: filter {} failed: {}", key, msg);
            } else if !e.is_client_fault() {
                warn!("client: responder failed: {}", e);
            }

            if !resp.flushed() {
                let items = generic_error_items(e.status(), &req.options(), &ticker);

                let _ = pipeline::send_raw(&sender, items).await;
            }
            // already flushed: dropping the sender aborts the stream
        }
    }
}

// ---- connection entry ----

// decide between http/1.x and http/2 for one accepted connection, then
// run the matching driver until it finishes
pub async fn handle_connection(
    stream: AsyncTcpStream,
    client: Rc<Client>,
    vhosts: Rc<VhostContainer>,
    stop: CancellationToken,
) {
    match client.info.crypto_info.as_deref() {
        // alpn already picked the protocol
        Some("h2") => serve_http2(stream, Vec::new(), client, vhosts, stop).await,
        Some(_) => serve_http1(stream, Vec::new(), client, vhosts, stop).await,
        None => {
            // cleartext: sniff the first bytes for the h2 preface
            match sniff_preface(&stream, &client, &stop).await {
                Some(Sniffed::Http2(buf)) => {
                    serve_http2(stream, buf, client, vhosts, stop).await
                }
                Some(Sniffed::Http1(buf)) => {
                    serve_http1(stream, buf, client, vhosts, stop).await
                }
                None => {}
            }
        }
    }
}

enum Sniffed {
    Http2(Vec<u8>),
    Http1(Vec<u8>),
}

// read until the collected bytes either match or diverge from the
// http/2 preface. None means the connection died first
async fn sniff_preface(
    stream: &AsyncTcpStream,
    client: &Client,
    stop: &CancellationToken,
) -> Option<Sniffed> {
    let (mut read_half, _) = io_split(stream);

    let mut buf = Vec::new();
    let mut chunk = [0; 4096];

    let timeout = Timeout::new(idle_deadline(&client.options));

    loop {
        let size = match select_3(
            stop.cancelled(),
            timeout.elapsed(),
            read_half.read(&mut chunk),
        )
        .await
        {
            Select3::R1(_) | Select3::R2(_) => return None,
            Select3::R3(Ok(0)) => return None,
            Select3::R3(Ok(size)) => size,
            Select3::R3(Err(_)) => return None,
        };

        buf.extend_from_slice(&chunk[..size]);

        let preface = http2::PREFACE;

        if buf.len() >= preface.len() {
            if &buf[..preface.len()] == preface {
                return Some(Sniffed::Http2(buf));
            }

            return Some(Sniffed::Http1(buf));
        }

        if buf[..] != preface[..buf.len()] {
            return Some(Sniffed::Http1(buf));
        }
    }
}

// ---- http/1 driver ----

struct H1ResponseEntry {
    receiver: LocalReceiver<CodecItem>,
    request: Option<Request>,
    protocol: Protocol,
    persistent: bool,
    force_close: Rc<Cell<bool>>,
    interim: Option<&'static [u8]>,
}

enum H1WriterEnd {
    Done,
    Upgrade(Request),
    Error,
}

async fn serve_http1(
    stream: AsyncTcpStream,
    initial: Vec<u8>,
    client: Rc<Client>,
    vhosts: Rc<VhostContainer>,
    stop: CancellationToken,
) {
    let options = Rc::clone(&client.options);

    let mut rbuf = RingBuffer::new(options.max_header_size + BODY_READ_SIZE);

    // sniffed bytes always fit: the buffer is larger than the sniff
    // reads
    rbuf.write(&initial).expect("initial bytes exceed buffer");

    let (resp_s, resp_r) = local_channel::<H1ResponseEntry>(PIPELINE_DEPTH);

    let idle = Timeout::new(idle_deadline(&options));

    let (read_half, write_half) = io_split(&stream);

    let mut reader = Box::pin(h1_read_loop(
        read_half,
        &mut rbuf,
        resp_s,
        Rc::clone(&client),
        Rc::clone(&vhosts),
        stop.clone(),
        &idle,
    ));

    let mut writer = Box::pin(h1_write_loop(write_half, resp_r, Rc::clone(&client), &idle));

    let writer_end = match select_2(&mut reader, &mut writer).await {
        Select2::R1(_) => {
            // the reader completed and dropped its sender; the writer
            // drains whatever responses are still queued
            (&mut writer).await
        }
        Select2::R2(end) => end,
    };

    drop(reader);
    drop(writer);

    if let H1WriterEnd::Upgrade(req) = writer_end {
        if let Some(handler) = take_upgrade_handler(&req) {
            rbuf.align();

            let io = UpgradeIo {
                leftover: rbuf.read_buf().to_vec(),
                stream,
                client: Rc::clone(&client),
            };

            handler.upgrade(io, req).await;

            return;
        }
    }

    client.mark_dead(CLOSED_RD | CLOSED_WR);
    stream.shutdown_write();
}

async fn h1_read_loop(
    mut read_half: ReadHalf<'_>,
    rbuf: &mut RingBuffer,
    resp_s: LocalSender<H1ResponseEntry>,
    client: Rc<Client>,
    vhosts: Rc<VhostContainer>,
    stop: CancellationToken,
    idle: &Timeout,
) -> Result<(), Error> {
    let options = Rc::clone(&client.options);

    let mut protocol = http1::ServerProtocol::new();

    loop {
        // parse a request head out of the buffer, reading more as
        // needed
        let parsed = loop {
            rbuf.align();

            match protocol.recv_request(rbuf.read_buf(), &options) {
                Ok(Some((parsed, consumed))) => {
                    rbuf.read_commit(consumed);

                    break parsed;
                }
                Ok(None) => {}
                Err(e) => {
                    send_h1_error(&resp_s, &client, e).await;

                    return Err(e.into());
                }
            }

            if rbuf.write_avail() == 0 {
                let e = ProtocolError::HeadersTooLarge;

                send_h1_error(&resp_s, &client, e).await;

                return Err(e.into());
            }

            let size = match select_3(
                stop.cancelled(),
                idle.elapsed(),
                read_half.read(rbuf.write_buf()),
            )
            .await
            {
                Select3::R1(_) => return Ok(()),
                Select3::R2(_) => {
                    debug!("client: idle timeout");

                    return Ok(());
                }
                Select3::R3(Ok(0)) => {
                    client.mark_dead(CLOSED_RD);

                    return Ok(());
                }
                Select3::R3(Ok(size)) => size,
                Select3::R3(Err(e)) => {
                    client.mark_dead(CLOSED_RD);

                    return Err(e.into());
                }
            };

            rbuf.write_commit(size);

            idle.set_deadline(idle_deadline(&options));
        };

        let body_size = parsed.body_size;
        let expect_100 = parsed.expect_100;

        let (emitter, message) = body_pair(options.soft_stream_cap, options.max_body_size);

        let req = Request::new(
            RequestParts {
                method: parsed.method,
                target: parsed.target,
                protocol: parsed.protocol,
                headers: parsed.headers,
                trace: Trace::Raw(parsed.trace),
                stream_id: 0,
            },
            message,
            Rc::clone(&options),
            client.info.clone(),
            &client.ticker,
        );

        let wants_upgrade = req
            .get_header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);

        let (codec_s, codec_r) = local_channel::<CodecItem>(RESPONSE_CHANNEL_BOUND);

        let codec = Codec::new(standard_filters(
            &options,
            &req.get_method(),
            req.get_header("accept-encoding").as_deref(),
            req.protocol(),
        ));

        let resp = Response::new(
            codec,
            codec_s.clone(),
            ResponseCtx {
                protocol: req.protocol(),
                request_method: req.get_method(),
                request_authority: req.authority(),
                // http/1 has no push; entries are discarded
                push_enabled: false,
            },
            client.ticker.clone(),
        );

        if Executor::current()
            .unwrap()
            .spawn(dispatch(
                Rc::clone(&vhosts),
                req.clone(),
                resp,
                codec_s,
                client.ticker.clone(),
            ))
            .is_err()
        {
            warn!("client: task limit reached, dropping request");

            return Ok(());
        }

        let force_close = Rc::new(Cell::new(false));

        let entry = H1ResponseEntry {
            receiver: codec_r,
            request: Some(req.clone()),
            protocol: req.protocol(),
            persistent: protocol.is_persistent() && !stop.is_cancelled(),
            force_close: Rc::clone(&force_close),
            interim: if expect_100 {
                Some(http1::CONTINUE_RESPONSE)
            } else {
                None
            },
        };

        if resp_s.send(entry).await.is_err() {
            return Ok(());
        }

        // receive the request body, if any
        if body_size != http1::BodySize::NoBody {
            if let Err(e) = h1_read_body(
                &mut read_half,
                rbuf,
                &mut protocol,
                &emitter,
                &req,
                &client,
                &stop,
                idle,
            )
            .await
            {
                force_close.set(true);
                emitter.fail(&e);

                return Err(e);
            }
        }

        emitter.complete();

        if !protocol.is_persistent() || stop.is_cancelled() || wants_upgrade {
            return Ok(());
        }

        protocol.reset();
    }
}

#[allow(clippy::too_many_arguments)]
async fn h1_read_body(
    read_half: &mut ReadHalf<'_>,
    rbuf: &mut RingBuffer,
    protocol: &mut http1::ServerProtocol,
    emitter: &BodyEmitter,
    req: &Request,
    client: &Client,
    stop: &CancellationToken,
    idle: &Timeout,
) -> Result<(), Error> {
    let options = req.options();

    let mut received: usize = 0;
    let mut dest = vec![0; BODY_READ_SIZE];

    while protocol.state() == http1::ServerState::ReceivingBody {
        rbuf.align();

        let result = {
            let mut cursor = std::io::Cursor::new(rbuf.read_buf_mut());

            let result = protocol.recv_body(&mut cursor, &mut dest);
            let consumed = cursor.position() as usize;

            (result, consumed)
        };

        let (size, trailers) = result.0?;
        rbuf.read_commit(result.1);

        if size > 0 {
            received += size;

            // the limit may have been raised mid-stream through the
            // body handle
            if received > emitter.limit() {
                return Err(Error::ClientSize);
            }

            if emitter.emit(dest[..size].to_vec()).await.is_err() {
                // nobody reads this body anymore, and the stream
                // position cannot be recovered for keep-alive
                protocol.set_persistent(false);

                return Ok(());
            }
        }

        if let Some(trailers) = trailers {
            req.merge_trailers(&trailers);
        }

        if protocol.state() != http1::ServerState::ReceivingBody {
            break;
        }

        if size == 0 && rbuf.read_avail() == 0 {
            let read = match select_3(
                stop.cancelled(),
                idle.elapsed(),
                read_half.read(rbuf.write_buf()),
            )
            .await
            {
                Select3::R1(_) | Select3::R2(_) => return Err(Error::Client),
                Select3::R3(Ok(0)) => {
                    client.mark_dead(CLOSED_RD);

                    return Err(Error::Client);
                }
                Select3::R3(Ok(read)) => read,
                Select3::R3(Err(_)) => {
                    client.mark_dead(CLOSED_RD);

                    return Err(Error::Client);
                }
            };

            rbuf.write_commit(read);

            idle.set_deadline(idle_deadline(&options));
        }
    }

    Ok(())
}

// queue a driver-generated error response, e.g. for a malformed head
async fn send_h1_error(resp_s: &LocalSender<H1ResponseEntry>, client: &Client, e: ProtocolError) {
    let (codec_s, codec_r) = local_channel::<CodecItem>(RESPONSE_CHANNEL_BOUND);

    // the bound covers the three items, so these cannot block
    for item in generic_error_items(e.status(), &client.options, &client.ticker) {
        if codec_s.try_send(item).is_err() {
            break;
        }
    }

    let entry = H1ResponseEntry {
        receiver: codec_r,
        request: None,
        protocol: Protocol::Http11,
        persistent: false,
        force_close: Rc::new(Cell::new(true)),
        interim: None,
    };

    let _ = resp_s.send(entry).await;
}

async fn h1_write_loop(
    mut write_half: WriteHalf<'_>,
    resp_r: LocalReceiver<H1ResponseEntry>,
    client: Rc<Client>,
    idle: &Timeout,
) -> H1WriterEnd {
    let options = Rc::clone(&client.options);

    loop {
        let entry = match select_2(idle.elapsed(), resp_r.recv()).await {
            Select2::R1(_) => return H1WriterEnd::Done,
            Select2::R2(Ok(entry)) => entry,
            // no more responses
            Select2::R2(Err(_)) => return H1WriterEnd::Done,
        };

        if let Some(interim) = entry.interim {
            if write_all(&mut write_half, interim).await.is_err() {
                client.mark_dead(CLOSED_WR);

                return H1WriterEnd::Error;
            }
        }

        let mut persistent = entry.persistent && !entry.force_close.get();
        let mut is_upgrade = false;

        loop {
            let item = match select_2(idle.elapsed(), entry.receiver.recv()).await {
                Select2::R1(_) => {
                    // a responder that makes no progress within the
                    // connection timeout takes the connection with it
                    debug!("client: response idle timeout");

                    client.mark_dead(CLOSED_WR);

                    return H1WriterEnd::Error;
                }
                Select2::R2(Ok(item)) => item,
                Select2::R2(Err(_)) => {
                    // the pipeline died mid-response; the stream state
                    // is unknown, so the connection goes down
                    warn!("client: response stream aborted");

                    client.mark_dead(CLOSED_WR);

                    return H1WriterEnd::Error;
                }
            };

            let bytes = match item {
                CodecItem::Headers(head) => {
                    if entry.force_close.get()
                        || http1::response_forces_close(&head, entry.protocol)
                    {
                        persistent = false;
                    }

                    is_upgrade = head.status == 101;

                    http1::serialize_response_head(
                        &head,
                        entry.protocol,
                        persistent,
                        &client.ticker,
                        options.send_server_token,
                    )
                }
                CodecItem::Chunk(data) => data,
                CodecItem::Flush => continue,
                CodecItem::End => break,
            };

            if write_all(&mut write_half, &bytes).await.is_err() {
                client.mark_dead(CLOSED_WR);

                return H1WriterEnd::Error;
            }

            idle.set_deadline(idle_deadline(&options));
        }

        if is_upgrade {
            if let Some(req) = entry.request {
                return H1WriterEnd::Upgrade(req);
            }
        }

        if !persistent || entry.force_close.get() {
            return H1WriterEnd::Done;
        }
    }
}

// ---- http/2 driver ----

struct H2StreamOut {
    receiver: LocalReceiver<CodecItem>,
    pending: Option<CodecItem>,
    ended: bool,
}

struct H2Conn {
    protocol: http2::ServerProtocol,
    streams: HashMap<u32, H2StreamOut>,
    emitters: HashMap<u32, BodyEmitter>,
    requests: HashMap<u32, Request>,
    // received body bytes per stream, for the (upgradeable) limit
    recv_totals: HashMap<u32, usize>,
    notify_s: LocalSender<u32>,
    feedback_s: LocalSender<(u32, usize)>,
}

async fn serve_http2(
    stream: AsyncTcpStream,
    initial: Vec<u8>,
    client: Rc<Client>,
    vhosts: Rc<VhostContainer>,
    stop: CancellationToken,
) {
    let options = Rc::clone(&client.options);

    let (mut read_half, mut write_half) = io_split(&stream);

    let (notify_s, notify_r) = local_channel::<u32>(256);
    let (feedback_s, feedback_r) = local_channel::<(u32, usize)>(256);

    let mut conn = H2Conn {
        protocol: http2::ServerProtocol::new(),
        streams: HashMap::new(),
        emitters: HashMap::new(),
        requests: HashMap::new(),
        recv_totals: HashMap::new(),
        notify_s,
        feedback_s,
    };

    conn.protocol.start();

    let mut inbuf = initial;
    let mut chunk = vec![0; 16_384];
    let mut stop_seen = false;

    let idle = Timeout::new(idle_deadline(&options));

    loop {
        // consume whatever input is buffered
        match conn.protocol.recv(&inbuf) {
            Ok((consumed, events)) => {
                inbuf.drain(..consumed);

                for event in events {
                    h2_handle_event(&mut conn, event, &client, &vhosts);
                }
            }
            Err(e) => {
                debug!("client: h2 connection error: {}", e.msg);

                let out = conn.protocol.take_output();
                let _ = write_all(&mut write_half, &out).await;

                break;
            }
        }

        // move response items into frames as windows allow
        let stream_ids: Vec<u32> = conn.streams.keys().copied().collect();

        for stream_id in stream_ids {
            h2_pump_stream(&mut conn, stream_id, &client, &vhosts);
        }

        // flush queued frames
        if conn.protocol.have_output() {
            let out = conn.protocol.take_output();

            if write_all(&mut write_half, &out).await.is_err() {
                client.mark_dead(CLOSED_WR);

                break;
            }

            idle.set_deadline(idle_deadline(&options));
        }

        if stop_seen && conn.streams.is_empty() {
            break;
        }

        match select_3(
            select_2(stop.cancelled(), idle.elapsed()),
            read_half.read(&mut chunk),
            select_2(notify_r.recv(), feedback_r.recv()),
        )
        .await
        {
            Select3::R1(Select2::R1(_)) => {
                if !stop_seen {
                    stop_seen = true;

                    conn.protocol.send_goaway(http2::frame::NO_ERROR);

                    continue;
                }

                break;
            }
            Select3::R1(Select2::R2(_)) => {
                debug!("client: idle timeout");

                break;
            }
            Select3::R2(Ok(0)) => {
                client.mark_dead(CLOSED_RD);

                break;
            }
            Select3::R2(Ok(size)) => {
                inbuf.extend_from_slice(&chunk[..size]);

                idle.set_deadline(idle_deadline(&options));
            }
            Select3::R2(Err(_)) => {
                client.mark_dead(CLOSED_RD);

                break;
            }
            // a response stream has items, or body bytes were consumed
            Select3::R3(Select2::R1(_)) => {}
            Select3::R3(Select2::R2(Ok((stream_id, amount)))) => {
                conn.protocol.consume_recv(stream_id, amount);
            }
            Select3::R3(Select2::R2(Err(_))) => {}
        }
    }

    client.mark_dead(CLOSED_RD | CLOSED_WR);
    stream.shutdown_write();
}

fn h2_handle_event(
    conn: &mut H2Conn,
    event: http2::Event,
    client: &Rc<Client>,
    vhosts: &Rc<VhostContainer>,
) {
    match event {
        http2::Event::Request {
            stream_id,
            fields,
            end_stream,
        } => {
            h2_start_request(conn, stream_id, fields, end_stream, client, vhosts);
        }
        http2::Event::Data {
            stream_id,
            data,
            end_stream,
        } => {
            if !conn.emitters.contains_key(&stream_id) {
                return;
            }

            let amount = data.len();

            // flow control already bounds how far ahead the peer can
            // be; the body limit is enforced against the running total
            let total = {
                let t = conn.recv_totals.entry(stream_id).or_insert(0);
                *t += amount;
                *t
            };

            if total > conn.emitters[&stream_id].limit() {
                if let Some(emitter) = conn.emitters.remove(&stream_id) {
                    emitter.fail(&Error::ClientSize);
                }

                conn.protocol
                    .send_rst_stream(stream_id, http2::frame::ENHANCE_YOUR_CALM);

                return;
            }

            // queue without blocking the connection; windows are only
            // replenished after the application drained the bytes.
            // the emit future enqueues its chunk on its first poll,
            // and first polls run in spawn order, so body order holds
            let fut = conn.emitters[&stream_id].emit(data);

            let feedback_s = conn.feedback_s.clone();

            Executor::current()
                .unwrap()
                .spawn(async move {
                    if fut.await.is_ok() {
                        let _ = feedback_s.send((stream_id, amount)).await;
                    }
                })
                .ok();

            if end_stream {
                if let Some(emitter) = conn.emitters.remove(&stream_id) {
                    // completion must order after the queued chunks
                    Executor::current()
                        .unwrap()
                        .spawn(async move {
                            emitter.complete();
                        })
                        .ok();
                }
            }
        }
        http2::Event::Trailers { stream_id, fields } => {
            if let Some(req) = conn.requests.get(&stream_id) {
                let mut trailers = HeaderMap::new();

                for (name, value) in fields {
                    trailers.add(&name, value);
                }

                req.merge_trailers(&trailers);
            }

            if let Some(emitter) = conn.emitters.remove(&stream_id) {
                Executor::current()
                    .unwrap()
                    .spawn(async move {
                        emitter.complete();
                    })
                    .ok();
            }
        }
        http2::Event::Reset { stream_id, .. } => {
            if let Some(emitter) = conn.emitters.remove(&stream_id) {
                emitter.fail(&Error::Client);
            }

            conn.streams.remove(&stream_id);
            conn.requests.remove(&stream_id);
            conn.protocol.reclaim_stream(stream_id);
        }
        http2::Event::WindowOpened => {}
        http2::Event::GoAway { .. } => {}
    }
}

fn h2_start_request(
    conn: &mut H2Conn,
    stream_id: u32,
    fields: Vec<(String, String)>,
    end_stream: bool,
    client: &Rc<Client>,
    vhosts: &Rc<VhostContainer>,
) {
    let options = Rc::clone(&client.options);

    let mut method = String::new();
    let mut path = String::new();
    let mut authority = String::new();
    let mut headers = HeaderMap::new();

    for (name, value) in &fields {
        match name.as_str() {
            ":method" => method = value.clone(),
            ":path" => path = value.clone(),
            ":authority" => authority = value.clone(),
            ":scheme" => {}
            _ => headers.add(name, value.clone()),
        }
    }

    if !authority.is_empty() && !headers.contains("host") {
        headers.set("host", authority.clone());
    }

    let (emitter, message) = body_pair(options.soft_stream_cap, options.max_body_size);

    if end_stream {
        emitter.complete();
    } else {
        conn.emitters.insert(stream_id, emitter);
        conn.recv_totals.insert(stream_id, 0);
    }

    let req = Request::new(
        RequestParts {
            method: method.clone(),
            target: path,
            protocol: Protocol::Http2,
            headers,
            trace: Trace::Pairs(fields),
            stream_id,
        },
        message,
        Rc::clone(&options),
        client.info.clone(),
        &client.ticker,
    );

    // the response flows: pipeline -> inner channel -> forwarder ->
    // stream channel, with a notify token per forwarded item so the
    // connection loop wakes up
    let (inner_s, inner_r) = local_channel::<CodecItem>(RESPONSE_CHANNEL_BOUND);
    let (outer_s, outer_r) = local_channel::<CodecItem>(RESPONSE_CHANNEL_BOUND);

    let codec = Codec::new(standard_filters(
        &options,
        &method,
        req.get_header("accept-encoding").as_deref(),
        Protocol::Http2,
    ));

    let resp = Response::new(
        codec,
        inner_s.clone(),
        ResponseCtx {
            protocol: Protocol::Http2,
            request_method: method,
            request_authority: req.authority(),
            push_enabled: conn.protocol.peer_settings().enable_push,
        },
        client.ticker.clone(),
    );

    conn.streams.insert(
        stream_id,
        H2StreamOut {
            receiver: outer_r,
            pending: None,
            ended: false,
        },
    );
    conn.requests.insert(stream_id, req.clone());

    let notify_s = conn.notify_s.clone();

    let executor = Executor::current().unwrap();

    executor
        .spawn(async move {
            while let Ok(item) = inner_r.recv().await {
                if outer_s.send(item).await.is_err() {
                    return;
                }

                let _ = notify_s.send(stream_id).await;
            }

            // channel end also needs a wake-up so the pump observes
            // the disconnect
            drop(outer_s);

            let _ = notify_s.send(stream_id).await;
        })
        .ok();

    executor
        .spawn(dispatch(
            Rc::clone(vhosts),
            req,
            resp,
            inner_s,
            client.ticker.clone(),
        ))
        .ok();
}

fn h2_pump_stream(
    conn: &mut H2Conn,
    stream_id: u32,
    client: &Rc<Client>,
    vhosts: &Rc<VhostContainer>,
) {
    let mut push_requests = Vec::new();
    let mut remove = false;

    {
        let stream = match conn.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        loop {
            let item = match stream.pending.take() {
                Some(item) => Some(item),
                None => match stream.receiver.try_recv() {
                    Ok(item) => Some(item),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => {
                        if !stream.ended {
                            // aborted mid-response
                            conn.protocol
                                .send_rst_stream(stream_id, http2::frame::INTERNAL_ERROR);
                        }

                        remove = true;

                        None
                    }
                },
            };

            let item = match item {
                Some(item) => item,
                None => break,
            };

            match item {
                CodecItem::Headers(head) => {
                    let mut fields: Vec<(String, String)> =
                        vec![(":status".to_string(), head.status.to_string())];

                    for (name, value) in head.headers.iter() {
                        // connection-level fields don't exist in h2
                        if name == "connection"
                            || name == "transfer-encoding"
                            || name == "keep-alive"
                        {
                            continue;
                        }

                        fields.push((name.to_string(), value.to_string()));
                    }

                    if let EntityLength::Known(n) = head.entity_length {
                        if !head.headers.contains("content-length") {
                            fields.push(("content-length".to_string(), n.to_string()));
                        }
                    }

                    if !head.headers.contains("date") {
                        fields.push((
                            "date".to_string(),
                            client.ticker.http_date().to_string(),
                        ));
                    }

                    if client.options.send_server_token && !head.headers.contains("server") {
                        fields.push(("server".to_string(), SERVER_TOKEN.to_string()));
                    }

                    let end_stream = head.entity_length == EntityLength::NoBody;

                    push_requests.extend(head.pushes.iter().cloned());

                    conn.protocol.send_headers(stream_id, &fields, end_stream);

                    if end_stream {
                        stream.ended = true;
                    }
                }
                CodecItem::Chunk(data) => {
                    if stream.ended {
                        continue;
                    }

                    let sent = conn.protocol.send_data(stream_id, &data, false);

                    if sent < data.len() {
                        // window exhausted; hold the rest until it
                        // reopens
                        stream.pending = Some(CodecItem::Chunk(data[sent..].to_vec()));

                        break;
                    }
                }
                CodecItem::Flush => {}
                CodecItem::End => {
                    if !stream.ended {
                        conn.protocol.send_data(stream_id, &[], true);
                        stream.ended = true;
                    }

                    remove = true;
                }
            }
        }
    }

    if remove {
        conn.streams.remove(&stream_id);
        conn.requests.remove(&stream_id);
        conn.recv_totals.remove(&stream_id);
        conn.protocol.reclaim_stream(stream_id);
    }

    // server push: promise on the originating stream, then run the
    // synthesized request through the regular pipeline
    for (path, extra_headers) in push_requests {
        h2_start_push(conn, stream_id, path, extra_headers, client, vhosts);
    }
}

fn h2_start_push(
    conn: &mut H2Conn,
    parent_stream_id: u32,
    path: String,
    extra_headers: Vec<(String, String)>,
    client: &Rc<Client>,
    vhosts: &Rc<VhostContainer>,
) {
    let (scheme, authority) = match conn.requests.get(&parent_stream_id) {
        Some(parent) => (
            parent.uri_scheme(),
            parent
                .get_header("host")
                .unwrap_or_else(|| parent.uri_host()),
        ),
        None => (
            if client.info.is_encrypted {
                "https".to_string()
            } else {
                "http".to_string()
            },
            client.options.default_host.clone().unwrap_or_default(),
        ),
    };

    let mut fields: Vec<(String, String)> = vec![
        (":method".to_string(), "GET".to_string()),
        (":scheme".to_string(), scheme),
        (":path".to_string(), path),
        (":authority".to_string(), authority),
    ];

    for (name, value) in extra_headers {
        fields.push((name.to_ascii_lowercase(), value));
    }

    let promised_id = match conn.protocol.send_push_promise(parent_stream_id, &fields) {
        Some(id) => id,
        // peer disabled push; entries are silently dropped
        None => return,
    };

    h2_start_request(conn, promised_id, fields, true, client, vhosts);
}
