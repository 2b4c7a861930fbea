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

use crate::client::{handle_connection, Client};
use crate::error::Error;
use crate::executor::Executor;
use crate::future::{
    io_split, select_2, sleep, write_all, AsyncTcpListener, AsyncTcpStream, CancellationSender,
    CancellationToken, Select2,
};
use crate::options::Options;
use crate::request::ConnectionInfo;
use crate::ticker::Ticker;
use crate::vhost::VhostContainer;
use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

const REJECT_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

struct ConnectionCounts {
    total: Cell<usize>,
    per_ip: RefCell<HashMap<IpAddr, usize>>,
}

impl ConnectionCounts {
    fn admit(&self, ip: IpAddr, max_total: usize, max_per_ip: usize) -> bool {
        if self.total.get() >= max_total {
            return false;
        }

        let per_ip = &mut *self.per_ip.borrow_mut();

        let count = per_ip.entry(ip).or_insert(0);

        if *count >= max_per_ip {
            return false;
        }

        *count += 1;
        self.total.set(self.total.get() + 1);

        true
    }

    fn release(&self, ip: IpAddr) {
        self.total.set(self.total.get() - 1);

        let per_ip = &mut *self.per_ip.borrow_mut();

        if let Some(count) = per_ip.get_mut(&ip) {
            *count -= 1;

            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
    }
}

struct ServerInner {
    options: Rc<Options>,
    vhosts: Rc<VhostContainer>,
    state: Cell<ServerState>,
    ticker: Ticker,
    counts: ConnectionCounts,
    kills: RefCell<Slab<CancellationSender>>,
}

// accepts connections, enforces admission limits, demultiplexes hosts,
// and supervises the per-connection tasks through shutdown
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    pub fn new(options: Options, vhosts: VhostContainer) -> Self {
        Self {
            inner: Rc::new(ServerInner {
                options: Rc::new(options),
                vhosts: Rc::new(vhosts),
                state: Cell::new(ServerState::Stopped),
                ticker: Ticker::new(),
                counts: ConnectionCounts {
                    total: Cell::new(0),
                    per_ip: RefCell::new(HashMap::new()),
                },
                kills: RefCell::new(Slab::new()),
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.state.get()
    }

    pub fn options(&self) -> Rc<Options> {
        Rc::clone(&self.inner.options)
    }

    pub fn ticker(&self) -> Ticker {
        self.inner.ticker.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.counts.total.get()
    }

    // bind a listening socket with the configured backlog
    pub fn bind(&self, addr: SocketAddr) -> Result<TcpListener, io::Error> {
        let domain = match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };

        let socket = socket2::Socket::new(
            domain,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.inner.options.socket_backlog_size as i32)?;
        socket.set_nonblocking(true)?;

        let listener: std::net::TcpListener = socket.into();

        Ok(TcpListener::from_std(listener))
    }

    // hand over one connection whose transport was established
    // elsewhere (e.g. a tls acceptor), with the alpn-selected protocol
    pub fn spawn_connection(
        &self,
        stream: TcpStream,
        is_encrypted: bool,
        alpn: Option<String>,
        stop: CancellationToken,
    ) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        let ip = peer_addr.ip();

        let options = &self.inner.options;

        if !self
            .inner
            .counts
            .admit(ip, options.max_connections, options.connections_per_ip)
        {
            debug!("server: rejecting connection from {}", peer_addr);

            reject_connection(stream);

            return;
        }

        let stream = match AsyncTcpStream::new(stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("server: failed to register stream: {}", e);

                self.inner.counts.release(ip);

                return;
            }
        };

        let info = ConnectionInfo {
            client_addr: peer_addr,
            server_addr: local_addr,
            is_encrypted,
            crypto_info: alpn,
        };

        let client = Rc::new(Client::new(
            info,
            Rc::clone(options),
            self.inner.ticker.clone(),
        ));

        let (kill_s, kill) = CancellationToken::new();
        let kill_key = self.inner.kills.borrow_mut().insert(kill_s);

        let inner = Rc::clone(&self.inner);
        let vhosts = Rc::clone(&self.inner.vhosts);

        let task = async move {
            debug!(
                "server: connection from {} ({}/{})",
                peer_addr,
                inner.counts.total.get(),
                inner.options.max_connections
            );

            select_2(
                kill.cancelled(),
                handle_connection(stream, client, vhosts, stop),
            )
            .await;

            inner.kills.borrow_mut().try_remove(kill_key);
            inner.counts.release(ip);

            debug!("server: connection from {} finished", peer_addr);
        };

        if Executor::current()
            .expect("no executor in thread")
            .spawn(task)
            .is_err()
        {
            error!("server: task limit reached, dropping connection");

            self.inner.kills.borrow_mut().try_remove(kill_key);
            self.inner.counts.release(ip);
        }
    }

    // worker entry: accept until `stop` fires, then drain in-flight
    // responses for up to shutdown_timeout and force-close the rest
    pub async fn run(self, listener: TcpListener, stop: CancellationToken) -> Result<(), Error> {
        assert_eq!(self.state(), ServerState::Stopped, "server already running");

        self.inner.state.set(ServerState::Starting);

        let listener = AsyncTcpListener::new(listener)?;

        let addr = listener.local_addr()?;

        info!("listening on {}", addr);

        {
            let ticker = self.inner.ticker.clone();
            let stop = stop.clone();

            Executor::current()
                .expect("no executor in thread")
                .spawn(ticker.run(stop))
                .map_err(|_| Error::Internal("failed to spawn ticker".into()))?;
        }

        self.inner.state.set(ServerState::Started);

        loop {
            match select_2(stop.cancelled(), listener.accept()).await {
                Select2::R1(_) => break,
                Select2::R2(Ok((stream, _peer_addr))) => {
                    self.spawn_connection(stream, false, None, stop.clone());
                }
                Select2::R2(Err(e)) => {
                    // the acceptor failing is not survivable
                    error!("server: accept failed: {}", e);

                    self.inner.state.set(ServerState::Stopping);

                    break;
                }
            }
        }

        self.inner.state.set(ServerState::Stopping);

        drop(listener);

        // connections have seen the stop token and are finishing their
        // in-flight responses
        let deadline = crate::reactor::Reactor::current()
            .expect("no reactor in thread")
            .now()
            + Duration::from_secs(self.inner.options.shutdown_timeout);

        while self.inner.counts.total.get() > 0 {
            if crate::reactor::Reactor::current().unwrap().now() >= deadline {
                let remaining = self.inner.counts.total.get();

                warn!("server: forcing {} connections closed", remaining);

                // dropping the senders cancels the connection tasks
                self.inner.kills.borrow_mut().clear();

                break;
            }

            sleep(Duration::from_millis(50)).await;
        }

        self.inner.state.set(ServerState::Stopped);

        info!("server stopped");

        Ok(())
    }
}

// over-capacity connections get a minimal response and the door
fn reject_connection(stream: TcpStream) {
    let stream = match AsyncTcpStream::new(stream) {
        Ok(stream) => stream,
        Err(_) => return,
    };

    let task = async move {
        let (_, mut write_half) = io_split(&stream);

        let _ = write_all(&mut write_half, REJECT_RESPONSE).await;

        stream.shutdown_write();
    };

    if let Some(executor) = Executor::current() {
        executor.spawn(task).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::future::{AsyncReadExt, Timeout};
    use crate::gateway::{
        CallbackFuture, Rfc6455Gateway, WebsocketHandler, WebsocketOptions, WsMessage,
    };
    use crate::http2;
    use crate::pipeline::{HandlerFuture, Responder};
    use crate::reactor::Reactor;
    use crate::request::Request;
    use crate::response::Response;
    use crate::vhost::Vhost;
    use crate::websocket;
    use std::time::Instant;

    // echoes the query params (or the path for bodyless checks)
    struct EchoResponder;

    impl Responder for EchoResponder {
        fn respond(&self, req: Request, resp: Response) -> HandlerFuture {
            Box::pin(async move {
                let params = req.get_all_params()?;

                let body = if params.is_empty() {
                    req.uri_path()
                } else {
                    params
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect::<Vec<String>>()
                        .join(",")
                };

                resp.set_header("content-type", "text/plain")?;
                resp.end(Some(body.into_bytes())).await
            })
        }
    }

    // sleeps before responding when the path asks for it, to force
    // out-of-order completion of pipelined requests
    struct SlowFastResponder;

    impl Responder for SlowFastResponder {
        fn respond(&self, req: Request, resp: Response) -> HandlerFuture {
            Box::pin(async move {
                let path = req.uri_path();

                if path == "/slow" {
                    sleep(Duration::from_millis(100)).await;
                }

                resp.set_header("content-type", "text/plain")?;
                resp.end(Some(path.into_bytes())).await
            })
        }
    }

    // buffers the whole request body, surfacing size faults
    struct BufferResponder;

    impl Responder for BufferResponder {
        fn respond(&self, req: Request, resp: Response) -> HandlerFuture {
            Box::pin(async move {
                let body = req.get_body(-1).buffer().await?;

                resp.end(Some(format!("got {}", body.len()).into_bytes()))
                    .await
            })
        }
    }

    fn start_server(options: Options, responder: Rc<dyn Responder>) -> (Server, SocketAddr) {
        let mut vhosts = VhostContainer::new();
        vhosts.add(Vhost::new("localhost", responder));

        let server = Server::new(options, vhosts);

        let listener = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_s, stop) = CancellationToken::new();

        // the stop sender lives in a task that fires when the marker
        // channel closes
        let (finish_s, finish_r) = crate::channel::local_channel::<()>(1);

        Executor::current()
            .unwrap()
            .spawn(async move {
                let _ = finish_r.recv().await;

                drop(stop_s);
            })
            .unwrap();

        {
            let server = server.clone();

            Executor::current()
                .unwrap()
                .spawn(async move {
                    server.run(listener, stop).await.unwrap();
                })
                .unwrap();
        }

        // leak the finish sender into the server handle so tests can
        // end the run by dropping it
        FINISH.with(|f| f.borrow_mut().push(finish_s));

        (server, addr)
    }

    thread_local! {
        static FINISH: RefCell<Vec<crate::channel::LocalSender<()>>> = RefCell::new(Vec::new());
    }

    fn finish_servers() {
        FINISH.with(|f| f.borrow_mut().clear());
    }

    // read a full http response: status line + headers, then a body
    // delimited by content-length or eof
    async fn read_response(stream: &AsyncTcpStream, buf: &mut Vec<u8>) -> (String, Vec<u8>) {
        let (mut read_half, _) = io_split(stream);

        let mut chunk = [0; 4096];

        let head_end = loop {
            if let Some(pos) = find_subslice(buf, b"\r\n\r\n") {
                break pos + 4;
            }

            let size = read_half.read(&mut chunk).await.unwrap();

            if size == 0 {
                panic!("eof before response head");
            }

            buf.extend_from_slice(&chunk[..size]);
        };

        let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();

        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;

                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);

        while buf.len() < head_end + content_length {
            let size = read_half.read(&mut chunk).await.unwrap();

            if size == 0 {
                panic!("eof before response body");
            }

            buf.extend_from_slice(&chunk[..size]);
        }

        let body = buf[head_end..(head_end + content_length)].to_vec();

        buf.drain(..(head_end + content_length));

        (head, body)
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    fn run_to_completion(executor: &Executor, reactor: &Reactor) {
        executor.run(|| reactor.poll()).unwrap();
    }

    #[test]
    fn test_echo_get() {
        let reactor = Reactor::new(128);
        let executor = Executor::new(128);

        let (_server, addr) = start_server(Options::default(), Rc::new(EchoResponder));

        let checked = Rc::new(Cell::new(false));

        {
            let checked = Rc::clone(&checked);

            executor
                .spawn(async move {
                    let stream = AsyncTcpStream::connect(addr).await.unwrap();

                    {
                        let (_, mut write_half) = io_split(&stream);

                        write_all(
                            &mut write_half,
                            b"GET /echo?x=1&x=2 HTTP/1.1\r\nHost: localhost\r\n\r\n",
                        )
                        .await
                        .unwrap();
                    }

                    let mut buf = Vec::new();

                    let (head, body) = read_response(&stream, &mut buf).await;

                    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
                    assert!(head.contains("Content-Length: 7\r\n"), "head: {}", head);
                    assert!(head.contains("Date: "), "head: {}", head);
                    assert_eq!(body, b"x=1,x=2");

                    checked.set(true);

                    finish_servers();
                })
                .unwrap();
        }

        run_to_completion(&executor, &reactor);

        assert!(checked.get());
    }

    #[test]
    fn test_pipelining_order() {
        let reactor = Reactor::new(128);
        let executor = Executor::new(128);

        let (_server, addr) = start_server(Options::default(), Rc::new(SlowFastResponder));

        let checked = Rc::new(Cell::new(false));

        {
            let checked = Rc::clone(&checked);

            executor
                .spawn(async move {
                    let stream = AsyncTcpStream::connect(addr).await.unwrap();

                    {
                        let (_, mut write_half) = io_split(&stream);

                        // two pipelined requests; the first responder
                        // finishes after the second
                        write_all(
                            &mut write_half,
                            b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n\
                              GET /fast HTTP/1.1\r\nHost: localhost\r\n\r\n",
                        )
                        .await
                        .unwrap();
                    }

                    let mut buf = Vec::new();

                    let (_, body1) = read_response(&stream, &mut buf).await;
                    let (_, body2) = read_response(&stream, &mut buf).await;

                    // responses come back in request order regardless
                    assert_eq!(body1, b"/slow");
                    assert_eq!(body2, b"/fast");

                    checked.set(true);

                    finish_servers();
                })
                .unwrap();
        }

        run_to_completion(&executor, &reactor);

        assert!(checked.get());
    }

    #[test]
    fn test_oversize_body_gets_413() {
        let reactor = Reactor::new(128);
        let executor = Executor::new(128);

        let options = Options {
            max_body_size: 1024,
            ..Options::default()
        };

        let (_server, addr) = start_server(options, Rc::new(BufferResponder));

        let checked = Rc::new(Cell::new(false));

        {
            let checked = Rc::clone(&checked);

            executor
                .spawn(async move {
                    let stream = AsyncTcpStream::connect(addr).await.unwrap();

                    {
                        let (_, mut write_half) = io_split(&stream);

                        write_all(
                            &mut write_half,
                            b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100000\r\n\r\n",
                        )
                        .await
                        .unwrap();

                        // stream more than the limit allows
                        let filler = vec![b'x'; 8192];

                        for _ in 0..4 {
                            if write_all(&mut write_half, &filler).await.is_err() {
                                // server may already have shut us down
                                break;
                            }
                        }
                    }

                    let mut buf = Vec::new();

                    let (head, _body) = read_response(&stream, &mut buf).await;

                    assert!(
                        head.starts_with("HTTP/1.1 413 "),
                        "expected 413, got: {}",
                        head
                    );
                    assert!(head.contains("Connection: close\r\n"), "head: {}", head);

                    checked.set(true);

                    finish_servers();
                })
                .unwrap();
        }

        run_to_completion(&executor, &reactor);

        assert!(checked.get());
    }

    #[test]
    fn test_keep_alive_idle_timeout() {
        let reactor = Reactor::new(128);
        let executor = Executor::new(128);

        let options = Options {
            connection_timeout: 1,
            ..Options::default()
        };

        let (_server, addr) = start_server(options, Rc::new(EchoResponder));

        let checked = Rc::new(Cell::new(false));

        {
            let checked = Rc::clone(&checked);

            executor
                .spawn(async move {
                    let started = Instant::now();

                    let stream = AsyncTcpStream::connect(addr).await.unwrap();

                    // no request; the server should hang up on its own
                    let (mut read_half, _) = io_split(&stream);

                    let mut chunk = [0; 64];

                    let size = read_half.read(&mut chunk).await.unwrap();

                    assert_eq!(size, 0, "expected eof, got data");
                    assert!(started.elapsed() >= Duration::from_secs(1));

                    checked.set(true);

                    finish_servers();
                })
                .unwrap();
        }

        run_to_completion(&executor, &reactor);

        assert!(checked.get());
    }

    // ---- websocket end to end ----

    struct RecordingHandler {
        events: Rc<RefCell<Vec<(String, Vec<u8>)>>>,
    }

    impl WebsocketHandler for RecordingHandler {
        fn on_open(&self, _client_id: u64) {
            self.events
                .borrow_mut()
                .push(("open".to_string(), Vec::new()));
        }

        fn on_data(&self, _client_id: u64, message: WsMessage) -> CallbackFuture {
            let events = Rc::clone(&self.events);

            Box::pin(async move {
                if let Ok(data) = message.body.buffer().await {
                    events.borrow_mut().push(("data".to_string(), data));
                }
            })
        }

        fn on_close(&self, _client_id: u64, code: u16, _reason: String) {
            self.events
                .borrow_mut()
                .push(("close".to_string(), code.to_be_bytes().to_vec()));
        }
    }

    #[test]
    fn test_websocket_echo_close() {
        let reactor = Reactor::new(128);
        let executor = Executor::new(128);

        let events = Rc::new(RefCell::new(Vec::new()));

        let gateway = Rfc6455Gateway::new(
            Rc::new(RecordingHandler {
                events: Rc::clone(&events),
            }),
            WebsocketOptions::default(),
        );

        let (_server, addr) = start_server(Options::default(), Rc::new(gateway));

        let checked = Rc::new(Cell::new(false));

        {
            let checked = Rc::clone(&checked);
            let events = Rc::clone(&events);

            executor
                .spawn(async move {
                    let stream = AsyncTcpStream::connect(addr).await.unwrap();

                    {
                        let (_, mut write_half) = io_split(&stream);

                        write_all(
                            &mut write_half,
                            b"GET /chat HTTP/1.1\r\nHost: localhost\r\n\
                              Upgrade: websocket\r\nConnection: Upgrade\r\n\
                              Sec-WebSocket-Version: 13\r\n\
                              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
                        )
                        .await
                        .unwrap();
                    }

                    let mut buf = Vec::new();

                    let (head, _) = read_response(&stream, &mut buf).await;

                    assert!(head.starts_with("HTTP/1.1 101 "), "head: {}", head);
                    assert!(
                        head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"),
                        "head: {}",
                        head
                    );

                    {
                        let (_, mut write_half) = io_split(&stream);

                        // text "hi", then close 1000
                        let frame = websocket::build_frame(
                            websocket::OPCODE_TEXT,
                            b"hi",
                            Some([1, 2, 3, 4]),
                            true,
                        );
                        write_all(&mut write_half, &frame).await.unwrap();

                        let close =
                            websocket::build_close_frame(1000, "", Some([5, 6, 7, 8]));
                        write_all(&mut write_half, &close).await.unwrap();
                    }

                    // the close echo comes back with code 1000
                    let (mut read_half, _) = io_split(&stream);

                    let mut chunk = [0; 64];

                    while buf.len() < 4 {
                        let size = read_half.read(&mut chunk).await.unwrap();

                        if size == 0 {
                            break;
                        }

                        buf.extend_from_slice(&chunk[..size]);
                    }

                    assert_eq!(&buf[..4], &[0x88, 0x02, 0x03, 0xe8]);

                    // give the server a beat to run the close callback
                    sleep(Duration::from_millis(50)).await;

                    let events = events.borrow();

                    assert_eq!(events[0].0, "open");
                    assert_eq!(events[1], ("data".to_string(), b"hi".to_vec()));
                    assert_eq!(
                        events[2],
                        ("close".to_string(), 1000u16.to_be_bytes().to_vec())
                    );

                    checked.set(true);

                    finish_servers();
                })
                .unwrap();
        }

        run_to_completion(&executor, &reactor);

        assert!(checked.get());
    }

    // ---- http/2 end to end ----

    struct HelloResponder;

    impl Responder for HelloResponder {
        fn respond(&self, _req: Request, resp: Response) -> HandlerFuture {
            Box::pin(async move {
                resp.set_header("content-type", "text/plain")?;
                resp.end(Some(b"hello".to_vec())).await
            })
        }
    }

    #[test]
    fn test_http2_get() {
        let reactor = Reactor::new(128);
        let executor = Executor::new(128);

        let (_server, addr) = start_server(Options::default(), Rc::new(HelloResponder));

        let checked = Rc::new(Cell::new(false));

        {
            let checked = Rc::clone(&checked);

            executor
                .spawn(async move {
                    let stream = AsyncTcpStream::connect(addr).await.unwrap();

                    {
                        let (_, mut write_half) = io_split(&stream);

                        let mut out = http2::PREFACE.to_vec();

                        // empty client SETTINGS
                        http2::frame::write_frame(
                            &mut out,
                            http2::frame::FRAME_SETTINGS,
                            0,
                            0,
                            &[],
                        );

                        // GET / on stream 1: indexed statics plus a
                        // literal :authority
                        let mut block = vec![0x82, 0x86, 0x84, 0x41, 0x09];
                        block.extend_from_slice(b"localhost");

                        http2::frame::write_frame(
                            &mut out,
                            http2::frame::FRAME_HEADERS,
                            http2::frame::FLAG_END_HEADERS | http2::frame::FLAG_END_STREAM,
                            1,
                            &block,
                        );

                        write_all(&mut write_half, &out).await.unwrap();
                    }

                    let (mut read_half, _) = io_split(&stream);

                    let mut buf = Vec::new();
                    let mut chunk = [0; 4096];

                    let mut decoder = http2::hpack::Decoder::new(4096);

                    let mut status = None;
                    let mut body = Vec::new();
                    let mut done = false;

                    while !done {
                        let size = read_half.read(&mut chunk).await.unwrap();

                        if size == 0 {
                            break;
                        }

                        buf.extend_from_slice(&chunk[..size]);

                        while let Some(header) = http2::frame::FrameHeader::parse(&buf) {
                            let total = http2::frame::FRAME_HEADER_SIZE + header.len;

                            if buf.len() < total {
                                break;
                            }

                            let payload: Vec<u8> =
                                buf[http2::frame::FRAME_HEADER_SIZE..total].to_vec();
                            buf.drain(..total);

                            match header.frame_type {
                                http2::frame::FRAME_HEADERS => {
                                    let fields = decoder.decode(&payload).unwrap();

                                    for (name, value) in fields {
                                        if name == ":status" {
                                            status = Some(value);
                                        }
                                    }
                                }
                                http2::frame::FRAME_DATA => {
                                    body.extend_from_slice(&payload);

                                    if header.flags & http2::frame::FLAG_END_STREAM != 0 {
                                        done = true;
                                    }
                                }
                                _ => {}
                            }
                        }
                    }

                    assert_eq!(status.as_deref(), Some("200"));
                    assert_eq!(body, b"hello");

                    checked.set(true);

                    finish_servers();
                })
                .unwrap();
        }

        run_to_completion(&executor, &reactor);

        assert!(checked.get());
    }

    #[test]
    fn test_admission_reject_over_capacity() {
        let reactor = Reactor::new(128);
        let executor = Executor::new(128);

        let options = Options {
            max_connections: 0,
            ..Options::default()
        };

        let (_server, addr) = start_server(options, Rc::new(EchoResponder));

        let checked = Rc::new(Cell::new(false));

        {
            let checked = Rc::clone(&checked);

            executor
                .spawn(async move {
                    let stream = AsyncTcpStream::connect(addr).await.unwrap();

                    let mut buf = Vec::new();

                    let (head, _) = read_response(&stream, &mut buf).await;

                    assert!(head.starts_with("HTTP/1.1 503 "), "head: {}", head);

                    checked.set(true);

                    finish_servers();
                })
                .unwrap();
        }

        run_to_completion(&executor, &reactor);

        assert!(checked.get());
    }

    #[test]
    fn test_state_transitions() {
        let reactor = Reactor::new(64);
        let executor = Executor::new(64);

        let mut vhosts = VhostContainer::new();
        vhosts.add(Vhost::new("localhost", Rc::new(EchoResponder)));

        let server = Server::new(Options::default(), vhosts);

        assert_eq!(server.state(), ServerState::Stopped);

        let listener = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let (stop_s, stop) = CancellationToken::new();

        {
            let server = server.clone();

            executor
                .spawn(async move {
                    server.run(listener, stop).await.unwrap();
                })
                .unwrap();
        }

        executor.run_until_stalled();
        assert_eq!(server.state(), ServerState::Started);

        drop(stop_s);

        run_to_completion(&executor, &reactor);
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_unused_timeout_gate() {
        // Timeout must be constructible without an executor task
        let _reactor = Reactor::new(4);

        let now = Reactor::current().unwrap().now();

        let t = Timeout::new(now + Duration::from_millis(5));
        t.set_deadline(now + Duration::from_millis(10));
    }
}
