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

//! Non-blocking HTTP/1.x and HTTP/2 application server with virtual
//! hosts, streaming bodies, a middleware/filter pipeline, and
//! WebSocket upgrades.
//!
//! One worker runs one [`executor::Executor`] and one
//! [`reactor::Reactor`] on a single thread; every connection, request
//! pipeline, and websocket session is a cooperative task on that loop.
//!
//! ```no_run
//! use aerys::executor::Executor;
//! use aerys::future::CancellationToken;
//! use aerys::options::Options;
//! use aerys::pipeline::{HandlerFuture, Responder};
//! use aerys::reactor::Reactor;
//! use aerys::request::Request;
//! use aerys::response::Response;
//! use aerys::server::Server;
//! use aerys::vhost::{Vhost, VhostContainer};
//! use std::rc::Rc;
//!
//! struct Hello;
//!
//! impl Responder for Hello {
//!     fn respond(&self, _req: Request, resp: Response) -> HandlerFuture {
//!         Box::pin(async move {
//!             resp.set_header("content-type", "text/plain")?;
//!             resp.end(Some(b"hello".to_vec())).await
//!         })
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let reactor = Reactor::new(1024);
//!     let executor = Executor::new(1024);
//!
//!     let mut vhosts = VhostContainer::new();
//!     vhosts.add(Vhost::new("localhost", Rc::new(Hello)));
//!
//!     let server = Server::new(Options::default(), vhosts);
//!     let listener = server.bind("127.0.0.1:8080".parse()?)?;
//!
//!     let (_stop_sender, stop) = CancellationToken::new();
//!
//!     executor.spawn(async move {
//!         server.run(listener, stop).await.unwrap();
//!     }).unwrap();
//!
//!     executor.run(|| reactor.poll())?;
//!
//!     Ok(())
//! }
//! ```

pub mod body;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod cookie;
pub mod error;
pub mod executor;
pub mod filters;
pub mod future;
pub mod gateway;
pub mod headers;
pub mod http1;
pub mod http2;
pub mod log;
pub mod options;
pub mod pipeline;
pub mod query;
pub mod reactor;
pub mod request;
pub mod response;
pub mod server;
pub mod ticker;
pub mod vhost;
pub mod websocket;

pub use crate::error::{Error, ProtocolError};
pub use crate::gateway::{Rfc6455Gateway, WebsocketHandler, WebsocketOptions, WsMessage};
pub use crate::options::Options;
pub use crate::pipeline::{HandlerFuture, Middleware, Next, Responder};
pub use crate::request::Request;
pub use crate::response::Response;
pub use crate::server::{Server, ServerState};
pub use crate::ticker::Ticker;
pub use crate::vhost::{Vhost, VhostContainer};
