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

use crate::error::Error;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

#[derive(Debug, Clone, Copy, PartialEq)]
enum EndState {
    Open,
    Complete,
    // peer went away mid-body
    FailedClient,
    // body exceeded the limit and the limit was not raised
    FailedSize,
}

struct BodyShared {
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    soft_cap: usize,
    limit: usize,
    end: EndState,
    reader_alive: bool,
    messages: usize,
    recv_waker: Option<Waker>,
    emit_wakers: Vec<Waker>,
}

impl BodyShared {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.recv_waker.take() {
            waker.wake();
        }
    }

    fn wake_emitters(&mut self) {
        for waker in self.emit_wakers.drain(..) {
            waker.wake();
        }
    }
}

// queue of body chunks between a protocol driver and a request handler.
// the emitter suspends once the queued bytes exceed the soft cap; the
// reader sees exactly the emitted bytes in order, then completion or
// failure. the limit lives here so a mid-stream upgrade is visible to
// the driver without swapping any handles
pub fn body_pair(soft_cap: usize, limit: usize) -> (BodyEmitter, Message) {
    let shared = Rc::new(RefCell::new(BodyShared {
        queue: VecDeque::new(),
        queued_bytes: 0,
        soft_cap,
        limit,
        end: EndState::Open,
        reader_alive: true,
        messages: 1,
        recv_waker: None,
        emit_wakers: Vec::new(),
    }));

    (
        BodyEmitter {
            shared: Rc::clone(&shared),
        },
        Message { shared },
    )
}

pub struct BodyEmitter {
    shared: Rc<RefCell<BodyShared>>,
}

impl BodyEmitter {
    pub fn limit(&self) -> usize {
        self.shared.borrow().limit
    }

    pub fn emit(&self, chunk: Vec<u8>) -> EmitFuture {
        EmitFuture {
            shared: Rc::clone(&self.shared),
            chunk: Some(chunk),
        }
    }

    pub fn complete(&self) {
        let shared = &mut *self.shared.borrow_mut();

        if shared.end == EndState::Open {
            shared.end = EndState::Complete;
            shared.wake_reader();
        }
    }

    pub fn fail(&self, err: &Error) {
        let shared = &mut *self.shared.borrow_mut();

        if shared.end == EndState::Open {
            shared.end = match err {
                Error::ClientSize => EndState::FailedSize,
                _ => EndState::FailedClient,
            };

            shared.wake_reader();
        }
    }
}

impl Drop for BodyEmitter {
    fn drop(&mut self) {
        let shared = &mut *self.shared.borrow_mut();

        // dropping without completing means the producer went away
        if shared.end == EndState::Open {
            shared.end = EndState::FailedClient;
            shared.wake_reader();
        }
    }
}

// owns its target, so it can outlive the emitter borrow and run as a
// free-standing task
pub struct EmitFuture {
    shared: Rc<RefCell<BodyShared>>,
    chunk: Option<Vec<u8>>,
}

impl Future for EmitFuture {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let f = &mut *self;

        let shared = &mut *f.shared.borrow_mut();

        if !shared.reader_alive {
            return Poll::Ready(Err(Error::Client));
        }

        // queue the chunk on the first poll, then hold the producer
        // until the reader drains below the watermark
        if let Some(chunk) = f.chunk.take() {
            shared.queued_bytes += chunk.len();
            shared.queue.push_back(chunk);
            shared.wake_reader();
        }

        if shared.queued_bytes > shared.soft_cap {
            shared.emit_wakers.push(cx.waker().clone());

            return Poll::Pending;
        }

        Poll::Ready(Ok(()))
    }
}

// lazy byte sequence handed to the application. clones share the same
// underlying stream state
pub struct Message {
    shared: Rc<RefCell<BodyShared>>,
}

impl Clone for Message {
    fn clone(&self) -> Self {
        self.shared.borrow_mut().messages += 1;

        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl Message {
    pub fn limit(&self) -> usize {
        self.shared.borrow().limit
    }

    // raise (never lower) the effective body limit
    pub fn set_limit(&self, limit: usize) {
        let shared = &mut *self.shared.borrow_mut();

        if limit > shared.limit {
            shared.limit = limit;
            shared.wake_emitters();
        }
    }

    // next chunk, or None at the end of the stream
    pub fn read(&self) -> ReadBodyFuture<'_> {
        ReadBodyFuture { m: self }
    }

    pub async fn buffer(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();

        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }

        Ok(out)
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        let shared = &mut *self.shared.borrow_mut();

        shared.messages -= 1;

        // when the last handle goes, release the producer
        if shared.messages == 0 {
            shared.reader_alive = false;
            shared.queue.clear();
            shared.queued_bytes = 0;
            shared.wake_emitters();
        }
    }
}

pub struct ReadBodyFuture<'a> {
    m: &'a Message,
}

impl Future for ReadBodyFuture<'_> {
    type Output = Result<Option<Vec<u8>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let shared = &mut *self.m.shared.borrow_mut();

        if let Some(chunk) = shared.queue.pop_front() {
            shared.queued_bytes -= chunk.len();

            if shared.queued_bytes <= shared.soft_cap {
                shared.wake_emitters();
            }

            return Poll::Ready(Ok(Some(chunk)));
        }

        match shared.end {
            EndState::Open => {
                shared.recv_waker = Some(cx.waker().clone());

                Poll::Pending
            }
            EndState::Complete => Poll::Ready(Ok(None)),
            EndState::FailedClient => Poll::Ready(Err(Error::Client)),
            EndState::FailedSize => Poll::Ready(Err(Error::ClientSize)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use std::cell::Cell;

    #[test]
    fn test_emit_and_read() {
        let executor = Executor::new(2);

        let (emitter, message) = body_pair(1024, 65_536);

        executor
            .spawn(async move {
                emitter.emit(b"hello ".to_vec()).await.unwrap();
                emitter.emit(b"world".to_vec()).await.unwrap();
                emitter.complete();
            })
            .unwrap();

        let out = Rc::new(RefCell::new(Vec::new()));

        {
            let out = Rc::clone(&out);

            executor
                .spawn(async move {
                    let body = message.buffer().await.unwrap();

                    *out.borrow_mut() = body;
                })
                .unwrap();
        }

        executor.run(|| Ok(())).unwrap();

        assert_eq!(out.borrow().as_slice(), b"hello world");
    }

    #[test]
    fn test_backpressure_below_cap() {
        let executor = Executor::new(2);

        let (emitter, message) = body_pair(4, 65_536);

        let emitted = Rc::new(Cell::new(0));

        {
            let emitted = Rc::clone(&emitted);

            executor
                .spawn(async move {
                    emitter.emit(b"12345".to_vec()).await.unwrap();
                    emitted.set(1);

                    emitter.emit(b"678".to_vec()).await.unwrap();
                    emitted.set(2);

                    emitter.complete();
                })
                .unwrap();
        }

        // first emit overruns the cap and parks the producer
        executor.run_until_stalled();
        assert_eq!(emitted.get(), 0);

        let chunks = Rc::new(RefCell::new(Vec::new()));

        {
            let chunks = Rc::clone(&chunks);

            executor
                .spawn(async move {
                    while let Some(c) = message.read().await.unwrap() {
                        chunks.borrow_mut().push(c);
                    }
                })
                .unwrap();
        }

        executor.run(|| Ok(())).unwrap();

        assert_eq!(emitted.get(), 2);
        assert_eq!(chunks.borrow().concat(), b"12345678".to_vec());
    }

    #[test]
    fn test_fail_surfaces_to_reader() {
        let executor = Executor::new(1);

        let (emitter, message) = body_pair(1024, 8);

        emitter.fail(&Error::ClientSize);
        drop(emitter);

        let got_err = Rc::new(Cell::new(false));

        {
            let got_err = Rc::clone(&got_err);

            executor
                .spawn(async move {
                    match message.buffer().await {
                        Err(Error::ClientSize) => got_err.set(true),
                        _ => {}
                    }
                })
                .unwrap();
        }

        executor.run(|| Ok(())).unwrap();

        assert!(got_err.get());
    }

    #[test]
    fn test_dropped_emitter_is_client_error() {
        let executor = Executor::new(1);

        let (emitter, message) = body_pair(1024, 8);

        drop(emitter);

        let got_err = Rc::new(Cell::new(false));

        {
            let got_err = Rc::clone(&got_err);

            executor
                .spawn(async move {
                    match message.read().await {
                        Err(Error::Client) => got_err.set(true),
                        _ => {}
                    }
                })
                .unwrap();
        }

        executor.run(|| Ok(())).unwrap();

        assert!(got_err.get());
    }

    #[test]
    fn test_limit_upgrade() {
        let (emitter, message) = body_pair(1024, 8);

        assert_eq!(emitter.limit(), 8);

        message.set_limit(1024);
        assert_eq!(emitter.limit(), 1024);

        // lowering is ignored
        message.set_limit(4);
        assert_eq!(emitter.limit(), 1024);
    }
}
