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

use crate::buffer::VECTORED_MAX;
use crate::reactor::{Reactor, Registration, TimerRegistration};
use mio::net::{TcpListener, TcpStream};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

pub trait AsyncRead {
    fn poll_read(&mut self, cx: &mut Context, buf: &mut [u8]) -> Poll<Result<usize, io::Error>>;
}

pub trait AsyncWrite {
    fn poll_write(&mut self, cx: &mut Context, buf: &[u8]) -> Poll<Result<usize, io::Error>>;

    fn poll_write_vectored(
        &mut self,
        cx: &mut Context,
        bufs: &[io::IoSlice],
    ) -> Poll<Result<usize, io::Error>>;
}

pub trait AsyncReadExt: AsyncRead {
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> ReadFuture<'a, Self>
    where
        Self: Sized,
    {
        ReadFuture { r: self, buf }
    }
}

impl<T: AsyncRead> AsyncReadExt for T {}

pub trait AsyncWriteExt: AsyncWrite {
    fn write<'a>(&'a mut self, buf: &'a [u8]) -> WriteFuture<'a, Self>
    where
        Self: Sized,
    {
        WriteFuture { w: self, buf }
    }
}

impl<T: AsyncWrite> AsyncWriteExt for T {}

pub struct ReadFuture<'a, R> {
    r: &'a mut R,
    buf: &'a mut [u8],
}

impl<R: AsyncRead> Future for ReadFuture<'_, R> {
    type Output = Result<usize, io::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let f = &mut *self;

        f.r.poll_read(cx, f.buf)
    }
}

pub struct WriteFuture<'a, W> {
    w: &'a mut W,
    buf: &'a [u8],
}

impl<W: AsyncWrite> Future for WriteFuture<'_, W> {
    type Output = Result<usize, io::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let f = &mut *self;

        f.w.poll_write(cx, f.buf)
    }
}

// write all of buf, looping over partial writes
pub async fn write_all<W: AsyncWrite>(w: &mut W, buf: &[u8]) -> Result<(), io::Error> {
    let mut pos = 0;

    while pos < buf.len() {
        let size = w.write(&buf[pos..]).await?;

        if size == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        pos += size;
    }

    Ok(())
}

struct WriteVectoredOffsetFuture<'a, W> {
    w: &'a mut W,
    bufs: &'a [&'a [u8]],
    offset: usize,
}

impl<W: AsyncWrite> Future for WriteVectoredOffsetFuture<'_, W> {
    type Output = Result<usize, io::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let f = &mut *self;

        let mut offset = f.offset;
        let mut start = 0;

        if f.bufs.is_empty() {
            return Poll::Ready(Ok(0));
        }

        while offset >= f.bufs[start].len() {
            if start + 1 >= f.bufs.len() {
                if offset > f.bufs[start].len() {
                    return Poll::Ready(Err(io::Error::from(io::ErrorKind::InvalidInput)));
                }

                return Poll::Ready(Ok(0));
            }

            offset -= f.bufs[start].len();
            start += 1;
        }

        let mut arr = [io::IoSlice::new(&b""[..]); VECTORED_MAX];
        let mut arr_len = 0;

        for i in start..f.bufs.len() {
            let buf = if i == start {
                &f.bufs[i][offset..]
            } else {
                f.bufs[i]
            };

            arr[arr_len] = io::IoSlice::new(buf);
            arr_len += 1;
        }

        f.w.poll_write_vectored(cx, &arr[..arr_len])
    }
}

pub async fn write_vectored_offset_async<W: AsyncWrite>(
    w: &mut W,
    bufs: &[&[u8]],
    offset: usize,
) -> Result<usize, io::Error> {
    WriteVectoredOffsetFuture { w, bufs, offset }.await
}

pub struct AsyncTcpListener {
    inner: RefCell<TcpListener>,
    registration: Registration,
}

impl AsyncTcpListener {
    pub fn new(mut l: TcpListener) -> Result<Self, io::Error> {
        let reactor = Reactor::current().expect("no reactor in thread");

        let registration = reactor.register(&mut l, mio::Interest::READABLE)?;

        registration.set_ready(mio::Interest::READABLE, true);

        Ok(Self {
            inner: RefCell::new(l),
            registration,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.inner.borrow().local_addr()
    }

    pub fn accept(&self) -> AcceptFuture<'_> {
        AcceptFuture { l: self }
    }
}

pub struct AcceptFuture<'a> {
    l: &'a AsyncTcpListener,
}

impl Future for AcceptFuture<'_> {
    type Output = Result<(TcpStream, SocketAddr), io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let reg = &self.l.registration;

        if !reg.is_ready(mio::Interest::READABLE) {
            reg.set_waker(cx.waker(), mio::Interest::READABLE);

            return Poll::Pending;
        }

        match self.l.inner.borrow().accept() {
            Ok(ret) => Poll::Ready(Ok(ret)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                reg.set_ready(mio::Interest::READABLE, false);
                reg.set_waker(cx.waker(), mio::Interest::READABLE);

                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for AcceptFuture<'_> {
    fn drop(&mut self) {
        self.l.registration.clear_waker(mio::Interest::READABLE);
    }
}

pub struct AsyncTcpStream {
    inner: RefCell<TcpStream>,
    registration: Registration,
}

impl AsyncTcpStream {
    pub fn new(mut stream: TcpStream) -> Result<Self, io::Error> {
        let reactor = Reactor::current().expect("no reactor in thread");

        let registration =
            reactor.register(&mut stream, mio::Interest::READABLE | mio::Interest::WRITABLE)?;

        // assume ready until a WouldBlock proves otherwise
        registration.set_ready(mio::Interest::READABLE | mio::Interest::WRITABLE, true);

        Ok(Self {
            inner: RefCell::new(stream),
            registration,
        })
    }

    // outbound connection, completing once the socket is writable
    pub async fn connect(addr: SocketAddr) -> Result<Self, io::Error> {
        let stream = TcpStream::connect(addr)?;

        let stream = Self::new(stream)?;

        stream.registration.set_ready(mio::Interest::WRITABLE, false);

        ConnectFuture { s: &stream }.await?;

        if let Some(e) = stream.inner.borrow().take_error()? {
            return Err(e);
        }

        Ok(stream)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, io::Error> {
        self.inner.borrow().peer_addr()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.inner.borrow().local_addr()
    }

    pub fn shutdown_write(&self) {
        // best effort
        let _ = self.inner.borrow().shutdown(std::net::Shutdown::Write);
    }

    fn poll_read_priv(&self, cx: &mut Context, buf: &mut [u8]) -> Poll<Result<usize, io::Error>> {
        let reg = &self.registration;

        if !reg.is_ready(mio::Interest::READABLE) {
            reg.set_waker(cx.waker(), mio::Interest::READABLE);

            return Poll::Pending;
        }

        match (&mut *self.inner.borrow_mut()).read(buf) {
            Ok(size) => Poll::Ready(Ok(size)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                reg.set_ready(mio::Interest::READABLE, false);
                reg.set_waker(cx.waker(), mio::Interest::READABLE);

                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_write_priv(&self, cx: &mut Context, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        let reg = &self.registration;

        if !reg.is_ready(mio::Interest::WRITABLE) {
            reg.set_waker(cx.waker(), mio::Interest::WRITABLE);

            return Poll::Pending;
        }

        match (&mut *self.inner.borrow_mut()).write(buf) {
            Ok(size) => Poll::Ready(Ok(size)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                reg.set_ready(mio::Interest::WRITABLE, false);
                reg.set_waker(cx.waker(), mio::Interest::WRITABLE);

                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_write_vectored_priv(
        &self,
        cx: &mut Context,
        bufs: &[io::IoSlice],
    ) -> Poll<Result<usize, io::Error>> {
        let reg = &self.registration;

        if !reg.is_ready(mio::Interest::WRITABLE) {
            reg.set_waker(cx.waker(), mio::Interest::WRITABLE);

            return Poll::Pending;
        }

        match (&mut *self.inner.borrow_mut()).write_vectored(bufs) {
            Ok(size) => Poll::Ready(Ok(size)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                reg.set_ready(mio::Interest::WRITABLE, false);
                reg.set_waker(cx.waker(), mio::Interest::WRITABLE);

                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncRead for AsyncTcpStream {
    fn poll_read(&mut self, cx: &mut Context, buf: &mut [u8]) -> Poll<Result<usize, io::Error>> {
        self.poll_read_priv(cx, buf)
    }
}

impl AsyncWrite for AsyncTcpStream {
    fn poll_write(&mut self, cx: &mut Context, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        self.poll_write_priv(cx, buf)
    }

    fn poll_write_vectored(
        &mut self,
        cx: &mut Context,
        bufs: &[io::IoSlice],
    ) -> Poll<Result<usize, io::Error>> {
        self.poll_write_vectored_priv(cx, bufs)
    }
}

struct ConnectFuture<'a> {
    s: &'a AsyncTcpStream,
}

impl Future for ConnectFuture<'_> {
    type Output = Result<(), io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let reg = &self.s.registration;

        if reg.is_ready(mio::Interest::WRITABLE) {
            return Poll::Ready(Ok(()));
        }

        reg.set_waker(cx.waker(), mio::Interest::WRITABLE);

        Poll::Pending
    }
}

impl Drop for ConnectFuture<'_> {
    fn drop(&mut self) {
        self.s.registration.clear_waker(mio::Interest::WRITABLE);
    }
}

pub struct ReadHalf<'a>(&'a AsyncTcpStream);

pub struct WriteHalf<'a>(&'a AsyncTcpStream);

pub fn io_split(stream: &AsyncTcpStream) -> (ReadHalf<'_>, WriteHalf<'_>) {
    (ReadHalf(stream), WriteHalf(stream))
}

impl AsyncRead for ReadHalf<'_> {
    fn poll_read(&mut self, cx: &mut Context, buf: &mut [u8]) -> Poll<Result<usize, io::Error>> {
        self.0.poll_read_priv(cx, buf)
    }
}

impl AsyncWrite for WriteHalf<'_> {
    fn poll_write(&mut self, cx: &mut Context, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        self.0.poll_write_priv(cx, buf)
    }

    fn poll_write_vectored(
        &mut self,
        cx: &mut Context,
        bufs: &[io::IoSlice],
    ) -> Poll<Result<usize, io::Error>> {
        self.0.poll_write_vectored_priv(cx, bufs)
    }
}

pub struct Timeout {
    evented: RefCell<Option<TimerRegistration>>,
}

impl Timeout {
    pub fn new(deadline: Instant) -> Self {
        let reactor = Reactor::current().expect("no reactor in thread");

        let evented = if deadline > reactor.now() {
            Some(reactor.register_timer(deadline).unwrap())
        } else {
            None
        };

        Self {
            evented: RefCell::new(evented),
        }
    }

    pub fn set_deadline(&self, deadline: Instant) {
        let reactor = Reactor::current().expect("no reactor in thread");

        if deadline > reactor.now() {
            let evented = &mut *self.evented.borrow_mut();

            match evented {
                Some(e) => e.set_expires(deadline),
                None => *evented = Some(reactor.register_timer(deadline).unwrap()),
            }
        } else {
            self.evented.replace(None);
        }
    }

    pub fn elapsed(&self) -> TimeoutFuture<'_> {
        TimeoutFuture { t: self }
    }
}

pub struct TimeoutFuture<'a> {
    t: &'a Timeout,
}

impl Future for TimeoutFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let evented = self.t.evented.borrow();

        let evented = match evented.as_ref() {
            Some(e) => e,
            // no registration means ready immediately
            None => return Poll::Ready(()),
        };

        if evented.is_ready() {
            return Poll::Ready(());
        }

        evented.set_waker(cx.waker());

        Poll::Pending
    }
}

impl Drop for TimeoutFuture<'_> {
    fn drop(&mut self) {
        if let Some(evented) = self.t.evented.borrow().as_ref() {
            evented.clear_waker();
        }
    }
}

pub async fn sleep(duration: Duration) {
    let reactor = Reactor::current().expect("no reactor in thread");

    Timeout::new(reactor.now() + duration).elapsed().await
}

struct CancellationData {
    cancelled: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

pub struct CancellationSender {
    data: Rc<CancellationData>,
}

impl CancellationSender {
    fn cancel(&self) {
        self.data.cancelled.set(true);

        if let Some(waker) = self.data.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

impl Drop for CancellationSender {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Clone)]
pub struct CancellationToken {
    data: Rc<CancellationData>,
}

impl CancellationToken {
    pub fn new() -> (CancellationSender, Self) {
        let data = Rc::new(CancellationData {
            cancelled: Cell::new(false),
            waker: RefCell::new(None),
        });

        (
            CancellationSender {
                data: Rc::clone(&data),
            },
            Self { data },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.data.cancelled.get()
    }

    pub fn cancelled(&self) -> CancelledFuture<'_> {
        CancelledFuture { t: self }
    }
}

pub struct CancelledFuture<'a> {
    t: &'a CancellationToken,
}

impl Future for CancelledFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        if self.t.data.cancelled.get() {
            return Poll::Ready(());
        }

        *self.t.data.waker.borrow_mut() = Some(cx.waker().clone());

        Poll::Pending
    }
}

impl Drop for CancelledFuture<'_> {
    fn drop(&mut self) {
        *self.t.data.waker.borrow_mut() = None;
    }
}

#[derive(Debug, PartialEq)]
pub enum Select2<O1, O2> {
    R1(O1),
    R2(O2),
}

pub struct Select2Future<F1, F2> {
    f1: F1,
    f2: F2,
}

impl<F1, F2> Future for Select2Future<F1, F2>
where
    F1: Future,
    F2: Future,
{
    type Output = Select2<F1::Output, F2::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        // SAFETY: fields are never moved out of the pinned struct
        let f1 = unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.f1) };

        if let Poll::Ready(v) = f1.poll(cx) {
            return Poll::Ready(Select2::R1(v));
        }

        let f2 = unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.f2) };

        if let Poll::Ready(v) = f2.poll(cx) {
            return Poll::Ready(Select2::R2(v));
        }

        Poll::Pending
    }
}

pub fn select_2<F1, F2>(f1: F1, f2: F2) -> Select2Future<F1, F2>
where
    F1: Future,
    F2: Future,
{
    Select2Future { f1, f2 }
}

#[derive(Debug, PartialEq)]
pub enum Select3<O1, O2, O3> {
    R1(O1),
    R2(O2),
    R3(O3),
}

pub struct Select3Future<F1, F2, F3> {
    f1: F1,
    f2: F2,
    f3: F3,
}

impl<F1, F2, F3> Future for Select3Future<F1, F2, F3>
where
    F1: Future,
    F2: Future,
    F3: Future,
{
    type Output = Select3<F1::Output, F2::Output, F3::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        // SAFETY: fields are never moved out of the pinned struct
        let f1 = unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.f1) };

        if let Poll::Ready(v) = f1.poll(cx) {
            return Poll::Ready(Select3::R1(v));
        }

        let f2 = unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.f2) };

        if let Poll::Ready(v) = f2.poll(cx) {
            return Poll::Ready(Select3::R2(v));
        }

        let f3 = unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.f3) };

        if let Poll::Ready(v) = f3.poll(cx) {
            return Poll::Ready(Select3::R3(v));
        }

        Poll::Pending
    }
}

pub fn select_3<F1, F2, F3>(f1: F1, f2: F2, f3: F3) -> Select3Future<F1, F2, F3>
where
    F1: Future,
    F2: Future,
    F3: Future,
{
    Select3Future { f1, f2, f3 }
}

#[derive(Debug, PartialEq)]
pub enum Select4<O1, O2, O3, O4> {
    R1(O1),
    R2(O2),
    R3(O3),
    R4(O4),
}

pub struct Select4Future<F1, F2, F3, F4> {
    f1: F1,
    f2: F2,
    f3: F3,
    f4: F4,
}

impl<F1, F2, F3, F4> Future for Select4Future<F1, F2, F3, F4>
where
    F1: Future,
    F2: Future,
    F3: Future,
    F4: Future,
{
    type Output = Select4<F1::Output, F2::Output, F3::Output, F4::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        // SAFETY: fields are never moved out of the pinned struct
        let f1 = unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.f1) };

        if let Poll::Ready(v) = f1.poll(cx) {
            return Poll::Ready(Select4::R1(v));
        }

        let f2 = unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.f2) };

        if let Poll::Ready(v) = f2.poll(cx) {
            return Poll::Ready(Select4::R2(v));
        }

        let f3 = unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.f3) };

        if let Poll::Ready(v) = f3.poll(cx) {
            return Poll::Ready(Select4::R3(v));
        }

        let f4 = unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.f4) };

        if let Poll::Ready(v) = f4.poll(cx) {
            return Poll::Ready(Select4::R4(v));
        }

        Poll::Pending
    }
}

pub fn select_4<F1, F2, F3, F4>(f1: F1, f2: F2, f3: F3, f4: F4) -> Select4Future<F1, F2, F3, F4>
where
    F1: Future,
    F2: Future,
    F3: Future,
    F4: Future,
{
    Select4Future { f1, f2, f3, f4 }
}

// a future over an optional future. pending forever when None
pub struct SelectOptionFuture<F> {
    fut: Option<F>,
}

impl<F: Future> Future for SelectOptionFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        // SAFETY: fields are never moved out of the pinned struct
        let fut = unsafe { self.map_unchecked_mut(|s| &mut s.fut) };

        match fut.as_pin_mut() {
            Some(f) => f.poll(cx),
            None => Poll::Pending,
        }
    }
}

pub fn select_option<F: Future>(fut: Option<F>) -> SelectOptionFuture<F> {
    SelectOptionFuture { fut }
}

pub struct SelectSliceFuture<'a, F> {
    futures: &'a mut [F],
}

impl<F, O> Future for SelectSliceFuture<'_, F>
where
    F: Future<Output = O>,
{
    type Output = (usize, O);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        for (i, f) in self.futures.iter_mut().enumerate() {
            // SAFETY: the slice elements are never moved
            let p = unsafe { Pin::new_unchecked(f) };

            if let Poll::Ready(v) = p.poll(cx) {
                return Poll::Ready((i, v));
            }
        }

        Poll::Pending
    }
}

pub fn select_slice<'a, F, O>(futures: &'a mut [F]) -> SelectSliceFuture<'a, F>
where
    F: Future<Output = O>,
{
    SelectSliceFuture { futures }
}

// poll a future once without consuming it
pub struct PollOnceFuture<'a, F> {
    fut: &'a mut F,
}

impl<F: Future + Unpin> Future for PollOnceFuture<'_, F> {
    type Output = Poll<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Poll::Ready(Pin::new(&mut *self.fut).poll(cx))
    }
}

pub fn poll_async<F: Future + Unpin>(fut: &mut F) -> PollOnceFuture<'_, F> {
    PollOnceFuture { fut }
}
