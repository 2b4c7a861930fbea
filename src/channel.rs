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

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::mpsc;
use std::task::{Context, Poll, Waker};

struct ChannelData<T> {
    queue: VecDeque<T>,
    bound: usize,
    senders: usize,
    receiver_alive: bool,
    recv_waker: Option<Waker>,
    send_wakers: Vec<Waker>,
}

impl<T> ChannelData<T> {
    fn wake_receiver(&mut self) {
        if let Some(waker) = self.recv_waker.take() {
            waker.wake();
        }
    }

    fn wake_senders(&mut self) {
        for waker in self.send_wakers.drain(..) {
            waker.wake();
        }
    }
}

// bounded same-thread channel. senders suspend while the queue is full
pub fn local_channel<T>(bound: usize) -> (LocalSender<T>, LocalReceiver<T>) {
    assert!(bound > 0);

    let data = Rc::new(RefCell::new(ChannelData {
        queue: VecDeque::with_capacity(bound),
        bound,
        senders: 1,
        receiver_alive: true,
        recv_waker: None,
        send_wakers: Vec::new(),
    }));

    (
        LocalSender {
            data: Rc::clone(&data),
        },
        LocalReceiver { data },
    )
}

pub struct LocalSender<T> {
    data: Rc<RefCell<ChannelData<T>>>,
}

impl<T> LocalSender<T> {
    pub fn can_send(&self) -> bool {
        let data = self.data.borrow();

        data.queue.len() < data.bound && data.receiver_alive
    }

    pub fn try_send(&self, t: T) -> Result<(), mpsc::TrySendError<T>> {
        let data = &mut *self.data.borrow_mut();

        if !data.receiver_alive {
            return Err(mpsc::TrySendError::Disconnected(t));
        }

        if data.queue.len() >= data.bound {
            return Err(mpsc::TrySendError::Full(t));
        }

        data.queue.push_back(t);
        data.wake_receiver();

        Ok(())
    }

    pub fn send(&self, t: T) -> SendFuture<'_, T> {
        SendFuture {
            s: self,
            t: Some(t),
        }
    }
}

impl<T> Clone for LocalSender<T> {
    fn clone(&self) -> Self {
        self.data.borrow_mut().senders += 1;

        Self {
            data: Rc::clone(&self.data),
        }
    }
}

impl<T> Drop for LocalSender<T> {
    fn drop(&mut self) {
        let data = &mut *self.data.borrow_mut();

        data.senders -= 1;

        if data.senders == 0 {
            data.wake_receiver();
        }
    }
}

pub struct SendFuture<'a, T> {
    s: &'a LocalSender<T>,
    t: Option<T>,
}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), mpsc::SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let f = unsafe { self.get_unchecked_mut() };

        let data = &mut *f.s.data.borrow_mut();

        if !data.receiver_alive {
            return Poll::Ready(Err(mpsc::SendError(f.t.take().unwrap())));
        }

        if data.queue.len() >= data.bound {
            data.send_wakers.push(cx.waker().clone());

            return Poll::Pending;
        }

        data.queue.push_back(f.t.take().unwrap());
        data.wake_receiver();

        Poll::Ready(Ok(()))
    }
}

pub struct LocalReceiver<T> {
    data: Rc<RefCell<ChannelData<T>>>,
}

impl<T> LocalReceiver<T> {
    pub fn try_recv(&self) -> Result<T, mpsc::TryRecvError> {
        let data = &mut *self.data.borrow_mut();

        match data.queue.pop_front() {
            Some(t) => {
                data.wake_senders();

                Ok(t)
            }
            None => {
                if data.senders == 0 {
                    Err(mpsc::TryRecvError::Disconnected)
                } else {
                    Err(mpsc::TryRecvError::Empty)
                }
            }
        }
    }

    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture { r: self }
    }
}

impl<T> Drop for LocalReceiver<T> {
    fn drop(&mut self) {
        let data = &mut *self.data.borrow_mut();

        data.receiver_alive = false;
        data.queue.clear();
        data.wake_senders();
    }
}

pub struct RecvFuture<'a, T> {
    r: &'a LocalReceiver<T>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, mpsc::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let data = &mut *self.r.data.borrow_mut();

        match data.queue.pop_front() {
            Some(t) => {
                data.wake_senders();

                Poll::Ready(Ok(t))
            }
            None => {
                if data.senders == 0 {
                    return Poll::Ready(Err(mpsc::RecvError));
                }

                data.recv_waker = Some(cx.waker().clone());

                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use std::cell::Cell;

    #[test]
    fn test_send_recv() {
        let executor = Executor::new(2);

        let (s, r) = local_channel::<u32>(1);

        let received = Rc::new(RefCell::new(Vec::new()));

        {
            let received = Rc::clone(&received);

            executor
                .spawn(async move {
                    while let Ok(v) = r.recv().await {
                        received.borrow_mut().push(v);
                    }
                })
                .unwrap();
        }

        executor
            .spawn(async move {
                // queue bound is 1, so the sends interleave with recvs
                for i in 0..3 {
                    s.send(i).await.unwrap();
                }
            })
            .unwrap();

        executor.run(|| Ok(())).unwrap();

        assert_eq!(*received.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_backpressure() {
        let executor = Executor::new(1);

        let (s, r) = local_channel::<u32>(1);

        s.try_send(1).unwrap();

        // queue is full now
        assert!(!s.can_send());
        assert!(matches!(
            s.try_send(2),
            Err(mpsc::TrySendError::Full(2))
        ));

        let progressed = Rc::new(Cell::new(false));

        {
            let progressed = Rc::clone(&progressed);

            executor
                .spawn(async move {
                    s.send(2).await.unwrap();

                    progressed.set(true);
                })
                .unwrap();
        }

        executor.run_until_stalled();
        assert_eq!(progressed.get(), false);

        assert_eq!(r.try_recv().unwrap(), 1);

        executor.run_until_stalled();
        assert_eq!(progressed.get(), true);
        assert_eq!(r.try_recv().unwrap(), 2);
    }

    #[test]
    fn test_disconnect() {
        let (s, r) = local_channel::<u32>(1);

        drop(r);

        assert!(matches!(
            s.try_send(1),
            Err(mpsc::TrySendError::Disconnected(1))
        ));

        let (s, r) = local_channel::<u32>(1);

        drop(s);

        assert!(matches!(r.try_recv(), Err(mpsc::TryRecvError::Disconnected)));
    }
}
