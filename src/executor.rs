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

use slab::Slab;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

thread_local! {
    static EXECUTOR: RefCell<Option<Weak<Tasks>>> = RefCell::new(None);
}

struct WakerData {
    tasks: Weak<Tasks>,
    task_id: usize,
}

impl WakerData {
    fn as_std_waker(self: &Rc<WakerData>) -> Waker {
        unsafe { Waker::from_raw(raw_waker(Rc::clone(self))) }
    }
}

fn raw_waker(waker: Rc<WakerData>) -> RawWaker {
    unsafe fn clone_waker(data: *const ()) -> RawWaker {
        let waker = mem::ManuallyDrop::new(Rc::from_raw(data as *const WakerData));

        let waker = Rc::clone(&waker);

        RawWaker::new(
            Rc::into_raw(waker) as *const (),
            &RawWakerVTable::new(clone_waker, wake, wake_by_ref, drop_waker),
        )
    }

    unsafe fn wake(data: *const ()) {
        let waker = Rc::from_raw(data as *const WakerData);

        if let Some(tasks) = waker.tasks.upgrade() {
            tasks.wake(waker.task_id);
        }
    }

    unsafe fn wake_by_ref(data: *const ()) {
        let waker = mem::ManuallyDrop::new(Rc::from_raw(data as *const WakerData));

        if let Some(tasks) = waker.tasks.upgrade() {
            tasks.wake(waker.task_id);
        }
    }

    unsafe fn drop_waker(data: *const ()) {
        drop(Rc::from_raw(data as *const WakerData));
    }

    RawWaker::new(
        Rc::into_raw(waker) as *const (),
        &RawWakerVTable::new(clone_waker, wake, wake_by_ref, drop_waker),
    )
}

fn poll_fut(fut: &mut Pin<Box<dyn Future<Output = ()>>>, waker: Waker) -> bool {
    let fut: Pin<&mut dyn Future<Output = ()>> = fut.as_mut();

    let mut cx = Context::from_waker(&waker);

    match fut.poll(&mut cx) {
        Poll::Ready(_) => true,
        Poll::Pending => false,
    }
}

struct Task {
    fut: Option<Pin<Box<dyn Future<Output = ()>>>>,
    waker: Rc<WakerData>,
    queued: bool,
}

struct TasksData {
    nodes: Slab<Task>,
    next: VecDeque<usize>,
}

struct Tasks {
    data: RefCell<TasksData>,
}

impl Tasks {
    fn new(max: usize) -> Rc<Self> {
        Rc::new(Self {
            data: RefCell::new(TasksData {
                nodes: Slab::with_capacity(max),
                next: VecDeque::with_capacity(max),
            }),
        })
    }

    fn is_empty(&self) -> bool {
        self.data.borrow().nodes.is_empty()
    }

    fn add<F>(self: &Rc<Self>, fut: F) -> Result<(), ()>
    where
        F: Future<Output = ()> + 'static,
    {
        let data = &mut *self.data.borrow_mut();

        if data.nodes.len() == data.nodes.capacity() {
            return Err(());
        }

        let entry = data.nodes.vacant_entry();
        let task_id = entry.key();

        entry.insert(Task {
            fut: Some(Box::pin(fut)),
            waker: Rc::new(WakerData {
                tasks: Rc::downgrade(self),
                task_id,
            }),
            queued: true,
        });

        data.next.push_back(task_id);

        Ok(())
    }

    fn remove(&self, task_id: usize) {
        let data = &mut *self.data.borrow_mut();

        // drop the future. this should cause it to drop any owned wakers
        data.nodes[task_id].fut = None;

        data.nodes.remove(task_id);
    }

    fn take_next(&self) -> Option<(usize, Pin<Box<dyn Future<Output = ()>>>, Waker)> {
        let data = &mut *self.data.borrow_mut();

        loop {
            let task_id = data.next.pop_front()?;

            // a queue entry may be stale if the task already completed
            let task = match data.nodes.get_mut(task_id) {
                Some(task) => task,
                None => continue,
            };

            task.queued = false;

            let fut = task.fut.take().unwrap();
            let waker = task.waker.as_std_waker();

            return Some((task_id, fut, waker));
        }
    }

    fn set_fut(&self, task_id: usize, fut: Pin<Box<dyn Future<Output = ()>>>) {
        let data = &mut *self.data.borrow_mut();

        data.nodes[task_id].fut = Some(fut);
    }

    fn wake(&self, task_id: usize) {
        let data = &mut *self.data.borrow_mut();

        if let Some(task) = data.nodes.get_mut(task_id) {
            if !task.queued && task.fut.is_some() {
                task.queued = true;
                data.next.push_back(task_id);
            } else if task.fut.is_none() {
                // woken while being polled. requeue so the poll loop
                // sees it again
                data.next.push_back(task_id);
            }
        }
    }
}

pub struct Executor {
    tasks: Rc<Tasks>,
}

impl Executor {
    pub fn new(tasks_max: usize) -> Self {
        let tasks = Tasks::new(tasks_max);

        EXECUTOR.with(|ex| {
            if ex.borrow().is_some() {
                panic!("thread already has an Executor");
            }

            ex.replace(Some(Rc::downgrade(&tasks)));
        });

        Self { tasks }
    }

    pub fn spawn<F>(&self, fut: F) -> Result<(), ()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.tasks.add(fut)
    }

    pub fn have_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn run_until_stalled(&self) {
        while let Some((task_id, mut fut, waker)) = self.tasks.take_next() {
            let done = poll_fut(&mut fut, waker);

            // take_next() took the future out of the task, so we could
            // poll it without holding a borrow of the task set
            self.tasks.set_fut(task_id, fut);

            if done {
                self.tasks.remove(task_id);
            }
        }
    }

    pub fn run<F>(&self, mut park: F) -> Result<(), io::Error>
    where
        F: FnMut() -> Result<(), io::Error>,
    {
        loop {
            self.run_until_stalled();

            if !self.have_tasks() {
                break;
            }

            park()?;
        }

        Ok(())
    }

    pub fn current() -> Option<Self> {
        EXECUTOR.with(|ex| {
            (*ex.borrow()).as_ref().map(|tasks| Self {
                tasks: tasks.upgrade().expect("executor dropped"),
            })
        })
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        EXECUTOR.with(|ex| {
            if Rc::strong_count(&self.tasks) == 1 {
                ex.replace(None);
            }
        });
    }
}
