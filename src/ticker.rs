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

use crate::future::{select_2, sleep, CancellationToken, Select2};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::macros::format_description;
use time::OffsetDateTime;

// http-date (IMF-fixdate), e.g. "Sun, 06 Nov 1994 08:49:37 GMT"
pub fn format_http_date(unix_time: u64) -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );

    let dt = OffsetDateTime::from_unix_timestamp(unix_time as i64)
        .expect("unix time out of range");

    dt.format(&format).expect("failed to format date")
}

struct TickerData {
    unix_time: Cell<u64>,
    http_date: RefCell<Rc<String>>,
}

// once-per-second clock shared by all connections of a worker. requests
// stamp their time and Date header from here instead of hitting the
// system clock
#[derive(Clone)]
pub struct Ticker {
    data: Rc<TickerData>,
}

impl Ticker {
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_secs();

        Self {
            data: Rc::new(TickerData {
                unix_time: Cell::new(now),
                http_date: RefCell::new(Rc::new(format_http_date(now))),
            }),
        }
    }

    pub fn unix_time(&self) -> u64 {
        self.data.unix_time.get()
    }

    pub fn http_date(&self) -> Rc<String> {
        Rc::clone(&self.data.http_date.borrow())
    }

    pub fn update(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_secs();

        if now != self.data.unix_time.get() {
            self.data.unix_time.set(now);
            self.data.http_date.replace(Rc::new(format_http_date(now)));
        }
    }

    #[cfg(test)]
    pub fn set_time(&self, unix_time: u64) {
        self.data.unix_time.set(unix_time);
        self.data
            .http_date
            .replace(Rc::new(format_http_date(unix_time)));
    }

    // refresh once per second until stopped
    pub async fn run(self, stop: CancellationToken) {
        loop {
            match select_2(stop.cancelled(), sleep(Duration::from_secs(1))).await {
                Select2::R1(_) => break,
                Select2::R2(_) => self.update(),
            }
        }
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_http_date() {
        // 1994-11-06 08:49:37 UTC, the classic example date
        assert_eq!(format_http_date(784111777), "Sun, 06 Nov 1994 08:49:37 GMT");

        assert_eq!(format_http_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn test_ticker() {
        let ticker = Ticker::new();

        ticker.set_time(784111777);

        assert_eq!(ticker.unix_time(), 784111777);
        assert_eq!(
            ticker.http_date().as_str(),
            "Sun, 06 Nov 1994 08:49:37 GMT"
        );
    }
}
