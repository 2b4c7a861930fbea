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

use crate::ticker::format_http_date;
use std::fmt::Write;

// request Cookie header into (name, value) pairs, preserving order
pub fn parse_cookie_header(value: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();

    for part in value.split(';') {
        let part = part.trim();

        if part.is_empty() {
            continue;
        }

        match part.split_once('=') {
            Some((name, value)) => out.push((name.to_string(), value.to_string())),
            None => out.push((part.to_string(), String::new())),
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum CookieAttribute {
    // e.g. "HttpOnly", "Secure"
    Flag(String),
    // e.g. ("max-age", "60"), ("path", "/")
    KeyValue(String, String),
}

// Set-Cookie value: "name=value; attr; key=val; ...". attribute names
// are lowercased. a max-age without an expires gets an expires
// synthesized from now + max-age
pub fn format_set_cookie(
    name: &str,
    value: &str,
    attributes: &[CookieAttribute],
    now_unix: u64,
) -> String {
    let mut out = String::new();

    write!(&mut out, "{}={}", name, value).unwrap();

    let mut max_age = None;
    let mut have_expires = false;

    for attr in attributes {
        match attr {
            CookieAttribute::Flag(flag) => {
                write!(&mut out, "; {}", flag.to_ascii_lowercase()).unwrap();
            }
            CookieAttribute::KeyValue(key, val) => {
                let key = key.to_ascii_lowercase();

                if key == "max-age" {
                    max_age = val.parse::<u64>().ok();
                } else if key == "expires" {
                    have_expires = true;
                }

                write!(&mut out, "; {}={}", key, val).unwrap();
            }
        }
    }

    if let (Some(max_age), false) = (max_age, have_expires) {
        write!(
            &mut out,
            "; expires={}",
            format_http_date(now_unix + max_age)
        )
        .unwrap();
    }

    out
}
