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
use url::form_urlencoded;

// x-www-form-urlencoded pairs, percent-decoded, repeated keys kept in
// insertion order. exceeding max_vars or max_field_len is a size fault
pub fn parse_query(
    query: &str,
    max_vars: usize,
    max_field_len: usize,
) -> Result<Vec<(String, String)>, Error> {
    let mut out = Vec::new();

    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
        if out.len() == max_vars {
            return Err(Error::ClientSize);
        }

        if name.len() > max_field_len || value.len() > max_field_len {
            return Err(Error::ClientSize);
        }

        out.push((name.into_owned(), value.into_owned()));
    }

    Ok(out)
}

pub fn first_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}
