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

use std::fmt;

fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[derive(Debug, Clone)]
struct HeaderEntry {
    name: String,
    values: Vec<String>,
}

// insertion-order-preserving multimap keyed by the case-folded field
// name. original casing survives only in a request's trace, which is
// kept separately for wire fidelity
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<HeaderEntry>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Option<&HeaderEntry> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut HeaderEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn add<V: Into<String>>(&mut self, name: &str, value: V) {
        match self.entry_mut(name) {
            Some(e) => e.values.push(value.into()),
            None => self.entries.push(HeaderEntry {
                name: fold(name),
                values: vec![value.into()],
            }),
        }
    }

    // replace all values of the field
    pub fn set<V: Into<String>>(&mut self, name: &str, value: V) {
        match self.entry_mut(name) {
            Some(e) => {
                e.values.clear();
                e.values.push(value.into());
            }
            None => self.entries.push(HeaderEntry {
                name: fold(name),
                values: vec![value.into()],
            }),
        }
    }

    // first value for the field, any input casing
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entry(name).map(|e| e.values[0].as_str())
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        match self.entry(name) {
            Some(e) => &e.values,
            None => &[],
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();

        self.entries.retain(|e| !e.name.eq_ignore_ascii_case(name));

        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // (folded name, value) pairs, fields in insertion order of their
    // first occurrence
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|e| {
            e.values
                .iter()
                .map(move |v| (e.name.as_str(), v.as_str()))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    // whether a comma-separated list field contains the given token,
    // compared case-insensitively
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        for value in self.get_all(name) {
            for part in value.split(',') {
                if part.trim().eq_ignore_ascii_case(token) {
                    return true;
                }
            }
        }

        false
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "{}: {}", name, value)?;
        }

        Ok(())
    }
}
