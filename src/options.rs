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

use serde::Deserialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use thiserror::Error;

pub const SERVER_TOKEN: &str = concat!("aerys/", env!("CARGO_PKG_VERSION"));

pub const MAX_DEFLATE_ENABLE_CACHE_SIZE: usize = 1024;

// per-process memoization attached to the otherwise immutable Options.
// mutated only from the event loop, so interior mutability without
// locking is fine
#[derive(Debug, Default)]
pub struct DynamicCache {
    deflate_content_types: RefCell<VecDeque<(String, bool)>>,
}

impl DynamicCache {
    pub fn deflate_decision(&self, content_type: &str) -> Option<bool> {
        let cache = self.deflate_content_types.borrow();

        cache
            .iter()
            .find(|(ct, _)| ct == content_type)
            .map(|&(_, decision)| decision)
    }

    pub fn store_deflate_decision(&self, content_type: &str, decision: bool) {
        let cache = &mut *self.deflate_content_types.borrow_mut();

        // evict the oldest entry before inserting at the cap
        if cache.len() == MAX_DEFLATE_ENABLE_CACHE_SIZE {
            cache.pop_front();
        }

        cache.push_back((content_type.to_string(), decision));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.deflate_content_types.borrow().len()
    }
}

fn default_true() -> bool {
    true
}

fn default_allowed_methods() -> Vec<String> {
    ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_deflate_content_types() -> Vec<String> {
    [
        "text/*",
        "*/xml",
        "*+xml",
        "application/json",
        "application/javascript",
        "application/x-javascript",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// process-wide knobs, immutable after boot apart from dynamic_cache.
// deserializable so embedders can populate it from whatever config
// source they use; file loading itself lives outside the core
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    pub max_body_size: usize,
    pub max_header_size: usize,
    pub max_input_vars: usize,
    pub max_field_len: usize,
    pub max_connections: usize,
    pub connections_per_ip: usize,

    // seconds without read/write progress before a connection is closed
    pub connection_timeout: u64,

    // soft watermark on the per-client write buffer
    pub output_buffer_size: usize,

    // backpressure threshold for body-emit queues
    pub soft_stream_cap: usize,

    pub deflate_enable: bool,
    pub deflate_minimum_length: usize,
    pub deflate_content_types: Vec<String>,
    pub deflate_buffer_size: usize,

    pub chunk_size: usize,

    pub send_server_token: bool,

    pub socket_backlog_size: u32,
    pub normalize_method_case: bool,
    pub allowed_methods: Vec<String>,
    pub default_host: Option<String>,

    // seconds to wait for in-flight responses during shutdown
    pub shutdown_timeout: u64,

    #[serde(skip)]
    pub dynamic_cache: DynamicCache,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_body_size: 131_072,
            max_header_size: 32_768,
            max_input_vars: 200,
            max_field_len: 16_384,
            max_connections: 1000,
            connections_per_ip: 30,
            connection_timeout: 15,
            output_buffer_size: 65_536,
            soft_stream_cap: 131_072,
            deflate_enable: true,
            deflate_minimum_length: 860,
            deflate_content_types: default_deflate_content_types(),
            deflate_buffer_size: 8192,
            chunk_size: 8192,
            send_server_token: default_true(),
            socket_backlog_size: 128,
            normalize_method_case: false,
            allowed_methods: default_allowed_methods(),
            default_host: None,
            shutdown_timeout: 5,
            dynamic_cache: DynamicCache::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Size(usize),
    Secs(u64),
    Flag(bool),
    Str(String),
    List(Vec<String>),
}

#[derive(Debug, Error)]
#[error("unknown option: {0}")]
pub struct UnknownOptionError(pub String);

impl Options {
    // dynamic lookup for the application api. unknown names are an
    // error rather than a silent None
    pub fn get(&self, name: &str) -> Result<OptionValue, UnknownOptionError> {
        let v = match name {
            "max_body_size" => OptionValue::Size(self.max_body_size),
            "max_header_size" => OptionValue::Size(self.max_header_size),
            "max_input_vars" => OptionValue::Size(self.max_input_vars),
            "max_field_len" => OptionValue::Size(self.max_field_len),
            "max_connections" => OptionValue::Size(self.max_connections),
            "connections_per_ip" => OptionValue::Size(self.connections_per_ip),
            "connection_timeout" => OptionValue::Secs(self.connection_timeout),
            "output_buffer_size" => OptionValue::Size(self.output_buffer_size),
            "soft_stream_cap" => OptionValue::Size(self.soft_stream_cap),
            "deflate_enable" => OptionValue::Flag(self.deflate_enable),
            "deflate_minimum_length" => OptionValue::Size(self.deflate_minimum_length),
            "deflate_content_types" => OptionValue::List(self.deflate_content_types.clone()),
            "deflate_buffer_size" => OptionValue::Size(self.deflate_buffer_size),
            "chunk_size" => OptionValue::Size(self.chunk_size),
            "send_server_token" => OptionValue::Flag(self.send_server_token),
            "socket_backlog_size" => OptionValue::Size(self.socket_backlog_size as usize),
            "normalize_method_case" => OptionValue::Flag(self.normalize_method_case),
            "allowed_methods" => OptionValue::List(self.allowed_methods.clone()),
            "default_host" => {
                OptionValue::Str(self.default_host.clone().unwrap_or_default())
            }
            "shutdown_timeout" => OptionValue::Secs(self.shutdown_timeout),
            _ => return Err(UnknownOptionError(name.to_string())),
        };

        Ok(v)
    }

    pub fn method_allowed(&self, method: &str) -> bool {
        self.allowed_methods.iter().any(|m| m == method)
    }
}
