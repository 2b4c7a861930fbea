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
use crate::options::Options;
use crate::pipeline::{CodecItem, EntityLength, Filter, ResponseHead};
use crate::request::Protocol;
use flate2::{Compress, Compression, FlushCompress, Status};
use std::fmt::Write as _;
use std::rc::Rc;

const CHUNK_SIZE_MAX: usize = 0xffff;

// drops body bytes for responses that must not carry one: replies to
// HEAD, and 1xx/204/304 statuses
pub struct NullBodyFilter {
    head_request: bool,
    active: bool,
}

impl NullBodyFilter {
    pub fn new(request_method: &str) -> Self {
        Self {
            head_request: request_method.eq_ignore_ascii_case("HEAD"),
            active: false,
        }
    }
}

impl Filter for NullBodyFilter {
    fn key(&self) -> &'static str {
        "null-body"
    }

    fn apply(&mut self, item: CodecItem, out: &mut Vec<CodecItem>) -> Result<(), Error> {
        match item {
            CodecItem::Headers(mut head) => {
                self.active = self.head_request
                    || matches!(head.status, 100..=199 | 204 | 304);

                if self.active {
                    head.entity_length = EntityLength::NoBody;
                }

                out.push(CodecItem::Headers(head));
            }
            CodecItem::Chunk(_) if self.active => {}
            item => out.push(item),
        }

        Ok(())
    }
}

fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    let value = match accept_encoding {
        Some(v) => v,
        None => return false,
    };

    for item in value.split(',') {
        let mut parts = item.split(';');

        let coding = parts.next().unwrap().trim();

        if !coding.eq_ignore_ascii_case("gzip") && coding != "*" {
            continue;
        }

        for param in parts {
            let param = param.trim();

            if let Some(q) = param.strip_prefix("q=") {
                if q.trim().parse::<f32>().map(|q| q == 0.0).unwrap_or(false) {
                    return false;
                }
            }
        }

        return true;
    }

    false
}

fn content_type_matches(patterns: &[String], content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap()
        .trim()
        .to_ascii_lowercase();

    for p in patterns {
        if p == "*" || p.eq_ignore_ascii_case(&ct) {
            return true;
        }

        if let Some(suffix) = p.strip_prefix('*') {
            if ct.ends_with(&suffix.to_ascii_lowercase()) {
                return true;
            }
        } else if let Some(prefix) = p.strip_suffix('*') {
            if ct.starts_with(&prefix.to_ascii_lowercase()) {
                return true;
            }
        }
    }

    false
}

enum DeflateState {
    AwaitHeaders,
    // holding headers and body until the minimum length is reached
    Buffering(Box<ResponseHead>, Vec<u8>),
    Compressing(Box<Compress>),
    PassThrough,
}

// gzip-compresses eligible responses. the decision depends on the
// request's Accept-Encoding, the response content type (memoized in
// the per-process decision cache), and the configured minimum length.
// a response that ends before reaching the minimum passes through
// untouched with its original headers
pub struct DeflateResponseFilter {
    options: Rc<Options>,
    accept_gzip: bool,
    state: DeflateState,
}

impl DeflateResponseFilter {
    pub fn new(options: Rc<Options>, accept_encoding: Option<&str>) -> Self {
        let accept_gzip = accepts_gzip(accept_encoding);

        Self {
            options,
            accept_gzip,
            state: DeflateState::AwaitHeaders,
        }
    }

    fn should_compress(&self, head: &ResponseHead) -> bool {
        if !self.options.deflate_enable || !self.accept_gzip {
            return false;
        }

        if head.headers.contains("content-encoding") {
            return false;
        }

        let content_type = match head.headers.get("content-type") {
            Some(ct) => ct,
            None => return false,
        };

        let cache = &self.options.dynamic_cache;

        match cache.deflate_decision(content_type) {
            Some(decision) => decision,
            None => {
                let decision =
                    content_type_matches(&self.options.deflate_content_types, content_type);

                cache.store_deflate_decision(content_type, decision);

                decision
            }
        }
    }

    fn start_compressing(
        &mut self,
        mut head: Box<ResponseHead>,
        buffered: Vec<u8>,
        out: &mut Vec<CodecItem>,
    ) -> Result<(), Error> {
        head.headers.remove("content-length");
        head.headers.set("content-encoding", "gzip");
        head.entity_length = EntityLength::Unknown;

        out.push(CodecItem::Headers(*head));

        let mut compress = Box::new(Compress::new_gzip(Compression::default(), 15));

        if !buffered.is_empty() {
            Self::run_compress(
                &mut compress,
                &buffered,
                FlushCompress::None,
                self.options.deflate_buffer_size,
                out,
            )?;
        }

        self.state = DeflateState::Compressing(compress);

        Ok(())
    }

    fn run_compress(
        compress: &mut Compress,
        data: &[u8],
        mode: FlushCompress,
        buffer_size: usize,
        out: &mut Vec<CodecItem>,
    ) -> Result<(), Error> {
        let mut input = data;

        loop {
            if input.is_empty() && matches!(mode, FlushCompress::None) {
                break;
            }

            let before_in = compress.total_in();
            let before_out = compress.total_out();

            let mut outbuf = vec![0; buffer_size];

            let status = compress
                .compress(input, &mut outbuf, mode)
                .map_err(|e| Error::Internal(format!("deflate failed: {}", e)))?;

            let consumed = (compress.total_in() - before_in) as usize;
            let produced = (compress.total_out() - before_out) as usize;

            input = &input[consumed..];

            if produced > 0 {
                outbuf.truncate(produced);
                out.push(CodecItem::Chunk(outbuf));
            }

            match mode {
                FlushCompress::None => {
                    if input.is_empty() {
                        break;
                    }
                }
                FlushCompress::Sync => {
                    if input.is_empty() && produced < buffer_size {
                        break;
                    }
                }
                FlushCompress::Finish => {
                    if status == Status::StreamEnd {
                        break;
                    }
                }
                _ => unreachable!(),
            }

            if consumed == 0 && produced == 0 {
                return Err(Error::Internal("deflate made no progress".into()));
            }
        }

        Ok(())
    }
}

impl Filter for DeflateResponseFilter {
    fn key(&self) -> &'static str {
        "deflate"
    }

    fn apply(&mut self, item: CodecItem, out: &mut Vec<CodecItem>) -> Result<(), Error> {
        match item {
            CodecItem::Headers(head) => {
                assert!(matches!(self.state, DeflateState::AwaitHeaders));

                if !self.should_compress(&head) {
                    self.state = DeflateState::PassThrough;
                    out.push(CodecItem::Headers(head));

                    return Ok(());
                }

                match head.entity_length {
                    EntityLength::NoBody => {
                        self.state = DeflateState::PassThrough;
                        out.push(CodecItem::Headers(head));
                    }
                    EntityLength::Known(n) if n < self.options.deflate_minimum_length => {
                        self.state = DeflateState::PassThrough;
                        out.push(CodecItem::Headers(head));
                    }
                    EntityLength::Known(_) => {
                        self.start_compressing(Box::new(head), Vec::new(), out)?;
                    }
                    EntityLength::Unknown => {
                        // hold everything until we know the body will
                        // reach the minimum length
                        self.state = DeflateState::Buffering(Box::new(head), Vec::new());
                    }
                }
            }
            CodecItem::Chunk(data) => match &mut self.state {
                DeflateState::PassThrough => out.push(CodecItem::Chunk(data)),
                DeflateState::Buffering(_, buf) => {
                    buf.extend_from_slice(&data);

                    if buf.len() >= self.options.deflate_minimum_length {
                        let (head, buf) = match std::mem::replace(
                            &mut self.state,
                            DeflateState::AwaitHeaders,
                        ) {
                            DeflateState::Buffering(head, buf) => (head, buf),
                            _ => unreachable!(),
                        };

                        self.start_compressing(head, buf, out)?;
                    }
                }
                DeflateState::Compressing(compress) => {
                    Self::run_compress(
                        compress,
                        &data,
                        FlushCompress::None,
                        self.options.deflate_buffer_size,
                        out,
                    )?;
                }
                DeflateState::AwaitHeaders => unreachable!(),
            },
            CodecItem::Flush => match &mut self.state {
                DeflateState::Buffering(_, _) => {
                    // the user wants bytes on the wire now, so stop
                    // waiting for the minimum
                    let (head, buf) =
                        match std::mem::replace(&mut self.state, DeflateState::AwaitHeaders) {
                            DeflateState::Buffering(head, buf) => (head, buf),
                            _ => unreachable!(),
                        };

                    self.start_compressing(head, buf, out)?;

                    if let DeflateState::Compressing(compress) = &mut self.state {
                        Self::run_compress(
                            compress,
                            &[],
                            FlushCompress::Sync,
                            self.options.deflate_buffer_size,
                            out,
                        )?;
                    }

                    out.push(CodecItem::Flush);
                }
                DeflateState::Compressing(compress) => {
                    Self::run_compress(
                        compress,
                        &[],
                        FlushCompress::Sync,
                        self.options.deflate_buffer_size,
                        out,
                    )?;

                    out.push(CodecItem::Flush);
                }
                _ => out.push(CodecItem::Flush),
            },
            CodecItem::End => match std::mem::replace(&mut self.state, DeflateState::PassThrough) {
                DeflateState::Buffering(head, buf) => {
                    // ended under the minimum: pass through unchanged
                    out.push(CodecItem::Headers(*head));

                    if !buf.is_empty() {
                        out.push(CodecItem::Chunk(buf));
                    }

                    out.push(CodecItem::End);
                }
                DeflateState::Compressing(mut compress) => {
                    Self::run_compress(
                        &mut compress,
                        &[],
                        FlushCompress::Finish,
                        self.options.deflate_buffer_size,
                        out,
                    )?;

                    out.push(CodecItem::End);
                }
                _ => out.push(CodecItem::End),
            },
        }

        Ok(())
    }
}

// http/1.1 chunked transfer framing for responses of unknown length.
// installed last in the chain so it sees the final byte stream
pub struct ChunkedEncodingFilter {
    protocol: Protocol,
    chunk_size: usize,
    active: bool,
}

impl ChunkedEncodingFilter {
    pub fn new(protocol: Protocol, chunk_size: usize) -> Self {
        Self {
            protocol,
            chunk_size: chunk_size.clamp(1, CHUNK_SIZE_MAX),
            active: false,
        }
    }

    fn frame(&self, data: &[u8], out: &mut Vec<CodecItem>) {
        for piece in data.chunks(self.chunk_size) {
            let mut framed = Vec::with_capacity(piece.len() + 8);

            let mut header = String::new();
            write!(&mut header, "{:x}\r\n", piece.len()).unwrap();

            framed.extend_from_slice(header.as_bytes());
            framed.extend_from_slice(piece);
            framed.extend_from_slice(b"\r\n");

            out.push(CodecItem::Chunk(framed));
        }
    }
}

impl Filter for ChunkedEncodingFilter {
    fn key(&self) -> &'static str {
        "chunked"
    }

    fn apply(&mut self, item: CodecItem, out: &mut Vec<CodecItem>) -> Result<(), Error> {
        match item {
            CodecItem::Headers(mut head) => {
                self.active = self.protocol == Protocol::Http11
                    && head.entity_length == EntityLength::Unknown
                    && head.status != 101;

                if self.active {
                    head.headers.set("transfer-encoding", "chunked");
                }

                out.push(CodecItem::Headers(head));
            }
            CodecItem::Chunk(data) if self.active => {
                if !data.is_empty() {
                    self.frame(&data, out);
                }
            }
            CodecItem::End if self.active => {
                out.push(CodecItem::Chunk(b"0\r\n\r\n".to_vec()));
                out.push(CodecItem::End);
            }
            item => out.push(item),
        }

        Ok(())
    }
}

// the standard per-request chain in front of a protocol driver
pub fn standard_filters(
    options: &Rc<Options>,
    request_method: &str,
    accept_encoding: Option<&str>,
    protocol: Protocol,
) -> Vec<Box<dyn Filter>> {
    let mut filters: Vec<Box<dyn Filter>> = Vec::new();

    filters.push(Box::new(NullBodyFilter::new(request_method)));
    filters.push(Box::new(DeflateResponseFilter::new(
        Rc::clone(options),
        accept_encoding,
    )));

    if protocol == Protocol::Http11 {
        filters.push(Box::new(ChunkedEncodingFilter::new(
            protocol,
            options.chunk_size,
        )));
    }

    filters
}
