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

use super::frame::*;
use super::hpack;
use log::debug;
use std::cmp;
use std::collections::HashMap;

// replenish receive windows once this many bytes were consumed
const WINDOW_UPDATE_THRESHOLD: usize = (DEFAULT_WINDOW_SIZE / 2) as usize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

struct Stream {
    state: StreamState,
    send_window: i64,
    recv_window: i64,
    recv_replenish: usize,
    // dependency/weight hints are recorded but not acted upon
    weight: u8,
    depends_on: u32,
}

impl Stream {
    fn new(send_window: i64, recv_window: i64) -> Self {
        Self {
            state: StreamState::Idle,
            send_window,
            recv_window,
            recv_replenish: 0,
            weight: 16,
            depends_on: 0,
        }
    }
}

// a connection-scope fault. the protocol has already queued a GOAWAY
// when one of these is returned
#[derive(Debug)]
pub struct ConnectionError {
    pub code: u32,
    pub msg: String,
}

impl ConnectionError {
    fn new(code: u32, msg: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Event {
    // a complete request head arrived on a client stream
    Request {
        stream_id: u32,
        fields: Vec<(String, String)>,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
    },
    Trailers {
        stream_id: u32,
        fields: Vec<(String, String)>,
    },
    Reset {
        stream_id: u32,
        error_code: u32,
    },
    // send windows grew; blocked writers should retry
    WindowOpened,
    GoAway {
        last_stream_id: u32,
        error_code: u32,
    },
}

// frame-level state machine for the server side of one connection.
// sans-io: recv() consumes raw bytes and yields events; send methods
// append protocol-ready bytes to an output queue the caller drains
pub struct ServerProtocol {
    local_settings: Settings,
    peer_settings: Settings,
    decoder: hpack::Decoder,
    encoder: hpack::Encoder,
    streams: HashMap<u32, Stream>,
    last_client_stream: u32,
    next_push_stream: u32,
    conn_send_window: i64,
    conn_recv_window: i64,
    conn_recv_replenish: usize,
    preface_done: bool,
    settings_sent: bool,
    // an in-progress header block: (stream id, initial flags, fragments)
    continuation: Option<(u32, u8, Vec<u8>)>,
    goaway_sent: bool,
    out: Vec<u8>,
}

impl ServerProtocol {
    pub fn new() -> Self {
        let local_settings = Settings::default();

        Self {
            decoder: hpack::Decoder::new(local_settings.header_table_size as usize),
            encoder: hpack::Encoder::new(Settings::default().header_table_size as usize),
            local_settings,
            peer_settings: Settings::default(),
            streams: HashMap::new(),
            last_client_stream: 0,
            next_push_stream: 2,
            conn_send_window: DEFAULT_WINDOW_SIZE as i64,
            conn_recv_window: DEFAULT_WINDOW_SIZE as i64,
            conn_recv_replenish: 0,
            preface_done: false,
            settings_sent: false,
            continuation: None,
            goaway_sent: false,
            out: Vec::new(),
        }
    }

    pub fn peer_settings(&self) -> &Settings {
        &self.peer_settings
    }

    pub fn goaway_sent(&self) -> bool {
        self.goaway_sent
    }

    pub fn stream_state(&self, stream_id: u32) -> StreamState {
        match self.streams.get(&stream_id) {
            Some(s) => s.state,
            None => {
                if stream_id <= self.last_client_stream {
                    StreamState::Closed
                } else {
                    StreamState::Idle
                }
            }
        }
    }

    pub fn conn_send_window(&self) -> i64 {
        self.conn_send_window
    }

    pub fn stream_send_window(&self, stream_id: u32) -> i64 {
        self.streams
            .get(&stream_id)
            .map(|s| s.send_window)
            .unwrap_or(0)
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    pub fn have_output(&self) -> bool {
        !self.out.is_empty()
    }

    // queue our SETTINGS. must be the first thing on the wire
    pub fn start(&mut self) {
        assert!(!self.settings_sent);

        self.local_settings.serialize(&mut self.out);
        self.settings_sent = true;
    }

    // consume as many complete frames as buf holds. returns consumed
    // byte count and the events produced
    pub fn recv(&mut self, buf: &[u8]) -> Result<(usize, Vec<Event>), ConnectionError> {
        let mut pos = 0;
        let mut events = Vec::new();

        if !self.preface_done {
            if buf.len() < PREFACE.len() {
                return Ok((0, events));
            }

            if &buf[..PREFACE.len()] != PREFACE {
                return Err(self.connection_error(PROTOCOL_ERROR, "bad connection preface"));
            }

            pos += PREFACE.len();
            self.preface_done = true;
        }

        loop {
            let header = match FrameHeader::parse(&buf[pos..]) {
                Some(header) => header,
                None => break,
            };

            if header.len > self.local_settings.max_frame_size {
                return Err(self.connection_error(FRAME_SIZE_ERROR, "frame too large"));
            }

            if buf.len() - pos < FRAME_HEADER_SIZE + header.len {
                break;
            }

            let payload = &buf[(pos + FRAME_HEADER_SIZE)..(pos + FRAME_HEADER_SIZE + header.len)];

            pos += FRAME_HEADER_SIZE + header.len;

            self.process_frame(header, payload, &mut events)?;
        }

        Ok((pos, events))
    }

    fn process_frame(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<(), ConnectionError> {
        // while a header block is open, only its continuations may
        // arrive
        if let Some((stream_id, _, _)) = &self.continuation {
            if header.frame_type != FRAME_CONTINUATION || header.stream_id != *stream_id {
                return Err(
                    self.connection_error(PROTOCOL_ERROR, "expected continuation frame")
                );
            }
        }

        match header.frame_type {
            FRAME_DATA => self.process_data(header, payload, events),
            FRAME_HEADERS => self.process_headers(header, payload, events),
            FRAME_PRIORITY => self.process_priority(header, payload),
            FRAME_RST_STREAM => self.process_rst_stream(header, payload, events),
            FRAME_SETTINGS => self.process_settings(header, payload, events),
            FRAME_PUSH_PROMISE => {
                Err(self.connection_error(PROTOCOL_ERROR, "push promise from client"))
            }
            FRAME_PING => self.process_ping(header, payload),
            FRAME_GOAWAY => self.process_goaway(header, payload, events),
            FRAME_WINDOW_UPDATE => self.process_window_update(header, payload, events),
            FRAME_CONTINUATION => self.process_continuation(header, payload, events),
            // unknown frame types are ignored
            _ => Ok(()),
        }
    }

    fn process_data(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<(), ConnectionError> {
        if header.stream_id == 0 {
            return Err(self.connection_error(PROTOCOL_ERROR, "data frame on stream 0"));
        }

        // flow control counts the whole payload, padding included
        self.conn_recv_window -= payload.len() as i64;

        if self.conn_recv_window < 0 {
            return Err(self.connection_error(FLOW_CONTROL_ERROR, "connection window underflow"));
        }

        let data = strip_padding(header.flags, payload)
            .ok_or_else(|| self.connection_error(PROTOCOL_ERROR, "bad padding"))?;

        let stream = match self.streams.get_mut(&header.stream_id) {
            Some(stream) => stream,
            None => {
                // data on an already-reclaimed stream only costs a
                // reset, but its bytes still occupied the connection
                // window
                self.queue_rst_stream(header.stream_id, STREAM_CLOSED);
                self.replenish_conn(payload.len());

                return Ok(());
            }
        };

        stream.recv_window -= payload.len() as i64;

        if stream.recv_window < 0 {
            return Err(self.connection_error(FLOW_CONTROL_ERROR, "stream window underflow"));
        }

        match stream.state {
            StreamState::Open | StreamState::HalfClosedLocal => {}
            _ => {
                self.queue_rst_stream(header.stream_id, STREAM_CLOSED);
                self.replenish_conn(payload.len());

                return Ok(());
            }
        }

        let end_stream = header.flags & FLAG_END_STREAM != 0;

        if end_stream {
            self.half_close_remote(header.stream_id);
        }

        events.push(Event::Data {
            stream_id: header.stream_id,
            data: data.to_vec(),
            end_stream,
        });

        Ok(())
    }

    fn process_headers(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<(), ConnectionError> {
        if header.stream_id == 0 {
            return Err(self.connection_error(PROTOCOL_ERROR, "headers frame on stream 0"));
        }

        let mut fragment = strip_padding(header.flags, payload)
            .ok_or_else(|| self.connection_error(PROTOCOL_ERROR, "bad padding"))?;

        // priority information may prefix the fragment
        if header.flags & FLAG_PRIORITY != 0 {
            if fragment.len() < 5 {
                return Err(self.connection_error(FRAME_SIZE_ERROR, "short priority prefix"));
            }

            fragment = &fragment[5..];
        }

        if header.flags & FLAG_END_HEADERS == 0 {
            self.continuation = Some((header.stream_id, header.flags, fragment.to_vec()));

            return Ok(());
        }

        self.finish_header_block(header.stream_id, header.flags, fragment.to_vec(), events)
    }

    fn process_continuation(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<(), ConnectionError> {
        let (stream_id, flags, mut block) = match self.continuation.take() {
            Some(c) => c,
            None => {
                return Err(
                    self.connection_error(PROTOCOL_ERROR, "continuation without headers")
                );
            }
        };

        block.extend_from_slice(payload);

        if header.flags & FLAG_END_HEADERS == 0 {
            if block.len() > self.local_settings.max_frame_size * 8 {
                return Err(self.connection_error(ENHANCE_YOUR_CALM, "header block too large"));
            }

            self.continuation = Some((stream_id, flags, block));

            return Ok(());
        }

        self.finish_header_block(stream_id, flags, block, events)
    }

    fn finish_header_block(
        &mut self,
        stream_id: u32,
        flags: u8,
        block: Vec<u8>,
        events: &mut Vec<Event>,
    ) -> Result<(), ConnectionError> {
        let fields = match self.decoder.decode(&block) {
            Ok(fields) => fields,
            Err(_) => {
                return Err(self.connection_error(COMPRESSION_ERROR, "header block decode failed"));
            }
        };

        let end_stream = flags & FLAG_END_STREAM != 0;

        let state = self.stream_state(stream_id);

        match state {
            StreamState::Idle => {
                // new client-initiated stream: odd id, increasing
                if stream_id % 2 == 0 || stream_id <= self.last_client_stream {
                    return Err(self.connection_error(PROTOCOL_ERROR, "bad stream id"));
                }

                if self.goaway_sent {
                    self.queue_rst_stream(stream_id, REFUSED_STREAM);

                    return Ok(());
                }

                if let Some(max) = self.local_settings.max_concurrent_streams {
                    let open = self
                        .streams
                        .values()
                        .filter(|s| s.state != StreamState::Closed)
                        .count();

                    if open as u32 >= max {
                        self.queue_rst_stream(stream_id, REFUSED_STREAM);

                        return Ok(());
                    }
                }

                self.last_client_stream = stream_id;

                let mut stream = Stream::new(
                    self.peer_settings.initial_window_size as i64,
                    DEFAULT_WINDOW_SIZE as i64,
                );

                stream.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };

                self.streams.insert(stream_id, stream);

                if validate_request_fields(&fields).is_err() {
                    debug!("conn: stream {} malformed request head", stream_id);

                    self.reset_stream(stream_id, PROTOCOL_ERROR, events);

                    return Ok(());
                }

                events.push(Event::Request {
                    stream_id,
                    fields,
                    end_stream,
                });

                Ok(())
            }
            StreamState::Open | StreamState::HalfClosedLocal => {
                // a second HEADERS on an open stream is the trailer
                // section and must end the stream
                if !end_stream || fields.iter().any(|(n, _)| n.starts_with(':')) {
                    return Err(self.connection_error(PROTOCOL_ERROR, "bad trailers"));
                }

                self.half_close_remote(stream_id);

                events.push(Event::Trailers { stream_id, fields });

                Ok(())
            }
            _ => {
                self.queue_rst_stream(stream_id, STREAM_CLOSED);

                Ok(())
            }
        }
    }

    fn process_priority(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        if header.stream_id == 0 {
            return Err(self.connection_error(PROTOCOL_ERROR, "priority frame on stream 0"));
        }

        if payload.len() != 5 {
            return Err(self.connection_error(FRAME_SIZE_ERROR, "bad priority frame size"));
        }

        let depends_on =
            u32::from_be_bytes([payload[0] & 0x7f, payload[1], payload[2], payload[3]]);

        if depends_on == header.stream_id {
            return Err(self.connection_error(PROTOCOL_ERROR, "stream depends on itself"));
        }

        if let Some(stream) = self.streams.get_mut(&header.stream_id) {
            stream.depends_on = depends_on;
            stream.weight = payload[4];
        }

        Ok(())
    }

    fn process_rst_stream(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<(), ConnectionError> {
        if header.stream_id == 0 {
            return Err(self.connection_error(PROTOCOL_ERROR, "rst frame on stream 0"));
        }

        if payload.len() != 4 {
            return Err(self.connection_error(FRAME_SIZE_ERROR, "bad rst frame size"));
        }

        if self.stream_state(header.stream_id) == StreamState::Idle {
            return Err(self.connection_error(PROTOCOL_ERROR, "rst on idle stream"));
        }

        let error_code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

        if let Some(stream) = self.streams.get_mut(&header.stream_id) {
            stream.state = StreamState::Closed;
        }

        events.push(Event::Reset {
            stream_id: header.stream_id,
            error_code,
        });

        Ok(())
    }

    fn process_settings(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<(), ConnectionError> {
        if header.stream_id != 0 {
            return Err(self.connection_error(PROTOCOL_ERROR, "settings on a stream"));
        }

        if header.flags & FLAG_ACK != 0 {
            if !payload.is_empty() {
                return Err(self.connection_error(FRAME_SIZE_ERROR, "settings ack with payload"));
            }

            return Ok(());
        }

        let old_initial_window = self.peer_settings.initial_window_size;
        let old_header_table = self.peer_settings.header_table_size;

        if let Err(code) = self.peer_settings.apply(payload) {
            return Err(self.connection_error(code, "bad settings"));
        }

        // initial window changes retroactively adjust every stream
        if self.peer_settings.initial_window_size != old_initial_window {
            let delta = self.peer_settings.initial_window_size as i64 - old_initial_window as i64;

            for stream in self.streams.values_mut() {
                stream.send_window += delta;
            }

            if delta > 0 {
                events.push(Event::WindowOpened);
            }
        }

        if self.peer_settings.header_table_size != old_header_table {
            self.encoder
                .set_max_table_size(self.peer_settings.header_table_size as usize);
        }

        write_frame(&mut self.out, FRAME_SETTINGS, FLAG_ACK, 0, &[]);

        Ok(())
    }

    fn process_ping(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), ConnectionError> {
        if header.stream_id != 0 {
            return Err(self.connection_error(PROTOCOL_ERROR, "ping on a stream"));
        }

        if payload.len() != 8 {
            return Err(self.connection_error(FRAME_SIZE_ERROR, "bad ping frame size"));
        }

        if header.flags & FLAG_ACK == 0 {
            write_frame(&mut self.out, FRAME_PING, FLAG_ACK, 0, payload);
        }

        Ok(())
    }

    fn process_goaway(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<(), ConnectionError> {
        if header.stream_id != 0 {
            return Err(self.connection_error(PROTOCOL_ERROR, "goaway on a stream"));
        }

        if payload.len() < 8 {
            return Err(self.connection_error(FRAME_SIZE_ERROR, "bad goaway frame size"));
        }

        let last_stream_id =
            u32::from_be_bytes([payload[0] & 0x7f, payload[1], payload[2], payload[3]]);
        let error_code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);

        events.push(Event::GoAway {
            last_stream_id,
            error_code,
        });

        Ok(())
    }

    fn process_window_update(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<(), ConnectionError> {
        if payload.len() != 4 {
            return Err(self.connection_error(FRAME_SIZE_ERROR, "bad window update size"));
        }

        let increment =
            u32::from_be_bytes([payload[0] & 0x7f, payload[1], payload[2], payload[3]]) as i64;

        if increment == 0 {
            if header.stream_id == 0 {
                return Err(self.connection_error(PROTOCOL_ERROR, "zero window increment"));
            }

            self.reset_stream(header.stream_id, PROTOCOL_ERROR, events);

            return Ok(());
        }

        if header.stream_id == 0 {
            self.conn_send_window += increment;

            if self.conn_send_window > 0x7fff_ffff {
                return Err(self.connection_error(FLOW_CONTROL_ERROR, "window overflow"));
            }
        } else if let Some(stream) = self.streams.get_mut(&header.stream_id) {
            stream.send_window += increment;

            if stream.send_window > 0x7fff_ffff {
                self.reset_stream(header.stream_id, FLOW_CONTROL_ERROR, events);

                return Ok(());
            }
        }

        events.push(Event::WindowOpened);

        Ok(())
    }

    // ---- send side ----

    pub fn send_headers(&mut self, stream_id: u32, fields: &[(String, String)], end_stream: bool) {
        let mut block = Vec::new();

        self.encoder.encode(fields, &mut block);

        let max = self.peer_settings.max_frame_size;

        let mut first = true;
        let mut offset = 0;

        while first || offset < block.len() {
            let end = cmp::min(offset + max, block.len());
            let last = end == block.len();

            let frame_type = if first { FRAME_HEADERS } else { FRAME_CONTINUATION };

            let mut flags = 0;

            if last {
                flags |= FLAG_END_HEADERS;
            }

            if first && end_stream {
                flags |= FLAG_END_STREAM;
            }

            write_frame(&mut self.out, frame_type, flags, stream_id, &block[offset..end]);

            offset = end;
            first = false;
        }

        if end_stream {
            self.half_close_local(stream_id);
        }
    }

    // send as much of data as the windows allow. returns the number of
    // bytes accepted. end_stream is applied only once everything was
    // accepted
    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> usize {
        let stream_window = match self.streams.get(&stream_id) {
            Some(stream) => match stream.state {
                StreamState::Open | StreamState::HalfClosedRemote => stream.send_window,
                _ => return data.len(),
            },
            None => return data.len(),
        };

        let budget = cmp::max(cmp::min(self.conn_send_window, stream_window), 0) as usize;

        let mut sent = 0;

        while sent < data.len() && sent < budget {
            let size = cmp::min(
                cmp::min(data.len() - sent, budget - sent),
                self.peer_settings.max_frame_size,
            );

            let last = sent + size == data.len();

            let flags = if last && end_stream { FLAG_END_STREAM } else { 0 };

            write_frame(
                &mut self.out,
                FRAME_DATA,
                flags,
                stream_id,
                &data[sent..(sent + size)],
            );

            sent += size;
        }

        self.conn_send_window -= sent as i64;

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.send_window -= sent as i64;
        }

        if end_stream && sent == data.len() {
            if data.is_empty() {
                write_frame(&mut self.out, FRAME_DATA, FLAG_END_STREAM, stream_id, &[]);
            }

            self.half_close_local(stream_id);
        }

        sent
    }

    pub fn send_rst_stream(&mut self, stream_id: u32, error_code: u32) {
        self.queue_rst_stream(stream_id, error_code);

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.state = StreamState::Closed;
        }
    }

    pub fn send_goaway(&mut self, error_code: u32) {
        if self.goaway_sent {
            return;
        }

        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&self.last_client_stream.to_be_bytes());
        payload.extend_from_slice(&error_code.to_be_bytes());

        write_frame(&mut self.out, FRAME_GOAWAY, 0, 0, &payload);

        self.goaway_sent = true;
    }

    // reserve a push stream and send the promise on the parent. None
    // when the peer disabled push
    pub fn send_push_promise(
        &mut self,
        parent_stream_id: u32,
        fields: &[(String, String)],
    ) -> Option<u32> {
        if !self.peer_settings.enable_push || self.goaway_sent {
            return None;
        }

        let promised_id = self.next_push_stream;
        self.next_push_stream += 2;

        let mut block = Vec::new();
        self.encoder.encode(fields, &mut block);

        let mut payload = Vec::with_capacity(4 + block.len());
        payload.extend_from_slice(&promised_id.to_be_bytes());
        payload.extend_from_slice(&block);

        write_frame(
            &mut self.out,
            FRAME_PUSH_PROMISE,
            FLAG_END_HEADERS,
            parent_stream_id,
            &payload,
        );

        // a promised stream can only carry our response
        let mut stream = Stream::new(
            self.peer_settings.initial_window_size as i64,
            DEFAULT_WINDOW_SIZE as i64,
        );
        stream.state = StreamState::HalfClosedRemote;

        self.streams.insert(promised_id, stream);

        Some(promised_id)
    }

    fn replenish_conn(&mut self, amount: usize) {
        self.conn_recv_replenish += amount;

        if self.conn_recv_replenish >= WINDOW_UPDATE_THRESHOLD {
            let increment = self.conn_recv_replenish as u32;

            write_frame(
                &mut self.out,
                FRAME_WINDOW_UPDATE,
                0,
                0,
                &increment.to_be_bytes(),
            );

            self.conn_recv_window += self.conn_recv_replenish as i64;
            self.conn_recv_replenish = 0;
        }
    }

    // record that body bytes were handed to the application, and
    // replenish receive windows once enough accumulated. this is the
    // only place receive windows grow, so the peer can never push
    // more than the application is willing to buffer
    pub fn consume_recv(&mut self, stream_id: u32, amount: usize) {
        self.replenish_conn(amount);

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.recv_replenish += amount;

            let open = matches!(
                stream.state,
                StreamState::Open | StreamState::HalfClosedLocal
            );

            if open && stream.recv_replenish >= WINDOW_UPDATE_THRESHOLD {
                let increment = stream.recv_replenish as u32;

                stream.recv_window += stream.recv_replenish as i64;
                stream.recv_replenish = 0;

                write_frame(
                    &mut self.out,
                    FRAME_WINDOW_UPDATE,
                    0,
                    stream_id,
                    &increment.to_be_bytes(),
                );
            }
        }
    }

    // forget a fully closed stream
    pub fn reclaim_stream(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get(&stream_id) {
            if stream.state == StreamState::Closed {
                self.streams.remove(&stream_id);
            }
        }
    }

    // the peer finished sending on the stream
    fn half_close_remote(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.state = match stream.state {
                StreamState::Open => StreamState::HalfClosedRemote,
                StreamState::HalfClosedLocal => StreamState::Closed,
                state => state,
            };
        }
    }

    // we finished sending on the stream
    fn half_close_local(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.state = match stream.state {
                StreamState::Open => StreamState::HalfClosedLocal,
                StreamState::HalfClosedRemote => StreamState::Closed,
                state => state,
            };
        }
    }

    fn reset_stream(&mut self, stream_id: u32, error_code: u32, events: &mut Vec<Event>) {
        self.queue_rst_stream(stream_id, error_code);

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.state = StreamState::Closed;
        }

        events.push(Event::Reset {
            stream_id,
            error_code,
        });
    }

    fn queue_rst_stream(&mut self, stream_id: u32, error_code: u32) {
        write_frame(
            &mut self.out,
            FRAME_RST_STREAM,
            0,
            stream_id,
            &error_code.to_be_bytes(),
        );
    }

    fn connection_error(&mut self, code: u32, msg: &str) -> ConnectionError {
        debug!("conn: connection error {}: {}", code, msg);

        self.send_goaway(code);

        ConnectionError::new(code, msg)
    }
}

impl Default for ServerProtocol {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_padding(flags: u8, payload: &[u8]) -> Option<&[u8]> {
    if flags & FLAG_PADDED == 0 {
        return Some(payload);
    }

    if payload.is_empty() {
        return None;
    }

    let pad_len = payload[0] as usize;

    if pad_len + 1 > payload.len() {
        return None;
    }

    Some(&payload[1..(payload.len() - pad_len)])
}

// RFC 7540 8.1.2: pseudo-headers before regular fields, no duplicates,
// no unknown pseudo fields, lowercase names, and the required method/
// scheme/path set
pub fn validate_request_fields(fields: &[(String, String)]) -> Result<(), ()> {
    let mut method = None;
    let mut scheme = None;
    let mut path = None;
    let mut authority: Option<&str> = None;
    let mut seen_regular = false;

    for (name, value) in fields {
        if name.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(());
        }

        if let Some(pseudo) = name.strip_prefix(':') {
            if seen_regular {
                return Err(());
            }

            let slot = match pseudo {
                "method" => &mut method,
                "scheme" => &mut scheme,
                "path" => &mut path,
                "authority" => &mut authority,
                _ => return Err(()),
            };

            if slot.is_some() {
                return Err(());
            }

            *slot = Some(value.as_str());
        } else {
            seen_regular = true;

            // connection-specific fields don't exist in http/2
            if name == "connection" || name == "keep-alive" || name == "upgrade"
                || name == "transfer-encoding"
            {
                return Err(());
            }

            if name == "te" && value != "trailers" {
                return Err(());
            }
        }
    }

    match (method, scheme, path) {
        (Some(_), Some(_), Some(p)) if !p.is_empty() => Ok(()),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_settings_frame() -> Vec<u8> {
        let mut out = Vec::new();
        write_frame(&mut out, FRAME_SETTINGS, 0, 0, &[]);
        out
    }

    fn client_headers_block(
        p: &mut hpack::Encoder,
        stream_id: u32,
        fields: &[(&str, &str)],
        end_stream: bool,
    ) -> Vec<u8> {
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();

        let mut block = Vec::new();
        p.encode(&fields, &mut block);

        let mut flags = FLAG_END_HEADERS;

        if end_stream {
            flags |= FLAG_END_STREAM;
        }

        let mut out = Vec::new();
        write_frame(&mut out, FRAME_HEADERS, flags, stream_id, &block);
        out
    }

    fn handshake(p: &mut ServerProtocol) -> hpack::Encoder {
        p.start();

        let mut input = PREFACE.to_vec();
        input.extend_from_slice(&client_settings_frame());

        let (consumed, events) = p.recv(&input).unwrap();
        assert_eq!(consumed, input.len());
        assert!(events.is_empty());

        // our settings + their ack are queued
        assert!(p.have_output());
        p.take_output();

        hpack::Encoder::new(4096)
    }

    const GET_FIELDS: [(&str, &str); 4] = [
        (":method", "GET"),
        (":scheme", "http"),
        (":path", "/"),
        (":authority", "example.com"),
    ];

    #[test]
    fn test_handshake_and_request() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        let input = client_headers_block(&mut enc, 1, &GET_FIELDS, true);

        let (consumed, events) = p.recv(&input).unwrap();
        assert_eq!(consumed, input.len());
        assert_eq!(events.len(), 1);

        match &events[0] {
            Event::Request {
                stream_id,
                fields,
                end_stream,
            } => {
                assert_eq!(*stream_id, 1);
                assert!(*end_stream);
                assert_eq!(fields[0], (":method".to_string(), "GET".to_string()));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert_eq!(p.stream_state(1), StreamState::HalfClosedRemote);
    }

    #[test]
    fn test_bad_preface() {
        let mut p = ServerProtocol::new();
        p.start();

        assert!(p.recv(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n....").is_err());
    }

    #[test]
    fn test_request_with_body_and_window_replenish() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        let mut input = client_headers_block(
            &mut enc,
            1,
            &[
                (":method", "POST"),
                (":scheme", "http"),
                (":path", "/upload"),
                (":authority", "example.com"),
            ],
            false,
        );

        let body = vec![0x42; 1000];
        write_frame(&mut input, FRAME_DATA, FLAG_END_STREAM, 1, &body);

        let (_, events) = p.recv(&input).unwrap();
        assert_eq!(events.len(), 2);

        match &events[1] {
            Event::Data {
                stream_id,
                data,
                end_stream,
            } => {
                assert_eq!(*stream_id, 1);
                assert_eq!(data.len(), 1000);
                assert!(*end_stream);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // consuming under the threshold produces no update
        p.take_output();
        p.consume_recv(1, 1000);
        assert!(!p.have_output());

        // crossing the threshold does
        p.consume_recv(1, WINDOW_UPDATE_THRESHOLD);
        let out = p.take_output();

        let header = FrameHeader::parse(&out).unwrap();
        assert_eq!(header.frame_type, FRAME_WINDOW_UPDATE);
        assert_eq!(header.stream_id, 0);
    }

    #[test]
    fn test_send_data_respects_windows() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        let input = client_headers_block(&mut enc, 1, &GET_FIELDS, true);
        p.recv(&input).unwrap();

        p.send_headers(
            1,
            &[(":status".to_string(), "200".to_string())],
            false,
        );
        p.take_output();

        // shrink the stream window artificially by sending data
        let big = vec![0u8; (DEFAULT_WINDOW_SIZE as usize) + 5000];

        let sent = p.send_data(1, &big, true);
        assert_eq!(sent, DEFAULT_WINDOW_SIZE as usize);
        assert_eq!(p.stream_send_window(1), 0);
        assert_eq!(p.conn_send_window(), 0);

        // nothing more until a window update arrives
        assert_eq!(p.send_data(1, &big[sent..], true), 0);

        let mut update = Vec::new();
        write_frame(
            &mut update,
            FRAME_WINDOW_UPDATE,
            0,
            0,
            &10_000u32.to_be_bytes(),
        );
        write_frame(
            &mut update,
            FRAME_WINDOW_UPDATE,
            0,
            1,
            &10_000u32.to_be_bytes(),
        );

        let (_, events) = p.recv(&update).unwrap();
        assert!(events.contains(&Event::WindowOpened));

        let sent2 = p.send_data(1, &big[sent..], true);
        assert_eq!(sent2, 5000);
        assert_eq!(p.stream_state(1), StreamState::Closed);
    }

    #[test]
    fn test_data_frames_split_to_max_frame_size() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        let input = client_headers_block(&mut enc, 1, &GET_FIELDS, true);
        p.recv(&input).unwrap();

        p.send_headers(1, &[(":status".to_string(), "200".to_string())], false);
        p.take_output();

        let data = vec![0u8; DEFAULT_MAX_FRAME_SIZE + 100];
        let sent = p.send_data(1, &data, false);
        assert_eq!(sent, data.len());

        let out = p.take_output();

        let first = FrameHeader::parse(&out).unwrap();
        assert_eq!(first.frame_type, FRAME_DATA);
        assert_eq!(first.len, DEFAULT_MAX_FRAME_SIZE);

        let second =
            FrameHeader::parse(&out[(FRAME_HEADER_SIZE + first.len)..]).unwrap();
        assert_eq!(second.len, 100);
    }

    #[test]
    fn test_ping_gets_acked() {
        let mut p = ServerProtocol::new();
        handshake(&mut p);

        let mut input = Vec::new();
        write_frame(&mut input, FRAME_PING, 0, 0, b"12345678");

        p.recv(&input).unwrap();

        let out = p.take_output();
        let header = FrameHeader::parse(&out).unwrap();

        assert_eq!(header.frame_type, FRAME_PING);
        assert_eq!(header.flags & FLAG_ACK, FLAG_ACK);
        assert_eq!(&out[FRAME_HEADER_SIZE..], b"12345678");
    }

    #[test]
    fn test_interleaved_responses() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        let mut input = client_headers_block(&mut enc, 1, &GET_FIELDS, true);
        input.extend_from_slice(&client_headers_block(&mut enc, 3, &GET_FIELDS, true));

        let (_, events) = p.recv(&input).unwrap();
        assert_eq!(events.len(), 2);

        // stream 3 responds first; each stream's frames stay in order
        p.send_headers(3, &[(":status".to_string(), "200".to_string())], false);
        p.send_data(3, b"three", true);
        p.send_headers(1, &[(":status".to_string(), "200".to_string())], false);
        p.send_data(1, b"one", true);

        let out = p.take_output();

        let mut frames = Vec::new();
        let mut pos = 0;

        while pos < out.len() {
            let h = FrameHeader::parse(&out[pos..]).unwrap();
            frames.push((h.frame_type, h.stream_id));
            pos += FRAME_HEADER_SIZE + h.len;
        }

        assert_eq!(
            frames,
            vec![
                (FRAME_HEADERS, 3),
                (FRAME_DATA, 3),
                (FRAME_HEADERS, 1),
                (FRAME_DATA, 1),
            ]
        );
    }

    #[test]
    fn test_push_promise_allocates_even_streams() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        let input = client_headers_block(&mut enc, 1, &GET_FIELDS, true);
        p.recv(&input).unwrap();

        let fields: Vec<(String, String)> = GET_FIELDS
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();

        assert_eq!(p.send_push_promise(1, &fields), Some(2));
        assert_eq!(p.send_push_promise(1, &fields), Some(4));

        assert_eq!(p.stream_state(2), StreamState::HalfClosedRemote);
    }

    #[test]
    fn test_push_disabled_by_peer() {
        let mut p = ServerProtocol::new();
        p.start();

        let mut input = PREFACE.to_vec();

        let mut settings = Vec::new();
        settings.extend_from_slice(&SETTINGS_ENABLE_PUSH.to_be_bytes());
        settings.extend_from_slice(&0u32.to_be_bytes());
        write_frame(&mut input, FRAME_SETTINGS, 0, 0, &settings);

        p.recv(&input).unwrap();

        assert_eq!(p.send_push_promise(1, &[]), None);
    }

    #[test]
    fn test_even_stream_id_from_client_is_error() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        let input = client_headers_block(&mut enc, 2, &GET_FIELDS, true);

        assert!(p.recv(&input).is_err());
        assert!(p.goaway_sent());
    }

    #[test]
    fn test_malformed_head_resets_stream() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        // missing :path
        let input = client_headers_block(
            &mut enc,
            1,
            &[(":method", "GET"), (":scheme", "http")],
            true,
        );

        let (_, events) = p.recv(&input).unwrap();

        assert_eq!(
            events,
            vec![Event::Reset {
                stream_id: 1,
                error_code: PROTOCOL_ERROR,
            }]
        );
    }

    #[test]
    fn test_validate_request_fields() {
        let ok: Vec<(String, String)> = vec![
            (":method".into(), "GET".into()),
            (":scheme".into(), "https".into()),
            (":path".into(), "/x".into()),
            (":authority".into(), "h".into()),
            ("accept".into(), "*/*".into()),
        ];
        assert!(validate_request_fields(&ok).is_ok());

        // pseudo after regular
        let bad: Vec<(String, String)> = vec![
            (":method".into(), "GET".into()),
            ("accept".into(), "*/*".into()),
            (":path".into(), "/x".into()),
        ];
        assert!(validate_request_fields(&bad).is_err());

        // duplicate pseudo
        let bad: Vec<(String, String)> = vec![
            (":method".into(), "GET".into()),
            (":method".into(), "POST".into()),
            (":scheme".into(), "http".into()),
            (":path".into(), "/".into()),
        ];
        assert!(validate_request_fields(&bad).is_err());

        // connection-specific field
        let bad: Vec<(String, String)> = vec![
            (":method".into(), "GET".into()),
            (":scheme".into(), "http".into()),
            (":path".into(), "/".into()),
            ("connection".into(), "close".into()),
        ];
        assert!(validate_request_fields(&bad).is_err());

        // uppercase field name
        let bad: Vec<(String, String)> = vec![
            (":method".into(), "GET".into()),
            (":scheme".into(), "http".into()),
            (":path".into(), "/".into()),
            ("Accept".into(), "*/*".into()),
        ];
        assert!(validate_request_fields(&bad).is_err());
    }

    #[test]
    fn test_continuation_assembly() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        let fields: Vec<(String, String)> = GET_FIELDS
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();

        let mut block = Vec::new();
        enc.encode(&fields, &mut block);

        let split = block.len() / 2;

        let mut input = Vec::new();
        write_frame(&mut input, FRAME_HEADERS, FLAG_END_STREAM, 1, &block[..split]);
        write_frame(
            &mut input,
            FRAME_CONTINUATION,
            FLAG_END_HEADERS,
            1,
            &block[split..],
        );

        let (_, events) = p.recv(&input).unwrap();

        assert!(matches!(events[0], Event::Request { stream_id: 1, .. }));
    }

    #[test]
    fn test_frame_between_continuations_is_error() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        let fields: Vec<(String, String)> = GET_FIELDS
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();

        let mut block = Vec::new();
        enc.encode(&fields, &mut block);

        let mut input = Vec::new();
        write_frame(&mut input, FRAME_HEADERS, FLAG_END_STREAM, 1, &block[..2]);
        write_frame(&mut input, FRAME_PING, 0, 0, b"12345678");

        assert!(p.recv(&input).is_err());
    }

    #[test]
    fn test_trailers() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        let mut input = client_headers_block(
            &mut enc,
            1,
            &[
                (":method", "POST"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "h"),
            ],
            false,
        );

        write_frame(&mut input, FRAME_DATA, 0, 1, b"hello");

        let trailer_fields: Vec<(String, String)> =
            vec![("x-checksum".to_string(), "abc".to_string())];

        let mut block = Vec::new();
        enc.encode(&trailer_fields, &mut block);
        write_frame(
            &mut input,
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            1,
            &block,
        );

        let (_, events) = p.recv(&input).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], Event::Trailers { stream_id: 1, fields }
            if fields[0].0 == "x-checksum"));

        assert_eq!(p.stream_state(1), StreamState::HalfClosedRemote);
    }

    #[test]
    fn test_goaway_refuses_new_streams() {
        let mut p = ServerProtocol::new();
        let mut enc = handshake(&mut p);

        p.send_goaway(NO_ERROR);
        p.take_output();

        let input = client_headers_block(&mut enc, 1, &GET_FIELDS, true);

        let (_, events) = p.recv(&input).unwrap();
        assert!(events.is_empty());

        let out = p.take_output();
        let header = FrameHeader::parse(&out).unwrap();

        assert_eq!(header.frame_type, FRAME_RST_STREAM);
        assert_eq!(header.stream_id, 1);
    }
}
