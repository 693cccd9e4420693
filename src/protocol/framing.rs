//! Incremental request frame decoder.
//!
//! ```text
//! [u8 type] [u16 LE payload_len] [payload: payload_len bytes]
//! ```
//!
//! Bytes arrive in arbitrary chunks, possibly with descriptors attached by
//! `SCM_RIGHTS`. One `recvmsg` may return bytes from several earlier writes
//! before the write that carried the descriptors, so a chunk's descriptors
//! are not tied to the chunk's first frame. Each batch is queued with the
//! byte range of its chunk and claimed by the first frame starting in or
//! after that range whose tag takes a descriptor (`CREATE_MEMORY`). Frames
//! that take none never claim a batch. A batch no frame can claim anymore is
//! closed.
//!
//! A frame declaring more than `MAX_PAYLOAD_SIZE` is skipped byte for byte
//! without buffering the payload, then surfaced as a rejected frame so the
//! connection can answer `INVALID_REQUEST` and stay in sync.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;

use bytes::{Buf, BytesMut};

use super::messages::{decode_request, message_type, DecodeError, Request};
use crate::constants::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// One complete frame pulled off the stream.
#[derive(Debug)]
pub struct Frame {
    /// Raw type tag.
    pub tag: u8,
    /// Decoded request, or why it could not be decoded.
    pub request: Result<Request, DecodeError>,
    /// Descriptors claimed by this frame. Always empty for tags that take
    /// none.
    pub fds: Vec<OwnedFd>,
    /// The claimed batch had its control data truncated by the kernel, so
    /// `fds` may be incomplete.
    pub fds_truncated: bool,
}

/// Descriptors from one `recvmsg`, with the stream range of its bytes.
#[derive(Debug)]
struct Arrival {
    start: u64,
    end: u64,
    fds: Vec<OwnedFd>,
    truncated: bool,
}

#[derive(Debug)]
struct Skip {
    tag: u8,
    declared: usize,
    remaining: usize,
    start: u64,
}

/// Stateful decoder; one per connection.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Stream offset of `buf[0]`.
    base: u64,
    /// Total bytes fed so far.
    received: u64,
    skip: Option<Skip>,
    arrivals: VecDeque<Arrival>,
}

impl FrameDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received chunk and its descriptors; return every frame
    /// that became complete.
    ///
    /// Incomplete data is retained for the next call.
    pub fn feed(&mut self, bytes: &[u8], fds: Vec<OwnedFd>) -> Vec<Frame> {
        self.feed_received(bytes, fds, false)
    }

    /// Like [`feed`](Self::feed), recording that the chunk's control data
    /// was truncated (`MSG_CTRUNC`).
    pub fn feed_received(&mut self, bytes: &[u8], fds: Vec<OwnedFd>, truncated: bool) -> Vec<Frame> {
        let start = self.received;
        self.received += bytes.len() as u64;
        if !fds.is_empty() || truncated {
            self.arrivals.push_back(Arrival { start, end: self.received, fds, truncated });
        }
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            if let Some(skip) = self.skip.as_mut() {
                let n = skip.remaining.min(self.buf.len());
                self.buf.advance(n);
                self.base += n as u64;
                skip.remaining -= n;
                if skip.remaining > 0 {
                    break;
                }
                let Skip { tag, declared, start, .. } = *skip;
                self.skip = None;
                let (fds, fds_truncated) = self.claim_fds(tag, start, self.base);
                frames.push(Frame {
                    tag,
                    request: Err(DecodeError::Oversized(declared)),
                    fds,
                    fds_truncated,
                });
                continue;
            }

            if self.buf.len() < FRAME_HEADER_SIZE {
                break;
            }
            let tag = self.buf[0];
            let len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;

            if len > MAX_PAYLOAD_SIZE {
                log::debug!("[framing] skipping oversized frame 0x{tag:02x} ({len} bytes)");
                let start = self.base;
                self.buf.advance(FRAME_HEADER_SIZE);
                self.base += FRAME_HEADER_SIZE as u64;
                self.skip = Some(Skip { tag, declared: len, remaining: len, start });
                continue;
            }

            let total = FRAME_HEADER_SIZE + len;
            if self.buf.len() < total {
                break;
            }

            let frame = self.buf.split_to(total);
            let start = self.base;
            self.base += total as u64;
            let request = decode_request(tag, &frame[FRAME_HEADER_SIZE..]);
            let (fds, fds_truncated) = self.claim_fds(tag, start, self.base);
            frames.push(Frame { tag, request, fds, fds_truncated });
        }

        frames
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Descriptors queued but not yet claimed by a frame.
    pub fn pending_fds(&self) -> usize {
        self.arrivals.iter().map(|a| a.fds.len()).sum()
    }

    /// Hand the frame spanning `start..end` its descriptor batch, if its tag
    /// takes one.
    fn claim_fds(&mut self, tag: u8, start: u64, end: u64) -> (Vec<OwnedFd>, bool) {
        // A batch whose bytes all precede this frame was sent with frames
        // that take no descriptor.
        while self.arrivals.front().is_some_and(|a| a.end <= start) {
            if let Some(stray) = self.arrivals.pop_front() {
                log::warn!(
                    "[framing] closing {} unclaimed descriptors from bytes {}..{}",
                    stray.fds.len(),
                    stray.start,
                    stray.end
                );
            }
        }

        if !message_type::carries_fd(tag) {
            return (Vec::new(), false);
        }
        if !self.arrivals.front().is_some_and(|a| a.start < end) {
            return (Vec::new(), false);
        }
        match self.arrivals.pop_front() {
            Some(Arrival { fds, truncated, .. }) => (fds, truncated),
            None => (Vec::new(), false),
        }
    }
}
