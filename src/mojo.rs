//! Binary event-stream emitter: the "mojo" protocol named in the external interfaces.
//!
//! This is the wire format the Austin sampler calls "mojo" (`src/mojo.h`/`src/events.h` in
//! that codebase): a 3-byte `MOJ` magic, a varint protocol version, and a stream of
//! one-byte-discriminated events with variable-length integers. It's reproduced here
//! bit-for-bit as a writer, alongside `speedscope`/`flamegraph`/`chrometrace`, the
//! equivalent text-oriented emitters for the same `StackTrace` data.
use std::io::{self, Write};

use crate::stack_trace::StackTrace;

pub const MOJO_VERSION: u64 = 1;

/// Bitmask applied to any ref (frame key's code address component, string key) before it's
/// varint-encoded: `(1 << (6 + 7*3)) - 1`, chosen so a masked ref always fits in at most 4
/// varint bytes (6 data bits in the first byte, 7 in each of up to 3 continuation bytes).
pub const MOJO_INT32: u64 = (1u64 << (6 + 7 * 3)) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Event {
    Metadata = 1,
    Stack = 2,
    Frame = 3,
    FrameInvalid = 4,
    FrameRef = 5,
    FrameKernel = 6,
    Gc = 7,
    Idle = 8,
    MetricTime = 9,
    MetricMemory = 10,
    String = 11,
    StringRef = 12,
}

/// Writes the mojo binary protocol described in the external interfaces section to any
/// `Write` sink (a file, a pipe, an in-memory buffer for tests).
pub struct MojoWriter<W: Write> {
    out: W,
}

impl<W: Write> MojoWriter<W> {
    pub fn new(mut out: W) -> io::Result<MojoWriter<W>> {
        out.write_all(b"MOJ")?;
        write_varint(&mut out, MOJO_VERSION, false)?;
        Ok(MojoWriter { out })
    }

    pub fn metadata(&mut self, label: &str, value: &str) -> io::Result<()> {
        self.event(Event::Metadata)?;
        write_cstring(&mut self.out, label)?;
        write_cstring(&mut self.out, value)
    }

    pub fn stack(&mut self, pid: u64, tid: u64) -> io::Result<()> {
        self.event(Event::Stack)?;
        write_varint(&mut self.out, pid, false)?;
        // the original format writes the native thread id formatted as hex text,
        // null-terminated, rather than as a varint -- preserved here bit-for-bit.
        write_cstring(&mut self.out, &format!("{:x}", tid))
    }

    pub fn frame(&mut self, key: u64, filename_ref: u64, scope_ref: u64, line: i64) -> io::Result<()> {
        self.event(Event::Frame)?;
        write_varint(&mut self.out, key, false)?;
        write_ref(&mut self.out, filename_ref)?;
        write_ref(&mut self.out, scope_ref)?;
        write_signed_varint(&mut self.out, line)
    }

    pub fn frame_ref(&mut self, key: u64) -> io::Result<()> {
        self.event(Event::FrameRef)?;
        write_varint(&mut self.out, key, false)
    }

    pub fn frame_invalid(&mut self) -> io::Result<()> {
        self.event(Event::FrameInvalid)
    }

    pub fn frame_kernel(&mut self, scope: &str) -> io::Result<()> {
        self.event(Event::FrameKernel)?;
        write_cstring(&mut self.out, scope)
    }

    pub fn gc(&mut self) -> io::Result<()> {
        self.event(Event::Gc)
    }

    pub fn idle(&mut self) -> io::Result<()> {
        self.event(Event::Idle)
    }

    pub fn metric_time(&mut self, value: i64) -> io::Result<()> {
        self.event(Event::MetricTime)?;
        write_signed_varint(&mut self.out, value)
    }

    pub fn metric_memory(&mut self, value: i64) -> io::Result<()> {
        self.event(Event::MetricMemory)?;
        write_signed_varint(&mut self.out, value)
    }

    pub fn string(&mut self, key: u64, value: &str) -> io::Result<()> {
        self.event(Event::String)?;
        write_ref(&mut self.out, key)?;
        write_cstring(&mut self.out, value)
    }

    pub fn string_ref(&mut self, key: u64) -> io::Result<()> {
        self.event(Event::StringRef)?;
        write_ref(&mut self.out, key)
    }

    /// Writes one sampled thread's frames as a stack event followed by a frame event per
    /// frame, bottom-most first as required by the ordering guarantee in the concurrency
    /// model, then a time metric for the sample interval elapsed.
    pub fn write_trace(&mut self, trace: &StackTrace, elapsed_micros: i64) -> io::Result<()> {
        self.stack(trace.pid as u64, trace.thread_id)?;
        for frame in trace.frames.iter().rev() {
            self.frame(
                frame.key,
                string_key(&frame.filename),
                string_key(&frame.name),
                frame.line as i64,
            )?;
        }
        if !trace.active {
            self.idle()?;
        }
        self.metric_time(elapsed_micros)
    }

    fn event(&mut self, event: Event) -> io::Result<()> {
        self.out.write_all(&[event as u8])
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Composite frame identity: the low 16 bits of `lasti` plus the `MOJO_INT32`-masked code
/// object's remote address shifted up, stable for the life of one sample.
pub fn frame_key(code_addr: usize, lasti: i32) -> u64 {
    ((code_addr as u64) & MOJO_INT32) << 16 | (lasti as u16 as u64)
}

/// `MOJO_INT32`-truncated identity used for string references (filenames/scopes interned via
/// `StringCache`).
pub fn string_key(s: &str) -> u64 {
    // stable, cheap fingerprint: FNV-1a truncated to fit a mojo ref
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash & MOJO_INT32
}

fn write_cstring<W: Write>(out: &mut W, s: &str) -> io::Result<()> {
    out.write_all(s.as_bytes())?;
    out.write_all(&[0u8])
}

fn write_ref<W: Write>(out: &mut W, value: u64) -> io::Result<()> {
    write_varint(out, value & MOJO_INT32, false)
}

/// First byte: 6 data bits, bit 6 = sign, bit 7 = continuation. Continuation bytes: 7 data
/// bits, bit 7 = continuation.
fn write_varint<W: Write>(out: &mut W, value: u64, negative: bool) -> io::Result<()> {
    let mut remaining = value;
    let mut byte = (remaining & 0x3f) as u8;
    if negative {
        byte |= 0x40;
    }
    remaining >>= 6;
    if remaining != 0 {
        byte |= 0x80;
    }
    out.write_all(&[byte])?;

    while remaining != 0 {
        let mut b = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining != 0 {
            b |= 0x80;
        }
        out.write_all(&[b])?;
    }
    Ok(())
}

fn write_signed_varint<W: Write>(out: &mut W, value: i64) -> io::Result<()> {
    let negative = value < 0;
    let magnitude = value.unsigned_abs();
    write_varint(out, magnitude, negative)
}

/// Decodes one varint starting at `data[0]`, returning the (signed) value and the number of
/// bytes consumed. Mirrors `write_varint`/`write_signed_varint`; used by tests and by any
/// future reader of recorded mojo streams.
pub fn read_varint(data: &[u8]) -> Option<(i64, usize)> {
    if data.is_empty() {
        return None;
    }
    let first = data[0];
    let negative = first & 0x40 != 0;
    let mut value: u64 = (first & 0x3f) as u64;
    let mut shift = 6;
    let mut consumed = 1;
    let mut cont = first & 0x80 != 0;

    while cont {
        let b = *data.get(consumed)?;
        value |= ((b & 0x7f) as u64) << shift;
        shift += 7;
        consumed += 1;
        cont = b & 0x80 != 0;
    }

    let value = if negative { -(value as i64) } else { value as i64 };
    Some((value, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_moj_plus_version() {
        let mut buf = Vec::new();
        {
            let _writer = MojoWriter::new(&mut buf).unwrap();
        }
        assert_eq!(&buf[..3], b"MOJ");
        let (version, _) = read_varint(&buf[3..]).unwrap();
        assert_eq!(version, MOJO_VERSION as i64);
    }

    #[test]
    fn test_varint_roundtrip_small_and_large() {
        for &value in &[0i64, 1, 63, 64, 127, 128, 1_000_000, -1, -63, -64, -1_000_000] {
            let mut buf = Vec::new();
            write_signed_varint(&mut buf, value).unwrap();
            let (decoded, consumed) = read_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_event_discriminator_is_single_byte() {
        let mut buf = Vec::new();
        let mut writer = MojoWriter::new(&mut buf).unwrap();
        writer.gc().unwrap();
        assert_eq!(*buf.last().unwrap(), Event::Gc as u8);
    }

    #[test]
    fn test_string_is_null_terminated() {
        let mut buf = Vec::new();
        let mut writer = MojoWriter::new(&mut buf).unwrap();
        writer.metadata("mode", "cpu").unwrap();
        assert!(buf.ends_with(b"cpu\0"));
    }

    #[test]
    fn test_ref_is_masked_to_27_bits() {
        let mut buf = Vec::new();
        write_ref(&mut buf, u64::MAX).unwrap();
        let (decoded, _) = read_varint(&buf).unwrap();
        assert_eq!(decoded as u64, MOJO_INT32);
        assert!(buf.len() <= 4);
    }
}
