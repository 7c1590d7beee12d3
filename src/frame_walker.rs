//! Thread iteration and frame-chain walking: given a remote `PyInterpreterState` address,
//! produces the decoded call stack of every thread.
use std::collections::HashSet;

use anyhow::{Error, Result};
use remoteprocess::ProcessMemory;

use crate::mojo::frame_key;
use crate::string_cache::StringCache;
use crate::version_table::{FrameLinkage, LineTableEncoding, StringLayout, VersionDescriptor};

const MAX_FRAMES: usize = 4096;
const MAX_STRING_LEN: usize = 4096;
const MAX_BYTES_LEN: usize = 65536;

/// One decoded activation record.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub key: u64,
    pub code_addr: usize,
    pub lasti: i32,
    pub filename: String,
    pub scope: String,
    pub line: i32,
    pub line_end: i32,
    pub column: i32,
    pub column_end: i32,
    /// Set on the CPython 3.11+ "shim" entry frame created to bridge a C call; callers
    /// typically filter these out of user-facing output.
    pub is_shim_entry: bool,
}

/// One thread's decoded stack, or a marker that the walk failed partway through.
#[derive(Debug, Clone)]
pub struct ThreadFrames {
    pub thread_id: u64,
    pub thread_state_addr: usize,
    pub frames: Vec<DecodedFrame>,
    pub invalid: bool,
}

/// Reads `interp_addr`'s thread-state list and decodes every thread's frame chain.
pub fn walk_interpreter<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    interp_addr: usize,
    cache: &mut StringCache,
) -> Result<Vec<ThreadFrames>> {
    let mut threads = Vec::new();
    let mut visited = HashSet::new();

    let head_ptr: usize = process.copy_struct(interp_addr + descriptor.interp_tstate_head)?;
    let mut tstate_addr = head_ptr;

    while tstate_addr != 0 && visited.len() < MAX_FRAMES {
        if !visited.insert(tstate_addr) {
            break;
        }

        let thread_id: u64 = process.copy_struct(tstate_addr + descriptor.tstate_thread_id)?;
        let thread_id = if thread_id != 0 {
            thread_id
        } else {
            tstate_addr as u64
        };

        let top_frame: usize = process.copy_struct(tstate_addr + descriptor.tstate_frame)?;

        let frames = match walk_frame_chain(process, descriptor, top_frame, cache) {
            Ok(frames) => frames,
            Err(_) => {
                threads.push(ThreadFrames {
                    thread_id,
                    thread_state_addr: tstate_addr,
                    frames: Vec::new(),
                    invalid: true,
                });
                let next: usize = process.copy_struct(tstate_addr + descriptor.tstate_next)?;
                tstate_addr = next;
                continue;
            }
        };

        threads.push(ThreadFrames {
            thread_id,
            thread_state_addr: tstate_addr,
            frames,
            invalid: false,
        });

        tstate_addr = process.copy_struct(tstate_addr + descriptor.tstate_next)?;
    }

    Ok(threads)
}

fn walk_frame_chain<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    top_frame: usize,
    cache: &mut StringCache,
) -> Result<Vec<DecodedFrame>> {
    let mut frames = Vec::new();
    let mut seen = HashSet::new();
    let mut frame_addr = top_frame;

    while frame_addr != 0 && frames.len() < MAX_FRAMES {
        if !seen.insert(frame_addr) {
            break;
        }

        let code_addr: usize = process.copy_struct(frame_addr + descriptor.frame_code)?;
        if code_addr == 0 {
            break;
        }
        let lasti: i32 = match descriptor.frame_linkage {
            FrameLinkage::Direct => process.copy_struct(frame_addr + descriptor.frame_lasti)?,
            FrameLinkage::Indirect311 => {
                // `prev_instr` is a `_Py_CODEUNIT*` into the code object's inline bytecode,
                // not a bytecode index; recover a byte-offset lasti by subtracting the
                // address of the first instruction.
                let prev_instr: usize = process.copy_struct(frame_addr + descriptor.frame_lasti)?;
                let first_instr = code_addr + descriptor.code_first_instr_offset.unwrap_or(0);
                prev_instr.wrapping_sub(first_instr) as i32
            }
        };

        let is_shim_entry = match descriptor.frame_is_entry {
            Some(offset) => {
                let is_entry: u8 = process.copy_struct(frame_addr + offset)?;
                is_entry != 0
            }
            None => false,
        };

        let filename = cached_string(process, descriptor, cache, code_addr + descriptor.code_filename)?;
        let scope = match descriptor.code_qualname {
            Some(offset) => cached_string(process, descriptor, cache, code_addr + offset)?,
            None => cached_string(process, descriptor, cache, code_addr + descriptor.code_name)?,
        };

        let firstlineno: i32 = process.copy_struct(code_addr + descriptor.code_firstlineno)?;
        let table_addr: usize = process.copy_struct(code_addr + descriptor.code_linetable)?;
        let (line, line_end, column, column_end) =
            decode_line_info(process, descriptor, firstlineno, lasti, table_addr)?;

        frames.push(DecodedFrame {
            key: frame_key(code_addr, lasti),
            code_addr,
            lasti,
            filename,
            scope,
            line,
            line_end,
            column,
            column_end,
            is_shim_entry,
        });

        frame_addr = match descriptor.frame_linkage {
            FrameLinkage::Direct => process.copy_struct(frame_addr + descriptor.frame_back.unwrap())?,
            FrameLinkage::Indirect311 => process.copy_struct(frame_addr + descriptor.frame_back.unwrap())?,
        };
    }

    Ok(frames)
}

fn cached_string<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    cache: &mut StringCache,
    string_obj_addr: usize,
) -> Result<String> {
    let key = string_obj_addr as u64;
    if let Some(hit) = cache.maybe_hit(key) {
        return Ok(hit.to_owned());
    }
    let decoded = decode_string(process, descriptor, string_obj_addr)?;
    cache.store(key, decoded.clone());
    Ok(decoded)
}

/// Decodes a Python string object living at `addr`, dispatching on `descriptor.string_layout`.
pub fn decode_string<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    addr: usize,
) -> Result<String> {
    match descriptor.string_layout {
        StringLayout::Python2Str => decode_legacy_bytes_as_str(process, descriptor, addr),
        StringLayout::Python3CompactAscii => decode_compact_ascii(process, descriptor, addr),
        StringLayout::Python3Generic => decode_generic_unicode(process, descriptor, addr),
    }
}

fn decode_legacy_bytes_as_str<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    addr: usize,
) -> Result<String> {
    let size: isize = process.copy_struct(addr + descriptor.bytes_size_offset)?;
    let len = size as usize;
    if len >= MAX_BYTES_LEN {
        return Err(Error::msg("string object too large to decode"));
    }
    let bytes = process.copy(addr + descriptor.bytes_header_size, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn decode_compact_ascii<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    addr: usize,
) -> Result<String> {
    let state: u32 = process.copy_struct(addr + descriptor.ascii_state_offset)?;
    // PyASCIIObject.state bitfield: interned:2, kind:3, compact:1, ascii:1, ready:1
    let kind = (state >> 2) & 7;
    let compact = (state >> 5) & 1 != 0;
    let ascii = (state >> 6) & 1 != 0;

    if !compact || kind != 1 {
        return decode_generic_unicode(process, descriptor, addr);
    }

    // PyASCIIObject: {ob_refcnt, ob_type} header, then `length` as the next field.
    let length: isize = process.copy_struct(addr + 2 * std::mem::size_of::<usize>())?;
    let len = length as usize;
    if len >= MAX_STRING_LEN {
        return Err(Error::msg("unicode object too large to decode"));
    }

    if ascii {
        let bytes = process.copy(addr + descriptor.ascii_header_size, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        decode_generic_unicode(process, descriptor, addr)
    }
}

fn decode_generic_unicode<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    addr: usize,
) -> Result<String> {
    let utf8_ptr: usize = process.copy_struct(addr + descriptor.unicode_utf8_ptr_offset)?;
    let utf8_len: isize = process.copy_struct(addr + descriptor.unicode_utf8_length_offset)?;
    let len = utf8_len as usize;
    if utf8_ptr == 0 || len == 0 {
        return Ok(String::new());
    }
    if len >= MAX_STRING_LEN {
        return Err(Error::msg("unicode object too large to decode"));
    }
    let bytes = process.copy(utf8_ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn decode_line_info<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    firstlineno: i32,
    lasti: i32,
    table_addr: usize,
) -> Result<(i32, i32, i32, i32)> {
    if table_addr == 0 {
        return Ok((firstlineno, firstlineno, 0, 0));
    }

    // the line table is itself a bytes object; read it through the same bytes layout
    // used for frame string decoding, then pick the variant decoder the descriptor names.
    let size: isize = process.copy_struct(table_addr + descriptor.bytes_size_offset)?;
    let len = (size as usize).min(MAX_BYTES_LEN);
    let table = process.copy(table_addr + descriptor.bytes_header_size, len)?;

    Ok(match descriptor.line_table_encoding {
        LineTableEncoding::Classic => {
            let line = decode_line_classic(firstlineno, lasti, &table);
            (line, line, 0, 0)
        }
        LineTableEncoding::Segmented310 => {
            let line = decode_line_310(firstlineno, lasti, &table);
            (line, line, 0, 0)
        }
        LineTableEncoding::Pep626 => decode_line_pep626(firstlineno, lasti, &table),
    })
}

fn decode_line_classic(firstlineno: i32, lasti: i32, table: &[u8]) -> i32 {
    let mut line = firstlineno;
    let mut bc = 0i32;
    let mut i = 0;
    while i + 1 < table.len() {
        let sdelta = table[i] as i32;
        let ldelta = table[i + 1] as i32;
        bc += sdelta;
        if bc > lasti {
            break;
        }
        line += if ldelta >= 0x80 { ldelta - 0x100 } else { ldelta };
        i += 2;
    }
    line
}

fn decode_line_310(firstlineno: i32, lasti: i32, table: &[u8]) -> i32 {
    let mut line = firstlineno;
    let mut bc = 0i32;
    let mut i = 0;
    while i + 1 < table.len() {
        let sdelta = table[i] as i32;
        if sdelta == 0xff {
            break;
        }
        let ldelta = table[i + 1] as i32;
        bc += sdelta * 2;
        if bc > lasti {
            break;
        }
        if ldelta != 0x80 {
            line += if ldelta >= 0x80 { ldelta - 0x100 } else { ldelta };
        }
        i += 2;
    }
    line
}

fn decode_line_pep626(firstlineno: i32, lasti: i32, table: &[u8]) -> (i32, i32, i32, i32) {
    let mut line = firstlineno;
    let mut end_line = firstlineno;
    let mut column = -1i32;
    let mut end_column = -1i32;
    let mut addr = 0i32;
    let mut i = 0;

    while i < table.len() {
        let first = table[i];
        i += 1;
        let advance = ((first & 0x07) as i32 + 1) * 2;
        let form = (first >> 3) & 0x0f;

        match form {
            15 => {}
            14 => {
                let (dline, n) = read_signed_varint(&table[i..]);
                i += n;
                let (dend, n) = read_signed_varint(&table[i..]);
                i += n;
                let (col, n) = read_signed_varint(&table[i..]);
                i += n;
                let (endcol, n) = read_signed_varint(&table[i..]);
                i += n;
                line += dline;
                end_line = line + dend;
                column = col;
                end_column = endcol;
            }
            13 => {
                let (dline, n) = read_signed_varint(&table[i..]);
                i += n;
                line += dline;
                end_line = line;
                column = 0;
                end_column = 0;
            }
            10..=12 => {
                let delta = form as i32 - 10;
                line += delta;
                end_line = line;
                if i < table.len() {
                    column = table[i] as i32 - 1;
                    i += 1;
                }
                if i < table.len() {
                    end_column = table[i] as i32 - 1;
                    i += 1;
                }
            }
            _ => {
                if i < table.len() {
                    let next = table[i] as i32;
                    i += 1;
                    column = 1 + ((form as i32) << 3) + ((next >> 4) & 7);
                    end_column = column + (next & 15);
                }
            }
        }

        addr += advance;
        if addr > lasti {
            break;
        }
    }

    (line, end_line, column.max(0), end_column.max(0))
}

fn read_unsigned_varint(data: &[u8]) -> (u32, usize) {
    if data.is_empty() {
        return (0, 0);
    }
    let mut value = (data[0] & 0x3f) as u32;
    let mut shift = 6;
    let mut i = 1;
    while data[i - 1] & 0x40 != 0 && i < data.len() {
        value |= ((data[i] & 0x3f) as u32) << shift;
        shift += 6;
        i += 1;
    }
    (value, i)
}

fn read_signed_varint(data: &[u8]) -> (i32, usize) {
    let (raw, n) = read_unsigned_varint(data);
    let value = if raw & 1 != 0 {
        -((raw >> 1) as i32)
    } else {
        (raw >> 1) as i32
    };
    (value, n.max(1))
}

/// Walks the candidate interpreter's thread/frame graph purely to validate it: used by
/// `interp_finder::check_interp` to reject stale or garbage addresses.
pub fn validates_as_interpreter<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    interp_addr: usize,
) -> bool {
    let mut cache = StringCache::new(16);
    walk_interpreter(process, descriptor, interp_addr, &mut cache)
        .map(|threads| !threads.is_empty() && threads.iter().all(|t| !t.invalid))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classic_lnotab_decode() {
        let table = [0x00u8, 0x01, 0x06, 0x02];
        assert_eq!(decode_line_classic(10, 8, &table), 13);
    }

    #[test]
    fn test_310_lnotab_decode_with_terminator() {
        let table = [0x04u8, 0x01, 0xff, 0x00];
        assert_eq!(decode_line_310(1, 10, &table), 2);
    }

    #[test]
    fn test_pep626_long_form_record() {
        // header: advance=4 (low3=3), form=14 -> byte = 3 | (14 << 3) = 0x73
        let mut table = vec![0x73u8];
        write_signed_varint(&mut table, 3); // line_delta
        write_signed_varint(&mut table, 0); // end_line_delta
        write_signed_varint(&mut table, 5); // column
        write_signed_varint(&mut table, 12); // end_column

        let (line, line_end, column, column_end) = decode_line_pep626(20, 0, &table);
        assert_eq!(line, 23);
        assert_eq!(line_end, 23);
        assert_eq!(column, 5);
        assert_eq!(column_end, 12);
    }

    fn write_signed_varint(out: &mut Vec<u8>, value: i32) {
        let raw = if value < 0 {
            ((-value) as u32) << 1 | 1
        } else {
            (value as u32) << 1
        };
        write_unsigned_varint(out, raw);
    }

    fn write_unsigned_varint(out: &mut Vec<u8>, mut value: u32) {
        loop {
            let mut byte = (value & 0x3f) as u8;
            value >>= 6;
            if value != 0 {
                byte |= 0x40;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    #[test]
    fn test_pep626_long_form_record_with_multi_byte_delta() {
        // a column delta of 70 needs two continuation bytes; exercises the low-order-first
        // varint decode rather than the single-byte case every other delta in this table hits.
        let mut table = vec![0x73u8];
        write_signed_varint(&mut table, 1);
        write_signed_varint(&mut table, 0);
        write_signed_varint(&mut table, 70);
        write_signed_varint(&mut table, 70);

        let (_, _, column, end_column) = decode_line_pep626(20, 0, &table);
        assert_eq!(column, 70);
        assert_eq!(end_column, 70);
    }
}
