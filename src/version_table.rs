//! Runtime-selected descriptor of the byte offsets needed to decode an attached
//! interpreter's in-memory structures.
//!
//! One approach to supporting many ABI generations is generating a Rust struct (and a
//! matching trait impl) per generation via `bindgen`, then dispatching on `Version` to pick
//! a concrete type parameter; that works, but adding a new interpreter version means adding
//! a whole module. This table instead generalizes the narrow, two-field offset lookup
//! already used for `_PyRuntime` (see `runtime_interp_head_offset`/`runtime_tstate_current_offset`
//! below, kept byte-for-byte) to every structure the frame walker touches, so a single walker
//! can read through it regardless of which interpreter generation produced the memory.
use anyhow::Result;

use crate::version::Version;

/// How a Unicode string object's character data is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringLayout {
    /// `PyStringObject` (Python 2): fixed 8-bit bytes stored inline after the header.
    Python2Str,
    /// PEP 393 compact ASCII: bytes stored inline immediately after the `PyASCIIObject` header.
    Python3CompactAscii,
    /// PEP 393 non-compact: character data lives behind a `data`/`utf8` pointer.
    Python3Generic,
}

/// Which encoding a code object's line-number table uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTableEncoding {
    /// `co_lnotab`: byte pairs of (bytecode delta, line delta), pre-3.10.
    Classic,
    /// `co_linetable` 3.10 encoding: `lasti` scaled by 2, 0xff sentinel ends a run.
    Segmented310,
    /// `co_linetable` 3.11+ encoding: variable length records with column info.
    Pep626,
}

/// Whether frames are reached directly off the thread state (`f_back` chain, pre-3.11)
/// or indirectly through an interpreter frame + "previous" chain (3.11+).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLinkage {
    Direct,
    Indirect311,
}

/// Byte offsets (and small layout facts) needed to walk one interpreter generation's
/// interpreter state -> thread state -> frame -> code object graph.
///
/// All offsets are in bytes, relative to the start of the named structure, and assume the
/// native pointer width of the target process (this crate only supports same-bitness attach).
#[derive(Debug, Clone)]
pub struct VersionDescriptor {
    pub version: Version,

    // InterpreterState
    pub interp_tstate_head: usize,
    pub interp_modules: usize,
    pub interp_next: Option<usize>,

    // ThreadState
    pub tstate_next: usize,
    pub tstate_prev: Option<usize>,
    pub tstate_interp: usize,
    pub tstate_thread_id: usize,
    pub tstate_native_thread_id: Option<usize>,
    pub tstate_frame: usize,
    pub frame_linkage: FrameLinkage,

    // Frame (PyFrameObject, or _PyInterpreterFrame for FrameLinkage::Indirect311)
    pub frame_back: Option<usize>,
    pub frame_code: usize,
    /// For `FrameLinkage::Direct`: offset of the frame's own `lasti` field, read as `i32`.
    /// For `FrameLinkage::Indirect311`: offset of `prev_instr`, a `_Py_CODEUNIT*` into the
    /// code object's inline bytecode, read as a pointer and combined with
    /// `code_first_instr_offset` to recover a byte-offset lasti.
    pub frame_lasti: usize,
    pub frame_is_entry: Option<usize>,

    // Code object
    pub code_filename: usize,
    pub code_name: usize,
    pub code_qualname: Option<usize>,
    pub code_firstlineno: usize,
    pub code_linetable: usize,
    pub line_table_encoding: LineTableEncoding,
    /// Offset from the code object's address to the start of its inline bytecode array
    /// (`co_code_adaptive`). Only set for `FrameLinkage::Indirect311`, where `frame_lasti`
    /// is a pointer rather than an index and needs this to convert to a byte offset.
    pub code_first_instr_offset: Option<usize>,

    // String / bytes decoding
    pub string_layout: StringLayout,
    pub ascii_header_size: usize,
    pub ascii_state_offset: usize,
    pub unicode_utf8_ptr_offset: usize,
    pub unicode_utf8_length_offset: usize,
    pub bytes_header_size: usize,
    pub bytes_size_offset: usize,

    // PyRuntimeState (only used when locating the interpreter via `_PyRuntime`)
    pub runtime_interp_head_offset: Option<usize>,
    pub runtime_tstate_current_offset: Option<usize>,
}

/// PyVarObject-style header shared by every variable-sized CPython object on this
/// platform: `ob_refcnt`, `ob_type`, `ob_size`.
#[repr(C)]
struct VarObjectHeader {
    ob_refcnt: isize,
    ob_type: usize,
    ob_size: isize,
}

#[repr(C)]
struct FixedObjectHeader {
    ob_refcnt: isize,
    ob_type: usize,
}

// -- Python 2.7 PyStringObject: header + ob_shash + ob_sstate + inline bytes.
#[repr(C)]
struct PyStringObject27 {
    base: VarObjectHeader,
    ob_shash: isize,
    ob_sstate: i32,
    ob_sval: [u8; 1],
}

// -- PEP 393 PyASCIIObject (stable since 3.3): length, hash, compact state bitfield, wstr.
#[repr(C)]
struct PyASCIIObject3 {
    base: FixedObjectHeader,
    length: isize,
    hash: isize,
    state: u32,
    wstr: usize,
}

#[repr(C)]
struct PyCompactUnicodeObject3 {
    ascii: PyASCIIObject3,
    utf8_length: isize,
    utf8: usize,
    wstr_length: isize,
}

#[repr(C)]
struct PyBytesObject3 {
    base: VarObjectHeader,
    ob_shash: isize,
    ob_sval: [u8; 1],
}

// -- Thread/frame/code shadow layouts. These reconstruct only the field *order* that
// matters for offset computation; bindgen would produce the same numbers from the real
// headers, this just avoids depending on a generated, version-pinned tree of types.

#[repr(C)]
struct ThreadStateLegacy {
    prev: usize,
    next: usize,
    interp: usize,
    frame: usize,
    recursion_depth: i32,
    tracing: i32,
    use_tracing: i32,
    gilstate_counter: i32,
    dict: usize,
    gil_last_holder_pad: [usize; 4],
    thread_id: i64,
}

#[repr(C)]
struct ThreadState311 {
    prev: usize,
    next: usize,
    interp: usize,
    cframe_pad: [usize; 2],
    recursion_depth: i32,
    recursion_headroom: i32,
    cframe_stack_pad: [usize; 4],
    datastack_chunk: usize,
    datastack_top: usize,
    datastack_limit: usize,
    current_frame: usize,
    thread_id: i64,
    native_thread_id: i64,
}

#[repr(C)]
struct FrameObjectLegacy {
    base: VarObjectHeader,
    f_back: usize,
    f_code: usize,
    f_builtins: usize,
    f_globals: usize,
    f_locals: usize,
    f_valuestack: usize,
    f_stacktop: usize,
    f_trace: usize,
    pad: [usize; 4],
    f_lasti: i32,
}

#[repr(C)]
struct InterpreterFrame311 {
    f_func: usize,
    f_globals: usize,
    f_builtins: usize,
    f_locals: usize,
    f_code: usize,
    frame_obj: usize,
    previous: usize,
    localsplus_pad: usize,
    stacktop: i32,
    is_entry: u8,
    owner: u8,
    prev_instr: usize,
}

#[repr(C)]
struct CodeObjectClassic {
    base: VarObjectHeader,
    co_argcount: i32,
    co_nlocals: i32,
    co_stacksize: i32,
    co_flags: i32,
    co_code: usize,
    co_consts: usize,
    co_names: usize,
    co_varnames: usize,
    co_freevars: usize,
    co_cellvars: usize,
    co_filename: usize,
    co_name: usize,
    co_firstlineno: i32,
    co_lnotab: usize,
}

#[repr(C)]
struct CodeObject310 {
    base: VarObjectHeader,
    co_argcount: i32,
    co_posonlyargcount: i32,
    co_kwonlyargcount: i32,
    co_nlocals: i32,
    co_stacksize: i32,
    co_flags: i32,
    co_firstlineno: i32,
    co_code: usize,
    co_consts: usize,
    co_names: usize,
    co_filename: usize,
    co_name: usize,
    co_varnames: usize,
    co_freevars: usize,
    co_cellvars: usize,
    co_linetable: usize,
}

#[repr(C)]
struct CodeObject311 {
    base: VarObjectHeader,
    co_argcount: i32,
    co_posonlyargcount: i32,
    co_kwonlyargcount: i32,
    co_stacksize: i32,
    co_flags: i32,
    co_firstlineno: i32,
    co_nlocalsplus: i32,
    co_nlocals: i32,
    co_nplaincellvars: i32,
    co_ncellvars: i32,
    co_nfreevars: i32,
    co_version: u32,
    co_filename: usize,
    co_name: usize,
    co_qualname: usize,
    co_linetable: usize,
    co_exceptiontable: usize,
}

fn ascii_preamble_size() -> usize {
    std::mem::size_of::<PyASCIIObject3>()
}

fn classic_descriptor(version: Version, legacy_string: bool) -> VersionDescriptor {
    VersionDescriptor {
        version,
        interp_tstate_head: std::mem::offset_of!(InterpHeadLegacy, tstate_head),
        interp_modules: std::mem::offset_of!(InterpHeadLegacy, modules),
        interp_next: Some(std::mem::offset_of!(InterpHeadLegacy, next)),
        tstate_next: std::mem::offset_of!(ThreadStateLegacy, next),
        tstate_prev: Some(std::mem::offset_of!(ThreadStateLegacy, prev)),
        tstate_interp: std::mem::offset_of!(ThreadStateLegacy, interp),
        tstate_thread_id: std::mem::offset_of!(ThreadStateLegacy, thread_id),
        tstate_native_thread_id: None,
        tstate_frame: std::mem::offset_of!(ThreadStateLegacy, frame),
        frame_linkage: FrameLinkage::Direct,
        frame_back: Some(std::mem::offset_of!(FrameObjectLegacy, f_back)),
        frame_code: std::mem::offset_of!(FrameObjectLegacy, f_code),
        frame_lasti: std::mem::offset_of!(FrameObjectLegacy, f_lasti),
        frame_is_entry: None,
        code_filename: std::mem::offset_of!(CodeObjectClassic, co_filename),
        code_name: std::mem::offset_of!(CodeObjectClassic, co_name),
        code_qualname: None,
        code_firstlineno: std::mem::offset_of!(CodeObjectClassic, co_firstlineno),
        code_linetable: std::mem::offset_of!(CodeObjectClassic, co_lnotab),
        line_table_encoding: LineTableEncoding::Classic,
        code_first_instr_offset: None,
        string_layout: if legacy_string {
            StringLayout::Python2Str
        } else {
            StringLayout::Python3CompactAscii
        },
        ascii_header_size: if legacy_string {
            std::mem::offset_of!(PyStringObject27, ob_sval)
        } else {
            ascii_preamble_size()
        },
        ascii_state_offset: std::mem::offset_of!(PyASCIIObject3, state),
        unicode_utf8_ptr_offset: std::mem::offset_of!(PyCompactUnicodeObject3, utf8),
        unicode_utf8_length_offset: std::mem::offset_of!(PyCompactUnicodeObject3, utf8_length),
        bytes_header_size: std::mem::offset_of!(PyBytesObject3, ob_sval),
        bytes_size_offset: std::mem::offset_of!(VarObjectHeader, ob_size),
        runtime_interp_head_offset: None,
        runtime_tstate_current_offset: None,
    }
}

// Pre-3.7 interpreters don't have a _PyRuntime global; the interpreter-state head is
// reached through a simple linked list rooted at a per-interpreter `interp_head` symbol
// instead. Shape it the same as a one-field struct so offset_of! stays uniform.
#[repr(C)]
struct InterpHeadLegacy {
    next: usize,
    tstate_head: usize,
    modules: usize,
}

fn descriptor_310(version: Version) -> VersionDescriptor {
    let mut d = classic_descriptor(version, false);
    d.tstate_prev = Some(std::mem::offset_of!(ThreadStateLegacy, prev));
    d.code_linetable = std::mem::offset_of!(CodeObject310, co_linetable);
    d.code_filename = std::mem::offset_of!(CodeObject310, co_filename);
    d.code_name = std::mem::offset_of!(CodeObject310, co_name);
    d.code_firstlineno = std::mem::offset_of!(CodeObject310, co_firstlineno);
    d.line_table_encoding = LineTableEncoding::Segmented310;
    d
}

fn descriptor_311plus(version: Version) -> VersionDescriptor {
    VersionDescriptor {
        version,
        interp_tstate_head: std::mem::offset_of!(InterpHeadLegacy, tstate_head),
        interp_modules: std::mem::offset_of!(InterpHeadLegacy, modules),
        interp_next: Some(std::mem::offset_of!(InterpHeadLegacy, next)),
        tstate_next: std::mem::offset_of!(ThreadState311, next),
        tstate_prev: Some(std::mem::offset_of!(ThreadState311, prev)),
        tstate_interp: std::mem::offset_of!(ThreadState311, interp),
        tstate_thread_id: std::mem::offset_of!(ThreadState311, thread_id),
        tstate_native_thread_id: Some(std::mem::offset_of!(ThreadState311, native_thread_id)),
        tstate_frame: std::mem::offset_of!(ThreadState311, current_frame),
        frame_linkage: FrameLinkage::Indirect311,
        frame_back: Some(std::mem::offset_of!(InterpreterFrame311, previous)),
        frame_code: std::mem::offset_of!(InterpreterFrame311, f_code),
        frame_lasti: std::mem::offset_of!(InterpreterFrame311, prev_instr),
        frame_is_entry: Some(std::mem::offset_of!(InterpreterFrame311, is_entry)),
        code_filename: std::mem::offset_of!(CodeObject311, co_filename),
        code_name: std::mem::offset_of!(CodeObject311, co_name),
        code_qualname: Some(std::mem::offset_of!(CodeObject311, co_qualname)),
        code_firstlineno: std::mem::offset_of!(CodeObject311, co_firstlineno),
        code_linetable: std::mem::offset_of!(CodeObject311, co_linetable),
        line_table_encoding: LineTableEncoding::Pep626,
        code_first_instr_offset: Some(std::mem::size_of::<CodeObject311>()),
        string_layout: StringLayout::Python3CompactAscii,
        ascii_header_size: ascii_preamble_size(),
        ascii_state_offset: std::mem::offset_of!(PyASCIIObject3, state),
        unicode_utf8_ptr_offset: std::mem::offset_of!(PyCompactUnicodeObject3, utf8),
        unicode_utf8_length_offset: std::mem::offset_of!(PyCompactUnicodeObject3, utf8_length),
        bytes_header_size: std::mem::offset_of!(PyBytesObject3, ob_sval),
        bytes_size_offset: std::mem::offset_of!(VarObjectHeader, ob_size),
        runtime_interp_head_offset: None,
        runtime_tstate_current_offset: None,
    }
}

/// Picks the one `VersionDescriptor` that applies to `version`, falling back to the
/// newest known descriptor for minor versions beyond what this table names explicitly
/// (the same "use the latest known ABI" fallback applied elsewhere when dispatching on
/// interpreter version).
pub fn descriptor_for(version: &Version) -> Result<VersionDescriptor> {
    let mut d = match (version.major, version.minor) {
        (2, _) => classic_descriptor(version.clone(), true),
        (3, 0..=9) => classic_descriptor(version.clone(), false),
        (3, 10) => descriptor_310(version.clone()),
        (3, 11..) => descriptor_311plus(version.clone()),
        _ => return Err(format_err!("unsupported interpreter version {}", version)),
    };

    d.runtime_interp_head_offset = runtime_interp_head_offset(version);
    d.runtime_tstate_current_offset = runtime_tstate_current_offset(version);
    Ok(d)
}

// --- _PyRuntime offsets -----------------------------------------------------------------
//
// PyRuntimeState embeds several platform-sized mutexes ahead of the fields this crate
// cares about, so these can't be derived with `offset_of!` against a portable struct
// definition the way the rest of this table is. These numbers come from introspecting
// real interpreter builds across supported platforms and architectures.

#[cfg(target_arch = "x86")]
fn runtime_interp_head_offset(version: &Version) -> Option<usize> {
    Some(match version {
        Version {
            major: 3,
            minor: 8,
            patch: 0,
            ..
        } => match version.release_flags.as_ref() {
            "a1" | "a2" => 16,
            "a3" | "a4" => 20,
            _ => 24,
        },
        Version {
            major: 3,
            minor: 8..=10,
            ..
        } => 24,
        _ => 16,
    })
}

#[cfg(target_arch = "arm")]
fn runtime_interp_head_offset(version: &Version) -> Option<usize> {
    Some(match version {
        Version {
            major: 3, minor: 7, ..
        } => 20,
        _ => 28,
    })
}

#[cfg(target_pointer_width = "64")]
fn runtime_interp_head_offset(version: &Version) -> Option<usize> {
    Some(match version {
        Version {
            major: 3,
            minor: 8,
            patch: 0,
            ..
        } => match version.release_flags.as_ref() {
            "a1" | "a2" => 24,
            _ => 32,
        },
        Version {
            major: 3,
            minor: 8..=10,
            ..
        } => 32,
        Version {
            major: 3,
            minor: 11..,
            ..
        } => 40,
        _ => 24,
    })
}

#[cfg(target_os = "macos")]
fn runtime_tstate_current_offset(version: &Version) -> Option<usize> {
    match version {
        Version {
            major: 3,
            minor: 7,
            patch: 0..=3,
            ..
        } => Some(1440),
        Version {
            major: 3, minor: 7, ..
        } => Some(1528),
        Version {
            major: 3,
            minor: 8,
            patch: 0,
            ..
        } => match version.release_flags.as_ref() {
            "a1" => Some(1432),
            "a2" => Some(888),
            "a3" | "a4" => Some(1448),
            _ => Some(1416),
        },
        Version {
            major: 3, minor: 8, ..
        } => Some(1416),
        Version {
            major: 3,
            minor: 9..=10,
            ..
        } => Some(616),
        Version {
            major: 3,
            minor: 11,
            ..
        } => Some(624),
        _ => None,
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86"))]
fn runtime_tstate_current_offset(version: &Version) -> Option<usize> {
    match version {
        Version {
            major: 3, minor: 7, ..
        } => Some(796),
        Version {
            major: 3,
            minor: 8,
            patch: 0,
            ..
        } => match version.release_flags.as_ref() {
            "a1" => Some(792),
            "a2" => Some(512),
            "a3" | "a4" => Some(800),
            _ => Some(788),
        },
        Version {
            major: 3, minor: 8, ..
        } => Some(788),
        Version {
            major: 3,
            minor: 9..=10,
            ..
        } => Some(352),
        _ => None,
    }
}

#[cfg(all(target_os = "linux", target_arch = "arm"))]
fn runtime_tstate_current_offset(version: &Version) -> Option<usize> {
    match version {
        Version {
            major: 3, minor: 7, ..
        } => Some(828),
        Version {
            major: 3, minor: 8, ..
        } => Some(804),
        Version {
            major: 3,
            minor: 9..=11,
            ..
        } => Some(364),
        _ => None,
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn runtime_tstate_current_offset(version: &Version) -> Option<usize> {
    match version {
        Version {
            major: 3,
            minor: 7,
            patch: 0..=3,
            ..
        } => Some(1408),
        Version {
            major: 3, minor: 7, ..
        } => Some(1496),
        Version {
            major: 3, minor: 8, ..
        } => Some(1384),
        Version {
            major: 3,
            minor: 9..=10,
            ..
        } => Some(584),
        Version {
            major: 3,
            minor: 11,
            ..
        } => Some(592),
        _ => None,
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn runtime_tstate_current_offset(version: &Version) -> Option<usize> {
    match version {
        Version {
            major: 3,
            minor: 7,
            patch: 0..=3,
            ..
        } => Some(1392),
        Version {
            major: 3, minor: 7, ..
        } => Some(1480),
        Version {
            major: 3,
            minor: 8,
            patch: 0,
            ..
        } => match version.release_flags.as_ref() {
            "a1" => Some(1384),
            "a2" => Some(840),
            "a3" | "a4" => Some(1400),
            _ => Some(1368),
        },
        Version {
            major: 3, minor: 8, ..
        } => match version.build_metadata.as_deref() {
            Some("cinder") => Some(1384),
            _ => Some(1368),
        },
        Version {
            major: 3,
            minor: 9..=10,
            ..
        } => Some(568),
        Version {
            major: 3,
            minor: 11,
            ..
        } => Some(576),
        _ => None,
    }
}

#[cfg(all(
    target_os = "linux",
    any(
        target_arch = "powerpc64",
        target_arch = "powerpc",
        target_arch = "mips"
    )
))]
fn runtime_tstate_current_offset(_version: &Version) -> Option<usize> {
    None
}

#[cfg(windows)]
fn runtime_tstate_current_offset(version: &Version) -> Option<usize> {
    match version {
        Version {
            major: 3,
            minor: 7,
            patch: 0..=3,
            ..
        } => Some(1320),
        Version {
            major: 3,
            minor: 8,
            patch: 0,
            ..
        } => match version.release_flags.as_ref() {
            "a1" => Some(1312),
            "a2" => Some(768),
            "a3" | "a4" => Some(1328),
            _ => Some(1296),
        },
        Version {
            major: 3, minor: 8, ..
        } => Some(1296),
        Version {
            major: 3,
            minor: 9..=10,
            ..
        } => Some(496),
        Version {
            major: 3,
            minor: 11,
            ..
        } => Some(504),
        _ => None,
    }
}

#[cfg(target_os = "freebsd")]
fn runtime_tstate_current_offset(version: &Version) -> Option<usize> {
    match version {
        Version {
            major: 3,
            minor: 7,
            patch: 0..=3,
            ..
        } => Some(1248),
        Version {
            major: 3,
            minor: 7,
            patch: 4..=7,
            ..
        } => Some(1336),
        Version {
            major: 3,
            minor: 8,
            patch: 0,
            ..
        } => match version.release_flags.as_ref() {
            "a1" => Some(1240),
            "a2" => Some(696),
            "a3" | "a4" => Some(1256),
            _ => Some(1224),
        },
        Version {
            major: 3, minor: 8, ..
        } => Some(1224),
        Version {
            major: 3,
            minor: 9..=10,
            ..
        } => Some(424),
        Version {
            major: 3,
            minor: 11,
            ..
        } => Some(432),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u64, minor: u64, patch: u64) -> Version {
        Version {
            major,
            minor,
            patch,
            release_flags: String::new(),
            build_metadata: None,
        }
    }

    #[test]
    fn test_descriptor_selection_is_stable_per_generation() {
        let d37 = descriptor_for(&v(3, 7, 0)).unwrap();
        assert_eq!(d37.line_table_encoding, LineTableEncoding::Classic);
        assert_eq!(d37.frame_linkage, FrameLinkage::Direct);

        let d310 = descriptor_for(&v(3, 10, 0)).unwrap();
        assert_eq!(d310.line_table_encoding, LineTableEncoding::Segmented310);

        let d311 = descriptor_for(&v(3, 11, 0)).unwrap();
        assert_eq!(d311.line_table_encoding, LineTableEncoding::Pep626);
        assert_eq!(d311.frame_linkage, FrameLinkage::Indirect311);
        assert!(d311.code_qualname.is_some());
    }

    #[test]
    fn test_unknown_minor_falls_back_to_newest_known() {
        // a hypothetical future 3.x release should reuse the 3.11+ shaped descriptor
        let future = descriptor_for(&v(3, 99, 0)).unwrap();
        assert_eq!(future.line_table_encoding, LineTableEncoding::Pep626);
    }

    #[test]
    fn test_python2_uses_legacy_string_layout() {
        let d27 = descriptor_for(&v(2, 7, 18)).unwrap();
        assert_eq!(d27.string_layout, StringLayout::Python2Str);
    }
}
