//! Event model: what one intercepted call looks like once captured, and how
//! it renders into its CSV row.

use std::fmt::Write as _;

use arrayvec::ArrayString;
use libc::{c_int, c_void, pid_t};

pub use self::alloc::{Calloc, Malloc, Realloc};
pub use self::copy::CopyCall;
pub use self::map::{Mmap, Munmap};
pub use self::task::{Clone3, CloneArgs, ThreadPack};

pub mod alloc;
pub mod copy;
pub mod map;
pub mod task;


/// The closed set of recorded event kinds. Adding one means adding a payload
/// variant, a serializer and a schema row.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Kind {
    Malloc = 0,
    Calloc,
    Free,
    ThreadCreate,
    ThreadExit,
    Exit,
    Fork,
    Realloc,
    Mmap,
    Munmap,
    Strncpy,
    Memcpy,
    Clone3,
}

pub const KIND_COUNT: usize = 13;

impl Kind {
    /// File name under the per-pid log directory, without the `.csv`.
    pub fn file_stem(self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::Calloc => "calloc",
            Self::Free => "free",
            Self::ThreadCreate => "thread_create",
            Self::ThreadExit => "thread_exit",
            Self::Exit => "exit",
            Self::Fork => "fork",
            Self::Realloc => "realloc",
            Self::Mmap => "mmap",
            Self::Munmap => "munmap",
            Self::Strncpy => "strncpy",
            Self::Memcpy => "memcpy",
            Self::Clone3 => "clone3",
        }
    }

    /// Kind-specific tail of the CSV header. Every file starts with
    /// `thread,time_ns` before these columns.
    pub fn schema(self) -> &'static str {
        match self {
            Self::Malloc => "size,return_value",
            Self::Calloc => "members,size_per_member,total_size,return_value",
            Self::Free => "address",
            Self::ThreadCreate => "function,arg",
            Self::ThreadExit => "return_value",
            Self::Exit => "code",
            Self::Fork => "return_value",
            Self::Realloc => "original_pointer,new_size,return_value",
            Self::Mmap => {
                "hint_address,size,executable,readable,writable,inaccessible,shared,\
                 copy_on_write,32_bit,anonymous,exact_hint,no_replace,grows_down,\
                 huge_page,locked,no_blocking,no_reserve,populate,sync,file_desc,\
                 offset,return_value"
            }
            Self::Munmap => "address,size,success",
            Self::Strncpy | Self::Memcpy => "destination,source,size",
            Self::Clone3 => {
                "flags,pidfd,child_tid,parent_tid,exit_signal,stack,stack_size,tls,\
                 set_tid,set_tid_size,cgroup,args_size,return_value"
            }
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::Malloc,
            1 => Self::Calloc,
            2 => Self::Free,
            3 => Self::ThreadCreate,
            4 => Self::ThreadExit,
            5 => Self::Exit,
            6 => Self::Fork,
            7 => Self::Realloc,
            8 => Self::Mmap,
            9 => Self::Munmap,
            10 => Self::Strncpy,
            11 => Self::Memcpy,
            12 => Self::Clone3,
            _ => return None,
        })
    }
}

/// Kind-specific captured arguments.
///
/// The variants split the same way ownership did in the wire-era layout:
/// `Free`, `ThreadExit`, `Exit` and `Fork` are bare scalars, everything else
/// is a struct owned by the event and dropped with it.
#[derive(Clone, Debug)]
pub enum Payload {
    Malloc(Malloc),
    Calloc(Calloc),
    Free(*mut c_void),
    ThreadCreate(ThreadPack),
    ThreadExit(*mut c_void),
    Exit(c_int),
    Fork(pid_t),
    Realloc(Realloc),
    Mmap(Mmap),
    Munmap(Munmap),
    Strncpy(CopyCall),
    Memcpy(CopyCall),
    Clone3(Clone3),
}

// The pointers are captured values: the drain thread renders them, it never
// dereferences them.
unsafe impl Send for Payload {}

/// One intercepted call, queued until the drain worker serializes it.
#[derive(Clone, Debug)]
pub struct Event {
    pub time_ns: u64,
    pub tid: pid_t,
    pub payload: Payload,
}

/// One fully rendered set of row columns. The longest row (`clone3` with
/// eleven u64 fields) stays well inside this.
pub type Row = ArrayString<512>;

impl Payload {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Malloc(_) => Kind::Malloc,
            Self::Calloc(_) => Kind::Calloc,
            Self::Free(_) => Kind::Free,
            Self::ThreadCreate(_) => Kind::ThreadCreate,
            Self::ThreadExit(_) => Kind::ThreadExit,
            Self::Exit(_) => Kind::Exit,
            Self::Fork(_) => Kind::Fork,
            Self::Realloc(_) => Kind::Realloc,
            Self::Mmap(_) => Kind::Mmap,
            Self::Munmap(_) => Kind::Munmap,
            Self::Strncpy(_) => Kind::Strncpy,
            Self::Memcpy(_) => Kind::Memcpy,
            Self::Clone3(_) => Kind::Clone3,
        }
    }

    /// Renders the kind-specific columns, matching [`Kind::schema`].
    pub fn columns(&self, row: &mut Row) {
        match self {
            Self::Malloc(call) => call.columns(row),
            Self::Calloc(call) => call.columns(row),
            Self::Free(ptr) => put_ptr(row, *ptr),
            Self::ThreadCreate(pack) => pack.columns(row),
            Self::ThreadExit(value) => put_ptr(row, *value),
            Self::Exit(code) => {
                let _ = write!(row, "{code}");
            }
            Self::Fork(pid) => {
                let _ = write!(row, "{pid}");
            }
            Self::Realloc(call) => call.columns(row),
            Self::Mmap(call) => call.columns(row),
            Self::Munmap(call) => call.columns(row),
            Self::Strncpy(call) | Self::Memcpy(call) => call.columns(row),
            Self::Clone3(call) => call.columns(row),
        }
    }
}

/// Pointer cell: quoted hex, or the literal `null` for zero.
pub(crate) fn put_ptr(row: &mut Row, ptr: *const c_void) {
    if ptr.is_null() {
        row.push_str("null");
    } else {
        let _ = write!(row, "\"{ptr:p}\"");
    }
}

/// Boolean cell.
pub(crate) fn put_bool(row: &mut Row, val: bool) {
    row.push_str(if val { "True" } else { "False" });
}
