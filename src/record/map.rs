use std::fmt::Write as _;

use libc::{c_int, c_void, off_t};

use super::{put_bool, put_ptr, Row};

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
const MAP_32BIT: c_int = libc::MAP_32BIT;
// The flag only exists on x86; a zero mask renders the column as a constant
// `False` elsewhere.
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
const MAP_32BIT: c_int = 0;

// Column order of the boolean flag block in `mmap.csv`.
const FLAG_ORDER: [c_int; 13] = [
    libc::MAP_SHARED,
    libc::MAP_PRIVATE,
    MAP_32BIT,
    libc::MAP_ANON,
    libc::MAP_FIXED,
    libc::MAP_FIXED_NOREPLACE,
    libc::MAP_GROWSDOWN,
    libc::MAP_HUGETLB,
    libc::MAP_LOCKED,
    libc::MAP_NONBLOCK,
    libc::MAP_NORESERVE,
    libc::MAP_POPULATE,
    libc::MAP_SYNC,
];

/// `mmap(addr, len, prot, flags, fd, offset) -> ret`, kept raw; the
/// protection and flag bits are decoded into columns at render time.
#[derive(Clone, Debug)]
pub struct Mmap {
    pub addr: *mut c_void,
    pub len: usize,
    pub prot: c_int,
    pub flags: c_int,
    pub fd: c_int,
    pub offset: off_t,
    pub ret: *mut c_void,
}

impl Mmap {
    /// A mapping nobody can execute, read or write.
    pub fn inaccessible(&self) -> bool {
        self.prot & (libc::PROT_EXEC | libc::PROT_READ | libc::PROT_WRITE) == 0
    }

    pub(crate) fn columns(&self, row: &mut Row) {
        put_ptr(row, self.addr);
        let _ = write!(row, ",{},", self.len);
        for prot in [libc::PROT_EXEC, libc::PROT_READ, libc::PROT_WRITE] {
            put_bool(row, self.prot & prot != 0);
            row.push(',');
        }
        put_bool(row, self.inaccessible());
        row.push(',');
        for flag in FLAG_ORDER {
            put_bool(row, self.flags & flag != 0);
            row.push(',');
        }
        let _ = write!(row, "{},{},", self.fd, self.offset);
        put_ptr(row, self.ret);
    }
}

/// `munmap(addr, len) -> ret`.
#[derive(Clone, Debug)]
pub struct Munmap {
    pub addr: *mut c_void,
    pub len: usize,
    pub ret: c_int,
}

impl Munmap {
    pub(crate) fn columns(&self, row: &mut Row) {
        put_ptr(row, self.addr);
        let _ = write!(row, ",{},", self.len);
        put_bool(row, self.ret == 0);
    }
}
