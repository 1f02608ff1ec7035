use std::fmt::Write as _;

use libc::c_void;

use super::{put_ptr, Row};

/// Shared shape of `memcpy` and `strncpy`: a bounded transfer from `src`
/// into `dest`.
#[derive(Clone, Debug)]
pub struct CopyCall {
    pub dest: *mut c_void,
    pub src: *const c_void,
    pub n: usize,
}

impl CopyCall {
    pub(crate) fn columns(&self, row: &mut Row) {
        put_ptr(row, self.dest);
        row.push(',');
        put_ptr(row, self.src);
        let _ = write!(row, ",{}", self.n);
    }
}
