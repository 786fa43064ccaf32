/// Conversion of C and libc return values.
pub(crate) mod interop;

pub(crate) mod select;
