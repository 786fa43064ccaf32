//! Lazy two-way selection on flags and C status codes.

pub(crate) trait Select {
    /// `set()` if the selector is true or non-zero, `unset()` otherwise.
    fn select<T>(&self, set: impl FnOnce() -> T, unset: impl FnOnce() -> T) -> T;
}

impl Select for bool {
    #[inline(always)]
    fn select<T>(&self, set: impl FnOnce() -> T, unset: impl FnOnce() -> T) -> T {
        if *self {
            set()
        } else {
            unset()
        }
    }
}

macro_rules! impl_select_for_status {
    ($($t:ty)*) => ($(
        impl Select for $t {
            #[inline(always)]
            fn select<T>(&self, set: impl FnOnce() -> T, unset: impl FnOnce() -> T) -> T {
                (*self != 0).select(set, unset)
            }
        }
    )*)
}

impl_select_for_status!(i32 u32);
