//! Internal macros for zerocopy header boilerplate.

/// Generates getter methods for header fields stored as little-endian
/// wrapper types (`U16`, `U32`, `U64`).
#[macro_export]
macro_rules! le_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
