cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")]{
        pub(crate) mod darwin;
        pub use darwin::*;
    }
}
