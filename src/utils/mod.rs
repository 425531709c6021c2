pub(crate) mod http;
pub(crate) mod sse;

#[doc(hidden)]
pub mod test_support;
