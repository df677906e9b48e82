pub(crate) mod atomic;
pub(crate) mod bitmap;
pub(crate) mod notify;
