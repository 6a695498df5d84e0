pub(crate) mod classify;
pub(crate) mod dump;
pub(crate) mod source;
