pub(crate) mod zero;

pub(crate) use zero::*;
