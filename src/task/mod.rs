#![forbid(unsafe_code)]

pub mod dispatch;
pub mod model;
pub mod storage;
pub mod store;
