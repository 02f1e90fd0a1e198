//! Various utilities functions and types

mod timestamp;

pub use self::timestamp::Timestamp;
