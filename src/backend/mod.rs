//! Backends connecting the selection owner to an X server
//!
//! The selection code only relies on the [`SelectionConnection`](crate::selection::SelectionConnection)
//! trait. [`x11`] provides the implementation used with a live server.

pub mod x11;
