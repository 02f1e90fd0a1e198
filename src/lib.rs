#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # xselection: X11 selections for window managers
//!
//! This crate lets a window manager own X11 selections and answer requests for their content
//! following the ICCCM, including incremental (`INCR`) transfers of large payloads.
//!
//! ## Structure of the crate
//!
//! - [`selection`] contains the ownership bookkeeping and the transfer engine. It is independent
//!   of any particular X connection and talks to the server through the
//!   [`SelectionConnection`](selection::SelectionConnection) trait.
//! - [`backend`] contains the implementation of that trait on top of [`x11rb`].
//! - [`utils`] contains small helper types, like the wrap-around aware [`Timestamp`](utils::Timestamp).
//!
//! ## General principles
//!
//! ### The event loop and state handling
//!
//! Incremental transfers are driven by property deletions of the requestor and abandoned after a
//! timeout. Those timeouts are scheduled on a [`calloop`] event loop, whose shared state is
//! expected to implement [`SelectionHandler`](selection::SelectionHandler) and to hold the
//! [`SelectionState`](selection::SelectionState).
//!
//! Reading events from the X connection is left to the window manager. Events relevant to
//! selections are converted into [`SelectionEvent`](selection::SelectionEvent)s and passed to
//! [`selection::dispatch`].
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod selection;
pub mod utils;

pub mod reexports;
