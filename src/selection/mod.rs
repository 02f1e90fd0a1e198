//! X11 selection ownership and data transfer
//!
//! This module lets a window manager own X11 selections (`PRIMARY`, `CLIPBOARD`, ...) and serve
//! their content to other clients following the ICCCM, including the incremental (`INCR`)
//! protocol for payloads that do not fit into a single property write.
//!
//! The content itself is not interpreted here. Whenever a client asks for a selection the
//! [`SelectionHandler`] is asked for a [`SelectionData`] payload in the requested target, which
//! is then delivered either in one go or chunk by chunk.
//!
//! ```no_run
//! use xselection::selection::{self, SelectionData, SelectionHandler, SelectionState, SelectionEvent};
//! use xselection::backend::x11::X11Connection;
//! use xselection::reexports::{calloop::EventLoop, x11rb::{self, protocol::xproto::Atom, rust_connection::RustConnection}};
//! use std::sync::Arc;
//!
//! struct State {
//!     selection: SelectionState<Self>,
//!     clipboard: Vec<u8>,
//! }
//!
//! impl SelectionHandler for State {
//!     type Connection = X11Connection<RustConnection>;
//!     type Handle = ();
//!
//!     fn selection_state(&mut self) -> &mut SelectionState<Self> {
//!         &mut self.selection
//!     }
//!
//!     fn resolve_selection(&mut self, _selection: Atom, _target: Atom) -> Option<SelectionData<()>> {
//!         Some(SelectionData::new((), self.clipboard.clone()))
//!     }
//! }
//!
//! let event_loop = EventLoop::<State>::try_new().unwrap();
//! let (conn, screen) = x11rb::connect(None).unwrap();
//! let conn = X11Connection::new(Arc::new(conn), screen);
//! let atoms = conn.intern_atoms().unwrap();
//! let selection = SelectionState::new(conn, atoms, event_loop.handle(), Default::default()).unwrap();
//! let mut state = State { selection, clipboard: b"hello".to_vec() };
//!
//! state.selection.acquire(atoms.CLIPBOARD).unwrap();
//!
//! // then, for every event read from the connection:
//! # let event: x11rb::protocol::Event = unimplemented!();
//! if let Ok(event) = SelectionEvent::try_from(event) {
//!     selection::dispatch(&mut state, event);
//! }
//! ```

use std::{collections::HashMap, fmt, time::Instant};

use calloop::LoopHandle;
use tracing::{debug, warn};
use x11rb::protocol::{
    xproto::{
        Atom, PropertyNotifyEvent, SelectionClearEvent, SelectionRequestEvent, Window as X11Window,
    },
    Event,
};

use crate::utils::Timestamp;

mod config;
mod connection;
mod ownership;
mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use self::config::{SelectionConfig, DEFAULT_INCR_TIMEOUT, INCR_CHUNK_SIZE};
pub use self::connection::{send_selection_notify_resp, ConnectionError, PropertyFormat, SelectionConnection};
pub use self::ownership::{
    handle_selection_clear, handle_selection_request, AcquireError, Claim, OwnershipManager, RejectReason,
};
pub use self::transfer::{
    begin, expire_transfers, handle_property_notify, reject, window_destroyed, IncrState, PendingTransfer,
    TransferError, TransferMode,
};

#[allow(missing_docs)]
mod atoms {
    x11rb::atom_manager! {
        /// Atoms used by the selection owner
        pub SelectionAtoms:
        SelectionAtomsCookie {
            CLIPBOARD,
            PRIMARY,
            INCR,
            TIMESTAMP,
        }
    }
}
pub use self::atoms::{SelectionAtoms, SelectionAtomsCookie};

/// Events the selection owner reacts to
#[derive(Debug, Clone)]
pub enum SelectionEvent {
    /// Another client took over one of our selections
    Clear(SelectionClearEvent),
    /// A client asks for the content of one of our selections
    Request(SelectionRequestEvent),
    /// A property changed on a window we listen to
    PropertyNotify(PropertyNotifyEvent),
}

impl SelectionEvent {
    /// Server time attached to the event
    pub fn time(&self) -> Timestamp {
        match self {
            SelectionEvent::Clear(event) => event.time.into(),
            SelectionEvent::Request(event) => event.time.into(),
            SelectionEvent::PropertyNotify(event) => event.time.into(),
        }
    }
}

impl TryFrom<Event> for SelectionEvent {
    type Error = Event;

    fn try_from(event: Event) -> Result<Self, Self::Error> {
        match event {
            Event::SelectionClear(event) => Ok(SelectionEvent::Clear(event)),
            Event::SelectionRequest(event) => Ok(SelectionEvent::Request(event)),
            Event::PropertyNotify(event) => Ok(SelectionEvent::PropertyNotify(event)),
            event => Err(event),
        }
    }
}

/// Routes an event to the ownership or transfer handling.
pub fn dispatch<D>(state: &mut D, event: SelectionEvent)
where
    D: SelectionHandler + 'static,
{
    match event {
        SelectionEvent::Clear(event) => handle_selection_clear(state, event),
        SelectionEvent::Request(event) => handle_selection_request(state, event),
        SelectionEvent::PropertyNotify(event) => handle_property_notify(state, event),
    }
}

/// A request for selection content, as seen by the transfer code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    /// Window asking for the content
    pub requestor: X11Window,
    /// Requested selection
    pub selection: Atom,
    /// Requested content type
    pub target: Atom,
    /// Property of the requestor window to store the content in
    pub property: Atom,
    /// Time of the request
    pub time: Timestamp,
}

impl TransferRequest {
    /// The (requestor, property) pair identifying the transfer
    pub fn key(&self) -> TransferKey {
        TransferKey {
            requestor: self.requestor,
            property: self.property,
        }
    }
}

impl From<&SelectionRequestEvent> for TransferRequest {
    fn from(event: &SelectionRequestEvent) -> Self {
        TransferRequest {
            requestor: event.requestor,
            selection: event.selection,
            target: event.target,
            // obsolete clients leave the property empty and expect the target to be used
            property: if event.property == x11rb::NONE {
                event.target
            } else {
                event.property
            },
            time: event.time.into(),
        }
    }
}

/// Identifies a pending transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKey {
    /// Window receiving the data
    pub requestor: X11Window,
    /// Property the data is written to
    pub property: Atom,
}

/// Selection content supplied by the [`SelectionHandler`]
///
/// The handle is kept for as long as the content is being delivered and handed back through
/// [`SelectionHandler::release_handle`] once the delivery is over, whatever its outcome.
pub struct SelectionData<H> {
    handle: H,
    type_: Option<Atom>,
    format: PropertyFormat,
    data: Vec<u8>,
}

impl<H> fmt::Debug for SelectionData<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionData")
            .field("handle", &"...")
            .field("type_", &self.type_)
            .field("format", &self.format)
            .field("len", &self.data.len())
            .finish()
    }
}

impl<H> SelectionData<H> {
    /// Byte content, stored with the requested target as its type
    pub fn new(handle: H, data: impl Into<Vec<u8>>) -> Self {
        SelectionData {
            handle,
            type_: None,
            format: PropertyFormat::Bits8,
            data: data.into(),
        }
    }

    /// A list of 32-bit values, like atoms or integers, stored with the given type
    pub fn from_u32s(handle: H, type_: Atom, values: &[u32]) -> Self {
        SelectionData {
            handle,
            type_: Some(type_),
            format: PropertyFormat::Bits32,
            data: values.iter().flat_map(|value| value.to_ne_bytes()).collect(),
        }
    }

    /// Stores the content with a type other than the requested target
    pub fn with_type(mut self, type_: Atom) -> Self {
        self.type_ = Some(type_);
        self
    }

    /// Explicit property type, if any
    pub fn type_(&self) -> Option<Atom> {
        self.type_
    }

    /// Element size of the content
    pub fn format(&self) -> PropertyFormat {
        self.format
    }

    /// Raw content in native byte order
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the content in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the content is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn into_parts(self) -> (H, Option<Atom>, PropertyFormat, Vec<u8>) {
        (self.handle, self.type_, self.format, self.data)
    }
}

/// Handler trait for the selection owner
///
/// This is the link to whatever decides on selection content, e.g. a scripting layer.
/// All methods are called from within [`dispatch`] and friends on the event loop thread.
pub trait SelectionHandler: Sized {
    /// Connection to the X server
    type Connection: SelectionConnection;
    /// Opaque reference to the producer of a payload, kept alive while it is being delivered
    type Handle;

    /// [`SelectionState`] getter
    fn selection_state(&mut self) -> &mut SelectionState<Self>;

    /// A client requested the content of `selection` converted to `target`.
    ///
    /// Returning `None` refuses the request. This is called synchronously while handling the
    /// event and must not wait on the X connection itself.
    fn resolve_selection(&mut self, selection: Atom, target: Atom) -> Option<SelectionData<Self::Handle>>;

    /// Another client took over a selection we owned
    fn ownership_lost(&mut self, selection: Atom) {
        let _ = selection;
    }

    /// Delivery of a payload could not be completed
    fn transfer_failed(&mut self, handle: &Self::Handle, error: &TransferError) {
        let _ = (handle, error);
    }

    /// A payload handle is no longer used.
    ///
    /// Called exactly once for every handle returned by [`resolve_selection`](Self::resolve_selection)
    /// or passed to [`begin`].
    fn release_handle(&mut self, handle: Self::Handle) {
        let _ = handle;
    }
}

/// State of the selection owner
///
/// Owns the window used to hold selections and all bookkeeping about claims and running
/// transfers. Dropping it destroys the window, which implicitly gives up all selections.
/// Call [`SelectionState::teardown`] beforehand to have pending payload handles released.
pub struct SelectionState<D: SelectionHandler> {
    pub(crate) conn: D::Connection,
    pub(crate) atoms: SelectionAtoms,
    pub(crate) config: SelectionConfig,
    pub(crate) ownership: OwnershipManager,
    pub(crate) transfers: HashMap<TransferKey, PendingTransfer<D::Handle>>,
    pub(crate) loop_handle: LoopHandle<'static, D>,
    next_transfer_id: u64,
}

impl<D: SelectionHandler> fmt::Debug for SelectionState<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionState")
            .field("conn", &"...")
            .field("atoms", &self.atoms)
            .field("config", &self.config)
            .field("ownership", &self.ownership)
            .field("transfers", &self.transfers)
            .finish()
    }
}

impl<D: SelectionHandler> Drop for SelectionState<D> {
    fn drop(&mut self) {
        let _ = self.conn.destroy_window(self.ownership.window());
        let _ = self.conn.flush();
    }
}

impl<D: SelectionHandler + 'static> SelectionState<D> {
    /// Creates the selection owner, including its window.
    ///
    /// Timeouts of incremental transfers are scheduled on the given event loop.
    pub fn new(
        conn: D::Connection,
        atoms: SelectionAtoms,
        loop_handle: LoopHandle<'static, D>,
        config: SelectionConfig,
    ) -> Result<Self, ConnectionError> {
        let window = conn.create_selection_window()?;
        conn.flush()?;

        debug!(selection_window = window, ?config, "Selection owner init");

        Ok(SelectionState {
            conn,
            atoms,
            config,
            ownership: OwnershipManager::new(window),
            transfers: HashMap::new(),
            loop_handle,
            next_transfer_id: 0,
        })
    }

    /// Abandons all running transfers and gives up all selections.
    ///
    /// Every pending payload handle is reported as failed and released.
    pub fn teardown(state: &mut D) {
        let keys = state.selection_state().transfers.keys().copied().collect::<Vec<_>>();
        for key in keys {
            transfer::abandon(state, key, TransferError::Shutdown);
        }

        let selection_state = state.selection_state();
        let selections = selection_state.ownership.claims().map(|claim| claim.selection).collect::<Vec<_>>();
        for selection in selections {
            if let Err(err) = selection_state.release(selection) {
                warn!(?err, selection, "Failed to give up selection during teardown");
            }
        }
    }

    pub(crate) fn next_transfer_id(&mut self) -> u64 {
        self.next_transfer_id += 1;
        self.next_transfer_id
    }
}

impl<D: SelectionHandler> SelectionState<D> {
    /// Connection used by the selection owner
    pub fn connection(&self) -> &D::Connection {
        &self.conn
    }

    /// Interned atoms
    pub fn atoms(&self) -> &SelectionAtoms {
        &self.atoms
    }

    /// Active configuration
    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Window used to own selections
    pub fn window(&self) -> X11Window {
        self.ownership.window()
    }

    /// Ownership bookkeeping
    pub fn ownership(&self) -> &OwnershipManager {
        &self.ownership
    }

    /// Active claim on a selection, if any
    pub fn claim(&self, selection: Atom) -> Option<&Claim> {
        self.ownership.claim(selection)
    }

    /// Makes a server time known to the selection owner.
    ///
    /// The most recent time seen is used when acquiring selections. Events passed to
    /// [`dispatch`] are accounted for automatically, other events (e.g. input) carrying a
    /// timestamp should be reported here.
    pub fn observe_timestamp(&mut self, time: Timestamp) {
        self.ownership.observe_timestamp(time);
    }

    /// Incremental transfer writing to the given property, if any
    pub fn pending_transfer(&self, requestor: X11Window, property: Atom) -> Option<&PendingTransfer<D::Handle>> {
        self.transfers.get(&TransferKey { requestor, property })
    }

    /// All running incremental transfers
    pub fn pending_transfers(&self) -> impl Iterator<Item = &PendingTransfer<D::Handle>> {
        self.transfers.values()
    }

    /// Time at which the transfer writing to the given property will be abandoned
    pub fn transfer_deadline(&self, requestor: X11Window, property: Atom) -> Option<Instant> {
        self.pending_transfer(requestor, property)
            .map(|transfer| transfer.deadline())
    }
}
