//! Protocol primitives used by the selection code
//!
//! The selection state machine does not talk to the X server directly. Everything it
//! needs goes through the [`SelectionConnection`] trait, which the
//! [`X11Connection`](crate::backend::x11::X11Connection) type implements on top of x11rb.

use x11rb::{
    errors::{ConnectionError as X11ConnectionError, ReplyError, ReplyOrIdError},
    protocol::xproto::{Atom, AtomEnum, SelectionNotifyEvent, Window as X11Window, SELECTION_NOTIFY_EVENT},
};

use crate::utils::Timestamp;

use super::TransferRequest;

/// Size of the elements stored in a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PropertyFormat {
    /// A list of bytes, used for most selection content
    #[default]
    Bits8,
    /// A list of 32-bit values, e.g. atoms or integers
    Bits32,
}

impl PropertyFormat {
    /// Value of the `format` field of the property
    pub fn bits(&self) -> u8 {
        match self {
            PropertyFormat::Bits8 => 8,
            PropertyFormat::Bits32 => 32,
        }
    }

    /// Size of one element in bytes
    pub fn element_size(&self) -> usize {
        match self {
            PropertyFormat::Bits8 => 1,
            PropertyFormat::Bits32 => 4,
        }
    }
}

/// Failure to talk to the X server
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection itself broke
    #[error(transparent)]
    Connection(#[from] X11ConnectionError),
    /// The server answered a request with an error
    #[error(transparent)]
    Reply(#[from] ReplyError),
    /// Failed to send a request or allocate an id
    #[error(transparent)]
    ReplyOrId(#[from] ReplyOrIdError),
}

/// The window and atom primitives the selection code relies on
///
/// All methods mirror a single X11 request. Requests are buffered until [`flush`](Self::flush)
/// is called, with the exception of [`get_selection_owner`](Self::get_selection_owner),
/// which needs a round trip.
pub trait SelectionConnection {
    /// Creates the window that will own selections on behalf of the window manager
    fn create_selection_window(&self) -> Result<X11Window, ConnectionError>;
    /// Destroys a window created by [`create_selection_window`](Self::create_selection_window)
    fn destroy_window(&self, window: X11Window) -> Result<(), ConnectionError>;

    /// Issues a `SetSelectionOwner` request
    fn set_selection_owner(
        &self,
        owner: X11Window,
        selection: Atom,
        time: Timestamp,
    ) -> Result<(), ConnectionError>;
    /// Queries the current owner of a selection, `x11rb::NONE` if there is none
    fn get_selection_owner(&self, selection: Atom) -> Result<X11Window, ConnectionError>;

    /// Replaces the value of a property.
    ///
    /// `data` holds whole elements of the given format in native byte order.
    fn change_property(
        &self,
        window: X11Window,
        property: Atom,
        type_: Atom,
        format: PropertyFormat,
        data: &[u8],
    ) -> Result<(), ConnectionError>;
    /// Starts listening to property changes on a foreign window
    fn select_property_changes(&self, window: X11Window) -> Result<(), ConnectionError>;
    /// Sends a `SelectionNotify` event to its requestor
    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), ConnectionError>;

    /// The largest amount of property data, in bytes, a single request can carry
    fn maximum_property_length(&self) -> usize;
    /// Flushes all buffered requests
    fn flush(&self) -> Result<(), ConnectionError>;
}

/// Answers a selection request, with `success == false` signalling a refusal.
pub fn send_selection_notify_resp<C: SelectionConnection + ?Sized>(
    conn: &C,
    request: &TransferRequest,
    success: bool,
) -> Result<(), ConnectionError> {
    conn.send_selection_notify(SelectionNotifyEvent {
        response_type: SELECTION_NOTIFY_EVENT,
        sequence: 0,
        time: request.time.into(),
        requestor: request.requestor,
        selection: request.selection,
        target: request.target,
        property: if success {
            request.property
        } else {
            AtomEnum::NONE.into()
        },
    })?;
    conn.flush()?;
    Ok(())
}
