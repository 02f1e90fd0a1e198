//! [`SelectionConnection`] on top of an x11rb connection
//!
//! The connection is shared with the rest of the window manager, nothing here reads events
//! from it. Events relevant to the selection owner have to be routed to
//! [`dispatch`](crate::selection::dispatch) by whoever does.

use std::{fmt, sync::Arc};

use x11rb::{
    connection::{Connection, RequestConnection},
    errors::ConnectionError as X11ConnectionError,
    protocol::xproto::{
        Atom, ChangeWindowAttributesAux, ConnectionExt as _, CreateWindowAux, EventMask, PropMode,
        SelectionNotifyEvent, Window as X11Window, WindowClass,
    },
};

use crate::{
    selection::{ConnectionError, PropertyFormat, SelectionAtoms, SelectionConnection},
    utils::Timestamp,
};

/// Size of the fixed part of a `ChangeProperty` request
const CHANGE_PROPERTY_HEADER: usize = 24;

/// An x11rb connection used by the selection owner
pub struct X11Connection<C> {
    conn: Arc<C>,
    screen_num: usize,
}

impl<C> fmt::Debug for X11Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X11Connection")
            .field("screen_num", &self.screen_num)
            .finish_non_exhaustive()
    }
}

impl<C> Clone for X11Connection<C> {
    fn clone(&self) -> Self {
        X11Connection {
            conn: self.conn.clone(),
            screen_num: self.screen_num,
        }
    }
}

impl<C: Connection> X11Connection<C> {
    /// Wraps a connection. The selection window will be created on the given screen.
    pub fn new(conn: Arc<C>, screen_num: usize) -> Self {
        X11Connection { conn, screen_num }
    }

    /// The underlying connection
    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    /// Screen the selection window is created on
    pub fn screen_num(&self) -> usize {
        self.screen_num
    }

    /// Interns the atoms needed by the selection owner
    pub fn intern_atoms(&self) -> Result<SelectionAtoms, ConnectionError> {
        Ok(SelectionAtoms::new(&*self.conn)?.reply()?)
    }
}

/// The selection window only receives selection events, which are always delivered
fn selection_window_aux() -> CreateWindowAux {
    CreateWindowAux::new()
}

impl<C: Connection> SelectionConnection for X11Connection<C> {
    fn create_selection_window(&self) -> Result<X11Window, ConnectionError> {
        let screen = self
            .conn
            .setup()
            .roots
            .get(self.screen_num)
            .ok_or(X11ConnectionError::UnknownError)?;

        let window = self.conn.generate_id()?;
        self.conn.create_window(
            screen.root_depth,
            window,
            screen.root,
            0,
            0,
            10,
            10,
            0,
            WindowClass::INPUT_OUTPUT,
            screen.root_visual,
            &selection_window_aux(),
        )?;

        Ok(window)
    }

    fn destroy_window(&self, window: X11Window) -> Result<(), ConnectionError> {
        self.conn.destroy_window(window)?;
        Ok(())
    }

    fn set_selection_owner(
        &self,
        owner: X11Window,
        selection: Atom,
        time: Timestamp,
    ) -> Result<(), ConnectionError> {
        self.conn.set_selection_owner(owner, selection, u32::from(time))?;
        Ok(())
    }

    fn get_selection_owner(&self, selection: Atom) -> Result<X11Window, ConnectionError> {
        Ok(self.conn.get_selection_owner(selection)?.reply()?.owner)
    }

    fn change_property(
        &self,
        window: X11Window,
        property: Atom,
        type_: Atom,
        format: PropertyFormat,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        let len = (data.len() / format.element_size()) as u32;
        self.conn.change_property(
            PropMode::REPLACE,
            window,
            property,
            type_,
            format.bits(),
            len,
            data,
        )?;
        Ok(())
    }

    fn select_property_changes(&self, window: X11Window) -> Result<(), ConnectionError> {
        self.conn.change_window_attributes(
            window,
            &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )?;
        Ok(())
    }

    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), ConnectionError> {
        self.conn.send_event(false, event.requestor, EventMask::NO_EVENT, event)?;
        Ok(())
    }

    fn maximum_property_length(&self) -> usize {
        self.conn
            .maximum_request_bytes()
            .saturating_sub(CHANGE_PROPERTY_HEADER)
    }

    fn flush(&self) -> Result<(), ConnectionError> {
        self.conn.flush()?;
        Ok(())
    }
}
