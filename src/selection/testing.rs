//! Recording connection and handler state shared by the selection tests

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
};

use calloop::EventLoop;
use x11rb::{
    errors::ConnectionError as X11ConnectionError,
    protocol::xproto::{
        Atom, Property, PropertyNotifyEvent, SelectionClearEvent, SelectionNotifyEvent, SelectionRequestEvent,
        Window as X11Window, PROPERTY_NOTIFY_EVENT, SELECTION_CLEAR_EVENT, SELECTION_REQUEST_EVENT,
    },
};

use crate::utils::Timestamp;

use super::{
    ConnectionError, PropertyFormat, SelectionAtoms, SelectionConfig, SelectionConnection, SelectionData,
    SelectionHandler, SelectionState, TransferError,
};

pub(crate) const OWNER_WINDOW: X11Window = 0x0020_0001;
pub(crate) const REQUESTOR: X11Window = 0x0040_0001;
pub(crate) const OTHER_REQUESTOR: X11Window = 0x0060_0001;
pub(crate) const RIVAL_WINDOW: X11Window = 0x0080_0001;

pub(crate) const ATOMS: SelectionAtoms = SelectionAtoms {
    CLIPBOARD: 300,
    PRIMARY: 1,
    INCR: 301,
    TIMESTAMP: 302,
};
pub(crate) const UTF8_STRING: Atom = 310;
pub(crate) const TARGETS: Atom = 311;
pub(crate) const XSEL_DATA: Atom = 320;
pub(crate) const OTHER_PROPERTY: Atom = 321;

/// A request sent through the [`MockConnection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    CreateWindow(X11Window),
    DestroyWindow(X11Window),
    SetSelectionOwner {
        owner: X11Window,
        selection: Atom,
        time: u32,
    },
    ChangeProperty {
        window: X11Window,
        property: Atom,
        write: PropertyWrite,
    },
    SelectPropertyChanges(X11Window),
    SelectionNotify(Notification),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PropertyWrite {
    pub type_: Atom,
    pub format: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Notification {
    pub requestor: X11Window,
    pub selection: Atom,
    pub target: Atom,
    pub property: Atom,
    pub time: u32,
}

/// Connection recording every request instead of talking to a server
#[derive(Debug)]
pub(crate) struct MockConnection {
    requests: RefCell<Vec<Request>>,
    owners: RefCell<HashMap<Atom, X11Window>>,
    rivals: RefCell<HashMap<Atom, X11Window>>,
    max_property_length: Cell<usize>,
    broken: Cell<bool>,
}

impl Default for MockConnection {
    fn default() -> Self {
        MockConnection {
            requests: RefCell::new(Vec::new()),
            owners: RefCell::new(HashMap::new()),
            rivals: RefCell::new(HashMap::new()),
            max_property_length: Cell::new(usize::MAX),
            broken: Cell::new(false),
        }
    }
}

impl MockConnection {
    /// Drains the recorded requests
    pub fn take_requests(&self) -> Vec<Request> {
        std::mem::take(&mut *self.requests.borrow_mut())
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.borrow().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.requests
            .borrow()
            .iter()
            .filter_map(|request| match request {
                Request::SelectionNotify(notification) => Some(*notification),
                _ => None,
            })
            .collect()
    }

    pub fn property_writes(&self, window: X11Window, property: Atom) -> Vec<PropertyWrite> {
        self.requests
            .borrow()
            .iter()
            .filter_map(|request| match request {
                Request::ChangeProperty {
                    window: w,
                    property: p,
                    write,
                } if *w == window && *p == property => Some(write.clone()),
                _ => None,
            })
            .collect()
    }

    /// Makes `window` win every future race for `selection`
    pub fn set_rival(&self, selection: Atom, window: X11Window) {
        self.rivals.borrow_mut().insert(selection, window);
    }

    /// Hands `selection` to `window` behind the back of the selection owner
    pub fn take_over(&self, selection: Atom, window: X11Window) {
        self.owners.borrow_mut().insert(selection, window);
    }

    /// Current owner of `selection` as known to the server
    pub fn owner(&self, selection: Atom) -> X11Window {
        self.owners.borrow().get(&selection).copied().unwrap_or(x11rb::NONE)
    }

    pub fn set_max_property_length(&self, len: usize) {
        self.max_property_length.set(len);
    }

    /// Lets every further request fail
    pub fn break_connection(&self) {
        self.broken.set(true);
    }

    fn record(&self, request: Request) -> Result<(), ConnectionError> {
        if self.broken.get() {
            return Err(X11ConnectionError::UnknownError.into());
        }
        self.requests.borrow_mut().push(request);
        Ok(())
    }
}

impl SelectionConnection for MockConnection {
    fn create_selection_window(&self) -> Result<X11Window, ConnectionError> {
        self.record(Request::CreateWindow(OWNER_WINDOW))?;
        Ok(OWNER_WINDOW)
    }

    fn destroy_window(&self, window: X11Window) -> Result<(), ConnectionError> {
        self.record(Request::DestroyWindow(window))
    }

    fn set_selection_owner(&self, owner: X11Window, selection: Atom, time: Timestamp) -> Result<(), ConnectionError> {
        self.record(Request::SetSelectionOwner {
            owner,
            selection,
            time: time.into(),
        })?;
        let owner = self.rivals.borrow().get(&selection).copied().unwrap_or(owner);
        self.owners.borrow_mut().insert(selection, owner);
        Ok(())
    }

    fn get_selection_owner(&self, selection: Atom) -> Result<X11Window, ConnectionError> {
        if self.broken.get() {
            return Err(X11ConnectionError::UnknownError.into());
        }
        Ok(self.owners.borrow().get(&selection).copied().unwrap_or(x11rb::NONE))
    }

    fn change_property(
        &self,
        window: X11Window,
        property: Atom,
        type_: Atom,
        format: PropertyFormat,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        self.record(Request::ChangeProperty {
            window,
            property,
            write: PropertyWrite {
                type_,
                format: format.bits(),
                data: data.to_vec(),
            },
        })
    }

    fn select_property_changes(&self, window: X11Window) -> Result<(), ConnectionError> {
        self.record(Request::SelectPropertyChanges(window))
    }

    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), ConnectionError> {
        self.record(Request::SelectionNotify(Notification {
            requestor: event.requestor,
            selection: event.selection,
            target: event.target,
            property: event.property,
            time: event.time,
        }))
    }

    fn maximum_property_length(&self) -> usize {
        self.max_property_length.get()
    }

    fn flush(&self) -> Result<(), ConnectionError> {
        if self.broken.get() {
            return Err(X11ConnectionError::UnknownError.into());
        }
        Ok(())
    }
}

/// Compositor-like state implementing the handler side
#[derive(Debug)]
pub(crate) struct TestState {
    pub selection: SelectionState<TestState>,
    /// Byte content per target
    pub contents: HashMap<Atom, Vec<u8>>,
    /// Atom list content per target, stored with the given type
    pub atom_lists: HashMap<Atom, (Atom, Vec<u32>)>,
    pub next_handle: u32,
    pub resolved: Vec<(Atom, Atom)>,
    pub lost: Vec<Atom>,
    pub failed: Vec<(u32, String)>,
    pub released: Vec<u32>,
}

impl SelectionHandler for TestState {
    type Connection = MockConnection;
    type Handle = u32;

    fn selection_state(&mut self) -> &mut SelectionState<Self> {
        &mut self.selection
    }

    fn resolve_selection(&mut self, selection: Atom, target: Atom) -> Option<SelectionData<u32>> {
        self.resolved.push((selection, target));
        if let Some(content) = self.contents.get(&target).cloned() {
            let handle = self.new_handle();
            return Some(SelectionData::new(handle, content));
        }
        if let Some((type_, values)) = self.atom_lists.get(&target).cloned() {
            let handle = self.new_handle();
            return Some(SelectionData::from_u32s(handle, type_, &values));
        }
        None
    }

    fn ownership_lost(&mut self, selection: Atom) {
        self.lost.push(selection);
    }

    fn transfer_failed(&mut self, handle: &u32, error: &TransferError) {
        self.failed.push((*handle, format!("{:?}", error)));
    }

    fn release_handle(&mut self, handle: u32) {
        assert!(!self.released.contains(&handle), "handle {} released twice", handle);
        self.released.push(handle);
    }
}

impl TestState {
    pub fn new_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Names of the failures reported for the given handle
    pub fn failures_of(&self, handle: u32) -> Vec<&str> {
        self.failed
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, error)| error.as_str())
            .collect()
    }
}

pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Creates a selection owner with a fresh event loop to drive its timeouts.
///
/// Requests issued during creation are already drained.
pub(crate) fn test_state(config: SelectionConfig) -> (EventLoop<'static, TestState>, TestState) {
    init_logging();

    let event_loop: EventLoop<'static, TestState> = EventLoop::try_new().unwrap();
    let selection = SelectionState::new(MockConnection::default(), ATOMS, event_loop.handle(), config).unwrap();
    selection.connection().take_requests();

    let state = TestState {
        selection,
        contents: HashMap::new(),
        atom_lists: HashMap::new(),
        next_handle: 0,
        resolved: Vec::new(),
        lost: Vec::new(),
        failed: Vec::new(),
        released: Vec::new(),
    };
    (event_loop, state)
}

pub(crate) fn request_event(selection: Atom, target: Atom, property: Atom, time: u32) -> SelectionRequestEvent {
    request_event_from(REQUESTOR, selection, target, property, time)
}

pub(crate) fn request_event_from(
    requestor: X11Window,
    selection: Atom,
    target: Atom,
    property: Atom,
    time: u32,
) -> SelectionRequestEvent {
    SelectionRequestEvent {
        response_type: SELECTION_REQUEST_EVENT,
        sequence: 0,
        time,
        owner: OWNER_WINDOW,
        requestor,
        selection,
        target,
        property,
    }
}

pub(crate) fn clear_event(selection: Atom, time: u32) -> SelectionClearEvent {
    SelectionClearEvent {
        response_type: SELECTION_CLEAR_EVENT,
        sequence: 0,
        time,
        owner: OWNER_WINDOW,
        selection,
    }
}

pub(crate) fn delete_event(window: X11Window, property: Atom, time: u32) -> PropertyNotifyEvent {
    property_event(window, property, time, Property::DELETE)
}

pub(crate) fn new_value_event(window: X11Window, property: Atom, time: u32) -> PropertyNotifyEvent {
    property_event(window, property, time, Property::NEW_VALUE)
}

fn property_event(window: X11Window, property: Atom, time: u32, state: Property) -> PropertyNotifyEvent {
    PropertyNotifyEvent {
        response_type: PROPERTY_NOTIFY_EVENT,
        sequence: 0,
        window,
        atom: property,
        time,
        state,
    }
}
