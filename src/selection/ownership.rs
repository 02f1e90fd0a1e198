//! Selection ownership
//!
//! Ownership is defended passively: when another client takes a selection over, the claim is
//! dropped and the [`SelectionHandler`] notified, the X server is the one arbitrating races.

use std::collections::HashMap;

use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{Atom, AtomEnum, SelectionClearEvent, SelectionRequestEvent, Window as X11Window};

use crate::utils::Timestamp;

use super::{
    connection::{send_selection_notify_resp, ConnectionError, PropertyFormat, SelectionConnection},
    transfer, SelectionHandler, SelectionState, TransferRequest,
};

/// Ownership of a selection held by the window manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    /// The owned selection
    pub selection: Atom,
    /// Window holding the selection
    pub owner: X11Window,
    /// Server time the selection was acquired at
    pub time: Timestamp,
}

/// Acquiring a selection failed
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// Another client owns the selection after our request was processed
    #[error("selection {selection} is owned by window {owner:#x}")]
    Lost {
        /// The requested selection
        selection: Atom,
        /// Its actual owner
        owner: X11Window,
    },
    /// Talking to the X server failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Why a selection request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    /// We do not own the requested selection
    #[error("selection is not owned")]
    NotOwned,
    /// The request was issued before we acquired the selection
    #[error("request predates the acquisition of the selection")]
    StaleTimestamp,
    /// The handler had no content for the requested target
    #[error("no content available for the requested target")]
    Unavailable,
}

/// Bookkeeping of owned selections
#[derive(Debug)]
pub struct OwnershipManager {
    window: X11Window,
    claims: HashMap<Atom, Claim>,
    last_timestamp: Timestamp,
}

impl OwnershipManager {
    pub(crate) fn new(window: X11Window) -> Self {
        OwnershipManager {
            window,
            claims: HashMap::new(),
            last_timestamp: Timestamp::CURRENT_TIME,
        }
    }

    /// Window used to own selections
    pub fn window(&self) -> X11Window {
        self.window
    }

    /// Active claim on a selection
    pub fn claim(&self, selection: Atom) -> Option<&Claim> {
        self.claims.get(&selection)
    }

    /// All active claims
    pub fn claims(&self) -> impl Iterator<Item = &Claim> {
        self.claims.values()
    }

    /// Most recent server time seen
    pub fn last_timestamp(&self) -> Timestamp {
        self.last_timestamp
    }

    pub(crate) fn observe_timestamp(&mut self, time: Timestamp) {
        self.last_timestamp = self.last_timestamp.latest(time);
    }

    /// Checks whether a request targets a selection we currently own.
    pub fn validate(&self, request: &TransferRequest) -> Result<&Claim, RejectReason> {
        let claim = self.claims.get(&request.selection).ok_or(RejectReason::NotOwned)?;

        if !request.time.is_current_time()
            && !claim.time.is_current_time()
            && !request.time.is_no_older_than(&claim.time)
        {
            return Err(RejectReason::StaleTimestamp);
        }

        Ok(claim)
    }

    fn invalidate(&mut self, event: &SelectionClearEvent) -> Option<Claim> {
        let claim = self.claims.get(&event.selection)?;
        if claim.owner != event.owner {
            return None;
        }

        // a clear from before our current claim was taken
        let time = Timestamp::from(event.time);
        if !time.is_current_time() && !claim.time.is_current_time() && !time.is_no_older_than(&claim.time) {
            return None;
        }

        self.claims.remove(&event.selection)
    }
}

impl<D: SelectionHandler> SelectionState<D> {
    /// Takes ownership of a selection.
    ///
    /// Uses the most recent server time known to the selection owner. If the selection is
    /// already owned, the existing claim is returned without contacting the server.
    pub fn acquire(&mut self, selection: Atom) -> Result<Claim, AcquireError> {
        if let Some(claim) = self.ownership.claim(selection) {
            trace!(selection, "Selection already owned");
            return Ok(*claim);
        }

        let window = self.ownership.window;
        let time = self.ownership.last_timestamp;
        self.conn.set_selection_owner(window, selection, time)?;

        // the server silently ignores outdated requests, check who won
        let owner = self.conn.get_selection_owner(selection)?;
        if owner != window {
            debug!(selection, owner, "Lost the race for selection ownership");
            return Err(AcquireError::Lost { selection, owner });
        }

        let claim = Claim {
            selection,
            owner: window,
            time,
        };
        self.ownership.claims.insert(selection, claim);
        debug!(selection, ?time, "Acquired selection");

        Ok(claim)
    }

    /// Gives up ownership of a selection.
    ///
    /// Running transfers of already resolved content are not affected.
    pub fn release(&mut self, selection: Atom) -> Result<Option<Claim>, ConnectionError> {
        let Some(claim) = self.ownership.claims.remove(&selection) else {
            return Ok(None);
        };

        // a rival acquiring with the same timestamp would be disowned by us
        let owner = self.conn.get_selection_owner(selection)?;
        if owner == claim.owner {
            self.conn.set_selection_owner(x11rb::NONE, selection, claim.time)?;
            self.conn.flush()?;
            debug!(selection, "Released selection");
        } else {
            debug!(selection, owner, "Selection already taken over, dropping claim");
        }

        Ok(Some(claim))
    }

    /// Drops the claim on a selection without telling the server
    pub fn forget(&mut self, selection: Atom) -> Option<Claim> {
        self.ownership.claims.remove(&selection)
    }
}

/// Handles a `SelectionClear` event.
///
/// Clears for selections we do not own (anymore) are ignored.
pub fn handle_selection_clear<D: SelectionHandler>(state: &mut D, event: SelectionClearEvent) {
    let selection_state = state.selection_state();
    selection_state.observe_timestamp(event.time.into());

    match selection_state.ownership.invalidate(&event) {
        Some(claim) => {
            debug!(selection = claim.selection, "Lost selection ownership");
            state.ownership_lost(claim.selection);
        }
        None => trace!(
            selection = event.selection,
            owner = event.owner,
            "Ignoring SelectionClear for a selection we do not own"
        ),
    }
}

/// Handles a `SelectionRequest` event.
///
/// Valid requests are answered with content from [`SelectionHandler::resolve_selection`],
/// anything else is refused.
pub fn handle_selection_request<D: SelectionHandler + 'static>(state: &mut D, event: SelectionRequestEvent) {
    let request = TransferRequest::from(&event);
    state.selection_state().observe_timestamp(request.time);

    // the requestor gave up on whatever it previously asked for on this property
    transfer::supersede(state, request.key());

    let selection_state = state.selection_state();
    let claim = match selection_state.ownership.validate(&request) {
        Ok(claim) => *claim,
        Err(reason) => {
            refuse(selection_state, &request, reason);
            return;
        }
    };

    if request.target == selection_state.atoms.TIMESTAMP && selection_state.config.answer_timestamp_target {
        answer_timestamp(selection_state, &request, &claim);
        return;
    }

    let Some(data) = state.resolve_selection(request.selection, request.target) else {
        refuse(state.selection_state(), &request, RejectReason::Unavailable);
        return;
    };

    if let Err(err) = transfer::begin(state, data, request) {
        debug!(?err, requestor = request.requestor, "Selection transfer failed to start");
    }
}

fn refuse<D: SelectionHandler>(state: &SelectionState<D>, request: &TransferRequest, reason: RejectReason) {
    debug!(
        ?reason,
        requestor = request.requestor,
        selection = request.selection,
        target = request.target,
        "Refusing selection request"
    );
    if let Err(err) = transfer::reject(&state.conn, request) {
        warn!(?err, requestor = request.requestor, "Failed to refuse selection request");
    }
}

fn answer_timestamp<D: SelectionHandler>(state: &SelectionState<D>, request: &TransferRequest, claim: &Claim) {
    let time = u32::from(claim.time);
    let result = state
        .conn
        .change_property(
            request.requestor,
            request.property,
            AtomEnum::INTEGER.into(),
            PropertyFormat::Bits32,
            &time.to_ne_bytes(),
        )
        .and_then(|_| send_selection_notify_resp(&state.conn, request, true));

    if let Err(err) = result {
        warn!(?err, requestor = request.requestor, "Failed to answer TIMESTAMP request");
    }
}
