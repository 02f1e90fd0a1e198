//! Delivery of selection content to requestors
//!
//! Content fitting into a single property write is delivered right away. Larger content is
//! announced with an `INCR` property and then written chunk by chunk, every time the requestor
//! deletes the property to signal it consumed the previous chunk. A zero-length write on the
//! deletion of the last chunk ends the transfer.
//!
//! There is no retransmission in this protocol, so every incremental transfer carries a deadline
//! for the next deletion and is abandoned once it passes.

use std::{cmp, fmt, time::Instant};

use calloop::{
    timer::{TimeoutAction, Timer},
    LoopHandle, RegistrationToken,
};
use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{Atom, Property, PropertyNotifyEvent, Window as X11Window};

use super::{
    connection::{send_selection_notify_resp, ConnectionError, PropertyFormat, SelectionConnection},
    SelectionAtoms, SelectionData, SelectionHandler, SelectionState, TransferKey, TransferRequest,
};

/// How content was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Written in one go, nothing left to do
    Direct,
    /// Announced as `INCR`, chunks follow on property deletion
    Incremental,
}

/// Progress of an incremental transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrState {
    /// The `INCR` announcement was written, no chunk sent yet
    AwaitingFirstDelete,
    /// Some chunks were written, more to come
    AwaitingNextDelete,
    /// All content was written, the zero-length terminator follows on the next deletion
    Complete,
}

/// Delivery of content was abandoned
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The requestor did not consume a chunk in time
    #[error("requestor did not consume the selection data in time")]
    TimedOut,
    /// The requestor window went away
    #[error("requestor window was destroyed")]
    RequestorGone,
    /// The selection owner is shutting down
    #[error("selection owner is shutting down")]
    Shutdown,
    /// Talking to the X server failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// An incremental transfer in progress
pub struct PendingTransfer<H> {
    id: u64,
    request: TransferRequest,
    type_: Atom,
    format: PropertyFormat,
    chunk_size: usize,
    source_data: Vec<u8>,
    offset: usize,
    state: IncrState,
    deadline: Instant,
    token: Option<RegistrationToken>,
    handle: Option<H>,
}

impl<H> fmt::Debug for PendingTransfer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransfer")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("type_", &self.type_)
            .field("format", &self.format)
            .field("chunk_size", &self.chunk_size)
            .field("len", &self.source_data.len())
            .field("offset", &self.offset)
            .field("state", &self.state)
            .field("deadline", &self.deadline)
            .field("token", &self.token)
            .finish()
    }
}

impl<H> PendingTransfer<H> {
    /// The request being answered
    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    /// Current progress
    pub fn state(&self) -> IncrState {
        self.state
    }

    /// Number of bytes already written
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total size of the content
    pub fn len(&self) -> usize {
        self.source_data.len()
    }

    /// Whether the content is empty, which never happens for incremental transfers
    pub fn is_empty(&self) -> bool {
        self.source_data.is_empty()
    }

    /// Maximum size of a chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Time the transfer will be abandoned at, unless the requestor deletes the property
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn write_next_chunk<C: SelectionConnection>(&mut self, conn: &C) -> Result<usize, ConnectionError> {
        let end = cmp::min(self.offset + self.chunk_size, self.source_data.len());

        conn.change_property(
            self.request.requestor,
            self.request.property,
            self.type_,
            self.format,
            &self.source_data[self.offset..end],
        )?;
        conn.flush()?;

        let len = end - self.offset;
        self.offset = end;
        self.state = if self.offset == self.source_data.len() {
            IncrState::Complete
        } else {
            IncrState::AwaitingNextDelete
        };
        Ok(len)
    }

    fn write_terminator<C: SelectionConnection>(&self, conn: &C) -> Result<(), ConnectionError> {
        conn.change_property(
            self.request.requestor,
            self.request.property,
            self.type_,
            self.format,
            &[],
        )?;
        conn.flush()?;
        Ok(())
    }

    fn destroy<D>(mut self, loop_handle: &LoopHandle<'_, D>) -> Option<H> {
        if let Some(token) = self.token.take() {
            loop_handle.remove(token);
        }
        self.handle.take()
    }
}

impl<H> Drop for PendingTransfer<H> {
    fn drop(&mut self) {
        if self.token.is_some() {
            tracing::warn!(?self, "PendingTransfer freed before being removed from EventLoop");
        }
    }
}

impl<D: SelectionHandler + 'static> SelectionState<D> {
    fn arm_timeout(&self, transfer: &mut PendingTransfer<D::Handle>) {
        if let Some(token) = transfer.token.take() {
            self.loop_handle.remove(token);
        }

        transfer.deadline = Instant::now() + self.config.incr_timeout;
        let key = transfer.request.key();
        let id = transfer.id;
        let token = self
            .loop_handle
            .insert_source(Timer::from_deadline(transfer.deadline), move |_, _, state| {
                transfer_timed_out(state, key, id);
                TimeoutAction::Drop
            });

        transfer.token = match token {
            Ok(token) => Some(token),
            Err(err) => {
                warn!(error = ?err.error, requestor = key.requestor, "Failed to schedule transfer timeout");
                None
            }
        };
    }
}

/// Largest chunk for a transfer, never smaller than one element
fn effective_chunk_size(max_chunk_size: usize, max_property_length: usize, format: PropertyFormat) -> usize {
    let element_size = format.element_size();
    let size = cmp::max(cmp::min(max_chunk_size, max_property_length), element_size);
    size - size % element_size
}

/// Refuses a selection request.
pub fn reject<C: SelectionConnection + ?Sized>(conn: &C, request: &TransferRequest) -> Result<(), ConnectionError> {
    trace!(
        requestor = request.requestor,
        target = request.target,
        "Sending refusal for selection request"
    );
    send_selection_notify_resp(conn, request, false)
}

/// Starts delivering content to a requestor.
///
/// A transfer already writing to the same property is abandoned first. On success the handle
/// of `data` is either released right away ([`TransferMode::Direct`]) or kept until the
/// incremental transfer ends. On failure the handler is informed and the handle released.
pub fn begin<D>(
    state: &mut D,
    data: SelectionData<D::Handle>,
    request: TransferRequest,
) -> Result<TransferMode, TransferError>
where
    D: SelectionHandler + 'static,
{
    supersede(state, request.key());

    let (handle, type_, format, source_data) = data.into_parts();
    let type_ = type_.unwrap_or(request.target);

    let selection_state = state.selection_state();
    let chunk_size = effective_chunk_size(
        selection_state.config.max_chunk_size,
        selection_state.conn.maximum_property_length(),
        format,
    );

    if source_data.len() <= chunk_size {
        let result = selection_state
            .conn
            .change_property(request.requestor, request.property, type_, format, &source_data)
            .and_then(|_| send_selection_notify_resp(&selection_state.conn, &request, true));

        return match result {
            Ok(()) => {
                debug!(
                    requestor = request.requestor,
                    len = source_data.len(),
                    "Non-Incr transfer completed"
                );
                state.release_handle(handle);
                Ok(TransferMode::Direct)
            }
            Err(err) => Err(fail(state, handle, err)),
        };
    }

    if let Err(err) = announce_incr(&selection_state.conn, &selection_state.atoms, &request, source_data.len()) {
        return Err(fail(state, handle, err));
    }
    debug!(
        requestor = request.requestor,
        len = source_data.len(),
        chunk_size,
        "Transfer became incremental"
    );

    let mut transfer = PendingTransfer {
        id: selection_state.next_transfer_id(),
        request,
        type_,
        format,
        chunk_size,
        source_data,
        offset: 0,
        state: IncrState::AwaitingFirstDelete,
        deadline: Instant::now(),
        token: None,
        handle: Some(handle),
    };
    selection_state.arm_timeout(&mut transfer);
    selection_state.transfers.insert(request.key(), transfer);

    Ok(TransferMode::Incremental)
}

fn announce_incr<C: SelectionConnection>(
    conn: &C,
    atoms: &SelectionAtoms,
    request: &TransferRequest,
    len: usize,
) -> Result<(), ConnectionError> {
    // deletions are the only signal to continue, make sure we get to see them
    conn.select_property_changes(request.requestor)?;

    let len = u32::try_from(len).unwrap_or(u32::MAX);
    conn.change_property(
        request.requestor,
        request.property,
        atoms.INCR,
        PropertyFormat::Bits32,
        &len.to_ne_bytes(),
    )?;
    send_selection_notify_resp(conn, request, true)
}

fn fail<D: SelectionHandler>(state: &mut D, handle: D::Handle, err: ConnectionError) -> TransferError {
    warn!(?err, "Failed to deliver selection data");
    let error = TransferError::Connection(err);
    state.transfer_failed(&handle, &error);
    state.release_handle(handle);
    error
}

/// Destroys a transfer, releasing its handle. Only `error` is reported to the handler.
fn finish<D: SelectionHandler>(state: &mut D, transfer: PendingTransfer<D::Handle>, error: Option<TransferError>) {
    let handle = transfer.destroy(&state.selection_state().loop_handle);
    if let Some(handle) = handle {
        if let Some(error) = error.as_ref() {
            state.transfer_failed(&handle, error);
        }
        state.release_handle(handle);
    }
}

/// Silently drops the transfer writing to `key`, if any.
pub(crate) fn supersede<D: SelectionHandler>(state: &mut D, key: TransferKey) {
    if let Some(transfer) = state.selection_state().transfers.remove(&key) {
        debug!(
            requestor = key.requestor,
            property = key.property,
            "New request for the property of a pending transfer, abandoning it"
        );
        finish(state, transfer, None);
    }
}

/// Drops the transfer writing to `key` and reports `error` for it.
pub(crate) fn abandon<D: SelectionHandler>(state: &mut D, key: TransferKey, error: TransferError) -> bool {
    match state.selection_state().transfers.remove(&key) {
        Some(transfer) => {
            finish(state, transfer, Some(error));
            true
        }
        None => false,
    }
}

fn transfer_timed_out<D: SelectionHandler>(state: &mut D, key: TransferKey, id: u64) {
    match state.selection_state().transfers.get_mut(&key) {
        Some(transfer) if transfer.id == id => {
            // the timer source drops itself
            transfer.token = None;
        }
        _ => return,
    }

    expire(state, key);
}

/// Drops a transfer whose deadline passed.
///
/// Once all content is written only the terminator is missing, which is not a failure.
fn expire<D: SelectionHandler>(state: &mut D, key: TransferKey) {
    let Some(transfer) = state.selection_state().transfers.remove(&key) else {
        return;
    };

    if transfer.state == IncrState::Complete {
        debug!(
            requestor = key.requestor,
            property = key.property,
            "Requestor never consumed the last chunk, dropping finished transfer"
        );
        finish(state, transfer, None);
    } else {
        debug!(
            requestor = key.requestor,
            property = key.property,
            "Incremental transfer timed out"
        );
        finish(state, transfer, Some(TransferError::TimedOut));
    }
}

/// Handles a `PropertyNotify` event.
///
/// Only the deletion of the property of a pending transfer moves it forward, everything else
/// is ignored.
pub fn handle_property_notify<D: SelectionHandler + 'static>(state: &mut D, event: PropertyNotifyEvent) {
    let selection_state = state.selection_state();
    selection_state.observe_timestamp(event.time.into());

    if event.state != Property::DELETE {
        return;
    }

    let key = TransferKey {
        requestor: event.window,
        property: event.atom,
    };
    let Some(mut transfer) = selection_state.transfers.remove(&key) else {
        trace!(
            window = event.window,
            property = event.atom,
            "Ignoring property deletion without pending transfer"
        );
        return;
    };

    if transfer.state == IncrState::Complete {
        match transfer.write_terminator(&selection_state.conn) {
            Ok(()) => {
                debug!(requestor = key.requestor, len = transfer.len(), "Incr transfer completed");
                finish(state, transfer, None);
            }
            Err(err) => {
                warn!(?err, requestor = key.requestor, "Failed to finish incremental transfer");
                finish(state, transfer, Some(err.into()));
            }
        }
        return;
    }

    match transfer.write_next_chunk(&selection_state.conn) {
        Ok(len) => {
            trace!(
                requestor = key.requestor,
                remaining = transfer.len() - transfer.offset(),
                "Send data chunk: {} bytes",
                len
            );
            selection_state.arm_timeout(&mut transfer);
            selection_state.transfers.insert(key, transfer);
        }
        Err(err) => {
            warn!(?err, requestor = key.requestor, "Failed to send data chunk");
            finish(state, transfer, Some(err.into()));
        }
    }
}

/// Drops every incremental transfer whose deadline passed at `now`.
///
/// Timeouts are normally driven by the event loop, this is for hosts driving time themselves.
/// Returns the number of dropped transfers.
pub fn expire_transfers<D: SelectionHandler>(state: &mut D, now: Instant) -> usize {
    let expired = state
        .selection_state()
        .transfers
        .iter()
        .filter(|(_, transfer)| transfer.deadline <= now)
        .map(|(key, _)| *key)
        .collect::<Vec<_>>();

    for key in &expired {
        expire(state, *key);
    }
    expired.len()
}

/// Abandons all transfers to a window that was destroyed.
///
/// Returns whether there were any.
pub fn window_destroyed<D: SelectionHandler>(state: &mut D, window: X11Window) -> bool {
    let keys = state
        .selection_state()
        .transfers
        .keys()
        .filter(|key| key.requestor == window)
        .copied()
        .collect::<Vec<_>>();

    for key in &keys {
        abandon(state, *key, TransferError::RequestorGone);
    }
    !keys.is_empty()
}
