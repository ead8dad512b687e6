// ve-protocol: event wire schema and gateway frame types.
//
// The canonical event JSON produced here is the sole contract consumed by
// the notifiers and both gateways.  Internal struct shapes elsewhere in the
// workspace must not leak into the wire.

mod event;
mod frames;

pub use event::{Event, EventKind, Severity, UnknownKind, derive_event_id};
pub use frames::{
    AckType, ClientMessage, DEFAULT_WS_KINDS, ServerFrame, TypesPayload, error_codes,
};
