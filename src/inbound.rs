//! Inbound engine: marker detection, pass-through, and delegation to the
//! persistence layer for reassembly.

use crate::db::Persistence;
use crate::error::Result;
use crate::marker;
use crate::transport::Client;

/// `on_wire_message`. Never touches outbound state; a completed blob is
/// forwarded to `client.on_message` with the original `(friend, type)`
/// while the data row backing it is still alive.
pub fn on_wire_message(
    persistence: &Persistence,
    client: &dyn Client,
    friend: u32,
    msg_type: i32,
    bytes: &[u8],
    now: u64,
) -> Result<()> {
    let Some(parsed) = marker::parse(bytes) else {
        client.on_message(friend, msg_type, bytes);
        return Ok(());
    };

    let payload = &bytes[parsed.consumed..];
    let completed = persistence.insert_inbound_fragment(
        friend,
        msg_type,
        parsed.id,
        parsed.off,
        parsed.sz,
        parsed.num_parts,
        payload,
        now,
    )?;
    // Persistence's lock is released by the time this returns: invoking
    // the client callback here never holds it.
    if let Some((_tm_first, _tm_last, message)) = completed {
        client.on_message(friend, msg_type, &message);
    }
    Ok(())
}
