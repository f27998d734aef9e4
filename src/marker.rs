//! The in-band fragment marker.
//!
//! ```text
//! <ZWS> <id:13 digits> | <partNo> | <numParts> | <off> | <sz> <ZWS>
//! ```
//!
//! `<ZWS>` is U+200B (zero-width space), three bytes `E2 80 8B` in UTF-8. The
//! marker is ASCII-digit text rather than a packed binary header so that a
//! buffer can be scanned for "does this look like a fragment" without first
//! knowing its length class, and so that a client message that merely starts
//! with ordinary bytes can never collide with it by chance.

const ZWS: [u8; 3] = [0xE2, 0x80, 0x8B];
const ID_DIGITS: usize = 13;
const MAX_FIELD_DIGITS: usize = 10;
const NUM_FIELDS: usize = 4;

/// A successfully parsed marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedMarker {
    pub id: u64,
    pub part_no: u32,
    pub num_parts: u32,
    pub off: u32,
    pub sz: u32,
    /// Number of bytes from the start of the buffer occupied by the marker;
    /// the fragment payload begins at this offset.
    pub consumed: usize,
}

fn num_digits(mut n: u64) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Worst-case marker length for the given `numParts`/`msgSize` magnitudes.
/// Used to size the per-part marker budget during splitting and to
/// validate `maxMessageLength` against the marker's own overhead.
pub fn max_size(num_parts: u32, msg_size: u32) -> usize {
    let num_parts_digits = num_digits(num_parts as u64);
    let msg_size_digits = num_digits(msg_size as u64);
    ZWS.len() * 2 + ID_DIGITS + 4 + 2 * num_parts_digits + 2 * msg_size_digits
}

/// Write the marker for `(id, partNo, numParts, off, sz)` to `out`, returning
/// the number of bytes written.
pub fn encode(id: u64, part_no: u32, num_parts: u32, off: u32, sz: u32, out: &mut Vec<u8>) -> usize {
    let start = out.len();
    out.extend_from_slice(&ZWS);
    debug_assert!(
        id < 10u64.pow(ID_DIGITS as u32),
        "message id does not fit in a 13-digit millisecond timestamp field"
    );
    out.extend_from_slice(format!("{:0width$}", id, width = ID_DIGITS).as_bytes());
    out.push(b'|');
    out.extend_from_slice(part_no.to_string().as_bytes());
    out.push(b'|');
    out.extend_from_slice(num_parts.to_string().as_bytes());
    out.push(b'|');
    out.extend_from_slice(off.to_string().as_bytes());
    out.push(b'|');
    out.extend_from_slice(sz.to_string().as_bytes());
    out.extend_from_slice(&ZWS);
    out.len() - start
}

/// Whether `buf` begins with a well-formed marker.
pub fn exists(buf: &[u8]) -> bool {
    parse(buf).is_some()
}

fn is_zws(buf: &[u8]) -> bool {
    buf.len() >= ZWS.len() && buf[..ZWS.len()] == ZWS
}

/// Parse the marker at the start of `buf`. Returns `None` if `buf` does not
/// begin with a well-formed marker, in which case the caller must treat the
/// whole buffer as an ordinary, non-fragmented client message.
pub fn parse(buf: &[u8]) -> Option<ParsedMarker> {
    // Minimum: ZWS + 13-digit id + '|' + 4 single-digit fields with their
    // separators + trailing ZWS.
    let min_len = ZWS.len() + ID_DIGITS + 1 + NUM_FIELDS * 2 + ZWS.len() - 1;
    if buf.len() <= min_len {
        return None;
    }
    if !is_zws(buf) || buf[ZWS.len() + ID_DIGITS] != b'|' {
        return None;
    }

    let id_bytes = &buf[ZWS.len()..ZWS.len() + ID_DIGITS];
    if !id_bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let id: u64 = std::str::from_utf8(id_bytes).ok()?.parse().ok()?;

    let mut field_off = [0usize; NUM_FIELDS];
    let mut field_len = [0usize; NUM_FIELDS];
    let mut p = ZWS.len() + ID_DIGITS + 1;

    for f in 0..NUM_FIELDS {
        field_off[f] = p;
        let mut len = 0;
        while len < MAX_FIELD_DIGITS && p + len < buf.len() && buf[p + len].is_ascii_digit() {
            len += 1;
        }
        field_len[f] = len;

        if len == 0 || p + len + 1 > buf.len() {
            return None;
        }
        let is_last = f == NUM_FIELDS - 1;
        let terminator_ok = if is_last {
            is_zws(&buf[p + len..])
        } else {
            buf[p + len] == b'|'
        };
        if !terminator_ok {
            return None;
        }
        p += len + 1;
    }

    let parse_field = |f: usize| -> Option<u32> {
        std::str::from_utf8(&buf[field_off[f]..field_off[f] + field_len[f]])
            .ok()?
            .parse()
            .ok()
    };

    let part_no = parse_field(0)?;
    let num_parts = parse_field(1)?;
    let off = parse_field(2)?;
    let sz = parse_field(3)?;
    let consumed = field_off[3] + field_len[3] + ZWS.len();

    Some(ParsedMarker {
        id,
        part_no,
        num_parts,
        off,
        sz,
        consumed,
    })
}
