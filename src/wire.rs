//! Minimal raw-packet scanning for the hot path: pull the question out of a
//! query without paying for a full message decode.

/// Header id plus first question, with the name already lowercased and
/// dot-joined (no trailing dot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionKey {
    pub id: u16,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

const HEADER_LEN: usize = 12;
const MAX_POINTER_HOPS: u8 = 8;

/// Scan the header and first question of a DNS packet. Returns `None` for
/// anything that is not a plausible single-question query; callers fall back
/// to the full decoder.
pub fn scan_question(packet: &[u8]) -> Option<QuestionKey> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return None;
    }

    let mut name = String::with_capacity(32);
    let mut cursor = HEADER_LEN;
    let mut after_name = None;
    let mut hops = 0u8;

    loop {
        let len = *packet.get(cursor)? as usize;
        if len == 0 {
            after_name.get_or_insert(cursor + 1);
            break;
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer; remember where the question resumes.
            let low = *packet.get(cursor + 1)? as usize;
            after_name.get_or_insert(cursor + 2);
            cursor = ((len & 0x3F) << 8) | low;
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return None;
            }
            continue;
        }
        let label = packet.get(cursor + 1..cursor + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        for &b in label {
            name.push(b.to_ascii_lowercase() as char);
        }
        cursor += 1 + len;
    }

    let fixed = after_name?;
    let tail = packet.get(fixed..fixed + 4)?;
    Some(QuestionKey {
        id,
        name,
        qtype: u16::from_be_bytes([tail[0], tail[1]]),
        qclass: u16::from_be_bytes([tail[2], tail[3]]),
    })
}
