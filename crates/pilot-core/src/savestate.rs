//! Best-effort checkpoint parsing. Exactly one container layout is
//! recognized; anything else is reported as unrecognized rather than
//! guessed at.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

const MAGIC: &[u8; 4] = b"PPSS";
const KNOWN_VERSION: u16 = 1;

const SECTION_PARTY: u8 = 0x01;
const SECTION_TRAINER: u8 = 0x02;

/// Fields extracted from a recognized checkpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParsedState {
    pub version: u16,
    #[serde(default)]
    pub party_count: u8,
    #[serde(default)]
    pub party_levels: Vec<u8>,
    #[serde(default)]
    pub badges: Option<u8>,
}

impl ParsedState {
    /// Human-readable one-screen summary for diagnostics endpoints.
    pub fn formatted(&self) -> String {
        let mut out = format!(
            "save-state v{} | party: {} member(s)",
            self.version, self.party_count
        );
        if !self.party_levels.is_empty() {
            let levels: Vec<String> = self.party_levels.iter().map(|l| l.to_string()).collect();
            out.push_str(&format!(" | levels: {}", levels.join(", ")));
        }
        if let Some(badges) = self.badges {
            out.push_str(&format!(" | badges: {}", badges.count_ones()));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(ParsedState),
    /// The layout did not match; `reason` says where recognition failed.
    Unrecognized { reason: String },
}

fn unrecognized(reason: impl Into<String>) -> ParseOutcome {
    ParseOutcome::Unrecognized {
        reason: reason.into(),
    }
}

/// Recognizes the `PPSS` container: magic, u16 version, u8 section
/// count, then `tag:u8 len:u32 payload` sections. Unknown sections are
/// skipped; truncated ones fail recognition.
pub fn parse(bytes: &[u8]) -> ParseOutcome {
    if bytes.len() < 8 {
        return unrecognized("shorter than the fixed header");
    }
    if &bytes[0..4] != MAGIC {
        return unrecognized("magic mismatch");
    }

    let mut cursor = Cursor::new(&bytes[4..]);
    let version = match cursor.read_u16::<LittleEndian>() {
        Ok(v) => v,
        Err(_) => return unrecognized("truncated version field"),
    };
    if version != KNOWN_VERSION {
        return unrecognized(format!("unknown version {version}"));
    }
    let section_count = match cursor.read_u8() {
        Ok(n) => n,
        Err(_) => return unrecognized("truncated section count"),
    };

    let mut parsed = ParsedState {
        version,
        ..ParsedState::default()
    };

    for i in 0..section_count {
        let tag = match cursor.read_u8() {
            Ok(t) => t,
            Err(_) => return unrecognized(format!("truncated tag for section {i}")),
        };
        let len = match cursor.read_u32::<LittleEndian>() {
            Ok(l) => l as usize,
            Err(_) => return unrecognized(format!("truncated length for section {i}")),
        };
        let start = cursor.position() as usize;
        let body = &bytes[4..];
        if start + len > body.len() {
            return unrecognized(format!("section {i} overruns the payload"));
        }
        let payload = &body[start..start + len];
        cursor.set_position((start + len) as u64);

        match tag {
            SECTION_PARTY => {
                if payload.is_empty() {
                    return unrecognized("empty party section");
                }
                let count = payload[0] as usize;
                if payload.len() < 1 + count {
                    return unrecognized("party section shorter than its count");
                }
                parsed.party_count = payload[0];
                parsed.party_levels = payload[1..1 + count].to_vec();
            }
            SECTION_TRAINER => {
                if payload.is_empty() {
                    return unrecognized("empty trainer section");
                }
                parsed.badges = Some(payload[0]);
            }
            _ => {
                // Unknown sections are tolerated; their content is not.
            }
        }
    }

    ParseOutcome::Parsed(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(sections: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&KNOWN_VERSION.to_le_bytes());
        out.push(sections.len() as u8);
        for (tag, payload) in sections {
            out.push(*tag);
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
        }
        out
    }

    #[test]
    fn parses_party_and_trainer_sections() {
        let bytes = container(&[
            (SECTION_PARTY, vec![3, 12, 14, 9]),
            (SECTION_TRAINER, vec![0b0000_0111]),
        ]);
        let ParseOutcome::Parsed(parsed) = parse(&bytes) else {
            panic!("expected parsed outcome");
        };
        assert_eq!(parsed.party_count, 3);
        assert_eq!(parsed.party_levels, vec![12, 14, 9]);
        assert_eq!(parsed.badges, Some(7));
        assert!(parsed.formatted().contains("badges: 3"));
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let bytes = container(&[(0x7f, vec![1, 2, 3]), (SECTION_PARTY, vec![1, 20])]);
        let ParseOutcome::Parsed(parsed) = parse(&bytes) else {
            panic!("expected parsed outcome");
        };
        assert_eq!(parsed.party_levels, vec![20]);
    }

    #[test]
    fn wrong_magic_is_unrecognized() {
        assert_eq!(
            parse(b"XXXX\x01\x00\x00"),
            ParseOutcome::Unrecognized {
                reason: "shorter than the fixed header".to_string()
            }
        );
        assert!(matches!(
            parse(b"XXXX\x01\x00\x00\x00\x00\x00"),
            ParseOutcome::Unrecognized { .. }
        ));
    }

    #[test]
    fn unknown_version_is_unrecognized() {
        let mut bytes = container(&[]);
        bytes[4] = 9;
        assert!(matches!(parse(&bytes), ParseOutcome::Unrecognized { .. }));
    }

    #[test]
    fn truncated_section_is_unrecognized() {
        let mut bytes = container(&[(SECTION_PARTY, vec![2, 10, 11])]);
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(parse(&bytes), ParseOutcome::Unrecognized { .. }));
    }

    #[test]
    fn party_count_larger_than_payload_is_unrecognized() {
        let bytes = container(&[(SECTION_PARTY, vec![6, 10])]);
        assert!(matches!(parse(&bytes), ParseOutcome::Unrecognized { .. }));
    }
}
