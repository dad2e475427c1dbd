//! OpenPGP packet framing (RFC 4880 §4) and the handful of packet bodies the decrypt path reads.

use crate::error::PgpError;
use crate::iobuf::{Filter, IoBuf};
use crate::mdc::MDC_LEN;
use crate::s2k::{S2k, S2kMode, SALT_LEN};

pub const TAG_PKESK: u8 = 1;
pub const TAG_SKESK: u8 = 3;
pub const TAG_COMPRESSED: u8 = 8;
pub const TAG_SED: u8 = 9;
pub const TAG_MARKER: u8 = 10;
pub const TAG_LITERAL: u8 = 11;
pub const TAG_SEIPD: u8 = 18;
pub const TAG_MDC: u8 = 19;

/// OpenPGP symmetric algorithm id for CAST5.
pub const CIPHER_CAST5: u8 = 3;

/// Session key length for an OpenPGP symmetric algorithm id (RFC 4880 §9.2, RFC 5581), or
/// `None` for ids no cipher is registered under.
pub fn cipher_key_len(id: u8) -> Option<usize> {
    match id {
        1 | 3 | 4 | 7 | 11 => Some(16),
        2 | 8 | 12 => Some(24),
        9 | 10 | 13 => Some(32),
        _ => None,
    }
}

const MARKER_BODY: &[u8; 3] = b"PGP";
/// Algorithm octet plus the longest session key any OpenPGP cipher uses.
pub const MAX_ESK_LEN: usize = 1 + 32;
const MAX_FILE_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Fixed(u32),
    /// First segment of a partial-body chain.
    Partial(u32),
    /// Old-format length type 3: the body runs to the end of the enclosing stream.
    Indeterminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub tag: u8,
    pub length: BodyLength,
    pub new_format: bool,
}

/// Symmetric-Key Encrypted Session Key packet (tag 3), version 4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skesk {
    pub cipher_algorithm: u8,
    pub s2k: S2k,
    esk: [u8; MAX_ESK_LEN],
    esk_len: usize,
}

impl Skesk {
    /// The encrypted session key, if the packet carries one. Without it the S2K output is the
    /// session key.
    pub fn encrypted_session_key(&self) -> Option<&[u8]> {
        (self.esk_len > 0).then(|| &self.esk[..self.esk_len])
    }
}

/// Literal Data packet (tag 11) header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralHeader {
    /// `b`, `t`, `u`, ...
    pub format: u8,
    name: [u8; MAX_FILE_NAME_LEN],
    name_len: u8,
    pub timestamp: u32,
}

impl LiteralHeader {
    pub fn file_name(&self) -> &[u8] {
        &self.name[..usize::from(self.name_len)]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Marker,
    Skesk(Skesk),
    /// Tag 9 or 18. The body filter stays on the stack, positioned at the ciphertext.
    Encrypted { integrity_protected: bool },
    /// The body filter stays on the stack, positioned at the literal content.
    Literal(LiteralHeader),
    Mdc([u8; MDC_LEN]),
    /// A packet this crate does not interpret; its body has been consumed.
    Skipped { tag: u8 },
}

fn is_data_tag(tag: u8) -> bool {
    matches!(tag, TAG_COMPRESSED | TAG_SED | TAG_LITERAL | TAG_SEIPD)
}

/// Decode a new-format length whose first octet is `first`; `next` yields further octets.
pub fn read_new_format_length(
    first: u8,
    mut next: impl FnMut() -> Result<u8, PgpError>,
) -> Result<BodyLength, PgpError> {
    Ok(match first {
        0..=191 => BodyLength::Fixed(u32::from(first)),
        192..=223 => {
            let second = next()?;
            BodyLength::Fixed(((u32::from(first) - 192) << 8) + u32::from(second) + 192)
        }
        224..=254 => BodyLength::Partial(1 << (first & 0x1f)),
        255 => {
            let mut len = 0u32;
            for _ in 0..4 {
                len = (len << 8) | u32::from(next()?);
            }
            BodyLength::Fixed(len)
        }
    })
}

/// Read one packet header; `None` at a clean end of stream.
pub fn read_header(io: &mut IoBuf<'_>) -> Result<Option<PacketHeader>, PgpError> {
    let Some(ctb) = io.read_byte()? else {
        return Ok(None);
    };
    if ctb & 0x80 == 0 {
        return Err(PgpError::malformed("packet tag without the high bit set"));
    }
    let mut next = || {
        io.read_byte()?
            .ok_or(PgpError::malformed("packet length truncated"))
    };

    let header = if ctb & 0x40 != 0 {
        let first = next()?;
        PacketHeader {
            tag: ctb & 0x3f,
            length: read_new_format_length(first, next)?,
            new_format: true,
        }
    } else {
        let octets = match ctb & 0x03 {
            0 => 1,
            1 => 2,
            2 => 4,
            _ => 0,
        };
        let length = if octets == 0 {
            BodyLength::Indeterminate
        } else {
            let mut len = 0u32;
            for _ in 0..octets {
                len = (len << 8) | u32::from(next()?);
            }
            BodyLength::Fixed(len)
        };
        PacketHeader {
            tag: (ctb >> 2) & 0x0f,
            length,
            new_format: false,
        }
    };

    if header.tag == 0 {
        return Err(PgpError::malformed("reserved packet tag 0"));
    }
    Ok(Some(header))
}

/// Read the next packet header and decode its body.
///
/// For [`Packet::Encrypted`] and [`Packet::Literal`] the body is left unread behind a filter that
/// the caller pops once done with it. Every other packet is fully consumed.
pub fn parse_next(io: &mut IoBuf<'_>) -> Result<Option<Packet>, PgpError> {
    let Some(header) = read_header(io)? else {
        return Ok(None);
    };
    log::debug!("packet: tag {} length {:?}", header.tag, header.length);

    if !is_data_tag(header.tag) {
        match header.length {
            BodyLength::Partial(_) => {
                return Err(PgpError::malformed("partial length on a non-data packet"))
            }
            BodyLength::Indeterminate => {
                return Err(PgpError::malformed(
                    "indeterminate length on a non-data packet",
                ))
            }
            BodyLength::Fixed(_) => {}
        }
    }

    io.push_filter(Filter::for_body(header.length))?;
    let packet = match header.tag {
        TAG_MARKER => {
            let mut body = [0u8; 3];
            if header.length != BodyLength::Fixed(3) {
                return Err(PgpError::malformed("marker packet length is not 3"));
            }
            io.read_exact(&mut body, "marker packet")?;
            if &body != MARKER_BODY {
                return Err(PgpError::malformed("marker packet is not \"PGP\""));
            }
            Packet::Marker
        }
        TAG_SKESK => Packet::Skesk(read_skesk(io)?),
        TAG_SED => {
            return Ok(Some(Packet::Encrypted {
                integrity_protected: false,
            }))
        }
        TAG_SEIPD => {
            let mut version = [0u8; 1];
            io.read_exact(&mut version, "SEIPD version")?;
            if version[0] != 1 {
                return Err(PgpError::UnsupportedAlgorithm {
                    what: "SEIPD version",
                    id: version[0],
                });
            }
            return Ok(Some(Packet::Encrypted {
                integrity_protected: true,
            }));
        }
        TAG_LITERAL => return Ok(Some(Packet::Literal(read_literal_header(io)?))),
        TAG_MDC => {
            if header.length != BodyLength::Fixed(MDC_LEN as u32) {
                return Err(PgpError::malformed("MDC packet length is not 20"));
            }
            let mut digest = [0u8; MDC_LEN];
            io.read_exact(&mut digest, "MDC digest")?;
            Packet::Mdc(digest)
        }
        TAG_COMPRESSED => {
            let mut algorithm = [0u8; 1];
            io.read_exact(&mut algorithm, "compression algorithm")?;
            return Err(PgpError::UnsupportedAlgorithm {
                what: "compression",
                id: algorithm[0],
            });
        }
        tag => {
            log::debug!("packet: skipping tag {tag}");
            Packet::Skipped { tag }
        }
    };
    io.pop_filter()?;
    Ok(Some(packet))
}

fn read_skesk(io: &mut IoBuf<'_>) -> Result<Skesk, PgpError> {
    let mut fixed = [0u8; 4];
    io.read_exact(&mut fixed, "SKESK header")?;
    let [version, cipher_algorithm, mode, hash_algorithm] = fixed;
    if version != 4 {
        return Err(PgpError::UnsupportedAlgorithm {
            what: "SKESK version",
            id: version,
        });
    }

    let mode = S2kMode::from_id(mode)?;
    let mut salt = [0u8; SALT_LEN];
    if mode != S2kMode::Simple {
        io.read_exact(&mut salt, "S2K salt")?;
    }
    let mut coded_count = [0u8; 1];
    if mode == S2kMode::IteratedSalted {
        io.read_exact(&mut coded_count, "S2K count")?;
    }

    let mut esk = [0u8; MAX_ESK_LEN];
    let mut esk_len = 0;
    loop {
        let mut spill = [0u8; 1];
        let dst = if esk_len < MAX_ESK_LEN {
            &mut esk[esk_len..]
        } else {
            &mut spill[..]
        };
        match io.read(dst)? {
            0 => break,
            _ if esk_len == MAX_ESK_LEN => {
                return Err(PgpError::malformed("encrypted session key too long"))
            }
            n => esk_len += n,
        }
    }

    Ok(Skesk {
        cipher_algorithm,
        s2k: S2k {
            mode,
            hash_algorithm,
            salt,
            coded_count: coded_count[0],
        },
        esk,
        esk_len,
    })
}

fn read_literal_header(io: &mut IoBuf<'_>) -> Result<LiteralHeader, PgpError> {
    let mut fixed = [0u8; 2];
    io.read_exact(&mut fixed, "literal header")?;
    let [format, name_len] = fixed;
    let mut name = [0u8; MAX_FILE_NAME_LEN];
    io.read_exact(&mut name[..usize::from(name_len)], "literal file name")?;
    let mut timestamp = [0u8; 4];
    io.read_exact(&mut timestamp, "literal timestamp")?;
    Ok(LiteralHeader {
        format,
        name,
        name_len,
        timestamp: u32::from_be_bytes(timestamp),
    })
}
