//! Pull-based buffered reader with a stack of filters.
//!
//! The topmost filter's output is what [`IoBuf::read`] returns. Filling the read buffer asks the
//! top filter for bytes, which pulls from the filter beneath it, down to the source slice.
//!
//! Bytes already buffered when a filter is pushed become that filter's input, and bytes the
//! popped filter pulled but never consumed go back to the read buffer, so push and pop never
//! lose or reorder stream data.

use crate::cfb::Cfb;
use crate::error::PgpError;
use crate::mdc::{MdcVerifier, MDC_PACKET_LEN};
use crate::packet::{read_new_format_length, BodyLength};

/// Size of the read buffer and of each filter's input carry.
pub const IOBUF_CHUNK: usize = 512;
/// Packet body, partial lengths, decryption and the literal body fit with one level to spare.
pub const MAX_FILTER_DEPTH: usize = 4;

/// Result of one fill call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pulled {
    /// Bytes produced. Zero means "nothing yet", not end of stream.
    Bytes(usize),
    EndOfStream,
}

struct Source<'s> {
    data: &'s [u8],
    pos: usize,
}

impl Source<'_> {
    fn fill(&mut self, out: &mut [u8]) -> Pulled {
        let rest = &self.data[self.pos..];
        if rest.is_empty() {
            return Pulled::EndOfStream;
        }
        let n = rest.len().min(out.len());
        out[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Pulled::Bytes(n)
    }
}

struct Carry {
    buf: [u8; IOBUF_CHUNK],
    start: usize,
    end: usize,
}

impl Carry {
    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn take_into(&mut self, out: &mut [u8]) -> usize {
        let n = (self.end - self.start).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
        self.start += n;
        n
    }

    fn load(&mut self, bytes: &[u8]) {
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.start = 0;
        self.end = bytes.len();
    }
}

impl Default for Carry {
    fn default() -> Self {
        Carry {
            buf: [0; IOBUF_CHUNK],
            start: 0,
            end: 0,
        }
    }
}

/// The stream beneath a filter, handed to its fill operation.
struct Lower<'a, 's> {
    carry: &'a mut Carry,
    below: &'a mut [Layer],
    source: &'a mut Source<'s>,
}

impl Lower<'_, '_> {
    fn pull(&mut self, out: &mut [u8]) -> Result<Pulled, PgpError> {
        if out.is_empty() {
            return Ok(Pulled::Bytes(0));
        }
        if !self.carry.is_empty() {
            return Ok(Pulled::Bytes(self.carry.take_into(out)));
        }
        pull_chain(self.below, self.source, out)
    }

    /// Like [`Lower::pull`], retrying once on an empty fill; `None` at end of stream.
    fn pull_some(&mut self, out: &mut [u8]) -> Result<Option<usize>, PgpError> {
        retry_once(|| self.pull(out))
    }

    fn read_byte(&mut self) -> Result<Option<u8>, PgpError> {
        let mut byte = [0u8; 1];
        Ok(self.pull_some(&mut byte)?.map(|_| byte[0]))
    }
}

fn pull_chain(
    layers: &mut [Layer],
    source: &mut Source<'_>,
    out: &mut [u8],
) -> Result<Pulled, PgpError> {
    match layers.split_last_mut() {
        Some((Layer { filter, carry }, below)) => filter.fill(
            out,
            &mut Lower {
                carry,
                below,
                source,
            },
        ),
        None => Ok(source.fill(out)),
    }
}

fn retry_once(
    mut pull: impl FnMut() -> Result<Pulled, PgpError>,
) -> Result<Option<usize>, PgpError> {
    for _ in 0..2 {
        match pull()? {
            Pulled::EndOfStream => return Ok(None),
            Pulled::Bytes(0) => continue,
            Pulled::Bytes(n) => return Ok(Some(n)),
        }
    }
    Err(PgpError::malformed("filter produced no data twice in a row"))
}

/// A stream transformation on the filter stack.
#[derive(Debug, Default)]
pub enum Filter {
    /// Pass bytes through unchanged until the lower stream ends.
    #[default]
    Identity,
    /// Exactly `remaining` more bytes, then end of stream.
    LengthLimited { remaining: u32 },
    /// A chain of partial-body segments (RFC 4880 §4.2.2.4) ending in a fixed-length segment.
    PartialBody { remaining: u32, last: bool },
    CipherDecrypt(DecryptFilter),
}

impl Filter {
    /// The filter that delimits a packet body of the given length.
    pub fn for_body(length: BodyLength) -> Self {
        match length {
            BodyLength::Fixed(remaining) => Filter::LengthLimited { remaining },
            BodyLength::Partial(remaining) => Filter::PartialBody {
                remaining,
                last: false,
            },
            BodyLength::Indeterminate => Filter::Identity,
        }
    }

    fn fill(&mut self, out: &mut [u8], lower: &mut Lower<'_, '_>) -> Result<Pulled, PgpError> {
        match self {
            Filter::Identity => lower.pull(out),
            Filter::LengthLimited { remaining } => {
                if *remaining == 0 {
                    return Ok(Pulled::EndOfStream);
                }
                let want = out.len().min(*remaining as usize);
                match lower.pull(&mut out[..want])? {
                    Pulled::EndOfStream => Err(PgpError::malformed("packet body truncated")),
                    Pulled::Bytes(n) => {
                        *remaining -= n as u32;
                        Ok(Pulled::Bytes(n))
                    }
                }
            }
            Filter::PartialBody { remaining, last } => {
                if *remaining == 0 {
                    if *last {
                        return Ok(Pulled::EndOfStream);
                    }
                    let first = lower
                        .read_byte()?
                        .ok_or(PgpError::malformed("partial body length truncated"))?;
                    let length = read_new_format_length(first, || {
                        lower
                            .read_byte()?
                            .ok_or(PgpError::malformed("partial body length truncated"))
                    })?;
                    match length {
                        BodyLength::Fixed(n) => {
                            *remaining = n;
                            *last = true;
                        }
                        BodyLength::Partial(n) => *remaining = n,
                        BodyLength::Indeterminate => {
                            return Err(PgpError::malformed("indeterminate partial segment"))
                        }
                    }
                    if *remaining == 0 {
                        return Ok(Pulled::Bytes(0));
                    }
                }
                let want = out.len().min(*remaining as usize);
                match lower.pull(&mut out[..want])? {
                    Pulled::EndOfStream => Err(PgpError::malformed("partial body truncated")),
                    Pulled::Bytes(n) => {
                        *remaining -= n as u32;
                        Ok(Pulled::Bytes(n))
                    }
                }
            }
            Filter::CipherDecrypt(decrypt) => decrypt.fill(out, lower),
        }
    }

    /// Consume the rest of this filter's output.
    fn drain(&mut self, lower: &mut Lower<'_, '_>) -> Result<(), PgpError> {
        let mut scratch = [0u8; IOBUF_CHUNK];
        while retry_once(|| self.fill(&mut scratch, lower))?.is_some() {}
        Ok(())
    }
}

/// Streaming CFB decryption, optionally holding back the trailing MDC packet.
///
/// With an MDC, the final [`MDC_PACKET_LEN`] plaintext octets are never released: everything in
/// front of them is hashed and passed up, and [`DecryptFilter::into_trailer`] hands them over once
/// the ciphertext has ended.
pub struct DecryptFilter {
    cfb: Cfb,
    trailer: Option<Trailer>,
}

struct Trailer {
    mdc: MdcVerifier,
    held: [u8; MDC_PACKET_LEN],
    len: usize,
}

impl DecryptFilter {
    /// Plain decryption, no integrity trailer.
    pub fn new(cfb: Cfb) -> Self {
        DecryptFilter { cfb, trailer: None }
    }

    /// Decryption whose last [`MDC_PACKET_LEN`] octets are an MDC packet covered by `mdc`.
    pub fn with_mdc(cfb: Cfb, mdc: MdcVerifier) -> Self {
        DecryptFilter {
            cfb,
            trailer: Some(Trailer {
                mdc,
                held: [0; MDC_PACKET_LEN],
                len: 0,
            }),
        }
    }

    fn fill(&mut self, out: &mut [u8], lower: &mut Lower<'_, '_>) -> Result<Pulled, PgpError> {
        loop {
            let n = match lower.pull(out)? {
                Pulled::EndOfStream => return Ok(Pulled::EndOfStream),
                Pulled::Bytes(0) => return Ok(Pulled::Bytes(0)),
                Pulled::Bytes(n) => n,
            };
            self.cfb.decrypt(&mut out[..n]);

            let Some(trailer) = self.trailer.as_mut() else {
                return Ok(Pulled::Bytes(n));
            };
            let total = trailer.len + n;
            if total <= MDC_PACKET_LEN {
                trailer.held[trailer.len..total].copy_from_slice(&out[..n]);
                trailer.len = total;
                continue;
            }

            // `held ++ out[..n]` is the plaintext in order; release all but the last 22 octets.
            let emit = total - MDC_PACKET_LEN;
            let mut next = [0u8; MDC_PACKET_LEN];
            for (i, slot) in next.iter_mut().enumerate() {
                let idx = emit + i;
                *slot = if idx < trailer.len {
                    trailer.held[idx]
                } else {
                    out[idx - trailer.len]
                };
            }
            if emit <= trailer.len {
                out[..emit].copy_from_slice(&trailer.held[..emit]);
            } else {
                out.copy_within(0..emit - trailer.len, trailer.len);
                out[..trailer.len].copy_from_slice(&trailer.held[..trailer.len]);
            }
            trailer.held = next;
            trailer.len = MDC_PACKET_LEN;
            trailer.mdc.update(&out[..emit]);
            return Ok(Pulled::Bytes(emit));
        }
    }

    pub fn has_mdc(&self) -> bool {
        self.trailer.is_some()
    }

    /// The running digest and the held-back MDC packet octets.
    ///
    /// `None` without an MDC; an error if the ciphertext ended before a full trailer arrived.
    pub fn into_trailer(self) -> Result<Option<(MdcVerifier, [u8; MDC_PACKET_LEN])>, PgpError> {
        match self.trailer {
            None => Ok(None),
            Some(trailer) if trailer.len < MDC_PACKET_LEN => {
                Err(PgpError::malformed("encrypted data too short for an MDC packet"))
            }
            Some(trailer) => Ok(Some((trailer.mdc, trailer.held))),
        }
    }
}

impl core::fmt::Debug for DecryptFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DecryptFilter")
            .field("mdc", &self.trailer.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Layer {
    filter: Filter,
    carry: Carry,
}

pub struct IoBuf<'s> {
    source: Source<'s>,
    layers: [Layer; MAX_FILTER_DEPTH],
    depth: usize,
    buf: [u8; IOBUF_CHUNK],
    start: usize,
    end: usize,
}

impl<'s> IoBuf<'s> {
    pub fn open(data: &'s [u8]) -> Self {
        IoBuf {
            source: Source { data, pos: 0 },
            layers: Default::default(),
            depth: 0,
            buf: [0; IOBUF_CHUNK],
            start: 0,
            end: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Make `filter` the new top of the stack.
    pub fn push_filter(&mut self, filter: Filter) -> Result<(), PgpError> {
        if self.depth == MAX_FILTER_DEPTH {
            return Err(PgpError::malformed("packet nesting too deep"));
        }
        let layer = &mut self.layers[self.depth];
        layer.carry.load(&self.buf[self.start..self.end]);
        layer.filter = filter;
        self.depth += 1;
        self.start = 0;
        self.end = 0;
        Ok(())
    }

    /// Flush the top filter (consuming whatever it has left to produce) and detach it.
    ///
    /// Unread bytes of the popped filter's output are discarded.
    pub fn pop_filter(&mut self) -> Result<Filter, PgpError> {
        if self.depth == 0 {
            return Err(PgpError::InvalidArguments {
                context: "pop on an empty filter stack",
            });
        }
        self.depth -= 1;
        self.start = 0;
        self.end = 0;

        let (below, rest) = self.layers.split_at_mut(self.depth);
        let Layer { filter, carry } = &mut rest[0];
        filter.drain(&mut Lower {
            carry: &mut *carry,
            below,
            source: &mut self.source,
        })?;

        self.end = carry.take_into(&mut self.buf);
        *carry = Carry::default();
        Ok(core::mem::take(filter))
    }

    fn underflow(&mut self) -> Result<bool, PgpError> {
        let Self {
            source,
            layers,
            depth,
            buf,
            ..
        } = self;
        let produced = retry_once(|| pull_chain(&mut layers[..*depth], source, buf))?;
        self.start = 0;
        self.end = produced.unwrap_or(0);
        Ok(produced.is_some())
    }

    pub fn read_byte(&mut self) -> Result<Option<u8>, PgpError> {
        if self.start == self.end && !self.underflow()? {
            return Ok(None);
        }
        let byte = self.buf[self.start];
        self.start += 1;
        Ok(Some(byte))
    }

    /// Read up to `out.len()` bytes; 0 only at end of stream.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, PgpError> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.start == self.end && !self.underflow()? {
            return Ok(0);
        }
        let n = (self.end - self.start).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
        self.start += n;
        Ok(n)
    }

    /// Fill `out` completely or fail with `MalformedPacket { context }`.
    pub fn read_exact(&mut self, out: &mut [u8], context: &'static str) -> Result<(), PgpError> {
        let mut filled = 0;
        while filled < out.len() {
            match self.read(&mut out[filled..])? {
                0 => return Err(PgpError::MalformedPacket { context }),
                n => filled += n,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(io: &mut IoBuf<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            let n = io.read(&mut chunk).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn source_reads_through() {
        let data: Vec<u8> = (0..=255u8).cycle().take(2000).collect();
        let mut io = IoBuf::open(&data);
        assert_eq!(read_all(&mut io), data);
        assert_eq!(io.read_byte().unwrap(), None);
    }

    #[test]
    fn length_limit_then_pop_realigns_the_stream() {
        let data = b"abcdefghij";
        let mut io = IoBuf::open(data);
        assert_eq!(io.read_byte().unwrap(), Some(b'a'));
        io.push_filter(Filter::LengthLimited { remaining: 5 }).unwrap();
        assert_eq!(io.read_byte().unwrap(), Some(b'b'));
        // Leave bytes unread; popping must skip exactly the rest of the body.
        assert!(matches!(io.pop_filter().unwrap(), Filter::LengthLimited { remaining: 0 }));
        assert_eq!(read_all(&mut io), b"ghij");
    }

    #[test]
    fn truncated_length_is_malformed() {
        let mut io = IoBuf::open(b"abc");
        io.push_filter(Filter::LengthLimited { remaining: 0xFFFF }).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(io.read(&mut out).unwrap(), 3);
        assert_eq!(
            io.read(&mut out),
            Err(PgpError::malformed("packet body truncated"))
        );
    }

    #[test]
    fn partial_body_segments_are_joined() {
        // 2-byte partial segment, 1-byte partial segment, final 3-byte segment, then trailing data.
        let mut data = vec![];
        data.extend_from_slice(b"ab");
        data.push(0xE0); // partial, 1 << 0
        data.extend_from_slice(b"c");
        data.push(3);
        data.extend_from_slice(b"def");
        data.extend_from_slice(b"rest");
        let mut io = IoBuf::open(&data);
        io.push_filter(Filter::PartialBody { remaining: 2, last: false }).unwrap();
        assert_eq!(read_all(&mut io), b"abcdef");
        io.pop_filter().unwrap();
        assert_eq!(read_all(&mut io), b"rest");
    }

    #[test]
    fn zero_length_final_segment_ends_the_body() {
        let data = [b'x', b'y', 0x00, b'z'];
        let mut io = IoBuf::open(&data);
        io.push_filter(Filter::PartialBody { remaining: 2, last: false }).unwrap();
        assert_eq!(read_all(&mut io), b"xy");
        io.pop_filter().unwrap();
        assert_eq!(read_all(&mut io), b"z");
    }

    #[test]
    fn stack_depth_is_bounded() {
        let mut io = IoBuf::open(b"");
        for _ in 0..MAX_FILTER_DEPTH {
            io.push_filter(Filter::Identity).unwrap();
        }
        assert!(io.push_filter(Filter::Identity).is_err());
        for _ in 0..MAX_FILTER_DEPTH {
            io.pop_filter().unwrap();
        }
        assert!(io.pop_filter().is_err());
    }

    #[test]
    fn buffered_bytes_move_between_levels() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut io = IoBuf::open(&data);
        io.read_byte().unwrap();
        // The read buffer now holds bytes 1..100 already pulled from the source.
        io.push_filter(Filter::LengthLimited { remaining: 10 }).unwrap();
        io.push_filter(Filter::LengthLimited { remaining: 4 }).unwrap();
        assert_eq!(read_all(&mut io), vec![1, 2, 3, 4]);
        io.pop_filter().unwrap();
        assert_eq!(read_all(&mut io), (5..11).collect::<Vec<u8>>());
        io.pop_filter().unwrap();
        assert_eq!(read_all(&mut io), (11..100).collect::<Vec<u8>>());
    }
}
