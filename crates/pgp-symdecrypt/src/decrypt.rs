//! Decryption orchestrator.
//!
//! A [`ControlContext`] owns the key material for one attempt and moves through
//! `Idle -> KeyEstablished -> Decrypting -> {Verified | Failed} -> Idle`. Whatever the outcome, its
//! session key or passphrase is wiped and released before [`decrypt_message`] returns.

use zeroize::Zeroize;

use crate::cast5::{Cast5, KEY_LEN};
use crate::cfb::{quick_check, Cfb, PREFIX_LEN};
use crate::error::{DecryptError, InvariantViolation, PgpError};
use crate::heap::{Heap, SecretBuf};
use crate::iobuf::{DecryptFilter, Filter, IoBuf, IOBUF_CHUNK};
use crate::mdc::{MdcVerifier, MDC_HEADER};
use crate::packet::{cipher_key_len, parse_next, LiteralHeader, Packet, Skesk, CIPHER_CAST5};
use crate::s2k::DEFAULT_MAX_S2K_COUNT;
use crate::sink::CharSink;

/// Decrypted and the MDC matched.
pub const STATUS_OK: i32 = 0;
/// Decrypted, but the message carried no MDC so nothing was verified.
pub const STATUS_INTEGRITY_SKIPPED: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptState {
    Idle,
    KeyEstablished,
    Decrypting,
    Verified,
    Failed,
}

/// What to do when the CFB prefix check fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QuickCheckPolicy {
    /// Keep decrypting; a later failure is reported as [`PgpError::KeyMismatchSuspected`].
    #[default]
    Tolerant,
    /// Stop before any plaintext is produced.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptLimits {
    /// Upper bound on the S2K byte count, so hostile headers cannot demand unbounded hashing.
    pub max_s2k_count: u32,
}

impl Default for DecryptLimits {
    fn default() -> Self {
        Self {
            max_s2k_count: DEFAULT_MAX_S2K_COUNT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecryptOptions {
    pub quick_check: QuickCheckPolicy,
    /// Reject legacy Symmetrically Encrypted Data packets, which carry no MDC.
    pub require_mdc: bool,
    pub limits: DecryptLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Verified,
    NotProtected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptOutcome {
    pub integrity: Integrity,
    pub literal: LiteralHeader,
    /// Plaintext bytes written to the sink.
    pub plaintext_len: u64,
    /// The prefix check failed but decryption still verified (tolerant policy).
    pub quick_check_failed: bool,
}

impl DecryptOutcome {
    pub fn status(&self) -> i32 {
        match self.integrity {
            Integrity::Verified => STATUS_OK,
            Integrity::NotProtected => STATUS_INTEGRITY_SKIPPED,
        }
    }
}

/// Per-attempt state: at most one of a session key or a passphrase, both heap-backed.
pub struct ControlContext<'h> {
    heap: &'h Heap,
    session_key: Option<SecretBuf<'h>>,
    passphrase: Option<SecretBuf<'h>>,
    state: DecryptState,
}

impl<'h> ControlContext<'h> {
    pub fn new(heap: &'h Heap) -> Self {
        ControlContext {
            heap,
            session_key: None,
            passphrase: None,
            state: DecryptState::Idle,
        }
    }

    pub fn state(&self) -> DecryptState {
        self.state
    }

    pub fn has_key_material(&self) -> bool {
        self.session_key.is_some() || self.passphrase.is_some()
    }

    fn transition(&mut self, to: DecryptState) {
        log::debug!("decrypt: {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    /// Wipe any previous material, then take exactly one of `session_key` or `passphrase`.
    ///
    /// An empty session key counts as absent.
    pub fn establish_key(
        &mut self,
        session_key: Option<&[u8]>,
        passphrase: Option<&[u8]>,
    ) -> Result<(), DecryptError> {
        self.wipe()?;
        match (session_key.filter(|key| !key.is_empty()), passphrase) {
            (Some(_), Some(_)) => {
                return Err(PgpError::InvalidArguments {
                    context: "both a session key and a passphrase were supplied",
                }
                .into())
            }
            (None, None) => {
                return Err(PgpError::InvalidArguments {
                    context: "either a session key or a passphrase is required",
                }
                .into())
            }
            (Some(key), None) => {
                log::debug!("decrypt: using a {}-byte session key", key.len());
                self.session_key = Some(SecretBuf::copy_from(self.heap, key)?);
            }
            (None, Some(passphrase)) => {
                log::debug!("decrypt: using a passphrase");
                self.passphrase = Some(SecretBuf::copy_from(self.heap, passphrase)?);
            }
        }
        self.transition(DecryptState::KeyEstablished);
        Ok(())
    }

    /// Zero, verify and release all key material.
    pub fn wipe(&mut self) -> Result<(), InvariantViolation> {
        let key = self.session_key.take().map_or(Ok(()), SecretBuf::destroy);
        let passphrase = self.passphrase.take().map_or(Ok(()), SecretBuf::destroy);
        key.and(passphrase)
    }

    /// Build the data cipher from the established material and the message's SKESK, if any.
    fn data_cipher(
        &self,
        skesk: Option<&Skesk>,
        options: &DecryptOptions,
    ) -> Result<Cast5, DecryptError> {
        if let Some(key) = &self.session_key {
            if let Some(skesk) = skesk {
                if skesk.encrypted_session_key().is_none()
                    && skesk.cipher_algorithm != CIPHER_CAST5
                {
                    return Err(unsupported_cipher(skesk.cipher_algorithm).into());
                }
            }
            return Ok(Cast5::new(key.expose())?);
        }

        let passphrase = self.passphrase.as_ref().ok_or(PgpError::InvalidArguments {
            context: "no key material established",
        })?;
        let skesk = skesk.ok_or(PgpError::malformed(
            "passphrase supplied but the message has no SKESK packet",
        ))?;
        if skesk.cipher_algorithm != CIPHER_CAST5 {
            return Err(unsupported_cipher(skesk.cipher_algorithm).into());
        }

        let mut dek = SecretBuf::allocate(self.heap, KEY_LEN)?;
        skesk.s2k.derive_into(
            passphrase.expose(),
            dek.expose_mut(),
            options.limits.max_s2k_count,
        )?;

        let cipher = match skesk.encrypted_session_key() {
            None => Cast5::new(dek.expose())?,
            Some(esk) => {
                let mut plain = SecretBuf::copy_from(self.heap, esk)?;
                Cfb::with_zero_iv(Cast5::new(dek.expose())?).decrypt(plain.expose_mut());
                let Some((&algorithm, key)) = plain.expose().split_first() else {
                    return Err(PgpError::malformed("empty encrypted session key").into());
                };
                // A wrong passphrase turns the algorithm octet into noise.
                if cipher_key_len(algorithm) != Some(key.len()) {
                    log::warn!(
                        "decrypt: session key does not decode as cipher {algorithm} with {} key bytes, \
                         the passphrase is probably wrong",
                        key.len()
                    );
                    return Err(PgpError::KeyMismatchSuspected.into());
                }
                if algorithm != CIPHER_CAST5 {
                    return Err(unsupported_cipher(algorithm).into());
                }
                let cipher = Cast5::new(key)?;
                plain.destroy()?;
                cipher
            }
        };
        dek.destroy()?;
        Ok(cipher)
    }
}

impl core::fmt::Debug for ControlContext<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ControlContext")
            .field("state", &self.state)
            .field("session_key", &self.session_key)
            .field("passphrase", &self.passphrase)
            .finish()
    }
}

fn unsupported_cipher(id: u8) -> PgpError {
    PgpError::UnsupportedAlgorithm { what: "cipher", id }
}

/// Decrypt `input`, writing the literal content to `sink`.
///
/// Exactly one of `session_key` or `passphrase` must be given. The context's copies of them are
/// wiped and released before this returns, whether it succeeds or fails.
pub fn decrypt_message<S: CharSink + ?Sized>(
    ctx: &mut ControlContext<'_>,
    session_key: Option<&[u8]>,
    passphrase: Option<&[u8]>,
    input: &[u8],
    sink: &mut S,
    options: &DecryptOptions,
) -> Result<DecryptOutcome, DecryptError> {
    let result = if input.is_empty() {
        Err(PgpError::InvalidArguments {
            context: "encrypted input is empty",
        }
        .into())
    } else {
        match ctx.establish_key(session_key, passphrase) {
            Ok(()) => {
                ctx.transition(DecryptState::Decrypting);
                run(ctx, input, sink, options)
            }
            Err(err) => Err(err),
        }
    };

    ctx.transition(match result {
        Ok(_) => DecryptState::Verified,
        Err(_) => DecryptState::Failed,
    });
    let wiped = ctx.wipe();
    ctx.transition(DecryptState::Idle);
    wiped?;
    result
}

fn run<S: CharSink + ?Sized>(
    ctx: &ControlContext<'_>,
    input: &[u8],
    sink: &mut S,
    options: &DecryptOptions,
) -> Result<DecryptOutcome, DecryptError> {
    let mut io = IoBuf::open(input);
    let mut skesk = None;
    let integrity_protected = loop {
        match parse_next(&mut io)? {
            None => return Err(PgpError::malformed("no encrypted data packet").into()),
            Some(Packet::Skesk(packet)) => {
                if skesk.is_none() {
                    skesk = Some(packet);
                } else {
                    log::debug!("decrypt: ignoring an additional SKESK packet");
                }
            }
            Some(Packet::Marker) | Some(Packet::Skipped { .. }) => {}
            Some(Packet::Encrypted {
                integrity_protected,
            }) => break integrity_protected,
            Some(Packet::Literal(_)) | Some(Packet::Mdc(_)) => {
                return Err(PgpError::malformed("plaintext packet outside encrypted data").into())
            }
        }
    };

    if !integrity_protected {
        if options.require_mdc {
            log::warn!("decrypt: message has no MDC and one is required");
            return Err(PgpError::IntegrityFailure.into());
        }
        log::warn!("decrypt: legacy encrypted data, integrity will not be verified");
    }

    let mut cfb = Cfb::with_zero_iv(ctx.data_cipher(skesk.as_ref(), options)?);
    let mut prefix = [0u8; PREFIX_LEN];
    io.read_exact(&mut prefix, "encrypted data prefix")?;
    cfb.decrypt(&mut prefix);
    let quick_check_failed = !quick_check(&prefix);
    if quick_check_failed {
        log::warn!("decrypt: quick-check failed, the key is probably wrong");
        if options.quick_check == QuickCheckPolicy::Strict {
            prefix.zeroize();
            return Err(PgpError::KeyMismatchSuspected.into());
        }
    }

    let filter = if integrity_protected {
        let mut mdc = MdcVerifier::new();
        mdc.update(&prefix);
        DecryptFilter::with_mdc(cfb, mdc)
    } else {
        cfb.resync();
        DecryptFilter::new(cfb)
    };
    prefix.zeroize();
    io.push_filter(Filter::CipherDecrypt(filter))?;

    let mut plaintext_len = 0u64;
    match read_encrypted_body(&mut io, sink, &mut plaintext_len) {
        Ok((literal, integrity)) => Ok(DecryptOutcome {
            integrity,
            literal,
            plaintext_len,
            quick_check_failed,
        }),
        Err(err) => {
            if plaintext_len > 0 {
                sink.mark_untrusted();
            }
            if quick_check_failed && !matches!(err, PgpError::AllocationFailure { .. }) {
                log::warn!("decrypt: {err} after a failed quick-check");
                return Err(PgpError::KeyMismatchSuspected.into());
            }
            Err(err.into())
        }
    }
}

/// Walk the decrypted packet stream, emit the literal content, then check the MDC trailer.
fn read_encrypted_body<S: CharSink + ?Sized>(
    io: &mut IoBuf<'_>,
    sink: &mut S,
    written: &mut u64,
) -> Result<(LiteralHeader, Integrity), PgpError> {
    let mut literal = None;
    while let Some(packet) = parse_next(io)? {
        match packet {
            Packet::Literal(header) => {
                if literal.is_some() {
                    return Err(PgpError::malformed("more than one literal data packet"));
                }
                log::debug!(
                    "decrypt: literal data, format {:?}, name of {} bytes",
                    char::from(header.format),
                    header.file_name().len()
                );
                let mut chunk = [0u8; IOBUF_CHUNK];
                loop {
                    let n = io.read(&mut chunk)?;
                    if n == 0 {
                        break;
                    }
                    sink.put_bytes(&chunk[..n]);
                    *written += n as u64;
                }
                chunk.zeroize();
                io.pop_filter()?;
                literal = Some(header);
            }
            Packet::Marker | Packet::Skipped { .. } => {}
            Packet::Mdc(_) => {
                return Err(PgpError::malformed(
                    "MDC packet before the end of encrypted data",
                ))
            }
            Packet::Skesk(_) | Packet::Encrypted { .. } => {
                return Err(PgpError::malformed("unexpected packet inside encrypted data"))
            }
        }
    }
    let literal = literal.ok_or(PgpError::malformed(
        "encrypted data holds no literal data packet",
    ))?;

    let Filter::CipherDecrypt(decrypt) = io.pop_filter()? else {
        return Err(PgpError::malformed("decryption filter missing from the stack"));
    };
    let integrity = match decrypt.into_trailer()? {
        None => Integrity::NotProtected,
        Some((mut mdc, trailer)) => {
            let digest = match parse_next(&mut IoBuf::open(&trailer))? {
                Some(Packet::Mdc(digest)) => digest,
                _ => {
                    return Err(PgpError::malformed(
                        "encrypted data does not end with an MDC packet",
                    ))
                }
            };
            mdc.update(&MDC_HEADER);
            mdc.verify(&digest)?;
            Integrity::Verified
        }
    };
    io.pop_filter()?;
    Ok((literal, integrity))
}

/// Status-code entry point: `0` verified, `1` decrypted without an MDC, negative on failure.
///
/// A failed quick-check followed by a matching MDC still returns `0` and is logged at warn level;
/// [`decrypt_message`] reports it through [`DecryptOutcome::quick_check_failed`].
pub fn unified_decrypt<S: CharSink + ?Sized>(
    ctx: &mut ControlContext<'_>,
    session_key: Option<&[u8]>,
    passphrase: Option<&[u8]>,
    input: &[u8],
    sink: &mut S,
) -> i32 {
    match decrypt_message(
        ctx,
        session_key,
        passphrase,
        input,
        sink,
        &DecryptOptions::default(),
    ) {
        Ok(outcome) => {
            // The status has no code for this; the MDC still vouches for the plaintext.
            if outcome.quick_check_failed {
                log::warn!("decryption verified although the quick-check failed");
            }
            log::info!(
                "decryption succeeded: {} bytes, {:?}",
                outcome.plaintext_len,
                outcome.integrity
            );
            outcome.status()
        }
        Err(err) => {
            log::warn!("decryption failed: {err}");
            err.status()
        }
    }
}
