//! Forward-secret encrypted transport for session traffic.
//!
//! # Handshake
//!
//! ```text
//!  initiator                               responder
//!  ─────────                               ─────────
//!  "KMS1" ‖ ephemeral X25519 pub  ──────►
//!                                 ◄──────  "KMS1" ‖ ephemeral X25519 pub
//!  shared = X25519(own secret, peer pub)    (same on both ends)
//! ```
//!
//! Both sides write first and read second, so neither waits on the other.
//! A fresh key pair per connection gives forward secrecy: nothing stored on
//! disk can decrypt a recorded session later.
//!
//! From the shared secret two AES-256-GCM keys are derived, one per
//! direction, as `SHA-256(label ‖ shared ‖ initiator pub ‖ responder pub)`.
//! Each direction numbers its records with a 64-bit counter that becomes the
//! nonce, so a replayed, dropped or reordered record fails authentication.
//!
//! # Records
//!
//! ```text
//! ┌──────────────────┬────────────────────────────────────────┐
//! │ length (u32 BE)  │ AES-GCM(ciphertext of one codec frame) │
//! └──────────────────┴────────────────────────────────────────┘
//! ```
//!
//! There are no certificates.  The channel only proves that both ends hold
//! the same ephemeral secret; the pairing layer proves *who* is on the other
//! end by binding its passphrase proof to [`SecureChannel::binding`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use kms_core::protocol::codec::{decode_frame, encode_frame, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};
use kms_core::{Envelope, ProtocolError};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Magic bytes opening every connection.
pub const CHANNEL_MAGIC: [u8; 4] = *b"KMS1";

/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;

/// Largest ciphertext record accepted: one full frame plus its tag.
pub const MAX_RECORD_LEN: usize = LENGTH_PREFIX_LEN + MAX_FRAME_LEN + TAG_LEN;

const LABEL_INITIATOR_TO_RESPONDER: &[u8] = b"kms channel i2r";
const LABEL_RESPONDER_TO_INITIATOR: &[u8] = b"kms channel r2i";
const LABEL_BINDING: &[u8] = b"kms channel binding";

/// Errors raised by the encrypted transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    Closed,

    #[error("peer is not a Keyboard Mouse Share endpoint (magic {0:02x?})")]
    BadMagic([u8; 4]),

    #[error("peer sent a low-order public key")]
    WeakKey,

    #[error("record failed authentication")]
    Crypto,

    #[error("record length {len} is outside 1..={max}", max = MAX_RECORD_LEN)]
    RecordLength { len: usize },

    #[error("record counter exhausted; reconnect required")]
    CounterExhausted,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Which end of the connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The end that opened the connection.
    Initiator,
    /// The end that accepted it.
    Responder,
}

// ── Halves ────────────────────────────────────────────────────────────────────

/// Decrypting half of a [`SecureChannel`].
pub struct SecureReader<R> {
    reader: R,
    cipher: Aes256Gcm,
    counter: u64,
}

/// Encrypting half of a [`SecureChannel`].
pub struct SecureWriter<W> {
    writer: W,
    cipher: Aes256Gcm,
    counter: u64,
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    /// Reads, decrypts and decodes the next envelope.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Closed`] on a clean end of stream,
    /// [`ChannelError::Crypto`] if the record was tampered with or replayed,
    /// or a codec error if the plaintext is not a valid frame.
    pub async fn recv_envelope(&mut self) -> Result<Envelope, ChannelError> {
        let mut prefix = [0u8; 4];
        match self.reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ChannelError::Closed),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 || len > MAX_RECORD_LEN {
            return Err(ChannelError::RecordLength { len });
        }

        let mut record = vec![0u8; len];
        self.reader.read_exact(&mut record).await?;

        let nonce = nonce_for(self.counter);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), record.as_slice())
            .map_err(|_| ChannelError::Crypto)?;
        self.counter = self.counter.checked_add(1).ok_or(ChannelError::CounterExhausted)?;

        let (envelope, _) = decode_frame(&plain)?;
        Ok(envelope)
    }
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    /// Encodes, encrypts and writes one envelope as a single record.
    ///
    /// # Errors
    ///
    /// A codec error if the envelope cannot be framed, or an I/O error.
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<usize, ChannelError> {
        let frame = encode_frame(envelope)?;
        let nonce = nonce_for(self.counter);
        let record = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), frame.as_slice())
            .map_err(|_| ChannelError::Crypto)?;
        self.counter = self.counter.checked_add(1).ok_or(ChannelError::CounterExhausted)?;

        let mut out = Vec::with_capacity(4 + record.len());
        out.extend_from_slice(&(record.len() as u32).to_be_bytes());
        out.extend_from_slice(&record);
        self.writer.write_all(&out).await?;
        self.writer.flush().await?;
        Ok(out.len())
    }

    /// Shuts down the write direction of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// An encrypted, framed, bidirectional message channel.
pub struct SecureChannel<S> {
    reader: SecureReader<ReadHalf<S>>,
    writer: SecureWriter<WriteHalf<S>>,
    binding: [u8; 32],
    side: Side,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Runs the key exchange over `stream` and returns the ready channel.
    ///
    /// # Errors
    ///
    /// [`ChannelError::BadMagic`] if the peer does not speak this protocol,
    /// [`ChannelError::WeakKey`] if its key yields a non-contributory secret,
    /// or an I/O error.
    pub async fn establish(mut stream: S, side: Side) -> Result<Self, ChannelError> {
        let secret = EphemeralSecret::random();
        let own_public = PublicKey::from(&secret);

        let mut hello = [0u8; 36];
        hello[..4].copy_from_slice(&CHANNEL_MAGIC);
        hello[4..].copy_from_slice(own_public.as_bytes());
        stream.write_all(&hello).await?;
        stream.flush().await?;

        let mut peer_hello = [0u8; 36];
        match stream.read_exact(&mut peer_hello).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ChannelError::Closed),
            Err(e) => return Err(e.into()),
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&peer_hello[..4]);
        if magic != CHANNEL_MAGIC {
            return Err(ChannelError::BadMagic(magic));
        }
        let mut peer_bytes = [0u8; 32];
        peer_bytes.copy_from_slice(&peer_hello[4..]);
        let peer_public = PublicKey::from(peer_bytes);

        let shared = secret.diffie_hellman(&peer_public);
        if !shared.was_contributory() {
            return Err(ChannelError::WeakKey);
        }

        let (initiator_pub, responder_pub) = match side {
            Side::Initiator => (own_public.to_bytes(), peer_bytes),
            Side::Responder => (peer_bytes, own_public.to_bytes()),
        };
        let derive = |label: &[u8]| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(label);
            hasher.update(shared.as_bytes());
            hasher.update(initiator_pub);
            hasher.update(responder_pub);
            hasher.finalize().into()
        };
        let i2r = derive(LABEL_INITIATOR_TO_RESPONDER);
        let r2i = derive(LABEL_RESPONDER_TO_INITIATOR);
        let (send_key, recv_key) = match side {
            Side::Initiator => (i2r, r2i),
            Side::Responder => (r2i, i2r),
        };

        let mut hasher = Sha256::new();
        hasher.update(LABEL_BINDING);
        hasher.update(initiator_pub);
        hasher.update(responder_pub);
        let binding: [u8; 32] = hasher.finalize().into();

        let send_cipher = Aes256Gcm::new_from_slice(&send_key).map_err(|_| ChannelError::Crypto)?;
        let recv_cipher = Aes256Gcm::new_from_slice(&recv_key).map_err(|_| ChannelError::Crypto)?;

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self {
            reader: SecureReader {
                reader: read_half,
                cipher: recv_cipher,
                counter: 0,
            },
            writer: SecureWriter {
                writer: write_half,
                cipher: send_cipher,
                counter: 0,
            },
            binding,
            side,
        })
    }
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Hash of both ephemeral public keys; identical on both ends.
    pub fn binding(&self) -> &[u8; 32] {
        &self.binding
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// See [`SecureWriter::send_envelope`].
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<usize, ChannelError> {
        self.writer.send_envelope(envelope).await
    }

    /// See [`SecureReader::recv_envelope`].
    pub async fn recv_envelope(&mut self) -> Result<Envelope, ChannelError> {
        self.reader.recv_envelope().await
    }

    /// Splits the channel so reading and writing can run on separate tasks.
    pub fn split(self) -> (SecureReader<ReadHalf<S>>, SecureWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
