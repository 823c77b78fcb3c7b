//! Packet encryption for the voice transport.
//!
//! Both supported modes are XSalsa20-Poly1305 secretboxes over the Opus
//! payload; they differ only in where the 24-byte nonce comes from.

use rand::RngCore;
use xsalsa20poly1305::{
    XSalsa20Poly1305,
    aead::{Aead, KeyInit},
};

use crate::common::errors::NodeError;

pub const RTP_HEADER_LEN: usize = 12;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Nonce is the RTP header zero-extended to 24 bytes.
    XSalsa20Poly1305,
    /// Nonce is 24 random bytes appended after the ciphertext.
    XSalsa20Poly1305Suffix,
}

impl EncryptionMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::XSalsa20Poly1305 => "xsalsa20_poly1305",
            Self::XSalsa20Poly1305Suffix => "xsalsa20_poly1305_suffix",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "xsalsa20_poly1305" => Some(Self::XSalsa20Poly1305),
            "xsalsa20_poly1305_suffix" => Some(Self::XSalsa20Poly1305Suffix),
            _ => None,
        }
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// First mode in `preferred` that the server also offers and we implement.
pub fn negotiate(offered: &[String], preferred: &[String]) -> Option<EncryptionMode> {
    preferred
        .iter()
        .filter(|p| offered.iter().any(|o| o == *p))
        .find_map(|p| EncryptionMode::from_name(p))
}

pub fn rtp_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_LEN] {
    let mut header = [0u8; RTP_HEADER_LEN];
    header[0] = 0x80;
    header[1] = 0x78;
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

/// Encrypt `payload` and return the complete packet: header, sealed box and,
/// for the suffix mode, the nonce.
pub fn encrypt(
    mode: EncryptionMode,
    key: &[u8; 32],
    header: &[u8; RTP_HEADER_LEN],
    payload: &[u8],
) -> Result<Vec<u8>, NodeError> {
    let cipher = XSalsa20Poly1305::new(key.into());
    let mut nonce = [0u8; NONCE_LEN];
    match mode {
        EncryptionMode::XSalsa20Poly1305 => nonce[..RTP_HEADER_LEN].copy_from_slice(header),
        EncryptionMode::XSalsa20Poly1305Suffix => rand::thread_rng().fill_bytes(&mut nonce),
    }

    let sealed = cipher
        .encrypt(&nonce.into(), payload)
        .map_err(|e| NodeError::Transport(format!("{} encryption failed: {:?}", mode, e)))?;

    let suffix = if mode == EncryptionMode::XSalsa20Poly1305Suffix {
        NONCE_LEN
    } else {
        0
    };
    let mut packet = Vec::with_capacity(RTP_HEADER_LEN + sealed.len() + suffix);
    packet.extend_from_slice(header);
    packet.extend_from_slice(&sealed);
    if suffix > 0 {
        packet.extend_from_slice(&nonce);
    }
    Ok(packet)
}

/// Inverse of [`encrypt`]: the plaintext payload of a full packet.
pub fn decrypt(mode: EncryptionMode, key: &[u8; 32], packet: &[u8]) -> Result<Vec<u8>, NodeError> {
    let min = RTP_HEADER_LEN
        + TAG_LEN
        + match mode {
            EncryptionMode::XSalsa20Poly1305 => 0,
            EncryptionMode::XSalsa20Poly1305Suffix => NONCE_LEN,
        };
    if packet.len() < min {
        return Err(NodeError::Transport(format!(
            "voice packet too short: {} bytes",
            packet.len()
        )));
    }

    let mut nonce = [0u8; NONCE_LEN];
    let sealed = match mode {
        EncryptionMode::XSalsa20Poly1305 => {
            nonce[..RTP_HEADER_LEN].copy_from_slice(&packet[..RTP_HEADER_LEN]);
            &packet[RTP_HEADER_LEN..]
        }
        EncryptionMode::XSalsa20Poly1305Suffix => {
            let split = packet.len() - NONCE_LEN;
            nonce.copy_from_slice(&packet[split..]);
            &packet[RTP_HEADER_LEN..split]
        }
    };

    XSalsa20Poly1305::new(key.into())
        .decrypt(&nonce.into(), sealed)
        .map_err(|e| NodeError::Transport(format!("{} decryption failed: {:?}", mode, e)))
}
