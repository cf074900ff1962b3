//! Channel cipher for broker envelopes: AES-128 in counter mode.
//!
//! The 16-byte initial counter block is
//!
//! ```text
//! bytes 0..4   packet id, little endian
//! bytes 4..8   sender node number, little endian
//! bytes 8..16  zero
//! ```
//!
//! and the counter increments big-endian over the whole block. Other mesh clients
//! derive the block the same way, so this layout cannot change.

use aes::Aes128;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const KEY_LEN: usize = 16;

/// Default channel key: `0x01` followed by fifteen zero bytes.
pub const DEFAULT_KEY: [u8; KEY_LEN] = [0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

pub fn build_nonce(packet_id: u32, sender: u32) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[0..4].copy_from_slice(&packet_id.to_le_bytes());
    nonce[4..8].copy_from_slice(&sender.to_le_bytes());
    nonce
}

fn apply_keystream(key: &[u8; KEY_LEN], packet_id: u32, sender: u32, data: &[u8]) -> Vec<u8> {
    let nonce = build_nonce(packet_id, sender);
    let mut cipher = Aes128Ctr::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(&nonce),
    );
    let mut buf = data.to_vec();
    cipher.apply_keystream(&mut buf);
    buf
}

pub fn encrypt(key: &[u8; KEY_LEN], packet_id: u32, sender: u32, plaintext: &[u8]) -> Vec<u8> {
    apply_keystream(key, packet_id, sender, plaintext)
}

pub fn decrypt(key: &[u8; KEY_LEN], packet_id: u32, sender: u32, ciphertext: &[u8]) -> Vec<u8> {
    apply_keystream(key, packet_id, sender, ciphertext)
}

/// One-byte channel hash carried in `MeshPacket.channel`: XOR of every byte of the
/// channel name and of the key.
pub fn channel_hash(name: &str, key: &[u8]) -> u32 {
    let fold = |acc: u8, b: &u8| acc ^ b;
    let h = name.as_bytes().iter().fold(0u8, fold) ^ key.iter().fold(0u8, fold);
    h as u32
}

/// Parse a key written as 32 hex digits.
pub fn parse_key_hex(raw: &str) -> Option<[u8; KEY_LEN]> {
    let raw = raw.trim();
    if raw.len() != KEY_LEN * 2 || !raw.is_ascii() {
        return None;
    }
    let mut key = [0u8; KEY_LEN];
    for (i, slot) in key.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&raw[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(key)
}
