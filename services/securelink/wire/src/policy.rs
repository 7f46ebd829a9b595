//! Per-message-type encryption policy.

use crate::header::msg_id;
use std::fmt;

/// Size of the policy bitmap in bytes (one bit per message identifier)
pub const POLICY_BITMAP_SIZE: usize = 32;

/// Identifiers that never require encryption
pub const DEFAULT_EXEMPT_IDS: [u8; 5] = [
    msg_id::SET_SL_MAC_KEY_REQ,
    msg_id::SL_EXCHANGE_PUB_KEYS_REQ,
    msg_id::SL_EXCHANGE_PUB_KEYS_IND,
    msg_id::EXCEPTION_IND,
    msg_id::ERROR_IND,
];

/// Bitmap over message identifiers: bit `n` set means id `n` must be encrypted
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandPolicy {
    bits: [u8; POLICY_BITMAP_SIZE],
}

impl CommandPolicy {
    /// Everything encrypted except the bootstrap and fatal-error identifiers
    pub fn new() -> Self {
        let mut policy = Self {
            bits: [0xFF; POLICY_BITMAP_SIZE],
        };
        for id in DEFAULT_EXEMPT_IDS {
            policy.exempt(id);
        }
        policy
    }

    /// Build from a raw bitmap as exchanged with the device
    pub fn from_bitmap(bits: [u8; POLICY_BITMAP_SIZE]) -> Self {
        Self { bits }
    }

    /// Raw bitmap as exchanged with the device
    pub fn bitmap(&self) -> [u8; POLICY_BITMAP_SIZE] {
        self.bits
    }

    /// Whether messages of type `id` must travel encrypted
    pub fn requires_encryption(&self, id: u8) -> bool {
        self.bits[(id / 8) as usize] & (1 << (id % 8)) != 0
    }

    /// Allow messages of type `id` to travel in the clear
    pub fn exempt(&mut self, id: u8) {
        self.bits[(id / 8) as usize] &= !(1 << (id % 8));
    }

    /// Require messages of type `id` to travel encrypted
    pub fn require(&mut self, id: u8) {
        self.bits[(id / 8) as usize] |= 1 << (id % 8);
    }

    /// Iterate over the identifiers allowed in the clear
    pub fn exempt_ids(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(move |id| !self.requires_encryption(*id))
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exempt: Vec<String> = self.exempt_ids().map(|id| format!("{:#04x}", id)).collect();
        f.debug_struct("CommandPolicy")
            .field("exempt", &exempt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = CommandPolicy::new();
        assert!(!policy.requires_encryption(0x27));
        assert!(!policy.requires_encryption(0x28));
        assert!(!policy.requires_encryption(0xE0));
        assert!(!policy.requires_encryption(0xE4));
        assert!(!policy.requires_encryption(0xE5));

        assert!(policy.requires_encryption(0x00));
        assert!(policy.requires_encryption(0x29));
        assert!(policy.requires_encryption(0x4A));
        assert!(policy.requires_encryption(0xFF));
        assert_eq!(policy.exempt_ids().count(), 5);
    }

    #[test]
    fn test_configure_carve_out() {
        let mut policy = CommandPolicy::new();
        policy.exempt(msg_id::SL_CONFIGURE_REQ);
        assert!(!policy.requires_encryption(0x29));
        assert_eq!(
            policy.exempt_ids().collect::<Vec<_>>(),
            vec![0x27, 0x28, 0x29, 0xE0, 0xE4, 0xE5]
        );

        policy.require(msg_id::SL_CONFIGURE_REQ);
        assert!(policy.requires_encryption(0x29));
        assert_eq!(policy, CommandPolicy::new());
    }

    #[test]
    fn test_bitmap_layout() {
        let bitmap = CommandPolicy::new().bitmap();
        // 0x27 and 0x28 live in byte 4 (bits 7) and byte 5 (bit 0)
        assert_eq!(bitmap[4], 0x7F);
        assert_eq!(bitmap[5], 0xFE);
        // 0xE0, 0xE4, 0xE5 live in byte 28
        assert_eq!(bitmap[28], 0b1100_1110);
        assert_eq!(CommandPolicy::from_bitmap(bitmap), CommandPolicy::new());
    }
}
