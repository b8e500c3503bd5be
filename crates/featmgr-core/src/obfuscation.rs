//! Feature-id obfuscation used for persisted key names.
//!
//! The transform is fixed by the OS: the boot store names each feature's
//! entry after the obfuscated id, so any deviation here silently breaks the
//! link between the live and persisted views of a feature.

const KEY_1: u32 = 0x7416_1A4E;
const KEY_2: u32 = 0x8FB2_3D4F;
const KEY_3: u32 = 0x833E_A8FF;

/// Obfuscate a feature id into the value the OS uses as its key name.
///
/// XOR, full byte swap, XOR, one-bit rotation, XOR. The reference encoder
/// rotates right by -1, which is a left rotation by one bit.
#[must_use]
pub fn obfuscate_feature_id(feature_id: u32) -> u32 {
    ((feature_id ^ KEY_1).swap_bytes() ^ KEY_2).rotate_left(1) ^ KEY_3
}

#[must_use]
pub fn deobfuscate_feature_id(obfuscated: u32) -> u32 {
    ((obfuscated ^ KEY_3).rotate_right(1) ^ KEY_2).swap_bytes() ^ KEY_1
}

/// Decimal key name for a feature id, as written into the persisted store.
#[must_use]
pub fn obfuscated_key_name(feature_id: u32) -> String {
    obfuscate_feature_id(feature_id).to_string()
}
