//! Payload transform plug-point.
//!
//! The reactor applies exactly one pure byte-to-byte function to every
//! inbound chunk before fan-out. Swapping the transform never touches the
//! connection manager.

/// A pure function applied to each inbound chunk before broadcast.
pub type Transform = fn(&[u8]) -> Vec<u8>;

/// Reference transform: uppercase ASCII letters, leave everything else as-is.
pub fn uppercase(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b.to_ascii_uppercase()).collect()
}

/// Identity transform, useful for a plain relay.
#[allow(dead_code)]
pub fn identity(input: &[u8]) -> Vec<u8> {
    input.to_vec()
}
