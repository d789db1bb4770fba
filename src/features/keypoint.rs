//! Keypoint and binary descriptor types shared by every extractor variant.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bytes in a 256-bit descriptor.
pub const DESCRIPTOR_BYTES: usize = 32;

/// A detected image feature.
///
/// Coordinates are expressed at pyramid level 0 (full resolution) and are
/// undistorted once the owning [`Frame`](crate::tracking::Frame) is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid level the keypoint was detected at.
    pub octave: usize,
    /// Orientation in degrees, `[0, 360)`. Zero for unrotated descriptors.
    pub angle: f32,
    pub response: f32,
    /// Patch diameter at level 0.
    pub size: f32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32, octave: usize) -> Self {
        Self {
            x,
            y,
            octave,
            angle: 0.0,
            response: 0.0,
            size: 31.0,
        }
    }
}

/// 256-bit binary descriptor (rBRIEF / BRIEF).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub fn zeros() -> Self {
        Self([0; DESCRIPTOR_BYTES])
    }

    /// Hamming distance in bits, `0..=256`.
    #[inline]
    pub fn distance(&self, other: &Descriptor) -> u32 {
        let mut dist = 0;
        for (a, b) in self.0.chunks_exact(8).zip(other.0.chunks_exact(8)) {
            let mut wa = [0u8; 8];
            let mut wb = [0u8; 8];
            wa.copy_from_slice(a);
            wb.copy_from_slice(b);
            dist += (u64::from_le_bytes(wa) ^ u64::from_le_bytes(wb)).count_ones();
        }
        dist
    }

    #[inline]
    pub fn bit(&self, i: usize) -> bool {
        (self.0[i / 8] >> (i % 8)) & 1 == 1
    }

    #[inline]
    pub fn set_bit(&mut self, i: usize) {
        self.0[i / 8] |= 1 << (i % 8);
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != DESCRIPTOR_BYTES * 2 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor({})", self.to_hex())
    }
}

impl Serialize for Descriptor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Descriptor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Descriptor::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid descriptor hex '{}'", s)))
    }
}
