//! G.711 companding (ITU-T μ-law and A-law)
//!
//! Telephony PBXes negotiate PCMA (A-law) or PCMU (μ-law) at 8 kHz. The
//! broadcast audio is pre-transcoded to raw A-law by the external encoder,
//! so at runtime these routines mostly supply silence fill and test
//! fixtures, but the conversions are kept bit-exact against the ITU
//! reference tables for interoperability checks.

use bytes::{Bytes, BytesMut};

/// μ-law encoding of digital silence
pub const ULAW_SILENCE: u8 = 0xFF;

/// A-law encoding of digital silence
pub const ALAW_SILENCE: u8 = 0xD5;

// μ-law segment lookup, indexed by (biased magnitude >> 7)
static ULAW_SEGMENT_TABLE: [i16; 256] = [
    0, 0, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
];

// μ-law byte to linear PCM
static ULAW_DECODE_TABLE: [i16; 256] = [
    -32124, -31100, -30076, -29052, -28028, -27004, -25980, -24956,
    -23932, -22908, -21884, -20860, -19836, -18812, -17788, -16764,
    -15996, -15484, -14972, -14460, -13948, -13436, -12924, -12412,
    -11900, -11388, -10876, -10364, -9852, -9340, -8828, -8316,
    -7932, -7676, -7420, -7164, -6908, -6652, -6396, -6140,
    -5884, -5628, -5372, -5116, -4860, -4604, -4348, -4092,
    -3900, -3772, -3644, -3516, -3388, -3260, -3132, -3004,
    -2876, -2748, -2620, -2492, -2364, -2236, -2108, -1980,
    -1884, -1820, -1756, -1692, -1628, -1564, -1500, -1436,
    -1372, -1308, -1244, -1180, -1116, -1052, -988, -924,
    -876, -844, -812, -780, -748, -716, -684, -652,
    -620, -588, -556, -524, -492, -460, -428, -396,
    -372, -356, -340, -324, -308, -292, -276, -260,
    -244, -228, -212, -196, -180, -164, -148, -132,
    -120, -112, -104, -96, -88, -80, -72, -64,
    -56, -48, -40, -32, -24, -16, -8, 0,
    32124, 31100, 30076, 29052, 28028, 27004, 25980, 24956,
    23932, 22908, 21884, 20860, 19836, 18812, 17788, 16764,
    15996, 15484, 14972, 14460, 13948, 13436, 12924, 12412,
    11900, 11388, 10876, 10364, 9852, 9340, 8828, 8316,
    7932, 7676, 7420, 7164, 6908, 6652, 6396, 6140,
    5884, 5628, 5372, 5116, 4860, 4604, 4348, 4092,
    3900, 3772, 3644, 3516, 3388, 3260, 3132, 3004,
    2876, 2748, 2620, 2492, 2364, 2236, 2108, 1980,
    1884, 1820, 1756, 1692, 1628, 1564, 1500, 1436,
    1372, 1308, 1244, 1180, 1116, 1052, 988, 924,
    876, 844, 812, 780, 748, 716, 684, 652,
    620, 588, 556, 524, 492, 460, 428, 396,
    372, 356, 340, 324, 308, 292, 276, 260,
    244, 228, 212, 196, 180, 164, 148, 132,
    120, 112, 104, 96, 88, 80, 72, 64,
    56, 48, 40, 32, 24, 16, 8, 0,
];

// A-law segment lookup, indexed by (magnitude >> 8)
static ALAW_SEGMENT_TABLE: [i16; 128] = [
    1, 1, 2, 2, 3, 3, 3, 3,
    4, 4, 4, 4, 4, 4, 4, 4,
    5, 5, 5, 5, 5, 5, 5, 5,
    5, 5, 5, 5, 5, 5, 5, 5,
    6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6,
    7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7,
];

// A-law byte to linear PCM
static ALAW_DECODE_TABLE: [i16; 256] = [
    -5504, -5248, -6016, -5760, -4480, -4224, -4992, -4736,
    -7552, -7296, -8064, -7808, -6528, -6272, -7040, -6784,
    -2752, -2624, -3008, -2880, -2240, -2112, -2496, -2368,
    -3776, -3648, -4032, -3904, -3264, -3136, -3520, -3392,
    -22016, -20992, -24064, -23040, -17920, -16896, -19968, -18944,
    -30208, -29184, -32256, -31232, -26112, -25088, -28160, -27136,
    -11008, -10496, -12032, -11520, -8960, -8448, -9984, -9472,
    -15104, -14592, -16128, -15616, -13056, -12544, -14080, -13568,
    -344, -328, -376, -360, -280, -264, -312, -296,
    -472, -456, -504, -488, -408, -392, -440, -424,
    -88, -72, -120, -104, -24, -8, -56, -40,
    -216, -200, -248, -232, -152, -136, -184, -168,
    -1376, -1312, -1504, -1440, -1120, -1056, -1248, -1184,
    -1888, -1824, -2016, -1952, -1632, -1568, -1760, -1696,
    -688, -656, -752, -720, -560, -528, -624, -592,
    -944, -912, -1008, -976, -816, -784, -880, -848,
    5504, 5248, 6016, 5760, 4480, 4224, 4992, 4736,
    7552, 7296, 8064, 7808, 6528, 6272, 7040, 6784,
    2752, 2624, 3008, 2880, 2240, 2112, 2496, 2368,
    3776, 3648, 4032, 3904, 3264, 3136, 3520, 3392,
    22016, 20992, 24064, 23040, 17920, 16896, 19968, 18944,
    30208, 29184, 32256, 31232, 26112, 25088, 28160, 27136,
    11008, 10496, 12032, 11520, 8960, 8448, 9984, 9472,
    15104, 14592, 16128, 15616, 13056, 12544, 14080, 13568,
    344, 328, 376, 360, 280, 264, 312, 296,
    472, 456, 504, 488, 408, 392, 440, 424,
    88, 72, 120, 104, 24, 8, 56, 40,
    216, 200, 248, 232, 152, 136, 184, 168,
    1376, 1312, 1504, 1440, 1120, 1056, 1248, 1184,
    1888, 1824, 2016, 1952, 1632, 1568, 1760, 1696,
    688, 656, 752, 720, 560, 528, 624, 592,
    944, 912, 1008, 976, 816, 784, 880, 848,
];

/// Encode a 16-bit PCM sample to μ-law
pub fn encode_ulaw(sample: i16) -> u8 {
    // -32768 would overflow when negated
    let magnitude = if sample == i16::MIN { 32767u16 } else { sample.unsigned_abs() };

    // Bias, clamped to the 16-bit positive range
    let biased = if magnitude as u32 + 132 > 32767 {
        32767u16
    } else {
        magnitude + 132
    };

    let segment = ULAW_SEGMENT_TABLE[(biased >> 7) as usize] as u8;
    let mantissa = ((biased >> (segment as u16 + 3)) & 0x0F) as u8;

    // μ-law inverts all bits on the wire; negative samples keep the
    // high bit clear after inversion.
    let mask = if sample < 0 { 0x7Fu8 } else { 0xFFu8 };
    ((segment << 4) | mantissa) ^ mask
}

/// Decode a μ-law byte to 16-bit PCM
pub fn decode_ulaw(encoded: u8) -> i16 {
    ULAW_DECODE_TABLE[encoded as usize]
}

/// Encode a 16-bit PCM sample to A-law
pub fn encode_alaw(sample: i16) -> u8 {
    let magnitude = if sample == i16::MIN { 32767u16 } else { sample.unsigned_abs() };
    let magnitude = magnitude.min(32635);

    let value = if magnitude >= 256 {
        let segment = ALAW_SEGMENT_TABLE[((magnitude >> 8) & 0x7F) as usize] as u8;
        (segment << 4) | ((magnitude >> (segment as u16 + 3)) & 0x0F) as u8
    } else {
        // Segments 0 and 1 fall out of the plain shift
        (magnitude >> 4) as u8
    };

    // A-law inverts every other bit; the high bit marks positive
    let sign = if sample >= 0 { 0x80u8 } else { 0u8 };
    (value ^ 0x55) | sign
}

/// Decode an A-law byte to 16-bit PCM
pub fn decode_alaw(encoded: u8) -> i16 {
    ALAW_DECODE_TABLE[encoded as usize]
}

/// Encode a PCM frame to A-law bytes
pub fn encode_alaw_frame(samples: &[i16]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len());
    for &s in samples {
        out.extend_from_slice(&[encode_alaw(s)]);
    }
    out.freeze()
}

/// Decode an A-law frame to PCM samples
pub fn decode_alaw_frame(encoded: &[u8]) -> Vec<i16> {
    encoded.iter().map(|&b| decode_alaw(b)).collect()
}

/// A frame of A-law silence of the given length
pub fn alaw_silence_frame(len: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(len);
    out.resize(len, ALAW_SILENCE);
    out.freeze()
}
