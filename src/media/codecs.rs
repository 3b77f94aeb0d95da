use serde::{Deserialize, Serialize};

// A-law to 16-bit linear PCM
static ALAW_DECODE_TABLE: [i16; 256] = [
    -5504, -5248, -6016, -5760, -4480, -4224, -4992, -4736, -7552, -7296, -8064, -7808, -6528,
    -6272, -7040, -6784, -2752, -2624, -3008, -2880, -2240, -2112, -2496, -2368, -3776, -3648,
    -4032, -3904, -3264, -3136, -3520, -3392, -22016, -20992, -24064, -23040, -17920, -16896,
    -19968, -18944, -30208, -29184, -32256, -31232, -26112, -25088, -28160, -27136, -11008, -10496,
    -12032, -11520, -8960, -8448, -9984, -9472, -15104, -14592, -16128, -15616, -13056, -12544,
    -14080, -13568, -344, -328, -376, -360, -280, -264, -312, -296, -472, -456, -504, -488, -408,
    -392, -440, -424, -88, -72, -120, -104, -24, -8, -56, -40, -216, -200, -248, -232, -152, -136,
    -184, -168, -1376, -1312, -1504, -1440, -1120, -1056, -1248, -1184, -1888, -1824, -2016, -1952,
    -1632, -1568, -1760, -1696, -688, -656, -752, -720, -560, -528, -624, -592, -944, -912, -1008,
    -976, -816, -784, -880, -848, 5504, 5248, 6016, 5760, 4480, 4224, 4992, 4736, 7552, 7296, 8064,
    7808, 6528, 6272, 7040, 6784, 2752, 2624, 3008, 2880, 2240, 2112, 2496, 2368, 3776, 3648, 4032,
    3904, 3264, 3136, 3520, 3392, 22016, 20992, 24064, 23040, 17920, 16896, 19968, 18944, 30208,
    29184, 32256, 31232, 26112, 25088, 28160, 27136, 11008, 10496, 12032, 11520, 8960, 8448, 9984,
    9472, 15104, 14592, 16128, 15616, 13056, 12544, 14080, 13568, 344, 328, 376, 360, 280, 264,
    312, 296, 472, 456, 504, 488, 408, 392, 440, 424, 88, 72, 120, 104, 24, 8, 56, 40, 216, 200,
    248, 232, 152, 136, 184, 168, 1376, 1312, 1504, 1440, 1120, 1056, 1248, 1184, 1888, 1824, 2016,
    1952, 1632, 1568, 1760, 1696, 688, 656, 752, 720, 560, 528, 624, 592, 944, 912, 1008, 976, 816,
    784, 880, 848,
];

const ULAW_BIAS: i16 = 0x84;

/// Telephony codecs carried between the switch and the realtime backend.
/// Both are 8-bit, 8 kHz, so one byte is one sample.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
pub enum CodecType {
    #[default]
    #[serde(alias = "ulaw", alias = "pcmu")]
    PCMU,
    #[serde(alias = "alaw", alias = "pcma")]
    PCMA,
}

impl CodecType {
    pub fn payload_type(&self) -> u8 {
        match self {
            CodecType::PCMU => 0,
            CodecType::PCMA => 8,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        8000
    }

    pub fn bytes_per_ms(&self) -> usize {
        (self.clock_rate() / 1000) as usize
    }

    /// Encoded value of a zero sample, used to pad a trailing partial frame.
    pub fn silence_byte(&self) -> u8 {
        match self {
            CodecType::PCMU => 0xFF,
            CodecType::PCMA => 0xD5,
        }
    }

    /// Format name understood by the switch's external media channel.
    pub fn switch_format(&self) -> &'static str {
        match self {
            CodecType::PCMU => "ulaw",
            CodecType::PCMA => "alaw",
        }
    }

    /// Audio format name understood by the realtime backend.
    pub fn realtime_format(&self) -> &'static str {
        match self {
            CodecType::PCMU => "g711_ulaw",
            CodecType::PCMA => "g711_alaw",
        }
    }

    pub fn decode_sample(&self, byte: u8) -> i16 {
        match self {
            CodecType::PCMU => decode_mu_law(byte),
            CodecType::PCMA => ALAW_DECODE_TABLE[byte as usize],
        }
    }

    /// Mean absolute amplitude of an encoded buffer.
    pub fn mean_amplitude(&self, payload: &[u8]) -> u32 {
        if payload.is_empty() {
            return 0;
        }
        let sum: u64 = payload
            .iter()
            .map(|b| self.decode_sample(*b).unsigned_abs() as u64)
            .sum();
        (sum / payload.len() as u64) as u32
    }
}

fn decode_mu_law(mu_law_sample: u8) -> i16 {
    let u = !mu_law_sample;
    let t = (((u & 0x0F) as i16) << 3) + ULAW_BIAS;
    let t = t << ((u & 0x70) >> 4);
    if u & 0x80 != 0 {
        ULAW_BIAS - t
    } else {
        t - ULAW_BIAS
    }
}
