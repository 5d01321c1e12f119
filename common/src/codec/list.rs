//! Codec settings, descriptors and the payload-type codec map.

use super::{
    Codec, G711Codec, L16Codec, OpusCodec, L16_MONO_PAYLOAD_TYPE, L16_RATE, L16_STEREO_PAYLOAD_TYPE,
    OPUS_DEFAULT_PAYLOAD_TYPE, PCMA_PAYLOAD_TYPE, PCMU_PAYLOAD_TYPE,
};
use anyhow::{Context, Result};
use std::collections::BTreeMap;

/// Payload type → lazily created codec.
///
/// A `None` entry is a known payload type whose codec has not been
/// instantiated yet; a missing key is an unknown payload type.
pub type CodecMap = BTreeMap<u8, Option<Box<dyn Codec>>>;

/// Opus stream parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusSettings {
    // ---
    pub payload_type: u8,
    pub rate: u32,
    pub channels: u16,
    pub ptime_ms: u32,
    pub bitrate: i32,
}

impl Default for OpusSettings {
    fn default() -> Self {
        // ---
        Self {
            payload_type: OPUS_DEFAULT_PAYLOAD_TYPE,
            rate: 48_000,
            channels: 2,
            ptime_ms: 20,
            bitrate: 48_000,
        }
    }
}

/// Which codecs a stream may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSettings {
    // ---
    /// Packetization time for PCMU/PCMA
    pub g711_ptime_ms: u32,

    /// Offer the static L16 payload types
    pub enable_l16: bool,

    /// Opus variants, one per dynamic payload type
    pub opus: Vec<OpusSettings>,
}

impl Default for CodecSettings {
    fn default() -> Self {
        // ---
        Self {
            g711_ptime_ms: 20,
            enable_l16: true,
            opus: vec![OpusSettings::default()],
        }
    }
}

/// Codec family and its construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecKind {
    Pcmu { ptime_ms: u32 },
    Pcma { ptime_ms: u32 },
    L16 { channels: u16 },
    Opus(OpusSettings),
}

/// A codec the engine knows how to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDescriptor {
    // ---
    pub payload_type: u8,
    pub kind: CodecKind,
}

impl CodecDescriptor {
    // ---
    /// Codec name as reported by [`Codec::name`].
    pub fn name(&self) -> &'static str {
        // ---
        match self.kind {
            CodecKind::Pcmu { .. } => "PCMU",
            CodecKind::Pcma { .. } => "PCMA",
            CodecKind::L16 { .. } => "L16",
            CodecKind::Opus(_) => "OPUS",
        }
    }

    /// Native sample rate without instantiating the codec.
    pub fn sample_rate(&self) -> u32 {
        // ---
        match &self.kind {
            CodecKind::Pcmu { .. } | CodecKind::Pcma { .. } => 8000,
            CodecKind::L16 { .. } => L16_RATE,
            CodecKind::Opus(opus) => opus.rate,
        }
    }

    /// Builds a fresh codec instance.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying codec cannot be initialized.
    pub fn create(&self) -> Result<Box<dyn Codec>> {
        // ---
        let codec: Box<dyn Codec> = match &self.kind {
            CodecKind::Pcmu { ptime_ms } => Box::new(G711Codec::pcmu(*ptime_ms)?),
            CodecKind::Pcma { ptime_ms } => Box::new(G711Codec::pcma(*ptime_ms)?),
            CodecKind::L16 { channels } => Box::new(L16Codec::new(*channels)?),
            CodecKind::Opus(opus) => Box::new(OpusCodec::new(
                opus.rate,
                opus.channels,
                opus.ptime_ms,
                opus.bitrate,
            )?),
        };
        Ok(codec)
    }
}

/// The set of codecs available to a stream.
#[derive(Debug, Clone)]
pub struct CodecList {
    // ---
    descriptors: Vec<CodecDescriptor>,
}

impl CodecList {
    // ---
    pub fn new(settings: &CodecSettings) -> Self {
        // ---
        let mut descriptors = vec![
            CodecDescriptor {
                payload_type: PCMU_PAYLOAD_TYPE,
                kind: CodecKind::Pcmu {
                    ptime_ms: settings.g711_ptime_ms,
                },
            },
            CodecDescriptor {
                payload_type: PCMA_PAYLOAD_TYPE,
                kind: CodecKind::Pcma {
                    ptime_ms: settings.g711_ptime_ms,
                },
            },
        ];

        if settings.enable_l16 {
            descriptors.push(CodecDescriptor {
                payload_type: L16_STEREO_PAYLOAD_TYPE,
                kind: CodecKind::L16 { channels: 2 },
            });
            descriptors.push(CodecDescriptor {
                payload_type: L16_MONO_PAYLOAD_TYPE,
                kind: CodecKind::L16 { channels: 1 },
            });
        }

        descriptors.extend(settings.opus.iter().map(|opus| CodecDescriptor {
            payload_type: opus.payload_type,
            kind: CodecKind::Opus(opus.clone()),
        }));

        Self { descriptors }
    }

    pub fn descriptors(&self) -> &[CodecDescriptor] {
        // ---
        &self.descriptors
    }

    /// Looks up a codec by payload type.
    pub fn find(&self, payload_type: u8) -> Option<&CodecDescriptor> {
        // ---
        self.descriptors
            .iter()
            .find(|d| d.payload_type == payload_type)
    }

    /// Looks up a codec by (case-insensitive) name.
    pub fn find_codec(&self, name: &str) -> Option<&CodecDescriptor> {
        // ---
        self.descriptors
            .iter()
            .find(|d| d.name().eq_ignore_ascii_case(name))
    }

    /// Builds a codec map with every known payload type uninstantiated.
    pub fn fill_codec_map(&self) -> CodecMap {
        // ---
        self.descriptors
            .iter()
            .map(|d| (d.payload_type, None))
            .collect()
    }

    /// Creates the codec for `payload_type`.
    ///
    /// # Errors
    ///
    /// Returns error if the payload type is unknown or construction fails.
    pub fn create(&self, payload_type: u8) -> Result<Box<dyn Codec>> {
        // ---
        self.find(payload_type)
            .with_context(|| format!("unknown payload type {}", payload_type))?
            .create()
            .with_context(|| format!("failed to create codec for payload type {}", payload_type))
    }
}

impl Default for CodecList {
    fn default() -> Self {
        // ---
        Self::new(&CodecSettings::default())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_default_list() {
        // ---
        let list = CodecList::default();
        let types: Vec<u8> = list.descriptors().iter().map(|d| d.payload_type).collect();

        assert_eq!(types, vec![0, 8, 10, 11, 106]);
    }

    #[test]
    fn test_codec_map_entries_start_empty() {
        // ---
        let map = CodecList::default().fill_codec_map();

        assert_eq!(map.len(), 5);
        assert!(map.values().all(|c| c.is_none()));
        assert!(!map.contains_key(&96));
    }

    #[test]
    fn test_find_codec_by_name() {
        // ---
        let list = CodecList::default();

        assert_eq!(list.find_codec("pcma").map(|d| d.payload_type), Some(8));
        assert_eq!(list.find_codec("OPUS").map(|d| d.sample_rate()), Some(48_000));
        assert!(list.find_codec("g729").is_none());
    }

    #[test]
    fn test_create_unknown_payload_type() {
        // ---
        let list = CodecList::default();

        assert!(list.create(99).is_err());
        let codec = list.create(0).expect("PCMU");
        assert_eq!(codec.name(), "PCMU");
    }

    #[test]
    fn test_without_l16() {
        // ---
        let settings = CodecSettings {
            enable_l16: false,
            opus: Vec::new(),
            ..Default::default()
        };
        let list = CodecList::new(&settings);

        assert_eq!(list.descriptors().len(), 2);
        assert!(list.find(11).is_none());
    }
}
