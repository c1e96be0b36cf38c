//! C3D container reading
//!
//! Loads a binary C3D recording and extracts the ordered analog channels
//! plus a game/technical metadata bundle. Missing parameter sections yield
//! missing metadata keys, not errors; a malformed container returns a
//! structured decode error carrying whatever metadata was readable.

pub mod parser;
#[doc(hidden)]
pub mod test_support;

use crate::error::AnalyzerError;
use parser::{parse_analog_data, parse_header, parse_parameters, ParameterSection};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// Metadata bundle
// ============================================================================

/// Everything the game and the acquisition system wrote into the file.
/// Every field is optional: sections absent from the file stay `None` and
/// are omitted from the serialized map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct C3dMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub therapist_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker_set: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gen_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type_labels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl C3dMetadata {
    /// Serialize to a JSON map with absent keys omitted.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Short summary used in log lines.
    pub fn technical_summary(&self) -> String {
        format!(
            "{} channels, {:.1}s @ {}Hz",
            self.channel_count.unwrap_or(0),
            self.duration_seconds.unwrap_or(0.0),
            self.sampling_rate.unwrap_or(0.0)
        )
    }
}

/// One extracted analog channel with its label.
#[derive(Debug, Clone)]
pub struct AnalogChannel {
    pub name: String,
    pub samples: Vec<f64>,
}

/// Decoded recording: metadata plus ordered analog channels.
#[derive(Debug, Clone)]
pub struct C3dFile {
    pub metadata: C3dMetadata,
    pub channels: Vec<AnalogChannel>,
}

// ============================================================================
// Reading
// ============================================================================

/// Decode a C3D file from raw bytes.
pub fn read_c3d(data: &[u8]) -> Result<C3dFile, AnalyzerError> {
    let header = parse_header(data).map_err(|message| AnalyzerError::C3dDecode {
        message,
        metadata: serde_json::json!({}),
    })?;

    let params = parse_parameters(data, &header).map_err(|message| AnalyzerError::C3dDecode {
        message,
        metadata: serde_json::json!({}),
    })?;

    let metadata = extract_metadata(&header, &params);

    let raw_channels =
        parse_analog_data(data, &header, &params).map_err(|message| AnalyzerError::C3dDecode {
            message,
            // The parameter section was readable; keep it for the caller.
            metadata: metadata.to_json(),
        })?;

    let names = metadata.channel_names.clone().unwrap_or_default();
    let channels = raw_channels
        .into_iter()
        .enumerate()
        .map(|(i, samples)| AnalogChannel {
            name: names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("CH{}", i + 1)),
            samples,
        })
        .collect();

    debug!("decoded C3D: {}", metadata.technical_summary());
    Ok(C3dFile { metadata, channels })
}

/// Map the parameter groups onto the standardized metadata fields.
fn extract_metadata(header: &parser::Header, params: &ParameterSection) -> C3dMetadata {
    let mut md = C3dMetadata::default();

    let info_string = |name: &str| {
        params
            .get("INFO", name)
            .and_then(|p| p.first_string())
            .filter(|s| !s.is_empty())
    };
    md.game_name = info_string("GAME_NAME");
    md.level = info_string("GAME_LEVEL");
    md.level_name = info_string("LEVEL_NAME");
    md.game_version = info_string("GAME_VERSION").or_else(|| info_string("VERSION"));
    md.duration = info_string("DURATION");
    md.therapist_id = info_string("THERAPIST_ID");
    md.group_id = info_string("GROUP_ID");
    md.time = info_string("TIME");
    md.game_score = params.get("INFO", "GAME_SCORE").and_then(|p| p.first_f64());

    md.player_name = params
        .get("SUBJECTS", "NAMES")
        .and_then(|p| p.first_string())
        .filter(|s| !s.is_empty());
    md.marker_set = params
        .get("SUBJECTS", "MARKER_SETS")
        .and_then(|p| p.first_string())
        .filter(|s| !s.is_empty());

    md.sampling_rate = params.get("ANALOG", "RATE").and_then(|p| p.first_f64());
    if let Some(labels) = params.get("ANALOG", "LABELS") {
        let names: Vec<String> = labels
            .strings()
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .collect();
        if !names.is_empty() {
            md.channel_count = Some(names.len());
            md.channel_names = Some(names);
        }
    }
    if md.channel_count.is_none() {
        let count = parser::analog_channel_count(header, params);
        if count > 0 {
            md.channel_count = Some(count);
        }
    }
    md.gen_scale = params.get("ANALOG", "GEN_SCALE").and_then(|p| p.first_f64());

    md.frame_count = params
        .get("POINT", "FRAMES")
        .and_then(|p| p.first_f64())
        .map(|f| f as u32)
        .or(Some(header.frame_count()));
    md.point_rate = params
        .get("POINT", "RATE")
        .and_then(|p| p.first_f64())
        .or(Some(header.point_rate as f64));
    if let Some(labels) = params.get("POINT", "DATA_TYPE_LABELS") {
        let names = labels.strings();
        if !names.is_empty() {
            md.data_type_labels = Some(names);
        }
    }

    if let (Some(frames), Some(rate)) = (md.frame_count, md.sampling_rate) {
        if rate > 0.0 {
            md.duration_seconds = Some(frames as f64 / rate);
        }
    }

    md
}
