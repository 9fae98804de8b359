//! HTTP/3 fingerprint: `SETTINGS|PSEUDO_HEADER_ORDER`.
//!
//! Settings are `id:value` pairs separated by `;`. The bare `GREASE` token marks
//! where a reserved setting is sent.

use crate::error::FormatError;
use crate::fingerprint::http2::PseudoHeaderOrder;

pub const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x1;
pub const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x6;
pub const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x7;
pub const SETTINGS_ENABLE_CONNECT_PROTOCOL: u64 = 0x8;
pub const SETTINGS_H3_DATAGRAM: u64 = 0x33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http3Setting {
    Value { id: u64, value: u64 },
    Grease,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http3Fingerprint {
    pub settings: Vec<Http3Setting>,
    pub pseudo_header_order: PseudoHeaderOrder,
}

impl Http3Fingerprint {
    pub fn parse(fp: &str) -> Result<Self, FormatError> {
        let fields: Vec<&str> = fp.trim().split('|').collect();
        if fields.len() != 2 {
            return Err(FormatError::InvalidFormat(format!(
                "HTTP/3 fingerprint needs 2 fields, got {}",
                fields.len()
            )));
        }

        let mut settings = Vec::new();
        let field = fields[0].trim();
        if field != "0" {
            for token in field.split([';', ',']).map(str::trim).filter(|t| !t.is_empty()) {
                if token.eq_ignore_ascii_case("GREASE") {
                    settings.push(Http3Setting::Grease);
                    continue;
                }
                let (id, value) = token
                    .split_once(':')
                    .ok_or_else(|| FormatError::InvalidSettings(token.to_string()))?;
                let id = id
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| FormatError::InvalidSettings(token.to_string()))?;
                let value = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| FormatError::InvalidSettings(token.to_string()))?;
                settings.push(Http3Setting::Value { id, value });
            }
        }

        let pseudo = fields[1].trim();
        let pseudo_header_order = if pseudo == "0" {
            PseudoHeaderOrder::default()
        } else {
            PseudoHeaderOrder::parse(pseudo)?
        };

        Ok(Self {
            settings,
            pseudo_header_order,
        })
    }

    pub fn setting(&self, wanted: u64) -> Option<u64> {
        self.settings.iter().find_map(|s| match s {
            Http3Setting::Value { id, value } if *id == wanted => Some(*value),
            _ => None,
        })
    }

    pub fn has_grease(&self) -> bool {
        self.settings.contains(&Http3Setting::Grease)
    }

    /// Settings quiche has no dedicated knob for, forwarded verbatim.
    pub fn additional_settings(&self) -> Vec<(u64, u64)> {
        self.settings
            .iter()
            .filter_map(|s| match s {
                Http3Setting::Value { id, value }
                    if !matches!(
                        *id,
                        SETTINGS_QPACK_MAX_TABLE_CAPACITY
                            | SETTINGS_MAX_FIELD_SECTION_SIZE
                            | SETTINGS_QPACK_BLOCKED_STREAMS
                            | SETTINGS_ENABLE_CONNECT_PROTOCOL
                            | SETTINGS_H3_DATAGRAM
                    ) =>
                {
                    Some((*id, *value))
                }
                _ => None,
            })
            .collect()
    }
}
