//! HTTP/2 fingerprint (Akamai format).
//!
//! `SETTINGS|WINDOW_UPDATE|PRIORITY|PSEUDO_HEADER_ORDER`, for example Chrome's
//! `1:65536;2:0;4:6291456;6:262144|15663105|0|m,a,s,p`.

use crate::error::FormatError;
use crate::fingerprint::profiles::{self, Browser};

/// Priority fields carried by a HEADERS or PRIORITY frame.
///
/// `weight` is the wire value (actual weight minus one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityData {
    pub exclusive: bool,
    pub stream_dependency: u32,
    pub weight: u8,
}

/// One PRIORITY frame sent right after the connection preface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPriority {
    pub stream_id: u32,
    pub priority: PriorityData,
}

/// The four request pseudo-headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PseudoHeader {
    Method,
    Scheme,
    Authority,
    Path,
}

impl PseudoHeader {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Method => ":method",
            Self::Scheme => ":scheme",
            Self::Authority => ":authority",
            Self::Path => ":path",
        }
    }

    fn letter(&self) -> char {
        match self {
            Self::Method => 'm',
            Self::Scheme => 's',
            Self::Authority => 'a',
            Self::Path => 'p',
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "m" => Some(Self::Method),
            "s" => Some(Self::Scheme),
            "a" => Some(Self::Authority),
            "p" => Some(Self::Path),
            _ => None,
        }
    }
}

/// Permutation of the four pseudo-headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoHeaderOrder(pub [PseudoHeader; 4]);

impl Default for PseudoHeaderOrder {
    fn default() -> Self {
        use PseudoHeader::*;
        Self([Method, Authority, Scheme, Path])
    }
}

impl PseudoHeaderOrder {
    /// Parse `m,a,s,p` style orders. `"0"` is handled by the callers.
    pub fn parse(field: &str) -> Result<Self, FormatError> {
        let tokens: Vec<&str> = field.split(',').map(str::trim).collect();
        if tokens.len() != 4 {
            return Err(FormatError::InvalidPseudoHeader(field.to_string()));
        }
        let mut order = [PseudoHeader::Method; 4];
        for (slot, token) in order.iter_mut().zip(&tokens) {
            *slot = PseudoHeader::from_token(token)
                .ok_or_else(|| FormatError::InvalidPseudoHeader(field.to_string()))?;
        }
        for i in 0..4 {
            if order[i + 1..].contains(&order[i]) {
                return Err(FormatError::InvalidPseudoHeader(field.to_string()));
            }
        }
        Ok(Self(order))
    }

    pub fn iter(&self) -> impl Iterator<Item = PseudoHeader> + '_ {
        self.0.iter().copied()
    }

    pub fn to_akamai(&self) -> String {
        self.0
            .iter()
            .map(|p| p.letter().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Complete HTTP/2 connection fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Fingerprint {
    /// SETTINGS entries in send order.
    pub settings: Vec<(u16, u32)>,
    /// Connection-level WINDOW_UPDATE increment; 0 sends no frame.
    pub connection_window_increment: u32,
    /// PRIORITY frames sent after the preface.
    pub priorities: Vec<StreamPriority>,
    pub pseudo_header_order: PseudoHeaderOrder,
    /// Priority block attached to every request HEADERS frame.
    pub header_priority: Option<PriorityData>,
}

impl Http2Fingerprint {
    /// Parse an Akamai fingerprint. `"0"` in a field selects the empty value,
    /// or the browser's default pseudo-header order.
    pub fn parse(fp: &str, browser: Browser) -> Result<Self, FormatError> {
        let fields: Vec<&str> = fp.trim().split('|').collect();
        if fields.len() != 4 {
            return Err(FormatError::InvalidFormat(format!(
                "HTTP/2 fingerprint needs 4 fields, got {}",
                fields.len()
            )));
        }

        let settings = parse_settings(fields[0].trim())?;

        let window = fields[1].trim();
        let connection_window_increment = window
            .parse::<u32>()
            .map_err(|_| FormatError::InvalidSettings(format!("window update `{}`", window)))?;
        if connection_window_increment > 0x7fff_ffff {
            return Err(FormatError::InvalidSettings(format!(
                "window update `{}` exceeds 2^31-1",
                window
            )));
        }

        let priorities = parse_priorities(fields[2].trim())?;

        let pseudo = fields[3].trim();
        let pseudo_header_order = if pseudo == "0" {
            profiles::pseudo_header_order(browser)
        } else {
            PseudoHeaderOrder::parse(pseudo)?
        };

        Ok(Self {
            settings,
            connection_window_increment,
            priorities,
            pseudo_header_order,
            header_priority: profiles::header_priority(browser),
        })
    }

    /// Value of a SETTINGS entry, if present.
    pub fn setting(&self, id: u16) -> Option<u32> {
        self.settings
            .iter()
            .find(|(setting, _)| *setting == id)
            .map(|(_, value)| *value)
    }

    /// Serialize back to the Akamai text form.
    pub fn akamai_string(&self) -> String {
        let settings = if self.settings.is_empty() {
            "0".to_string()
        } else {
            self.settings
                .iter()
                .map(|(id, value)| format!("{}:{}", id, value))
                .collect::<Vec<_>>()
                .join(";")
        };
        let priorities = if self.priorities.is_empty() {
            "0".to_string()
        } else {
            self.priorities
                .iter()
                .map(|p| {
                    format!(
                        "{}:{}:{}:{}",
                        p.stream_id,
                        u8::from(p.priority.exclusive),
                        p.priority.stream_dependency,
                        u16::from(p.priority.weight) + 1
                    )
                })
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            "{}|{}|{}|{}",
            settings,
            self.connection_window_increment,
            priorities,
            self.pseudo_header_order.to_akamai()
        )
    }
}

fn parse_settings(field: &str) -> Result<Vec<(u16, u32)>, FormatError> {
    if field == "0" {
        return Ok(Vec::new());
    }
    field
        .split([',', ';'])
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (id, value) = pair
                .split_once(':')
                .ok_or_else(|| FormatError::InvalidSettings(pair.to_string()))?;
            let id = id
                .trim()
                .parse::<u16>()
                .map_err(|_| FormatError::InvalidSettings(pair.to_string()))?;
            let value = value
                .trim()
                .parse::<u32>()
                .map_err(|_| FormatError::InvalidSettings(pair.to_string()))?;
            Ok((id, value))
        })
        .collect()
}

fn parse_priorities(field: &str) -> Result<Vec<StreamPriority>, FormatError> {
    if field == "0" {
        return Ok(Vec::new());
    }
    field
        .split(',')
        .map(str::trim)
        .map(|entry| {
            let invalid = || FormatError::InvalidSettings(format!("priority `{}`", entry));
            let parts: Vec<&str> = entry.split(':').collect();
            if parts.len() != 4 {
                return Err(invalid());
            }
            let stream_id = parts[0].parse::<u32>().map_err(|_| invalid())?;
            let exclusive = match parts[1] {
                "0" => false,
                "1" => true,
                _ => return Err(invalid()),
            };
            let stream_dependency = parts[2].parse::<u32>().map_err(|_| invalid())?;
            let weight = parts[3].parse::<u16>().map_err(|_| invalid())?;
            // stream ids are 31 bits; a stream cannot depend on itself
            if !(1..=256).contains(&weight)
                || stream_id == 0
                || stream_id > 0x7fff_ffff
                || stream_dependency > 0x7fff_ffff
                || stream_dependency == stream_id
            {
                return Err(invalid());
            }
            Ok(StreamPriority {
                stream_id,
                priority: PriorityData {
                    exclusive,
                    stream_dependency,
                    weight: (weight - 1) as u8,
                },
            })
        })
        .collect()
}
