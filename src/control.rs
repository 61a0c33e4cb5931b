//! In-band control frames.
//!
//! A terminal socket carries raw payload and, interleaved with it, JSON control
//! objects. A message is a control frame only if it deserializes into one of the
//! recognized shapes below; everything else is payload and must reach the
//! process untouched.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Resize { cols: u16, rows: u16 },
}

impl ControlFrame {
    pub fn resize(cols: u16, rows: u16) -> Self {
        ControlFrame::Resize { cols, rows }
    }

    pub fn to_json(&self) -> String {
        match self {
            ControlFrame::Resize { cols, rows } => {
                format!("{{\"type\":\"resize\",\"cols\":{cols},\"rows\":{rows}}}")
            }
        }
    }
}

/// Classify one inbound socket message.
///
/// Only messages whose first non-whitespace byte is `{` are tried as JSON;
/// `cols`/`rows` must be non-negative integers that fit a terminal dimension.
pub fn parse_control_frame(payload: &[u8]) -> Option<ControlFrame> {
    let first = payload.iter().find(|byte| !byte.is_ascii_whitespace())?;
    if *first != b'{' {
        return None;
    }
    serde_json::from_slice::<ControlFrame>(payload).ok()
}
