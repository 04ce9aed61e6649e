//! Line-oriented text protocol for the observer wire and the recording log
//!
//! Observers send plain control frames (`JOIN:<name>`, `INPUT:<vx>,<vy>`), the
//! server pushes one JSON object per line. Recordings reuse the same record
//! family with three extra kinds: `header`, `input` and `keyframe`.

use crate::{Color, EntityView, Shape, SimulationState, Snapshot, RECORDING_VERSION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const JOIN_PREFIX: &str = "JOIN:";
pub const INPUT_PREFIX: &str = "INPUT:";
pub const JOIN_ACK: &str = "JOIN-ACK";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected a {expected} record, found '{found}'")]
    UnexpectedRecord {
        expected: &'static str,
        found: &'static str,
    },
}

/// Control frames an observer may send to the server
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Join { name: String },
    Input { vx: f32, vy: f32 },
}

impl ControlFrame {
    /// Scans one line of observer text for control frames.
    ///
    /// A line may carry both a join and an input frame. Anything that fails to
    /// parse is skipped, a malformed frame never produces an error.
    pub fn scan(line: &str) -> Vec<ControlFrame> {
        let mut frames = Vec::new();

        if let Some(idx) = line.find(JOIN_PREFIX) {
            let rest = &line[idx + JOIN_PREFIX.len()..];
            let rest = match rest.find(INPUT_PREFIX) {
                Some(end) => &rest[..end],
                None => rest,
            };
            frames.push(ControlFrame::Join {
                name: rest.trim().to_string(),
            });
        }

        if let Some(idx) = line.find(INPUT_PREFIX) {
            if let Some((vx, vy)) = parse_velocity(&line[idx + INPUT_PREFIX.len()..]) {
                frames.push(ControlFrame::Input { vx, vy });
            }
        }

        frames
    }

    /// Encodes the frame as a newline-terminated line
    pub fn to_line(&self) -> String {
        match self {
            ControlFrame::Join { name } => format!("{}{}\n", JOIN_PREFIX, name),
            ControlFrame::Input { vx, vy } => format!("{}{},{}\n", INPUT_PREFIX, vx, vy),
        }
    }
}

fn parse_velocity(payload: &str) -> Option<(f32, f32)> {
    let payload = payload.lines().next()?;
    let mut parts = payload.split(',');
    let vx = parts.next()?.trim().parse::<f32>().ok()?;
    // Trailing data after the second value is ignored
    let vy = parts
        .next()?
        .split_whitespace()
        .next()?
        .parse::<f32>()
        .ok()?;
    if vx.is_finite() && vy.is_finite() {
        Some((vx, vy))
    } else {
        None
    }
}

/// Entity as sent on the live wire: position and color only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntity {
    pub id: String,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub color: Color,
}

/// Entity as written to a recording: position plus full render attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEntity {
    pub id: String,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub rt: Shape,
    #[serde(default)]
    pub w: f32,
    #[serde(default)]
    pub h: f32,
    #[serde(default)]
    pub color: Color,
}

/// Every JSON object that appears on the wire or in a recording log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Record {
    /// Live broadcast keyframe
    #[serde(rename = "kf")]
    Broadcast {
        t: f64,
        #[serde(default)]
        state: SimulationState,
        entities: Vec<WireEntity>,
    },
    #[serde(rename = "header")]
    Header { version: u32, w: u32, h: u32 },
    #[serde(rename = "input")]
    Input { t: f64, keys: Vec<i32> },
    /// Recorded keyframe
    #[serde(rename = "keyframe")]
    Keyframe {
        t: f64,
        entities: Vec<RecordedEntity>,
    },
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Broadcast { .. } => "kf",
            Record::Header { .. } => "header",
            Record::Input { .. } => "input",
            Record::Keyframe { .. } => "keyframe",
        }
    }

    pub fn header(width: u32, height: u32) -> Self {
        Record::Header {
            version: RECORDING_VERSION,
            w: width,
            h: height,
        }
    }

    pub fn input(t: f64, keys: &[i32], decimals: u32) -> Self {
        Record::Input {
            t: quantize(t, decimals),
            keys: keys.to_vec(),
        }
    }

    /// Live broadcast record for a snapshot, values written unrounded
    pub fn broadcast(snapshot: &Snapshot) -> Self {
        Record::Broadcast {
            t: snapshot.timestamp,
            state: snapshot.state,
            entities: snapshot
                .entities
                .iter()
                .map(|e| WireEntity {
                    id: e.id.clone(),
                    x: e.x,
                    y: e.y,
                    color: e.color,
                })
                .collect(),
        }
    }

    /// Recording keyframe with every number rounded to `decimals` places
    pub fn keyframe(t: f64, entities: &[EntityView], decimals: u32) -> Self {
        let q = |v: f32| quantize_f32(v, decimals);
        Record::Keyframe {
            t: quantize(t, decimals),
            entities: entities
                .iter()
                .map(|e| RecordedEntity {
                    id: e.id.clone(),
                    x: q(e.x),
                    y: q(e.y),
                    rt: e.shape,
                    w: q(e.width),
                    h: q(e.height),
                    color: Color::new(q(e.color.r), q(e.color.g), q(e.color.b), q(e.color.a)),
                })
                .collect(),
        }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Converts a broadcast or keyframe record into a snapshot
    pub fn into_snapshot(self) -> Result<Snapshot, ProtocolError> {
        match self {
            Record::Broadcast { t, state, entities } => Ok(Snapshot::new(
                t,
                state,
                entities
                    .into_iter()
                    .map(|e| EntityView::new(e.id, e.x, e.y).with_color(e.color))
                    .collect(),
            )),
            Record::Keyframe { t, entities } => Ok(Snapshot::new(
                t,
                SimulationState::Playing,
                entities
                    .into_iter()
                    .map(|e| {
                        EntityView::new(e.id, e.x, e.y)
                            .with_color(e.color)
                            .with_shape(e.rt, e.w, e.h)
                    })
                    .collect(),
            )),
            other => Err(ProtocolError::UnexpectedRecord {
                expected: "kf or keyframe",
                found: other.kind(),
            }),
        }
    }
}

/// Serializes a snapshot into a broadcast line (without trailing newline)
pub fn encode_broadcast(snapshot: &Snapshot) -> Result<String, ProtocolError> {
    Record::broadcast(snapshot).to_line()
}

/// Parses a broadcast line received from the server
pub fn decode_broadcast(line: &str) -> Result<Snapshot, ProtocolError> {
    match Record::parse(line)? {
        record @ Record::Broadcast { .. } => record.into_snapshot(),
        other => Err(ProtocolError::UnexpectedRecord {
            expected: "kf",
            found: other.kind(),
        }),
    }
}

/// Rounds `value` to `decimals` decimal places
pub fn quantize(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals.min(15) as i32);
    (value * scale).round() / scale
}

pub fn quantize_f32(value: f32, decimals: u32) -> f32 {
    quantize(value as f64, decimals) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn sample_snapshot() -> Snapshot {
        Snapshot::new(
            12.5,
            SimulationState::Victory,
            vec![
                EntityView::new("Hero#1", 100.123, 200.987)
                    .with_color(Color::new(1.0, 0.5, 0.0, 1.0))
                    .with_shape(Shape::Circle, 30.0, 30.0),
                EntityView::new("Imp#7", 5.0, 6.0),
            ],
        )
    }

    #[test]
    fn test_scan_join() {
        let frames = ControlFrame::scan("JOIN:Client_42");
        assert_eq!(
            frames,
            vec![ControlFrame::Join {
                name: "Client_42".to_string()
            }]
        );
    }

    #[test]
    fn test_scan_input_with_trailing_data() {
        let frames = ControlFrame::scan("INPUT:1.5,-2.25,ignored extra");
        assert_eq!(frames, vec![ControlFrame::Input { vx: 1.5, vy: -2.25 }]);

        let frames = ControlFrame::scan("INPUT: 3 , 4 trailing");
        assert_eq!(frames, vec![ControlFrame::Input { vx: 3.0, vy: 4.0 }]);
    }

    #[test]
    fn test_scan_malformed_input_is_ignored() {
        assert!(ControlFrame::scan("INPUT:abc,1").is_empty());
        assert!(ControlFrame::scan("INPUT:1").is_empty());
        assert!(ControlFrame::scan("INPUT:").is_empty());
        assert!(ControlFrame::scan("INPUT:NaN,1").is_empty());
        assert!(ControlFrame::scan("hello world").is_empty());
    }

    #[test]
    fn test_scan_join_and_input_on_one_line() {
        let frames = ControlFrame::scan("JOIN:bob INPUT:1,2");
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0],
            ControlFrame::Join {
                name: "bob".to_string()
            }
        );
        assert_eq!(frames[1], ControlFrame::Input { vx: 1.0, vy: 2.0 });
    }

    #[test]
    fn test_control_frame_lines() {
        let join = ControlFrame::Join {
            name: "alice".to_string(),
        };
        assert_eq!(join.to_line(), "JOIN:alice\n");
        let input = ControlFrame::Input { vx: 0.5, vy: -1.0 };
        assert_eq!(input.to_line(), "INPUT:0.5,-1\n");
        assert_eq!(ControlFrame::scan(input.to_line().trim()), vec![input]);
    }

    #[test]
    fn test_broadcast_layout() {
        let snapshot = Snapshot::new(
            1.5,
            SimulationState::Playing,
            vec![EntityView::new("A", 1.0, 2.0)],
        );
        let line = encode_broadcast(&snapshot).unwrap();
        assert_eq!(
            line,
            r#"{"type":"kf","t":1.5,"state":"PLAYING","entities":[{"id":"A","x":1.0,"y":2.0,"color":[1.0,1.0,1.0,1.0]}]}"#
        );
    }

    #[test]
    fn test_broadcast_round_trip() {
        let snapshot = sample_snapshot();
        let line = encode_broadcast(&snapshot).unwrap();
        let decoded = decode_broadcast(&line).unwrap();

        assert_eq!(decoded.timestamp, 12.5);
        assert_eq!(decoded.state, SimulationState::Victory);
        assert_eq!(decoded.entities.len(), 2);
        assert_eq!(decoded.entities[0].id, "Hero#1");
        assert_approx_eq!(decoded.entities[0].x, 100.123, 1e-4);
        assert_approx_eq!(decoded.entities[0].y, 200.987, 1e-4);
        assert_eq!(decoded.entities[0].color, Color::new(1.0, 0.5, 0.0, 1.0));
    }

    #[test]
    fn test_decode_broadcast_lenient_fields() {
        let decoded =
            decode_broadcast(r#"{"type":"kf","t":3,"entities":[{"id":"X","x":1,"y":2}]}"#).unwrap();
        assert_eq!(decoded.state, SimulationState::Playing);
        assert_eq!(decoded.entities[0].color, Color::WHITE);
    }

    #[test]
    fn test_decode_broadcast_rejects_other_records() {
        let err = decode_broadcast(r#"{"type":"header","version":1,"w":800,"h":600}"#);
        assert!(matches!(
            err,
            Err(ProtocolError::UnexpectedRecord { found: "header", .. })
        ));
        assert!(matches!(
            decode_broadcast("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_header_and_input_layout() {
        assert_eq!(
            Record::header(800, 600).to_line().unwrap(),
            r#"{"type":"header","version":1,"w":800,"h":600}"#
        );
        assert_eq!(
            Record::input(1.23456, &[32, 65], 2).to_line().unwrap(),
            r#"{"type":"input","t":1.23,"keys":[32,65]}"#
        );
    }

    #[test]
    fn test_keyframe_is_quantized() {
        let snapshot = sample_snapshot();
        let line = Record::keyframe(0.123456, &snapshot.entities, 2)
            .to_line()
            .unwrap();
        assert!(line.starts_with(r#"{"type":"keyframe","t":0.12,"entities":[{"id":"Hero#1","x":100.12,"y":200.99,"rt":"CIRCLE""#));
    }

    #[test]
    fn test_keyframe_round_trip_within_tolerance() {
        let snapshot = sample_snapshot();
        let decimals = 2;
        let line = Record::keyframe(4.0, &snapshot.entities, decimals)
            .to_line()
            .unwrap();
        let decoded = Record::parse(&line).unwrap().into_snapshot().unwrap();

        let tolerance = 0.5 * 10f32.powi(-(decimals as i32)) + 1e-4;
        for (original, restored) in snapshot.entities.iter().zip(&decoded.entities) {
            assert_eq!(original.id, restored.id);
            assert_approx_eq!(original.x, restored.x, tolerance);
            assert_approx_eq!(original.y, restored.y, tolerance);
            assert_eq!(original.shape, restored.shape);
        }
        assert_eq!(decoded.entities[0].width, 30.0);
    }

    #[test]
    fn test_header_cannot_become_snapshot() {
        let result = Record::header(1, 1).into_snapshot();
        assert!(result.is_err());
    }

    #[test]
    fn test_quantize() {
        assert_eq!(quantize(1.23456, 2), 1.23);
        assert_eq!(quantize(1.235, 0), 1.0);
        assert_eq!(quantize_f32(2.71828, 3), 2.718);
    }
}
