use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::protocol::{RESP_ERROR_PREFIX, RESP_OK_PREFIX};

/// Keys `Telemetry` cannot decode without. A body missing any of them is a
/// fragment and the scan moves on.
pub const CORE_TELEMETRY_FIELDS: [&str; 7] = [
    "panelToBatteryCurrent",
    "batteryToLoadCurrent",
    "voltagePanel",
    "voltageBatterySensor2",
    "chargeState",
    "currentPWM",
    "temperature",
];

/// Objects larger than this are abandoned as corrupt.
pub const MAX_FRAME_BYTES: usize = 16 * 1024;

pub const MAX_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Acknowledgement,
    Telemetry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub accepted: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ack(Acknowledgement),
    Telemetry(Map<String, Value>),
}

/// Parses a balanced `{...}` slice and accepts it only if it carries every
/// core telemetry key.
pub fn sniff_telemetry(bytes: &[u8]) -> Result<Map<String, Value>, String> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| format!("not valid JSON: {err}"))?;
    let Value::Object(object) = value else {
        return Err("JSON body is not an object".to_string());
    };
    let missing: Vec<_> = CORE_TELEMETRY_FIELDS
        .iter()
        .filter(|field| !object.contains_key(**field))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing telemetry fields: {}", missing.join(", ")));
    }
    Ok(object)
}

fn line_carries_telemetry(line: &str) -> bool {
    line.find('{')
        .is_some_and(|start| sniff_telemetry(line[start..].as_bytes()).is_ok())
}

/// Incremental frame reconstruction over arbitrarily chunked input.
#[derive(Debug)]
pub struct FrameAssembler {
    kind: FrameKind,
    buf: Vec<u8>,
    cursor: usize,
    received: usize,
    depth: usize,
    object_start: usize,
    in_string: bool,
    escaped: bool,
    rejected_objects: usize,
    skipped_telemetry: usize,
}

impl FrameAssembler {
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            buf: Vec::with_capacity(1024),
            cursor: 0,
            received: 0,
            depth: 0,
            object_start: 0,
            in_string: false,
            escaped: false,
            rejected_objects: 0,
            skipped_telemetry: 0,
        }
    }

    /// Total bytes fed since construction.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_empty(&self) -> bool {
        self.received == 0
    }

    /// Balanced objects that failed schema sniffing.
    pub fn rejected_objects(&self) -> usize {
        self.rejected_objects
    }

    /// Telemetry bodies skipped while waiting for an acknowledgement.
    pub fn skipped_telemetry(&self) -> usize {
        self.skipped_telemetry
    }

    pub fn push(&mut self, bytes: &[u8]) -> Option<Frame> {
        self.received += bytes.len();
        self.buf.extend_from_slice(bytes);
        let frame = match self.kind {
            FrameKind::Telemetry => self.scan_telemetry(),
            FrameKind::Acknowledgement => self.scan_acknowledgement(),
        };
        self.compact();
        frame
    }

    fn scan_telemetry(&mut self) -> Option<Frame> {
        while self.cursor < self.buf.len() {
            let index = self.cursor;
            let byte = self.buf[index];
            self.cursor += 1;

            if self.depth == 0 {
                if byte == b'{' {
                    self.depth = 1;
                    self.object_start = index;
                    self.in_string = false;
                    self.escaped = false;
                }
                continue;
            }

            if index - self.object_start >= MAX_FRAME_BYTES {
                debug!("abandoning oversized object after {} bytes", index - self.object_start);
                self.rejected_objects += 1;
                self.depth = 0;
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        match sniff_telemetry(&self.buf[self.object_start..=index]) {
                            Ok(object) => return Some(Frame::Telemetry(object)),
                            Err(reason) => {
                                debug!("skipping balanced object: {reason}");
                                self.rejected_objects += 1;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn scan_acknowledgement(&mut self) -> Option<Frame> {
        while let Some(offset) = self.buf[self.cursor..].iter().position(|b| *b == b'\n') {
            let end = self.cursor + offset;
            let line = String::from_utf8_lossy(&self.buf[self.cursor..end])
                .trim()
                .to_string();
            self.cursor = end + 1;

            if let Some(message) = line.strip_prefix(RESP_OK_PREFIX) {
                return Some(Frame::Ack(Acknowledgement {
                    accepted: true,
                    message: message.trim().to_string(),
                }));
            }
            if let Some(message) = line.strip_prefix(RESP_ERROR_PREFIX) {
                return Some(Frame::Ack(Acknowledgement {
                    accepted: false,
                    message: message.trim().to_string(),
                }));
            }
            if line.is_empty() {
                continue;
            }
            if line_carries_telemetry(&line) {
                debug!("skipping unsolicited telemetry while awaiting acknowledgement");
                self.skipped_telemetry += 1;
            } else {
                debug!("skipping line {line:?}");
            }
        }
        None
    }

    /// Drops bytes no pending frame can still reference.
    fn compact(&mut self) {
        let keep_from = match self.kind {
            FrameKind::Telemetry if self.depth > 0 => self.object_start,
            _ => self.cursor,
        };
        if keep_from == 0 {
            return;
        }
        self.buf.drain(..keep_from);
        self.cursor -= keep_from;
        self.object_start = self.object_start.saturating_sub(keep_from);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    Fixed(usize),
    Adaptive { initial: usize, min: usize, max: usize },
}

/// Tried in order for every exchange.
pub const READ_STRATEGIES: [ReadStrategy; 3] = [
    ReadStrategy::Fixed(16),
    ReadStrategy::Fixed(32),
    ReadStrategy::Adaptive {
        initial: 16,
        min: 8,
        max: MAX_CHUNK,
    },
];

impl ReadStrategy {
    pub fn sizer(self) -> ChunkSizer {
        match self {
            Self::Fixed(size) => ChunkSizer {
                size: size.clamp(1, MAX_CHUNK),
                max: size.clamp(1, MAX_CHUNK),
                adaptive: false,
                good_reads: 0,
                full_streak: 0,
            },
            Self::Adaptive { initial, min, max } => ChunkSizer {
                size: initial.clamp(min.max(1), max.min(MAX_CHUNK)),
                max: max.min(MAX_CHUNK),
                adaptive: true,
                good_reads: 0,
                full_streak: 0,
            },
        }
    }
}

impl std::fmt::Display for ReadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(size) => write!(f, "fixed-{size}"),
            Self::Adaptive { .. } => f.write_str("adaptive"),
        }
    }
}

/// Read increment for one strategy. The adaptive variant doubles after more
/// than three productive reads once two back-to-back reads filled the whole
/// chunk, i.e. at least twice the current size was pending.
#[derive(Debug, Clone)]
pub struct ChunkSizer {
    size: usize,
    max: usize,
    adaptive: bool,
    good_reads: u32,
    full_streak: u32,
}

impl ChunkSizer {
    pub fn next_size(&self) -> usize {
        self.size
    }

    pub fn record(&mut self, read: usize) {
        if read == 0 {
            self.full_streak = 0;
            return;
        }
        self.good_reads += 1;
        if read >= self.size {
            self.full_streak += 1;
        } else {
            self.full_streak = 0;
        }
        if self.adaptive && self.good_reads > 3 && self.full_streak >= 2 && self.size < self.max {
            self.size = (self.size * 2).min(self.max);
            self.full_streak = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{
        fixtures::{telemetry_json, telemetry_line},
        Telemetry,
    };
    use pretty_assertions::assert_eq;

    fn feed(assembler: &mut FrameAssembler, bytes: &[u8], chunk: usize) -> Option<Frame> {
        bytes
            .chunks(chunk)
            .find_map(|piece| assembler.push(piece))
    }

    #[test]
    fn telemetry_is_chunk_size_independent() {
        let line = telemetry_line();
        let expected = match telemetry_json() {
            Value::Object(object) => Frame::Telemetry(object),
            _ => unreachable!(),
        };

        for chunk in [1, 7, 16, 32, 256] {
            let mut assembler = FrameAssembler::new(FrameKind::Telemetry);
            let frame = feed(&mut assembler, line.as_bytes(), chunk);
            assert_eq!(frame.as_ref(), Some(&expected), "chunk size {chunk}");
        }
    }

    #[test]
    fn braces_inside_strings_do_not_close_object() {
        let mut assembler = FrameAssembler::new(FrameKind::Telemetry);
        let line = telemetry_line();
        let cut = line.find("{braces}").unwrap() + 2;
        assert_eq!(assembler.push(line[..cut].as_bytes()), None);
        assert!(matches!(
            assembler.push(line[cut..].as_bytes()),
            Some(Frame::Telemetry(_))
        ));
    }

    #[test]
    fn field_deficient_object_is_skipped_and_scan_resumes() {
        let mut assembler = FrameAssembler::new(FrameKind::Telemetry);
        let noise = br#"{"voltagePanel": 1, "temperature": 2, "chargeState": "BULK_CHARGE"}"#;
        assert_eq!(assembler.push(noise), None);
        assert_eq!(assembler.rejected_objects(), 1);

        let frame = assembler.push(telemetry_line().as_bytes());
        assert!(matches!(frame, Some(Frame::Telemetry(_))));
    }

    #[test]
    fn sniffing_requires_every_core_field() {
        let five = br#"{"panelToBatteryCurrent":1,"batteryToLoadCurrent":2,"voltagePanel":3,"temperature":4,"currentPWM":5,"bulkVoltage":14.4}"#;
        let err = sniff_telemetry(five).unwrap_err();
        assert!(err.contains("voltageBatterySensor2"));
        assert!(err.contains("chargeState"));

        let core = br#"{"panelToBatteryCurrent":1,"batteryToLoadCurrent":2,"voltagePanel":3,"voltageBatterySensor2":4,"chargeState":"FLOAT_CHARGE","currentPWM":5,"temperature":6}"#;
        let object = sniff_telemetry(core).unwrap();
        assert!(Telemetry::from_object(object).is_ok());
        assert!(sniff_telemetry(b"[1,2,3]").is_err());
    }

    #[test]
    fn undecodable_fragment_does_not_end_the_read() {
        let mut assembler = FrameAssembler::new(FrameKind::Telemetry);
        let fragment = br#"{"panelToBatteryCurrent":1,"batteryToLoadCurrent":2,"voltagePanel":3,"temperature":4,"currentPWM":5}"#;
        assert_eq!(assembler.push(fragment), None);
        assert_eq!(assembler.rejected_objects(), 1);

        match assembler.push(telemetry_line().as_bytes()) {
            Some(Frame::Telemetry(object)) => {
                assert!(Telemetry::from_object(object).is_ok())
            }
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn acknowledgement_needs_line_terminator() {
        let mut assembler = FrameAssembler::new(FrameKind::Acknowledgement);
        assert_eq!(assembler.push(b"OK:Load tog"), None);
        assert_eq!(
            assembler.push(b"gled\r\n"),
            Some(Frame::Ack(Acknowledgement {
                accepted: true,
                message: "Load toggled".to_string(),
            }))
        );
    }

    #[test]
    fn acknowledgement_skips_noise_and_telemetry() {
        let mut assembler = FrameAssembler::new(FrameKind::Acknowledgement);
        let mut input = String::from("debug: pwm=128\n");
        input.push_str(&telemetry_line());
        input.push_str("ERROR:value out of range\n");

        let frame = feed(&mut assembler, input.as_bytes(), 16);
        assert_eq!(
            frame,
            Some(Frame::Ack(Acknowledgement {
                accepted: false,
                message: "value out of range".to_string(),
            }))
        );
        assert_eq!(assembler.skipped_telemetry(), 1);
    }

    #[test]
    fn adaptive_sizer_grows_only_under_backlog() {
        let mut sizer = READ_STRATEGIES[2].sizer();
        assert_eq!(sizer.next_size(), 16);
        for _ in 0..3 {
            sizer.record(16);
        }
        assert_eq!(sizer.next_size(), 16);
        sizer.record(16);
        assert_eq!(sizer.next_size(), 32);
        sizer.record(5);
        sizer.record(32);
        assert_eq!(sizer.next_size(), 32);
        for _ in 0..10 {
            let size = sizer.next_size();
            sizer.record(size);
        }
        assert_eq!(sizer.next_size(), MAX_CHUNK);

        let mut fixed = READ_STRATEGIES[0].sizer();
        for _ in 0..10 {
            fixed.record(16);
        }
        assert_eq!(fixed.next_size(), 16);
    }
}
