use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use crate::drivers::error::DecodeError;
use crate::types::{ChannelId, Sample, SampleBatch, Timestamp, MAX_CHANNELS};
/// Longest run of bytes we keep waiting for a newline before giving up on it.
const MAX_PENDING_BYTES: usize = 64 * 1024;
/// Marker line that opens a BalkonLogger frame.
pub const FRAME_MARKER: &str = "eof";
/// Upper bound on the record count a frame header may declare.
pub const MAX_FRAME_RECORDS: usize = 256;
/// Values carried by each BalkonLogger record, after the device time.
pub const BALKON_CHANNELS: usize = MAX_CHANNELS;
/// How far past the decode clock a frame's device time may run.
pub const MAX_CLOCK_LEAD: TimeDelta = TimeDelta::hours(1);
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Standard,
    #[default]
    BalkonLogger,
}
/// Result of one decode call: everything complete in the buffered input.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Decoded {
    pub batch: SampleBatch,
    pub errors: Vec<DecodeError>,
}
/// Device protocol decoders. Both keep partial input across calls.
#[derive(Debug)]
pub enum Decoder {
    Standard(StandardDecoder),
    BalkonLogger(BalkonDecoder),
}
impl Decoder {
    pub fn for_protocol(protocol: Protocol, standard_fields: usize) -> Self {
        match protocol {
            Protocol::Standard => Decoder::Standard(StandardDecoder::new(standard_fields)),
            Protocol::BalkonLogger => Decoder::BalkonLogger(BalkonDecoder::new()),
        }
    }
    /// Feeds a chunk of raw bytes. `now` stamps the samples (Standard) or anchors
    /// the device clock (BalkonLogger).
    pub fn decode(&mut self, chunk: &[u8], now: Timestamp) -> Decoded {
        match self {
            Decoder::Standard(d) => d.decode(chunk, now),
            Decoder::BalkonLogger(d) => d.decode(chunk, now),
        }
    }
    pub fn pending_bytes(&self) -> usize {
        match self {
            Decoder::Standard(d) => d.lines.pending.len(),
            Decoder::BalkonLogger(d) => d.lines.pending.len(),
        }
    }
}
/// Splits an arbitrary byte stream into complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}
impl LineBuffer {
    fn feed(&mut self, chunk: &[u8], errors: &mut Vec<DecodeError>) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            if self.pending.len() > MAX_PENDING_BYTES {
                errors.push(DecodeError::MalformedLine {
                    line: String::from_utf8_lossy(&self.pending[..32]).into_owned(),
                    reason: format!("no line terminator within {MAX_PENDING_BYTES} bytes"),
                });
                self.pending.clear();
            }
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).trim().to_owned())
            .filter(|line| !line.is_empty())
            .collect()
    }
}
fn parse_value(field: &str) -> Result<f64, String> {
    let field = field.trim();
    match field.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(_) => Err(format!("non-finite value {field:?}")),
        Err(_) => Err(format!("non-numeric field {field:?}")),
    }
}
/// One line of comma separated values per reading, positional channels.
#[derive(Debug)]
pub struct StandardDecoder {
    lines: LineBuffer,
    fields: usize,
}
impl StandardDecoder {
    pub fn new(fields: usize) -> Self {
        Self {
            lines: LineBuffer::default(),
            fields: fields.clamp(1, MAX_CHANNELS),
        }
    }
    fn decode(&mut self, chunk: &[u8], now: Timestamp) -> Decoded {
        let mut out = Decoded::default();
        for line in self.lines.feed(chunk, &mut out.errors) {
            match self.parse_line(&line) {
                Ok(values) => {
                    for (channel, value) in ChannelId::all().zip(values) {
                        out.batch.push(Sample::new(channel, now, value));
                    }
                }
                Err(err) => out.errors.push(err),
            }
        }
        out
    }
    fn parse_line(&self, line: &str) -> Result<Vec<f64>, DecodeError> {
        let malformed = |reason: String| DecodeError::MalformedLine {
            line: line.to_owned(),
            reason,
        };
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != self.fields {
            return Err(malformed(format!(
                "expected {} fields, found {}",
                self.fields,
                fields.len()
            )));
        }
        fields
            .into_iter()
            .map(|f| parse_value(f).map_err(&malformed))
            .collect()
    }
}
#[derive(Debug)]
enum FrameState {
    /// Outside a frame, scanning for the next marker.
    Hunting,
    /// Marker seen, header line expected next.
    Header,
    Records {
        expected: usize,
        records: Vec<(u64, [f64; BALKON_CHANNELS])>,
    },
}
/// Framed batch protocol: `eof`, a record count, then `device_ms,v0..v7` records.
#[derive(Debug)]
pub struct BalkonDecoder {
    lines: LineBuffer,
    state: FrameState,
    /// Device time and wall time of the first record of the session.
    origin: Option<(u64, Timestamp)>,
    /// Device time of the last record emitted.
    last_ms: Option<u64>,
}
impl Default for BalkonDecoder {
    fn default() -> Self {
        Self::new()
    }
}
impl BalkonDecoder {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::default(),
            state: FrameState::Hunting,
            origin: None,
            last_ms: None,
        }
    }
    fn decode(&mut self, chunk: &[u8], now: Timestamp) -> Decoded {
        let mut out = Decoded::default();
        for line in self.lines.feed(chunk, &mut out.errors) {
            self.step(&line, now, &mut out);
        }
        out
    }
    fn step(&mut self, line: &str, now: Timestamp, out: &mut Decoded) {
        if line.eq_ignore_ascii_case(FRAME_MARKER) {
            if let FrameState::Records { expected, records } = &self.state {
                out.errors.push(DecodeError::FramingError(format!(
                    "frame truncated after {} of {} records",
                    records.len(),
                    expected
                )));
            } else if matches!(self.state, FrameState::Header) {
                out.errors
                    .push(DecodeError::FramingError("frame header missing".into()));
            }
            self.state = FrameState::Header;
            return;
        }
        match &mut self.state {
            FrameState::Hunting => {
                log::debug!("skipping {} bytes outside a frame", line.len());
            }
            FrameState::Header => match line.parse::<usize>() {
                Ok(n) if (1..=MAX_FRAME_RECORDS).contains(&n) => {
                    self.state = FrameState::Records {
                        expected: n,
                        records: Vec::with_capacity(n),
                    };
                }
                _ => {
                    out.errors.push(DecodeError::FramingError(format!(
                        "invalid record count {line:?}"
                    )));
                    self.state = FrameState::Hunting;
                }
            },
            FrameState::Records { expected, records } => {
                let previous = records.last().map(|r| r.0);
                match parse_record(line, previous) {
                    Ok(record) => {
                        records.push(record);
                        if records.len() == *expected {
                            let records = std::mem::take(records);
                            self.state = FrameState::Hunting;
                            if let Err(reason) = self.emit(&records, now, &mut out.batch) {
                                out.errors.push(DecodeError::FramingError(reason));
                            }
                        }
                    }
                    Err(reason) => {
                        out.errors.push(DecodeError::FramingError(reason));
                        self.state = FrameState::Hunting;
                    }
                }
            }
        }
    }
    /// Stamps a complete frame and appends it to `batch`. A frame that would
    /// move device time backwards, overflow, or land past `now + MAX_CLOCK_LEAD`
    /// is rejected whole and leaves the session origin untouched.
    fn emit(
        &mut self,
        records: &[(u64, [f64; BALKON_CHANNELS])],
        now: Timestamp,
        batch: &mut SampleBatch,
    ) -> Result<(), String> {
        let (Some(&(first_ms, _)), Some(&(last_ms, _))) = (records.first(), records.last()) else {
            return Ok(());
        };
        if let Some(previous) = self.last_ms.filter(|&previous| first_ms < previous) {
            return Err(format!(
                "device time {first_ms} ms is behind the previous frame ({previous} ms)"
            ));
        }
        let (origin_ms, origin_wall) = self.origin.unwrap_or((first_ms, now));
        let horizon = now.checked_add_signed(MAX_CLOCK_LEAD).unwrap_or(now);
        let mut stamped = Vec::with_capacity(records.len());
        for &(device_ms, values) in records {
            let timestamp = device_time(origin_ms, origin_wall, device_ms)
                .ok_or_else(|| format!("device time {device_ms} ms is out of range"))?;
            if timestamp > horizon {
                return Err(format!(
                    "device time {device_ms} ms runs more than {} min ahead of the clock",
                    MAX_CLOCK_LEAD.num_minutes()
                ));
            }
            stamped.push((timestamp, values));
        }
        self.origin = Some((origin_ms, origin_wall));
        self.last_ms = Some(last_ms);
        for (timestamp, values) in stamped {
            for (channel, value) in ChannelId::all().zip(values) {
                batch.push(Sample::new(channel, timestamp, value));
            }
        }
        Ok(())
    }
}
fn device_time(origin_ms: u64, origin_wall: Timestamp, device_ms: u64) -> Option<Timestamp> {
    let elapsed = i64::try_from(device_ms)
        .ok()?
        .checked_sub(i64::try_from(origin_ms).ok()?)?;
    origin_wall.checked_add_signed(TimeDelta::try_milliseconds(elapsed)?)
}
fn parse_record(
    line: &str,
    previous_ms: Option<u64>,
) -> Result<(u64, [f64; BALKON_CHANNELS]), String> {
    let mut fields = line.split(',');
    let device_ms = fields
        .next()
        .and_then(|f| f.trim().parse::<u64>().ok())
        .ok_or_else(|| format!("record {line:?} has no device time"))?;
    if previous_ms.is_some_and(|prev| device_ms < prev) {
        return Err(format!("device time went backwards in record {line:?}"));
    }
    let mut values = [0.0; BALKON_CHANNELS];
    let mut count = 0;
    for field in fields {
        if count == BALKON_CHANNELS {
            return Err(format!("record {line:?} has too many values"));
        }
        values[count] = parse_value(field).map_err(|e| format!("record {line:?}: {e}"))?;
        count += 1;
    }
    if count != BALKON_CHANNELS {
        return Err(format!(
            "record {line:?} has {count} values, expected {BALKON_CHANNELS}"
        ));
    }
    Ok((device_ms, values))
}
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    fn t0() -> Timestamp {
        chrono::Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }
    fn record(ms: u64, base: f64) -> String {
        let values: Vec<String> = (0..8).map(|i| format!("{}", base + i as f64)).collect();
        format!("{ms},{}\n", values.join(","))
    }
    #[test]
    fn standard_skips_one_bad_line_and_keeps_going() {
        let mut decoder = Decoder::for_protocol(Protocol::Standard, 1);
        let mut input = String::new();
        for i in 0..10 {
            if i == 4 {
                input.push_str("12.x\n");
            } else {
                input.push_str(&format!("{i}.5\n"));
            }
        }
        let out = decoder.decode(input.as_bytes(), t0());
        assert_eq!(out.batch.len(), 9);
        assert_eq!(out.errors.len(), 1);
        assert!(matches!(out.errors[0], DecodeError::MalformedLine { .. }));
        let values: Vec<f64> = out.batch.iter().map(|s| s.raw_value).collect();
        assert_eq!(values[4], 5.5);
        assert_eq!(values[8], 9.5);
    }
    #[test]
    fn standard_buffers_partial_lines_across_chunks() {
        let mut decoder = Decoder::for_protocol(Protocol::Standard, 3);
        let first = decoder.decode(b"1.0,2.", t0());
        assert!(first.batch.is_empty());
        assert!(first.errors.is_empty());
        assert_eq!(decoder.pending_bytes(), 6);
        let second = decoder.decode(b"0,3.0\r\n4", t0());
        assert_eq!(second.batch.len(), 3);
        let values: Vec<(usize, f64)> = second
            .batch
            .iter()
            .map(|s| (s.channel.index(), s.raw_value))
            .collect();
        assert_eq!(values, vec![(0, 1.0), (1, 2.0), (2, 3.0)]);
        assert_eq!(decoder.pending_bytes(), 1);
    }
    #[test]
    fn standard_rejects_wrong_field_count_and_non_finite() {
        let mut decoder = Decoder::for_protocol(Protocol::Standard, 2);
        let out = decoder.decode(b"1,2,3\nnan,1\n\n5,6\n", t0());
        assert_eq!(out.errors.len(), 2);
        assert_eq!(out.batch.len(), 2);
        assert!(out.batch.iter().all(|s| s.timestamp == t0()));
    }
    #[test]
    fn balkon_frame_is_emitted_once_complete() {
        let mut decoder = Decoder::for_protocol(Protocol::BalkonLogger, 8);
        let frame = format!("eof\n2\n{}{}", record(1_000, 0.0), record(1_500, 10.0));
        let (head, tail) = frame.as_bytes().split_at(9);
        let out = decoder.decode(head, t0());
        assert!(out.batch.is_empty());
        let out = decoder.decode(tail, t0());
        assert!(out.errors.is_empty());
        assert_eq!(out.batch.len(), 16);
        let samples = out.batch.samples();
        assert_eq!(samples[0].timestamp, t0());
        assert_eq!(samples[8].timestamp, t0() + TimeDelta::milliseconds(500));
        assert_eq!(samples[15].channel.index(), 7);
        assert_eq!(samples[15].raw_value, 17.0);
    }
    #[test]
    fn balkon_session_offset_is_fixed_at_first_frame() {
        let mut decoder = Decoder::for_protocol(Protocol::BalkonLogger, 8);
        let first = format!("eof\n1\n{}", record(10_000, 0.0));
        decoder.decode(first.as_bytes(), t0());
        // Second frame decoded much later: device time, not decode time, wins.
        let later = t0() + TimeDelta::seconds(30);
        let second = format!("eof\n1\n{}", record(12_000, 0.0));
        let out = decoder.decode(second.as_bytes(), later);
        assert_eq!(out.batch.samples()[0].timestamp, t0() + TimeDelta::seconds(2));
    }
    #[test]
    fn balkon_truncated_frame_resyncs_on_next_marker() {
        let mut decoder = Decoder::for_protocol(Protocol::BalkonLogger, 8);
        let input = format!(
            "noise\neof\n3\n{}eof\n1\n{}",
            record(0, 0.0),
            record(100, 1.0)
        );
        let out = decoder.decode(input.as_bytes(), t0());
        assert_eq!(out.errors.len(), 1);
        assert!(matches!(out.errors[0], DecodeError::FramingError(_)));
        assert_eq!(out.batch.len(), 8);
        assert_eq!(out.batch.samples()[0].raw_value, 1.0);
    }
    #[test]
    fn balkon_bad_record_drops_frame_until_next_marker() {
        let mut decoder = Decoder::for_protocol(Protocol::BalkonLogger, 8);
        let input = format!(
            "eof\n2\n5,1,2,3\n{}eof\nabc\neof\n1\n{}",
            record(10, 0.0),
            record(20, 2.0)
        );
        let out = decoder.decode(input.as_bytes(), t0());
        // short record, then bad header
        assert_eq!(out.errors.len(), 2);
        assert_eq!(out.batch.len(), 8);
        assert_eq!(out.batch.samples()[0].raw_value, 2.0);
    }
    #[test]
    fn standard_gives_up_on_an_endless_line() {
        let mut decoder = Decoder::for_protocol(Protocol::Standard, 1);
        let out = decoder.decode(&vec![b'7'; MAX_PENDING_BYTES + 1], t0());
        assert!(out.batch.is_empty());
        assert_eq!(out.errors.len(), 1);
        assert!(matches!(out.errors[0], DecodeError::MalformedLine { .. }));
        assert_eq!(decoder.pending_bytes(), 0);
        let out = decoder.decode(b"1.5\n", t0());
        assert!(out.errors.is_empty());
        assert_eq!(out.batch.len(), 1);
    }
    #[test]
    fn balkon_out_of_range_device_time_is_a_framing_error() {
        let mut decoder = Decoder::for_protocol(Protocol::BalkonLogger, 8);
        let input = format!(
            "eof\n1\n{}eof\n1\n{}eof\n1\n{}eof\n1\n{}",
            record(0, 0.0),
            record(100_000_000_000_000_000, 1.0),
            record(u64::MAX, 2.0),
            record(1_000, 3.0)
        );
        let out = decoder.decode(input.as_bytes(), t0());
        assert_eq!(out.errors.len(), 2);
        assert!(out.errors.iter().all(|e| matches!(e, DecodeError::FramingError(_))));
        let stamps: Vec<Timestamp> = out.batch.iter().step_by(8).map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![t0(), t0() + TimeDelta::seconds(1)]);
    }
    #[test]
    fn balkon_rejects_frames_that_jump_ahead_or_back() {
        let mut decoder = Decoder::for_protocol(Protocol::BalkonLogger, 8);
        let mut stamps = Vec::new();
        let mut errors = 0;
        for (i, ms) in [1_000u64, 2_000, 900_003_000, 1_500, 4_000].into_iter().enumerate() {
            let frame = format!("eof\n1\n{}", record(ms, i as f64));
            let now = t0() + TimeDelta::seconds(i as i64);
            let out = decoder.decode(frame.as_bytes(), now);
            errors += out.errors.len();
            stamps.extend(out.batch.iter().step_by(8).map(|s| s.timestamp));
        }
        assert_eq!(errors, 2);
        assert_eq!(
            stamps,
            vec![t0(), t0() + TimeDelta::seconds(1), t0() + TimeDelta::seconds(3)]
        );
    }
}
