//! Simulated SCPI instrument for testing.
//!
//! `MockTransport` answers the command set of the supported supplies,
//! multimeters and oscilloscopes from in-memory state, so every layer above
//! the transport can be exercised without hardware. It provides:
//! - Per-channel supply state (setpoints, OVP, output, trip latch)
//! - An instrument error queue
//! - Queued readings for `:READ?` and `:MEASure` queries
//! - Failure injection (write timeouts, dropped replies, device errors,
//!   protection trips, open failures)
//! - A log of every delivered frame
//!
//! Clones share state, so a test keeps one handle for inspection while the
//! session owns another.

use super::Transport;
use crate::codec::{encode_block, DeviceErrorEntry};
use crate::error::TransportError;
use crate::session::InstrumentAddress;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const ERROR_QUERY: &str = ":SYSTem:ERRor:NEXT?";

/// Observable state of one simulated supply channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockChannelState {
    /// Programmed voltage setpoint.
    pub voltage: f64,
    /// Programmed current limit.
    pub current_limit: f64,
    /// Programmed OVP level.
    pub ovp_level: f64,
    /// Whether OVP is armed.
    pub ovp_enabled: bool,
    /// Output relay state.
    pub output: bool,
    /// Protection latch.
    pub tripped: bool,
}

impl MockChannelState {
    fn reset(max_voltage: f64, tripped: bool) -> Self {
        Self {
            voltage: 0.0,
            current_limit: 0.1,
            ovp_level: max_voltage,
            ovp_enabled: false,
            output: false,
            tripped,
        }
    }
}

#[derive(Debug)]
struct Fault {
    pattern: String,
    remaining: u32,
}

fn take_fault(faults: &mut Vec<Fault>, frame: &str) -> bool {
    let hit = faults
        .iter_mut()
        .find(|f| f.remaining > 0 && frame.contains(&f.pattern));
    match hit {
        Some(fault) => {
            fault.remaining -= 1;
            true
        }
        None => false,
    }
}

#[derive(Debug, Default)]
struct ScopeChannel {
    scale: f64,
    offset: f64,
    coupling: String,
    probe: f64,
}

#[derive(Debug)]
struct MockState {
    identity: String,
    max_voltage: f64,
    max_current: f64,
    load_ohms: f64,
    channels: Vec<MockChannelState>,
    selected: usize,
    connected: bool,
    open_count: u32,
    open_failure: Option<String>,
    error_queue: VecDeque<DeviceErrorEntry>,
    pending: VecDeque<Vec<u8>>,
    readings: VecDeque<f64>,
    default_reading: f64,
    scope: BTreeMap<u8, ScopeChannel>,
    timebase: f64,
    screenshot: Vec<u8>,
    frames: Vec<String>,
    fail_next_writes: u32,
    write_faults: Vec<Fault>,
    dropped_replies: Vec<Fault>,
    device_faults: Vec<(String, DeviceErrorEntry)>,
    trips: Vec<(String, u8)>,
}

impl MockState {
    fn new(identity: &str, channels: usize, max_voltage: f64, max_current: f64) -> Self {
        Self {
            identity: identity.to_string(),
            max_voltage,
            max_current,
            load_ohms: 10.0,
            channels: vec![MockChannelState::reset(max_voltage, false); channels],
            selected: 1,
            connected: false,
            open_count: 0,
            open_failure: None,
            error_queue: VecDeque::new(),
            pending: VecDeque::new(),
            readings: VecDeque::new(),
            default_reading: 0.0,
            scope: BTreeMap::new(),
            timebase: 1e-3,
            screenshot: Vec::new(),
            frames: Vec::new(),
            fail_next_writes: 0,
            write_faults: Vec::new(),
            dropped_replies: Vec::new(),
            device_faults: Vec::new(),
            trips: Vec::new(),
        }
    }

    fn push_error(&mut self, code: i32, message: &str) {
        self.error_queue.push_back(DeviceErrorEntry::new(code, message));
    }

    fn selected_channel(&mut self) -> Option<&mut MockChannelState> {
        self.channels.get_mut(self.selected.wrapping_sub(1))
    }

    fn trip(&mut self, channel: u8) {
        if let Some(state) = self.channels.get_mut(usize::from(channel).wrapping_sub(1)) {
            state.tripped = true;
            state.output = false;
            self.push_error(801, "Over voltage protection tripped");
        }
    }

    fn check_ovp(&mut self) {
        let selected = self.selected as u8;
        let trips = self
            .selected_channel()
            .map(|ch| ch.output && ch.ovp_enabled && ch.voltage > ch.ovp_level)
            .unwrap_or(false);
        if trips {
            self.trip(selected);
        }
    }

    fn next_reading(&mut self) -> Vec<u8> {
        let value = self.readings.pop_front().unwrap_or(self.default_reading);
        format!("{value:E}").into_bytes()
    }

    fn execute_frame(&mut self, frame: &str) {
        let rejected = self
            .device_faults
            .iter()
            .find(|(pattern, _)| frame.contains(pattern.as_str()))
            .map(|(_, entry)| entry.clone());
        if let Some(entry) = rejected {
            self.error_queue.push_back(entry);
            return;
        }

        let replies: Vec<Vec<u8>> = frame
            .split(';')
            .filter_map(|segment| self.execute_segment(segment.trim()))
            .collect();

        if let Some(index) = self
            .trips
            .iter()
            .position(|(pattern, _)| frame.contains(pattern.as_str()))
        {
            let (_, channel) = self.trips.remove(index);
            self.trip(channel);
        }

        if !replies.is_empty() && !take_fault(&mut self.dropped_replies, frame) {
            self.pending.push_back(replies.join(&b';'));
        }
    }

    fn execute_segment(&mut self, segment: &str) -> Option<Vec<u8>> {
        if segment.is_empty() {
            return None;
        }
        let (header, args) = match segment.split_once(' ') {
            Some((header, args)) => (header, args.trim()),
            None => (segment, ""),
        };
        let short = short_form(header);
        match short.as_str() {
            "*IDN?" => Some(self.identity.clone().into_bytes()),
            "*CLS" => {
                self.error_queue.clear();
                None
            }
            "*RST" => {
                let max = self.max_voltage;
                for ch in &mut self.channels {
                    *ch = MockChannelState::reset(max, ch.tripped);
                }
                self.selected = 1;
                None
            }
            "*OPC?" => Some(b"1".to_vec()),
            ":SYST:ERR:NEXT?" | ":SYST:ERR?" => Some(
                self.error_queue
                    .pop_front()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "0,\"No error\"".to_string())
                    .into_bytes(),
            ),
            ":SYST:PRES" | ":ABOR" => None,
            ":INST:SEL" | ":INST:NSEL" => {
                let wanted = args
                    .trim_start_matches("CH")
                    .trim_start_matches("ch")
                    .parse::<usize>()
                    .ok()
                    .filter(|n| (1..=self.channels.len()).contains(n));
                match wanted {
                    Some(n) => self.selected = n,
                    None => self.push_error(-224, "Illegal parameter value"),
                }
                None
            }
            ":VOLT" => {
                let max = self.max_voltage;
                self.set_selected(args, max, |ch, v| ch.voltage = v);
                self.check_ovp();
                None
            }
            ":CURR" => {
                let max = self.max_current;
                self.set_selected(args, max, |ch, v| ch.current_limit = v);
                None
            }
            ":VOLT:PROT:LEV" => {
                let max = self.max_voltage * 1.1;
                self.set_selected(args, max, |ch, v| ch.ovp_level = v);
                None
            }
            ":VOLT:PROT:STAT" => {
                let on = parse_switch(args);
                match (on, self.selected_channel()) {
                    (Some(on), Some(ch)) => ch.ovp_enabled = on,
                    _ => self.push_error(-224, "Illegal parameter value"),
                }
                None
            }
            ":VOLT:PROT:CLE" => {
                if let Some(ch) = self.selected_channel() {
                    ch.tripped = false;
                }
                None
            }
            ":OUTP" | ":OUTP:STAT" => {
                let on = parse_switch(args);
                let tripped = self.selected_channel().map(|ch| ch.tripped);
                match (on, tripped) {
                    (Some(true), Some(true)) => {
                        self.push_error(-221, "Settings conflict; protection latched")
                    }
                    (Some(on), Some(_)) => {
                        if let Some(ch) = self.selected_channel() {
                            ch.output = on;
                        }
                        self.check_ovp();
                    }
                    _ => self.push_error(-224, "Illegal parameter value"),
                }
                None
            }
            ":VOLT?" => self.query_selected(|ch| format!("{:.6}", ch.voltage)),
            ":CURR?" => self.query_selected(|ch| format!("{:.6}", ch.current_limit)),
            ":VOLT:PROT:LEV?" => self.query_selected(|ch| format!("{:.6}", ch.ovp_level)),
            ":VOLT:PROT:TRIP?" => self.query_selected(|ch| flag(ch.tripped)),
            ":OUTP?" | ":OUTP:STAT?" => self.query_selected(|ch| flag(ch.output)),
            ":MEAS:VOLT?" if args.eq_ignore_ascii_case("ALL") && !self.channels.is_empty() => Some(
                self.channels
                    .iter()
                    .map(|ch| format!("{:.6}", if ch.output { ch.voltage } else { 0.0 }))
                    .collect::<Vec<_>>()
                    .join(",")
                    .into_bytes(),
            ),
            ":MEAS:VOLT?" if !self.channels.is_empty() => {
                self.query_selected(|ch| format!("{:.6}", if ch.output { ch.voltage } else { 0.0 }))
            }
            ":MEAS:CURR?" if !self.channels.is_empty() => {
                let load = self.load_ohms;
                self.query_selected(|ch| {
                    let amps = if ch.output {
                        (ch.voltage / load).min(ch.current_limit)
                    } else {
                        0.0
                    };
                    format!("{amps:.6}")
                })
            }
            ":READ?" => Some(self.next_reading()),
            ":TIM:SCAL" => {
                match args.parse::<f64>() {
                    Ok(v) if v > 0.0 => self.timebase = v,
                    _ => self.push_error(-222, "Data out of range"),
                }
                None
            }
            ":TIM:SCAL?" => Some(format!("{:E}", self.timebase).into_bytes()),
            ":DISP:DATA?" => Some(encode_block(&self.screenshot)),
            h if h.starts_with(":SENS:") => None,
            h if h.starts_with(":MEAS:") && h.ends_with('?') => Some(self.next_reading()),
            h if h.starts_with(":CHAN") => self.scope_channel(h, args),
            _ => {
                self.push_error(-113, "Undefined header");
                None
            }
        }
    }

    fn set_selected(&mut self, args: &str, max: f64, apply: impl FnOnce(&mut MockChannelState, f64)) {
        let value = args.parse::<f64>();
        match (value, self.channels.is_empty()) {
            (_, true) => self.push_error(-113, "Undefined header"),
            (Err(_), _) => self.push_error(-104, "Data type error"),
            (Ok(v), _) if !(0.0..=max).contains(&v) => self.push_error(-222, "Data out of range"),
            (Ok(v), _) => {
                if let Some(ch) = self.selected_channel() {
                    apply(ch, v);
                }
            }
        }
    }

    fn query_selected(&mut self, read: impl FnOnce(&MockChannelState) -> String) -> Option<Vec<u8>> {
        match self.selected_channel() {
            Some(ch) => Some(read(ch).into_bytes()),
            None => {
                self.push_error(-113, "Undefined header");
                None
            }
        }
    }

    fn scope_channel(&mut self, header: &str, args: &str) -> Option<Vec<u8>> {
        let rest = &header[":CHAN".len()..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let channel = digits.parse::<u8>().ok().filter(|n| (1..=4).contains(n));
        let Some(channel) = channel else {
            self.push_error(-113, "Undefined header");
            return None;
        };
        let field = &rest[digits.len()..];
        let number = args.parse::<f64>();
        let state = self.scope.entry(channel).or_insert_with(|| ScopeChannel {
            scale: 1.0,
            offset: 0.0,
            coupling: "DC".to_string(),
            probe: 1.0,
        });
        match (field, number) {
            (":DISP", _) => None,
            (":SCAL", Ok(v)) => {
                state.scale = v;
                None
            }
            (":OFFS", Ok(v)) => {
                state.offset = v;
                None
            }
            (":PROB", Ok(v)) => {
                state.probe = v;
                None
            }
            (":COUP", _) => {
                state.coupling = args.to_ascii_uppercase();
                None
            }
            (":SCAL?", _) => Some(format!("{:E}", state.scale).into_bytes()),
            (":OFFS?", _) => Some(format!("{:E}", state.offset).into_bytes()),
            (":PROB?", _) => Some(format!("{:E}", state.probe).into_bytes()),
            (":COUP?", _) => Some(state.coupling.clone().into_bytes()),
            _ => {
                self.push_error(-113, "Undefined header");
                None
            }
        }
    }
}

/// Reduce a long-form SCPI header to its short form: `:INSTrument:SELect`
/// becomes `:INST:SEL`.
fn short_form(header: &str) -> String {
    header
        .split(':')
        .map(|mnemonic| {
            mnemonic
                .chars()
                .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '?' | '*'))
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_switch(args: &str) -> Option<bool> {
    match args.to_ascii_uppercase().as_str() {
        "ON" | "1" => Some(true),
        "OFF" | "0" => Some(false),
        _ => None,
    }
}

fn flag(on: bool) -> String {
    if on { "1" } else { "0" }.to_string()
}

/// Simulated SCPI instrument.
///
/// # Example
///
/// ```
/// use labctl::transport::MockTransport;
///
/// let mock = MockTransport::keithley_2230();
/// mock.device_error_on(":VOLTage 31", -222, "Data out of range");
/// assert!(mock.frames().is_empty());
/// ```
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    latency: Option<Duration>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::keithley_2230()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockTransport")
            .field("identity", &state.identity)
            .field("connected", &state.connected)
            .field("frames", &state.frames.len())
            .finish()
    }
}

impl MockTransport {
    /// A supply with `channels` outputs and the given hardware limits.
    pub fn power_supply(identity: &str, channels: usize, max_voltage: f64, max_current: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(
                identity,
                channels,
                max_voltage,
                max_current,
            ))),
            latency: None,
        }
    }

    /// Three-channel 30 V / 3 A supply.
    pub fn keithley_2230() -> Self {
        Self::power_supply(
            "KEITHLEY INSTRUMENTS,MODEL 2230-30-1,9102345,1.15-1.04",
            3,
            30.0,
            3.0,
        )
    }

    /// Single-channel 72 V / 6 A supply.
    pub fn keithley_2280s() -> Self {
        Self::power_supply(
            "KEITHLEY INSTRUMENTS,MODEL 2280S-60-3,4432109,1.06",
            1,
            72.0,
            6.0,
        )
    }

    /// Bench multimeter; readings come from the reading queue.
    pub fn keithley_dmm6500() -> Self {
        Self::power_supply(
            "KEITHLEY INSTRUMENTS,MODEL DMM6500,04412345,1.7.5b",
            0,
            0.0,
            0.0,
        )
    }

    /// Four-channel oscilloscope.
    pub fn keysight_dsox6004a() -> Self {
        Self::power_supply(
            "KEYSIGHT TECHNOLOGIES,DSOX6004A,MY58260123,07.50.2021102830",
            0,
            0.0,
            0.0,
        )
    }

    /// Replace the `*IDN?` reply.
    pub fn with_identity(self, identity: &str) -> Self {
        self.lock().identity = identity.to_string();
        self
    }

    /// Delay every read by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- failure injection --

    /// Make `open` fail with an I/O error.
    pub fn fail_open(&self, reason: &str) {
        self.lock().open_failure = Some(reason.to_string());
    }

    /// Fail the next `count` writes with an I/O error.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().fail_next_writes = count;
    }

    /// Time out the next `times` writes of frames containing `pattern`.
    pub fn fail_writes_containing(&self, pattern: &str, times: u32) {
        self.lock().write_faults.push(Fault {
            pattern: pattern.to_string(),
            remaining: times,
        });
    }

    /// Swallow the reply to the next `times` frames containing `pattern`.
    pub fn drop_replies_containing(&self, pattern: &str, times: u32) {
        self.lock().dropped_replies.push(Fault {
            pattern: pattern.to_string(),
            remaining: times,
        });
    }

    /// Reject every frame containing `pattern` with the given error entry.
    pub fn device_error_on(&self, pattern: &str, code: i32, message: &str) {
        self.lock()
            .device_faults
            .push((pattern.to_string(), DeviceErrorEntry::new(code, message)));
    }

    /// Trip protection on `channel` the next time a frame contains `pattern`.
    pub fn trip_on(&self, pattern: &str, channel: u8) {
        self.lock().trips.push((pattern.to_string(), channel));
    }

    /// Push an entry straight into the error queue.
    pub fn push_device_error(&self, code: i32, message: &str) {
        self.lock().push_error(code, message);
    }

    // -- readings --

    /// Queue one reading for `:READ?` or a scope `:MEASure` query.
    pub fn push_reading(&self, value: f64) {
        self.lock().readings.push_back(value);
    }

    /// Queue several readings.
    pub fn push_readings(&self, values: impl IntoIterator<Item = f64>) {
        self.lock().readings.extend(values);
    }

    /// Reading returned once the queue is empty.
    pub fn set_default_reading(&self, value: f64) {
        self.lock().default_reading = value;
    }

    /// Image returned by `:DISPlay:DATA?`.
    pub fn set_screenshot(&self, bytes: &[u8]) {
        self.lock().screenshot = bytes.to_vec();
    }

    /// Force a channel's output relay, bypassing the command path.
    pub fn set_output(&self, channel: u8, on: bool) {
        if let Some(ch) = self.lock().channels.get_mut(usize::from(channel).wrapping_sub(1)) {
            ch.output = on;
        }
    }

    // -- inspection --

    /// Every delivered frame, in order.
    pub fn frames(&self) -> Vec<String> {
        self.lock().frames.clone()
    }

    /// Delivered frames other than error-queue polls.
    pub fn command_frames(&self) -> Vec<String> {
        self.lock()
            .frames
            .iter()
            .filter(|f| f.as_str() != ERROR_QUERY)
            .cloned()
            .collect()
    }

    /// Number of delivered frames containing `pattern`.
    pub fn count_frames(&self, pattern: &str) -> usize {
        self.lock()
            .frames
            .iter()
            .filter(|f| f.contains(pattern))
            .count()
    }

    /// Forget the frame log.
    pub fn clear_frames(&self) {
        self.lock().frames.clear();
    }

    /// State of a supply channel.
    pub fn channel(&self, channel: u8) -> Option<MockChannelState> {
        self.lock()
            .channels
            .get(usize::from(channel).wrapping_sub(1))
            .copied()
    }

    /// Current horizontal scale.
    pub fn timebase(&self) -> f64 {
        self.lock().timebase
    }

    /// Vertical scale, offset, coupling and probe of a scope channel.
    pub fn scope_channel(&self, channel: u8) -> Option<(f64, f64, String, f64)> {
        self.lock()
            .scope
            .get(&channel)
            .map(|c| (c.scale, c.offset, c.coupling.clone(), c.probe))
    }

    /// Entries waiting in the error queue.
    pub fn queued_errors(&self) -> usize {
        self.lock().error_queue.len()
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &mut self,
        _address: &InstrumentAddress,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if let Some(reason) = state.open_failure.clone() {
            return Err(TransportError::Io(reason));
        }
        state.connected = true;
        state.open_count += 1;
        state.pending.clear();
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotOpen);
        }
        let text = String::from_utf8_lossy(frame).into_owned();
        if state.fail_next_writes > 0 {
            state.fail_next_writes -= 1;
            return Err(TransportError::Io("injected write failure".into()));
        }
        if take_fault(&mut state.write_faults, &text) {
            return Err(TransportError::Timeout(Duration::from_millis(100)));
        }
        state.frames.push(text.clone());
        state.execute_frame(&text);
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotOpen);
        }
        state
            .pending
            .pop_front()
            .ok_or(TransportError::Timeout(timeout))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.connected = false;
        state.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn opened(mock: &MockTransport) -> MockTransport {
        let mut transport = mock.clone();
        transport
            .open(&InstrumentAddress::new("mock"), Duration::from_millis(10))
            .await
            .unwrap();
        transport
    }

    async fn query(transport: &mut MockTransport, frame: &str) -> String {
        let reply = transport
            .query(frame.as_bytes(), Duration::from_millis(10))
            .await
            .unwrap();
        String::from_utf8(reply).unwrap()
    }

    #[test]
    fn test_short_form() {
        assert_eq!(short_form(":INSTrument:SELect"), ":INST:SEL");
        assert_eq!(short_form(":VOLTage:PROTection:LEVel"), ":VOLT:PROT:LEV");
        assert_eq!(short_form("*IDN?"), "*IDN?");
        assert_eq!(short_form(":CHANnel2:SCALe?"), ":CHAN2:SCAL?");
    }

    #[tokio::test]
    async fn test_channel_state_follows_commands() {
        let mock = MockTransport::keithley_2230();
        let mut transport = opened(&mock).await;

        transport
            .write(b":INSTrument:SELect CH2;:VOLTage 5.000000")
            .await
            .unwrap();
        transport
            .write(b":INSTrument:SELect CH2;:OUTPut ON")
            .await
            .unwrap();

        assert_eq!(
            query(&mut transport, ":INSTrument:SELect CH2;:VOLTage?").await,
            "5.000000"
        );
        assert_eq!(
            query(&mut transport, ":MEASure:VOLTage? ALL").await,
            "0.000000,5.000000,0.000000"
        );
        let ch2 = mock.channel(2).unwrap();
        assert!(ch2.output);
        assert_eq!(mock.count_frames("CH2"), 3);
    }

    #[tokio::test]
    async fn test_out_of_range_goes_to_error_queue() {
        let mock = MockTransport::keithley_2230();
        let mut transport = opened(&mock).await;
        transport.write(b":VOLTage 99.000000").await.unwrap();
        assert_eq!(mock.channel(1).unwrap().voltage, 0.0);
        assert_eq!(
            query(&mut transport, ERROR_QUERY).await,
            "-222,\"Data out of range\""
        );
        assert_eq!(query(&mut transport, ERROR_QUERY).await, "0,\"No error\"");
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mock = MockTransport::keithley_2230();
        let mut transport = opened(&mock).await;

        mock.fail_writes_containing("OUTPut", 1);
        assert!(matches!(
            transport.write(b":OUTPut OFF").await,
            Err(TransportError::Timeout(_))
        ));
        assert!(transport.write(b":OUTPut OFF").await.is_ok());

        mock.drop_replies_containing("*IDN?", 1);
        assert!(matches!(
            transport.query(b"*IDN?", Duration::from_millis(5)).await,
            Err(TransportError::Timeout(_))
        ));
        assert!(query(&mut transport, "*IDN?").await.contains("2230"));
    }

    #[tokio::test]
    async fn test_trip_latches_and_blocks_output() {
        let mock = MockTransport::keithley_2230();
        let mut transport = opened(&mock).await;
        mock.trip_on("CH1;:OUTPut ON", 1);
        transport
            .write(b":INSTrument:SELect CH1;:OUTPut ON")
            .await
            .unwrap();
        let ch1 = mock.channel(1).unwrap();
        assert!(ch1.tripped);
        assert!(!ch1.output);
        assert_eq!(mock.queued_errors(), 1);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_io() {
        let mock = MockTransport::keithley_dmm6500();
        let mut transport = mock.clone();
        assert_eq!(transport.write(b"*CLS").await, Err(TransportError::NotOpen));
    }
}
