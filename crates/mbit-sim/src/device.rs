//! Simulated micro:bit board
//!
//! A [`Device`] owns the peripheral state of one board together with its
//! virtual clock and lifecycle. It is exclusively owned by one session; the
//! only state it shares with other devices is its radio bucket membership,
//! reached through the [`RadioDomain`].
//!
//! Every operation validates before mutating, so an `Err` leaves the device
//! untouched.

use std::collections::VecDeque;
use std::sync::Arc;

use mbit_protocol::{
    Button, DeviceId, DeviceSnapshot, Gesture, Grid, RadioSettings, DISPLAY_SIZE, MAX_BRIGHTNESS,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{VirtualClock, WakeToken};
use crate::error::{DeviceError, RadioError};
use crate::lifecycle::Lifecycle;
use crate::radio::{BucketKey, Packet, RadioDomain, RadioNotifier, SendReport, MAX_POWER};

/// Highest radio channel
pub const MAX_CHANNEL: u8 = 83;
/// Longest configurable radio payload
pub const MAX_RADIO_LENGTH: u8 = 251;
/// Supported radio data rates in kbit/s
pub const DATA_RATES: [u16; 3] = [250, 1000, 2000];
/// Supported accelerometer ranges in g
pub const ACCELEROMETER_RANGES: [u8; 3] = [2, 4, 8];
/// Accepted temperature range in degrees Celsius
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<i16> = -40..=105;
/// Gestures kept before the oldest is dropped
pub const GESTURE_HISTORY: usize = 32;

/// Power-on defaults of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Temperature after reset
    pub temperature: i16,
    /// Ambient light level after reset
    pub light_level: u8,
    /// Accelerometer range in g after reset
    pub accelerometer_range: u8,
    /// Radio settings after reset
    pub radio: RadioSettings,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            temperature: 20,
            light_level: 0,
            accelerometer_range: 2,
            radio: RadioSettings::default(),
        }
    }
}

/// Result of reading a button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ButtonReading {
    /// Currently held down
    pub pressed: bool,
    /// Pressed at least once since the last read
    pub was_pressed: bool,
    /// Presses since the last read
    pub presses: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct ButtonState {
    pressed: bool,
    was_pressed: bool,
    presses: u16,
}

impl ButtonState {
    /// Returns true on a released -> pressed edge
    fn press(&mut self) -> bool {
        if self.pressed {
            return false;
        }
        self.pressed = true;
        self.was_pressed = true;
        self.presses = self.presses.saturating_add(1);
        true
    }

    fn release(&mut self) {
        self.pressed = false;
    }

    /// Read and clear the edge counters
    fn take(&mut self) -> ButtonReading {
        let reading = ButtonReading {
            pressed: self.pressed,
            was_pressed: self.was_pressed,
            presses: self.presses,
        };
        self.was_pressed = false;
        self.presses = 0;
        reading
    }
}

/// Accelerometer reading in milli-g
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerometerReading {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub gesture: Gesture,
}

#[derive(Debug, Clone)]
struct Accelerometer {
    reading: AccelerometerReading,
    range_g: u8,
    /// Gestures seen since the last drain, oldest first
    history: VecDeque<Gesture>,
}

impl Accelerometer {
    fn new(range_g: u8) -> Self {
        Self {
            reading: AccelerometerReading::default(),
            range_g,
            history: VecDeque::new(),
        }
    }

    fn record(&mut self, gesture: Gesture) {
        self.reading.gesture = gesture;
        if gesture == Gesture::None {
            return;
        }
        if self.history.len() == GESTURE_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(gesture);
    }

    fn limit(&self) -> i16 {
        i16::from(self.range_g) * 1000
    }

    fn set_vector(&mut self, x: i16, y: i16, z: i16) {
        let limit = self.limit();
        self.reading.x = x.clamp(-limit, limit);
        self.reading.y = y.clamp(-limit, limit);
        self.reading.z = z.clamp(-limit, limit);
    }
}

#[derive(Debug, Clone, Copy)]
struct RadioState {
    settings: RadioSettings,
    enabled: bool,
}

/// One simulated board
pub struct Device {
    id: DeviceId,
    config: DeviceConfig,
    lifecycle: Lifecycle,
    clock: VirtualClock,
    /// Clock reading at the last reset; running time counts from here
    boot_micros: u64,
    display: Grid,
    display_on: bool,
    light_level: u8,
    buttons: [ButtonState; 2],
    accelerometer: Accelerometer,
    temperature: i16,
    radio: RadioState,
    domain: Arc<RadioDomain>,
    notifier: Option<RadioNotifier>,
}

impl Device {
    /// Create a device in the `Reset` state
    ///
    /// `notifier` receives a notice for each packet queued at this device.
    pub fn new(
        id: DeviceId,
        config: DeviceConfig,
        domain: Arc<RadioDomain>,
        notifier: Option<RadioNotifier>,
    ) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::Reset,
            clock: VirtualClock::new(),
            boot_micros: 0,
            display: Grid::display(),
            display_on: true,
            light_level: config.light_level,
            buttons: [ButtonState::default(); 2],
            accelerometer: Accelerometer::new(config.accelerometer_range),
            temperature: config.temperature,
            radio: RadioState {
                settings: config.radio,
                enabled: false,
            },
            config,
            domain,
            notifier,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Complete a pending reset
    pub fn finish_reset(&mut self) {
        self.lifecycle = self.lifecycle.finish_reset();
    }

    /// Current simulated time
    pub fn now_micros(&self) -> u64 {
        self.clock.now_micros()
    }

    /// Point-in-time view for observers
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            lifecycle: self.lifecycle.kind(),
            panic_code: match self.lifecycle {
                Lifecycle::Panicked { code } => code,
                _ => 0,
            },
            display: self.display.clone(),
            display_on: self.display_on,
            temperature: self.temperature,
            running_time_micros: self.running_micros(),
            radio_on: self.radio.enabled,
            radio: self.radio.settings,
            accelerometer_range: self.accelerometer.range_g,
            acceleration: [
                self.accelerometer.reading.x,
                self.accelerometer.reading.y,
                self.accelerometer.reading.z,
            ],
            gesture: self.accelerometer.reading.gesture,
        }
    }

    fn ensure_operable(&self, operation: &'static str) -> Result<(), DeviceError> {
        if self.lifecycle.is_operable() {
            Ok(())
        } else {
            Err(self.lifecycle.reject(operation))
        }
    }

    fn running_micros(&self) -> u64 {
        self.clock.now_micros().saturating_sub(self.boot_micros)
    }

    // ---- display ----

    /// Replace the whole display buffer
    pub fn display_write(&mut self, grid: Grid) -> Result<(), DeviceError> {
        self.ensure_operable("display write")?;
        if grid.rows() != DISPLAY_SIZE || grid.cols() != DISPLAY_SIZE {
            return Err(DeviceError::validation(format!(
                "display is {0}x{0}, got {1}x{2}",
                DISPLAY_SIZE,
                grid.rows(),
                grid.cols()
            )));
        }
        if let Some(bad) = grid.cells().iter().find(|&&c| c > MAX_BRIGHTNESS) {
            return Err(DeviceError::validation(format!(
                "brightness {} outside 0-{}",
                bad, MAX_BRIGHTNESS
            )));
        }
        self.display = grid;
        Ok(())
    }

    pub fn set_pixel(&mut self, x: u8, y: u8, value: u8) -> Result<(), DeviceError> {
        self.ensure_operable("set pixel")?;
        check_coordinates(x, y)?;
        if value > MAX_BRIGHTNESS {
            return Err(DeviceError::validation(format!(
                "brightness {} outside 0-{}",
                value, MAX_BRIGHTNESS
            )));
        }
        self.display.set(x, y, value);
        Ok(())
    }

    pub fn get_pixel(&self, x: u8, y: u8) -> Result<u8, DeviceError> {
        self.ensure_operable("get pixel")?;
        check_coordinates(x, y)?;
        Ok(self.display.get(x, y).unwrap_or(0))
    }

    pub fn display_clear(&mut self) -> Result<(), DeviceError> {
        self.ensure_operable("display clear")?;
        self.display.clear();
        Ok(())
    }

    /// Switch the LED matrix on or off; the buffer is kept either way
    pub fn set_display_on(&mut self, on: bool) -> Result<(), DeviceError> {
        self.ensure_operable(if on { "display on" } else { "display off" })?;
        self.display_on = on;
        Ok(())
    }

    pub fn display(&self) -> &Grid {
        &self.display
    }

    pub fn read_light_level(&self) -> Result<u8, DeviceError> {
        self.ensure_operable("read light level")?;
        Ok(self.light_level)
    }

    // ---- buttons ----

    /// Read a button and clear its edge counters
    pub fn button_read(&mut self, button: Button) -> Result<ButtonReading, DeviceError> {
        self.ensure_operable("button read")?;
        Ok(self.buttons[button_index(button)].take())
    }

    // ---- accelerometer ----

    pub fn accelerometer(&self) -> Result<AccelerometerReading, DeviceError> {
        self.ensure_operable("accelerometer read")?;
        Ok(self.accelerometer.reading)
    }

    /// Change the measuring range; current values are clamped to it
    pub fn set_accelerometer_range(&mut self, g: u8) -> Result<(), DeviceError> {
        self.ensure_operable("accelerometer set range")?;
        if !ACCELEROMETER_RANGES.contains(&g) {
            return Err(DeviceError::validation(format!(
                "accelerometer range {}g not one of {:?}",
                g, ACCELEROMETER_RANGES
            )));
        }
        self.accelerometer.range_g = g;
        let AccelerometerReading { x, y, z, .. } = self.accelerometer.reading;
        self.accelerometer.set_vector(x, y, z);
        Ok(())
    }

    /// Gestures recorded since the history was last drained, oldest first
    ///
    /// With `drain` the history is cleared, as `get_gestures` does on the
    /// board; without it this backs `was_gesture`.
    pub fn gestures(&mut self, drain: bool) -> Result<Vec<Gesture>, DeviceError> {
        self.ensure_operable("accelerometer gestures")?;
        let list = if drain {
            self.accelerometer.history.drain(..).collect()
        } else {
            self.accelerometer.history.iter().copied().collect()
        };
        Ok(list)
    }

    // ---- temperature ----

    pub fn temperature(&self) -> Result<i16, DeviceError> {
        self.ensure_operable("temperature read")?;
        Ok(self.temperature)
    }

    pub fn set_temperature(&mut self, value: i16) -> Result<(), DeviceError> {
        self.ensure_operable("temperature set")?;
        self.temperature = check_temperature(value)?;
        Ok(())
    }

    // ---- radio ----

    /// Apply radio settings, switching the radio on
    pub fn configure_radio(&mut self, settings: RadioSettings) -> Result<(), DeviceError> {
        self.ensure_operable("radio configure")?;
        check_radio_settings(&settings)?;
        self.radio.settings = settings;
        self.radio.enabled = true;
        self.join_radio();
        Ok(())
    }

    pub fn radio_on(&mut self) -> Result<(), DeviceError> {
        self.ensure_operable("radio on")?;
        self.radio.enabled = true;
        self.join_radio();
        Ok(())
    }

    /// Switch the radio off; queued packets are discarded
    pub fn radio_off(&mut self) -> Result<(), DeviceError> {
        self.ensure_operable("radio off")?;
        self.radio.enabled = false;
        self.domain.leave(self.id);
        Ok(())
    }

    /// Restore default radio settings without changing on/off state
    pub fn radio_reset(&mut self) -> Result<(), DeviceError> {
        self.ensure_operable("radio reset")?;
        self.radio.settings = self.config.radio;
        if self.radio.enabled {
            self.join_radio();
        }
        Ok(())
    }

    pub fn radio_settings(&self) -> RadioSettings {
        self.radio.settings
    }

    pub fn radio_enabled(&self) -> bool {
        self.radio.enabled
    }

    /// Broadcast a payload to the device's bucket
    ///
    /// Returns `None` when the radio is off; the send is then a no-op.
    pub fn radio_send(&mut self, payload: &[u8]) -> Result<Option<SendReport>, DeviceError> {
        self.ensure_operable("radio send")?;
        if payload.len() > usize::from(self.radio.settings.length) {
            return Err(DeviceError::validation(format!(
                "payload of {} bytes exceeds radio length {}",
                payload.len(),
                self.radio.settings.length
            )));
        }
        if !self.radio.enabled {
            return Ok(None);
        }
        Ok(self.domain.send(
            self.id,
            payload,
            self.radio.settings.power,
            self.clock.now_micros(),
        ))
    }

    /// Oldest queued packet, if any
    pub fn radio_receive(&mut self) -> Result<Option<Packet>, DeviceError> {
        self.ensure_operable("radio receive")?;
        if !self.radio.enabled {
            return Ok(None);
        }
        Ok(self.domain.receive(self.id))
    }

    /// Move an attached radio to the current settings, or attach it
    fn join_radio(&self) {
        let key = BucketKey::from_settings(&self.radio.settings);
        let capacity = usize::from(self.radio.settings.queue);
        if let Err(RadioError::NotRegistered(_)) =
            self.domain
                .reconfigure(self.id, key, capacity, self.notifier.clone())
        {
            self.domain.join(self.id, key, capacity, self.notifier.clone());
        }
    }

    // ---- time ----

    /// Park the device until `millis` of simulated time have passed
    pub fn sleep(&mut self, millis: u32, request_seq: u64) -> Result<WakeToken, DeviceError> {
        if !matches!(self.lifecycle, Lifecycle::Running) {
            return Err(self.lifecycle.reject("sleep"));
        }
        let token = self.clock.sleep_for(u64::from(millis) * 1000);
        self.lifecycle = self.lifecycle.sleep(token, request_seq)?;
        debug!("{} sleeping {} ms", self.id, millis);
        Ok(token)
    }

    /// Deadline of the pending sleep, if any
    pub fn wake_deadline(&self) -> Option<u64> {
        match self.lifecycle {
            Lifecycle::Sleeping { .. } => self.clock.next_deadline(),
            _ => None,
        }
    }

    /// Advance simulated time on behalf of the user program
    ///
    /// Returns the request sequence of a sleep that completed.
    pub fn advance_time(&mut self, delta_micros: u64) -> Result<Option<u64>, DeviceError> {
        self.ensure_operable("advance time")?;
        Ok(self.tick(delta_micros))
    }

    /// Advance simulated time from an external source (wall-clock ticks)
    ///
    /// Applies in every lifecycle state. Returns the request sequence of a
    /// sleep that completed.
    pub fn tick(&mut self, delta_micros: u64) -> Option<u64> {
        let mut woke = None;
        for token in self.clock.advance(delta_micros) {
            if let Lifecycle::Sleeping { request_seq, .. } = self.lifecycle {
                let next = self.lifecycle.wake(token);
                if next != self.lifecycle {
                    self.lifecycle = next;
                    woke = Some(request_seq);
                }
            }
        }
        woke
    }

    /// Jump straight to the pending sleep deadline
    pub fn run_until_wake(&mut self) -> Option<u64> {
        let deadline = self.wake_deadline()?;
        let delta = deadline.saturating_sub(self.clock.now_micros());
        self.tick(delta)
    }

    /// Microseconds since the last reset
    pub fn running_time(&self) -> Result<u64, DeviceError> {
        self.ensure_operable("running time")?;
        Ok(self.running_micros())
    }

    // ---- lifecycle ----

    /// Halt the device until reset
    ///
    /// Outputs freeze and pending wakes are cancelled. Radio membership is
    /// kept. Returns the request sequence of an interrupted sleep.
    pub fn panic(&mut self, code: u8) -> Result<Option<u64>, DeviceError> {
        let interrupted = self.sleeping_request();
        self.lifecycle = self.lifecycle.panic(code)?;
        self.clock.cancel_all();
        info!("{} panicked with code {}", self.id, code);
        Ok(interrupted)
    }

    /// Re-initialize every peripheral and return to `Running`
    ///
    /// The clock keeps counting; running time restarts from zero. Returns
    /// the request sequence of an interrupted sleep.
    pub fn reset(&mut self) -> Option<u64> {
        let interrupted = self.sleeping_request();
        self.lifecycle = self.lifecycle.reset();

        self.clock.cancel_all();
        self.boot_micros = self.clock.now_micros();
        self.display.clear();
        self.display_on = true;
        self.light_level = self.config.light_level;
        self.buttons = [ButtonState::default(); 2];
        self.accelerometer = Accelerometer::new(self.config.accelerometer_range);
        self.temperature = self.config.temperature;
        self.radio = RadioState {
            settings: self.config.radio,
            enabled: false,
        };
        self.domain.leave(self.id);

        self.lifecycle = self.lifecycle.finish_reset();
        info!("{} reset", self.id);
        interrupted
    }

    fn sleeping_request(&self) -> Option<u64> {
        match self.lifecycle {
            Lifecycle::Sleeping { request_seq, .. } => Some(request_seq),
            _ => None,
        }
    }

    // ---- physical inputs ----

    /// Press a button; returns true on a new press edge
    pub fn press(&mut self, button: Button) -> bool {
        self.buttons[button_index(button)].press()
    }

    pub fn release(&mut self, button: Button) {
        self.buttons[button_index(button)].release();
    }

    /// Tilt the board; values clamp to the current range
    pub fn tilt(&mut self, x: i16, y: i16, z: i16) {
        self.accelerometer.set_vector(x, y, z);
    }

    /// Perform a gesture; anything but `None` also lands in the history
    pub fn gesture(&mut self, gesture: Gesture) {
        self.accelerometer.record(gesture);
    }

    pub fn set_light_level(&mut self, level: u8) {
        self.light_level = level;
    }

    /// Change the ambient temperature from outside the program
    pub fn set_ambient_temperature(&mut self, value: i16) -> Result<(), DeviceError> {
        self.temperature = check_temperature(value)?;
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.clock.cancel_all();
        self.domain.leave(self.id);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle)
            .field("now_micros", &self.clock.now_micros())
            .field("radio", &self.radio)
            .finish_non_exhaustive()
    }
}

fn button_index(button: Button) -> usize {
    match button {
        Button::A => 0,
        Button::B => 1,
    }
}

fn check_coordinates(x: u8, y: u8) -> Result<(), DeviceError> {
    if x >= DISPLAY_SIZE || y >= DISPLAY_SIZE {
        return Err(DeviceError::validation(format!(
            "pixel ({}, {}) outside {}x{} display",
            x, y, DISPLAY_SIZE, DISPLAY_SIZE
        )));
    }
    Ok(())
}

fn check_temperature(value: i16) -> Result<i16, DeviceError> {
    if !TEMPERATURE_RANGE.contains(&value) {
        return Err(DeviceError::validation(format!(
            "temperature {} outside {:?}",
            value, TEMPERATURE_RANGE
        )));
    }
    Ok(value)
}

fn check_radio_settings(settings: &RadioSettings) -> Result<(), DeviceError> {
    if settings.channel > MAX_CHANNEL {
        return Err(DeviceError::validation(format!(
            "channel {} outside 0-{}",
            settings.channel, MAX_CHANNEL
        )));
    }
    if settings.power > MAX_POWER {
        return Err(DeviceError::validation(format!(
            "power {} outside 0-{}",
            settings.power, MAX_POWER
        )));
    }
    if settings.length > MAX_RADIO_LENGTH {
        return Err(DeviceError::validation(format!(
            "length {} outside 0-{}",
            settings.length, MAX_RADIO_LENGTH
        )));
    }
    if !DATA_RATES.contains(&settings.data_rate) {
        return Err(DeviceError::validation(format!(
            "data rate {} not one of {:?}",
            settings.data_rate, DATA_RATES
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::RadioDomainConfig;
    use mbit_protocol::LifecycleKind;

    fn domain() -> Arc<RadioDomain> {
        Arc::new(RadioDomain::new(RadioDomainConfig::default()))
    }

    fn running(id: u32, domain: &Arc<RadioDomain>) -> Device {
        let mut device = Device::new(
            DeviceId(id),
            DeviceConfig::default(),
            Arc::clone(domain),
            None,
        );
        device.finish_reset();
        device
    }

    fn heart() -> Grid {
        Grid::parse_image("09090:99999:99999:09990:00900").unwrap()
    }

    #[test]
    fn test_starts_in_reset() {
        let device = Device::new(DeviceId(1), DeviceConfig::default(), domain(), None);
        assert_eq!(device.lifecycle(), Lifecycle::Reset);
        assert!(device.temperature().is_err());
    }

    #[test]
    fn test_display_last_write_wins() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.display_write(heart()).unwrap();
        let square = Grid::parse_image("99999:90009:90009:90009:99999").unwrap();
        device.display_write(square.clone()).unwrap();
        assert_eq!(device.display(), &square);
    }

    #[test]
    fn test_display_validation_does_not_mutate() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.display_write(heart()).unwrap();

        let bright = Grid::from_cells(5, 5, vec![10; 25]).unwrap();
        assert!(matches!(
            device.display_write(bright),
            Err(DeviceError::Validation(_))
        ));
        assert!(device.display_write(Grid::blank(3, 3)).is_err());
        assert!(device.set_pixel(5, 0, 1).is_err());
        assert!(device.set_pixel(0, 0, 12).is_err());
        assert_eq!(device.display(), &heart());
    }

    #[test]
    fn test_pixels() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.set_pixel(2, 3, 7).unwrap();
        assert_eq!(device.get_pixel(2, 3).unwrap(), 7);
        device.display_clear().unwrap();
        assert_eq!(device.get_pixel(2, 3).unwrap(), 0);
    }

    #[test]
    fn test_button_counters_consumed_by_read() {
        let domain = domain();
        let mut device = running(1, &domain);
        assert!(device.press(Button::A));
        assert!(!device.press(Button::A));
        device.release(Button::A);
        device.press(Button::A);

        let reading = device.button_read(Button::A).unwrap();
        assert_eq!(
            reading,
            ButtonReading {
                pressed: true,
                was_pressed: true,
                presses: 2
            }
        );
        let reading = device.button_read(Button::A).unwrap();
        assert!(reading.pressed);
        assert!(!reading.was_pressed);
        assert_eq!(reading.presses, 0);
        assert_eq!(device.button_read(Button::B).unwrap(), ButtonReading::default());
    }

    #[test]
    fn test_accelerometer_clamps_to_range() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.tilt(5000, -5000, 1000);
        let reading = device.accelerometer().unwrap();
        assert_eq!((reading.x, reading.y, reading.z), (2000, -2000, 1000));

        device.set_accelerometer_range(8).unwrap();
        device.tilt(5000, 0, 0);
        assert_eq!(device.accelerometer().unwrap().x, 5000);

        device.set_accelerometer_range(4).unwrap();
        assert_eq!(device.accelerometer().unwrap().x, 4000);
        assert!(device.set_accelerometer_range(3).is_err());

        device.gesture(Gesture::Shake);
        assert_eq!(device.accelerometer().unwrap().gesture, Gesture::Shake);
    }

    #[test]
    fn test_gesture_history() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.gesture(Gesture::Shake);
        device.gesture(Gesture::None);
        device.gesture(Gesture::Up);

        assert_eq!(device.gestures(false).unwrap(), vec![Gesture::Shake, Gesture::Up]);
        assert_eq!(device.gestures(true).unwrap(), vec![Gesture::Shake, Gesture::Up]);
        assert!(device.gestures(true).unwrap().is_empty());
        assert_eq!(device.accelerometer().unwrap().gesture, Gesture::Up);

        for _ in 0..GESTURE_HISTORY + 3 {
            device.gesture(Gesture::FaceUp);
        }
        device.gesture(Gesture::Freefall);
        let history = device.gestures(false).unwrap();
        assert_eq!(history.len(), GESTURE_HISTORY);
        assert_eq!(history.last(), Some(&Gesture::Freefall));

        device.reset();
        assert!(device.gestures(false).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_tracks_radio_and_accelerometer() {
        let domain = domain();
        let mut device = running(1, &domain);
        let before = device.snapshot();

        let mut settings = device.radio_settings();
        settings.channel = 12;
        device.configure_radio(settings).unwrap();
        let after = device.snapshot();
        assert_ne!(before, after);
        assert!(after.radio_on);
        assert_eq!(after.radio.channel, 12);

        device.set_accelerometer_range(8).unwrap();
        device.tilt(100, 200, 300);
        let snap = device.snapshot();
        assert_eq!(snap.accelerometer_range, 8);
        assert_eq!(snap.acceleration, [100, 200, 300]);

        device.radio_off().unwrap();
        assert!(!device.snapshot().radio_on);
    }

    #[test]
    fn test_configure_moves_bucket() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.radio_on().unwrap();
        let mut settings = device.radio_settings();
        settings.channel = 20;
        device.configure_radio(settings).unwrap();
        assert_eq!(domain.bucket_of(DeviceId(1)), Some(BucketKey::from_settings(&settings)));
    }

    #[test]
    fn test_temperature() {
        let domain = domain();
        let mut device = running(1, &domain);
        assert_eq!(device.temperature().unwrap(), 20);
        device.set_temperature(-5).unwrap();
        assert_eq!(device.temperature().unwrap(), -5);
        assert!(device.set_temperature(200).is_err());
        assert_eq!(device.temperature().unwrap(), -5);
    }

    #[test]
    fn test_radio_config_validation() {
        let domain = domain();
        let mut device = running(1, &domain);
        let bad = [
            RadioSettings {
                channel: 84,
                ..Default::default()
            },
            RadioSettings {
                power: 8,
                ..Default::default()
            },
            RadioSettings {
                length: 252,
                ..Default::default()
            },
            RadioSettings {
                data_rate: 500,
                ..Default::default()
            },
        ];
        for settings in bad {
            assert!(device.configure_radio(settings).is_err());
        }
        assert!(!device.radio_enabled());
        assert_eq!(domain.bucket_of(DeviceId(1)), None);
    }

    #[test]
    fn test_radio_between_devices() {
        let domain = domain();
        let mut a = running(1, &domain);
        let mut b = running(2, &domain);
        a.configure_radio(RadioSettings::default()).unwrap();
        b.configure_radio(RadioSettings::default()).unwrap();

        a.advance_time(1_500).unwrap();
        let report = a.radio_send(b"hi").unwrap().unwrap();
        assert_eq!(report.delivered, 1);

        let packet = b.radio_receive().unwrap().unwrap();
        assert_eq!(packet.payload, b"hi");
        assert_eq!(packet.timestamp_micros, 1_500);
        assert_eq!(packet.rssi, domain.config().rssi.rssi(6));
        assert!(b.radio_receive().unwrap().is_none());
    }

    #[test]
    fn test_radio_off_is_silent() {
        let domain = domain();
        let mut device = running(1, &domain);
        assert_eq!(device.radio_send(b"x").unwrap(), None);
        assert_eq!(device.radio_receive().unwrap(), None);
    }

    #[test]
    fn test_radio_payload_longer_than_length() {
        let domain = domain();
        let mut device = running(1, &domain);
        device
            .configure_radio(RadioSettings {
                length: 4,
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(
            device.radio_send(b"too long"),
            Err(DeviceError::Validation(_))
        ));
    }

    #[test]
    fn test_radio_off_leaves_bucket() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.radio_on().unwrap();
        assert!(domain.bucket_of(DeviceId(1)).is_some());
        device.radio_off().unwrap();
        assert!(domain.bucket_of(DeviceId(1)).is_none());
    }

    #[test]
    fn test_sleep_wakes_at_deadline() {
        let domain = domain();
        let mut device = running(1, &domain);
        let before = device.running_time().unwrap();

        device.sleep(100, 7).unwrap();
        assert_eq!(device.lifecycle().kind(), LifecycleKind::Sleeping);
        assert_eq!(device.wake_deadline(), Some(100_000));
        assert_eq!(device.tick(99_999), None);
        assert_eq!(device.tick(1), Some(7));
        assert_eq!(device.lifecycle(), Lifecycle::Running);

        let after = device.running_time().unwrap();
        assert!(after >= before + 100_000);
    }

    #[test]
    fn test_run_until_wake() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.sleep(0, 3).unwrap();
        assert_eq!(device.run_until_wake(), Some(3));
        assert_eq!(device.run_until_wake(), None);
    }

    #[test]
    fn test_panic_freezes_device() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.display_write(heart()).unwrap();
        device.radio_on().unwrap();
        device.panic(42).unwrap();

        assert!(matches!(
            device.display_write(Grid::display()),
            Err(DeviceError::InvalidState {
                state: LifecycleKind::Panicked,
                ..
            })
        ));
        assert!(device.radio_send(b"x").is_err());
        assert!(device.running_time().is_err());
        assert!(device.panic(1).is_err());
        assert_eq!(device.display(), &heart());
        assert_eq!(device.snapshot().panic_code, 42);
        // Membership survives the panic
        assert!(domain.bucket_of(DeviceId(1)).is_some());
    }

    #[test]
    fn test_reset_clears_state() {
        let domain = domain();
        let mut peer = running(2, &domain);
        let mut device = running(1, &domain);
        peer.radio_on().unwrap();
        device.radio_on().unwrap();
        peer.radio_send(b"queued").unwrap();

        device.display_write(heart()).unwrap();
        device.press(Button::B);
        device.set_temperature(30).unwrap();
        device.advance_time(5_000).unwrap();
        device.panic(1).unwrap();

        assert_eq!(device.reset(), None);
        assert_eq!(device.lifecycle(), Lifecycle::Running);
        assert!(device.display().is_blank());
        assert_eq!(device.button_read(Button::B).unwrap().presses, 0);
        assert_eq!(device.temperature().unwrap(), 20);
        assert_eq!(device.running_time().unwrap(), 0);
        assert_eq!(device.now_micros(), 5_000);
        assert!(!device.radio_enabled());
        assert_eq!(domain.queue_len(DeviceId(1)), 0);
    }

    #[test]
    fn test_reset_interrupts_sleep() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.sleep(1_000, 11).unwrap();
        assert_eq!(device.reset(), Some(11));
        assert_eq!(device.wake_deadline(), None);
        assert_eq!(device.tick(10_000_000), None);
    }

    #[test]
    fn test_drop_leaves_domain() {
        let domain = domain();
        let mut device = running(1, &domain);
        device.radio_on().unwrap();
        drop(device);
        assert_eq!(domain.bucket_of(DeviceId(1)), None);
        assert_eq!(domain.bucket_count(), 0);
    }
}
