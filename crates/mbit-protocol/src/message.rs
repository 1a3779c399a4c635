//! Protocol message model
//!
//! Every frame on the wire carries one [`Envelope`]. The body is one of the
//! three message kinds:
//!
//! - [`Request`]: a call from the client hosting the user program
//! - [`Response`]: the server's answer, echoing the request sequence number
//! - [`Event`]: an unsolicited notification pushed to the client

use std::fmt;

/// Display width and height of the LED matrix
pub const DISPLAY_SIZE: u8 = 5;

/// Highest LED brightness level
pub const MAX_BRIGHTNESS: u8 = 9;

/// Identifies one simulated board
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Get the raw id value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// One framed protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Device this message concerns
    pub device_id: DeviceId,
    /// Per-session sequence number
    pub seq: u64,
    /// Message payload
    pub body: MessageBody,
}

impl Envelope {
    /// Build a request envelope
    pub fn request(device_id: DeviceId, seq: u64, request: Request) -> Self {
        Self {
            device_id,
            seq,
            body: MessageBody::Request(request),
        }
    }

    /// Build a response envelope
    pub fn response(device_id: DeviceId, seq: u64, response: Response) -> Self {
        Self {
            device_id,
            seq,
            body: MessageBody::Response(response),
        }
    }

    /// Build an event envelope
    pub fn event(device_id: DeviceId, seq: u64, event: Event) -> Self {
        Self {
            device_id,
            seq,
            body: MessageBody::Event(event),
        }
    }

    /// The message kind carried by this envelope
    pub fn kind(&self) -> MessageKind {
        match self.body {
            MessageBody::Request(_) => MessageKind::Request,
            MessageBody::Response(_) => MessageKind::Response,
            MessageBody::Event(_) => MessageKind::Event,
        }
    }
}

/// The three message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

impl MessageKind {
    /// Wire value of this kind
    pub fn as_u8(self) -> u8 {
        match self {
            MessageKind::Request => 0x01,
            MessageKind::Response => 0x02,
            MessageKind::Event => 0x03,
        }
    }

    /// Parse a wire kind byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(MessageKind::Request),
            0x02 => Some(MessageKind::Response),
            0x03 => Some(MessageKind::Event),
            _ => None,
        }
    }
}

/// Envelope body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Request(Request),
    Response(Response),
    Event(Event),
}

/// A rows x cols matrix of LED brightness levels
///
/// The grid itself accepts any shape and value so that decoding never fails
/// on semantic grounds. The device only accepts 5x5 grids with values 0-9.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Grid {
    rows: u8,
    cols: u8,
    cells: Vec<u8>,
}

impl Grid {
    /// A grid with every LED off
    pub fn blank(rows: u8, cols: u8) -> Self {
        Self {
            rows,
            cols,
            cells: vec![0; rows as usize * cols as usize],
        }
    }

    /// A blank grid the size of the device display
    pub fn display() -> Self {
        Self::blank(DISPLAY_SIZE, DISPLAY_SIZE)
    }

    /// Build from row-major cells; `None` if the cell count does not match
    pub fn from_cells(rows: u8, cols: u8, cells: Vec<u8>) -> Option<Self> {
        if cells.len() != rows as usize * cols as usize {
            return None;
        }
        Some(Self { rows, cols, cells })
    }

    /// Build from a list of rows; `None` if the rows are ragged or too large
    pub fn from_rows(rows: &[Vec<u8>]) -> Option<Self> {
        let row_count = u8::try_from(rows.len()).ok()?;
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let col_count = u8::try_from(cols).ok()?;
        if rows.iter().any(|r| r.len() != cols) {
            return None;
        }
        Some(Self {
            rows: row_count,
            cols: col_count,
            cells: rows.concat(),
        })
    }

    /// Parse the `"09090:90909:..."` image notation used by micro:bit programs
    pub fn parse_image(image: &str) -> Option<Self> {
        let rows: Option<Vec<Vec<u8>>> = image
            .trim_end_matches(':')
            .split(':')
            .map(|row| {
                row.chars()
                    .map(|c| c.to_digit(10).map(|d| d as u8))
                    .collect()
            })
            .collect();
        Self::from_rows(&rows?)
    }

    /// Number of rows
    pub fn rows(&self) -> u8 {
        self.rows
    }

    /// Number of columns
    pub fn cols(&self) -> u8 {
        self.cols
    }

    /// Row-major cell values
    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    /// Brightness at column `x`, row `y`
    pub fn get(&self, x: u8, y: u8) -> Option<u8> {
        if x >= self.cols || y >= self.rows {
            return None;
        }
        self.cells
            .get(y as usize * self.cols as usize + x as usize)
            .copied()
    }

    /// Set brightness at column `x`, row `y`; returns false when out of bounds
    pub fn set(&mut self, x: u8, y: u8, value: u8) -> bool {
        if x >= self.cols || y >= self.rows {
            return false;
        }
        let idx = y as usize * self.cols as usize + x as usize;
        // A deserialized grid may carry fewer cells than rows x cols
        match self.cells.get_mut(idx) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    /// Turn every LED off
    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = 0);
    }

    /// True when every LED is off
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|&c| c == 0)
    }
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.cells.chunks(self.cols.max(1) as usize).enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            for cell in row {
                write!(f, "{}", cell)?;
            }
        }
        Ok(())
    }
}

/// Physical push buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Button {
    A,
    B,
}

impl Button {
    pub fn as_u8(self) -> u8 {
        match self {
            Button::A => 0,
            Button::B => 1,
        }
    }

    /// Button ids outside A/B are kept as raw bytes by the decoder
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Button::A),
            1 => Some(Button::B),
            _ => None,
        }
    }
}

/// Accelerometer gestures recognized by the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Gesture {
    #[default]
    None,
    Up,
    Down,
    Left,
    Right,
    FaceUp,
    FaceDown,
    Freefall,
    ThreeG,
    SixG,
    EightG,
    Shake,
}

impl Gesture {
    const ALL: [Gesture; 12] = [
        Gesture::None,
        Gesture::Up,
        Gesture::Down,
        Gesture::Left,
        Gesture::Right,
        Gesture::FaceUp,
        Gesture::FaceDown,
        Gesture::Freefall,
        Gesture::ThreeG,
        Gesture::SixG,
        Gesture::EightG,
        Gesture::Shake,
    ];

    pub fn as_u8(self) -> u8 {
        Self::ALL.iter().position(|g| *g == self).unwrap_or(0) as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Name as micro:bit programs spell it
    pub fn name(&self) -> &'static str {
        match self {
            Gesture::None => "",
            Gesture::Up => "up",
            Gesture::Down => "down",
            Gesture::Left => "left",
            Gesture::Right => "right",
            Gesture::FaceUp => "face up",
            Gesture::FaceDown => "face down",
            Gesture::Freefall => "freefall",
            Gesture::ThreeG => "3g",
            Gesture::SixG => "6g",
            Gesture::EightG => "8g",
            Gesture::Shake => "shake",
        }
    }
}

/// Device lifecycle as reported in snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LifecycleKind {
    Running,
    Sleeping,
    Panicked,
    Reset,
}

impl LifecycleKind {
    pub fn as_u8(self) -> u8 {
        match self {
            LifecycleKind::Running => 0,
            LifecycleKind::Sleeping => 1,
            LifecycleKind::Panicked => 2,
            LifecycleKind::Reset => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LifecycleKind::Running),
            1 => Some(LifecycleKind::Sleeping),
            2 => Some(LifecycleKind::Panicked),
            3 => Some(LifecycleKind::Reset),
            _ => None,
        }
    }
}

/// Point-in-time view of a device for observers and clients
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceSnapshot {
    /// Current lifecycle state
    pub lifecycle: LifecycleKind,
    /// Panic code (meaningful only while panicked)
    pub panic_code: u8,
    /// LED matrix contents
    pub display: Grid,
    /// Whether the display is switched on
    pub display_on: bool,
    /// Temperature in degrees Celsius
    pub temperature: i16,
    /// Virtual running time in microseconds
    pub running_time_micros: u64,
    /// Whether the radio is switched on
    pub radio_on: bool,
    /// Current radio settings
    pub radio: RadioSettings,
    /// Accelerometer range in g
    pub accelerometer_range: u8,
    /// Acceleration `[x, y, z]` in milli-g
    pub acceleration: [i16; 3],
    /// Current gesture
    pub gesture: Gesture,
}

/// Error categories reported back to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    /// Frame could not be decoded
    Decode,
    /// Sequence violation, unknown device or misdirected message
    Protocol,
    /// Operation not allowed in the device's current state
    InvalidState,
    /// Peripheral value out of range
    Validation,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ErrorCode::Decode => 1,
            ErrorCode::Protocol => 2,
            ErrorCode::InvalidState => 3,
            ErrorCode::Validation => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ErrorCode::Decode),
            2 => Some(ErrorCode::Protocol),
            3 => Some(ErrorCode::InvalidState),
            4 => Some(ErrorCode::Validation),
            _ => None,
        }
    }
}

/// Radio settings carried by [`Request::Configure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RadioSettings {
    /// Radio channel (0-83)
    pub channel: u8,
    /// Radio group (0-255)
    pub group: u8,
    /// Transmit power (0-7)
    pub power: u8,
    /// 32-bit radio address
    pub address: u32,
    /// Receive queue depth
    pub queue: u8,
    /// Maximum payload length in bytes
    pub length: u8,
    /// Data rate in kbit/s (250, 1000 or 2000)
    pub data_rate: u16,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            channel: 7,
            group: 0,
            power: 6,
            address: 0x7562_6974,
            queue: 3,
            length: 32,
            data_rate: 1000,
        }
    }
}

/// Client to server calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Configure the radio and join the matching broadcast bucket
    Configure(RadioSettings),
    /// Switch the radio on with its current settings
    RadioOn,
    /// Switch the radio off and leave the broadcast bucket
    RadioOff,
    /// Restore default radio settings
    RadioReset,
    /// Replace the whole display buffer
    DisplayWrite { grid: Grid },
    /// Set a single LED
    DisplaySetPixel { x: u8, y: u8, value: u8 },
    /// Read a single LED
    DisplayGetPixel { x: u8, y: u8 },
    DisplayClear,
    DisplayOn,
    DisplayOff,
    DisplayReadLightLevel,
    /// Read (and consume) a button's edge state
    ButtonRead { button: u8 },
    AccelerometerRead,
    /// Set accelerometer range in g
    AccelerometerSetRange { g: u8 },
    /// Gestures seen since the history was last drained
    AccelerometerGestures { drain: bool },
    TemperatureRead,
    TemperatureSet { value: i16 },
    /// Suspend until the virtual clock passes now + millis
    Sleep { millis: u32 },
    /// Move the virtual clock forward explicitly
    AdvanceTime { micros: u64 },
    RunningTime,
    /// Fire-and-forget broadcast
    RadioSend { payload: Vec<u8> },
    /// Pop the oldest queued packet
    RadioReceive,
    Panic { code: u8 },
    Reset,
}

impl Request {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Request::Configure(_) => "configure",
            Request::RadioOn => "radio_on",
            Request::RadioOff => "radio_off",
            Request::RadioReset => "radio_reset",
            Request::DisplayWrite { .. } => "display_write",
            Request::DisplaySetPixel { .. } => "display_set_pixel",
            Request::DisplayGetPixel { .. } => "display_get_pixel",
            Request::DisplayClear => "display_clear",
            Request::DisplayOn => "display_on",
            Request::DisplayOff => "display_off",
            Request::DisplayReadLightLevel => "display_read_light_level",
            Request::ButtonRead { .. } => "button_read",
            Request::AccelerometerRead => "accelerometer_read",
            Request::AccelerometerSetRange { .. } => "accelerometer_set_range",
            Request::AccelerometerGestures { .. } => "accelerometer_gestures",
            Request::TemperatureRead => "temperature_read",
            Request::TemperatureSet { .. } => "temperature_set",
            Request::Sleep { .. } => "sleep",
            Request::AdvanceTime { .. } => "advance_time",
            Request::RunningTime => "running_time",
            Request::RadioSend { .. } => "radio_send",
            Request::RadioReceive => "radio_receive",
            Request::Panic { .. } => "panic",
            Request::Reset => "reset",
        }
    }

    /// Check if the request can change device state
    ///
    /// Reads that consume something (button counters, queued packets,
    /// gesture history) count as mutating.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Request::DisplayGetPixel { .. }
                | Request::DisplayReadLightLevel
                | Request::AccelerometerRead
                | Request::AccelerometerGestures { drain: false }
                | Request::TemperatureRead
                | Request::RunningTime
        )
    }
}

/// Server answers to requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    ButtonState {
        pressed: bool,
        was_pressed: bool,
        presses: u16,
    },
    Accelerometer {
        x: i16,
        y: i16,
        z: i16,
        gesture: Gesture,
    },
    Temperature { value: i16 },
    Micros { value: u64 },
    Packet {
        payload: Vec<u8>,
        rssi: i16,
        timestamp_micros: u64,
    },
    Empty,
    LightLevel { level: u8 },
    Pixel { value: u8 },
    Gestures { list: Vec<Gesture> },
    Error { code: ErrorCode, message: String },
}

impl Response {
    /// Build an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    /// Check if this is an error response
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    /// Error category of an error response
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Response::Error { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Unsolicited server notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// First frame of every session
    Hello { device_id: DeviceId, version: u8 },
    /// A packet was queued for this device
    RadioPacketArrived { from: DeviceId, length: u16 },
    /// A button was pressed on the simulator front end
    ButtonPressed { button: Button },
    /// The device lifecycle changed
    StateChanged(DeviceSnapshot),
}
