//! Wire envelope encoding
//!
//! # Format
//!
//! All integers are big-endian.
//!
//! ```text
//! version:u8 kind:u8 opcode:u8 device_id:u32 seq:u64 payload_len:u16 payload
//! ```
//!
//! Payload layouts are fixed per opcode. Byte strings and text carry a
//! `u16` length prefix, booleans are encoded as `0`/`1`. Because every layout
//! is canonical, `encode(decode(bytes)) == bytes` holds for any frame that
//! decodes.

use crate::error::{DecodeError, EncodeError};
use crate::message::{
    Button, DeviceId, DeviceSnapshot, Envelope, ErrorCode, Event, Gesture, Grid, LifecycleKind,
    MessageBody, MessageKind, RadioSettings, Request, Response,
};

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed envelope header
pub const HEADER_LEN: usize = 17;

/// Largest payload a frame can carry
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Offset of the `payload_len` field inside the header
pub(crate) const PAYLOAD_LEN_OFFSET: usize = 15;

mod op {
    // Requests
    pub const CONFIGURE: u8 = 0x01;
    pub const RADIO_ON: u8 = 0x02;
    pub const RADIO_OFF: u8 = 0x03;
    pub const RADIO_RESET: u8 = 0x04;
    pub const DISPLAY_WRITE: u8 = 0x10;
    pub const DISPLAY_SET_PIXEL: u8 = 0x11;
    pub const DISPLAY_GET_PIXEL: u8 = 0x12;
    pub const DISPLAY_CLEAR: u8 = 0x13;
    pub const DISPLAY_ON: u8 = 0x14;
    pub const DISPLAY_OFF: u8 = 0x15;
    pub const DISPLAY_LIGHT_LEVEL: u8 = 0x16;
    pub const BUTTON_READ: u8 = 0x20;
    pub const ACCEL_READ: u8 = 0x21;
    pub const ACCEL_SET_RANGE: u8 = 0x22;
    pub const TEMPERATURE_READ: u8 = 0x23;
    pub const TEMPERATURE_SET: u8 = 0x24;
    pub const ACCEL_GESTURES: u8 = 0x25;
    pub const SLEEP: u8 = 0x30;
    pub const ADVANCE_TIME: u8 = 0x31;
    pub const RUNNING_TIME: u8 = 0x32;
    pub const RADIO_SEND: u8 = 0x40;
    pub const RADIO_RECEIVE: u8 = 0x41;
    pub const PANIC: u8 = 0x50;
    pub const RESET: u8 = 0x51;

    // Responses
    pub const ACK: u8 = 0x01;
    pub const BUTTON_STATE: u8 = 0x02;
    pub const ACCELEROMETER: u8 = 0x03;
    pub const TEMPERATURE: u8 = 0x04;
    pub const MICROS: u8 = 0x05;
    pub const PACKET: u8 = 0x06;
    pub const EMPTY: u8 = 0x07;
    pub const LIGHT_LEVEL: u8 = 0x08;
    pub const PIXEL: u8 = 0x09;
    pub const GESTURES: u8 = 0x0A;
    pub const ERROR: u8 = 0x7F;

    // Events
    pub const HELLO: u8 = 0x01;
    pub const RADIO_PACKET_ARRIVED: u8 = 0x02;
    pub const BUTTON_PRESSED: u8 = 0x03;
    pub const STATE_CHANGED: u8 = 0x04;
}

/// Encode an envelope to its wire format
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let mut payload = Writer::default();
    let opcode = match &envelope.body {
        MessageBody::Request(req) => encode_request(req, &mut payload)?,
        MessageBody::Response(resp) => encode_response(resp, &mut payload)?,
        MessageBody::Event(event) => encode_event(event, &mut payload)?,
    };

    let payload = payload.into_inner();
    let payload_len = u16::try_from(payload.len())
        .map_err(|_| EncodeError::PayloadTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(PROTOCOL_VERSION);
    frame.push(envelope.kind().as_u8());
    frame.push(opcode);
    frame.extend_from_slice(&envelope.device_id.0.to_be_bytes());
    frame.extend_from_slice(&envelope.seq.to_be_bytes());
    frame.extend_from_slice(&payload_len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode exactly one frame
///
/// The buffer must hold one complete frame and nothing else.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::malformed(format!(
            "frame too short: {} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let mut header = Reader::new(&bytes[..HEADER_LEN]);
    let version = header.u8()?;
    let kind_byte = header.u8()?;
    let opcode = header.u8()?;
    let device_id = DeviceId(header.u32()?);
    let seq = header.u64()?;
    let payload_len = header.u16()? as usize;

    if version != PROTOCOL_VERSION {
        return Err(DecodeError::SchemaVersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }

    let body = &bytes[HEADER_LEN..];
    if body.len() != payload_len {
        return Err(DecodeError::malformed(format!(
            "payload length mismatch: header says {}, got {}",
            payload_len,
            body.len()
        )));
    }

    let kind = MessageKind::from_u8(kind_byte).ok_or(DecodeError::UnknownKind {
        kind: kind_byte,
        opcode,
    })?;

    let mut reader = Reader::new(body);
    let body = match kind {
        MessageKind::Request => MessageBody::Request(decode_request(kind_byte, opcode, &mut reader)?),
        MessageKind::Response => {
            MessageBody::Response(decode_response(kind_byte, opcode, &mut reader)?)
        }
        MessageKind::Event => MessageBody::Event(decode_event(kind_byte, opcode, &mut reader)?),
    };
    reader.finish()?;

    Ok(Envelope {
        device_id,
        seq,
        body,
    })
}

fn encode_request(req: &Request, w: &mut Writer) -> Result<u8, EncodeError> {
    let opcode = match req {
        Request::Configure(settings) => {
            w.radio_settings(settings);
            op::CONFIGURE
        }
        Request::RadioOn => op::RADIO_ON,
        Request::RadioOff => op::RADIO_OFF,
        Request::RadioReset => op::RADIO_RESET,
        Request::DisplayWrite { grid } => {
            w.grid(grid);
            op::DISPLAY_WRITE
        }
        Request::DisplaySetPixel { x, y, value } => {
            w.u8(*x);
            w.u8(*y);
            w.u8(*value);
            op::DISPLAY_SET_PIXEL
        }
        Request::DisplayGetPixel { x, y } => {
            w.u8(*x);
            w.u8(*y);
            op::DISPLAY_GET_PIXEL
        }
        Request::DisplayClear => op::DISPLAY_CLEAR,
        Request::DisplayOn => op::DISPLAY_ON,
        Request::DisplayOff => op::DISPLAY_OFF,
        Request::DisplayReadLightLevel => op::DISPLAY_LIGHT_LEVEL,
        Request::ButtonRead { button } => {
            w.u8(*button);
            op::BUTTON_READ
        }
        Request::AccelerometerRead => op::ACCEL_READ,
        Request::AccelerometerSetRange { g } => {
            w.u8(*g);
            op::ACCEL_SET_RANGE
        }
        Request::AccelerometerGestures { drain } => {
            w.bool(*drain);
            op::ACCEL_GESTURES
        }
        Request::TemperatureRead => op::TEMPERATURE_READ,
        Request::TemperatureSet { value } => {
            w.i16(*value);
            op::TEMPERATURE_SET
        }
        Request::Sleep { millis } => {
            w.u32(*millis);
            op::SLEEP
        }
        Request::AdvanceTime { micros } => {
            w.u64(*micros);
            op::ADVANCE_TIME
        }
        Request::RunningTime => op::RUNNING_TIME,
        Request::RadioSend { payload } => {
            w.bytes(payload)?;
            op::RADIO_SEND
        }
        Request::RadioReceive => op::RADIO_RECEIVE,
        Request::Panic { code } => {
            w.u8(*code);
            op::PANIC
        }
        Request::Reset => op::RESET,
    };
    Ok(opcode)
}

fn decode_request(kind: u8, opcode: u8, r: &mut Reader<'_>) -> Result<Request, DecodeError> {
    let req = match opcode {
        op::CONFIGURE => Request::Configure(r.radio_settings()?),
        op::RADIO_ON => Request::RadioOn,
        op::RADIO_OFF => Request::RadioOff,
        op::RADIO_RESET => Request::RadioReset,
        op::DISPLAY_WRITE => Request::DisplayWrite { grid: r.grid()? },
        op::DISPLAY_SET_PIXEL => Request::DisplaySetPixel {
            x: r.u8()?,
            y: r.u8()?,
            value: r.u8()?,
        },
        op::DISPLAY_GET_PIXEL => Request::DisplayGetPixel {
            x: r.u8()?,
            y: r.u8()?,
        },
        op::DISPLAY_CLEAR => Request::DisplayClear,
        op::DISPLAY_ON => Request::DisplayOn,
        op::DISPLAY_OFF => Request::DisplayOff,
        op::DISPLAY_LIGHT_LEVEL => Request::DisplayReadLightLevel,
        op::BUTTON_READ => Request::ButtonRead { button: r.u8()? },
        op::ACCEL_READ => Request::AccelerometerRead,
        op::ACCEL_SET_RANGE => Request::AccelerometerSetRange { g: r.u8()? },
        op::ACCEL_GESTURES => Request::AccelerometerGestures { drain: r.bool()? },
        op::TEMPERATURE_READ => Request::TemperatureRead,
        op::TEMPERATURE_SET => Request::TemperatureSet { value: r.i16()? },
        op::SLEEP => Request::Sleep { millis: r.u32()? },
        op::ADVANCE_TIME => Request::AdvanceTime { micros: r.u64()? },
        op::RUNNING_TIME => Request::RunningTime,
        op::RADIO_SEND => Request::RadioSend { payload: r.bytes()? },
        op::RADIO_RECEIVE => Request::RadioReceive,
        op::PANIC => Request::Panic { code: r.u8()? },
        op::RESET => Request::Reset,
        _ => return Err(DecodeError::UnknownKind { kind, opcode }),
    };
    Ok(req)
}

fn encode_response(resp: &Response, w: &mut Writer) -> Result<u8, EncodeError> {
    let opcode = match resp {
        Response::Ack => op::ACK,
        Response::ButtonState {
            pressed,
            was_pressed,
            presses,
        } => {
            w.bool(*pressed);
            w.bool(*was_pressed);
            w.u16(*presses);
            op::BUTTON_STATE
        }
        Response::Accelerometer { x, y, z, gesture } => {
            w.i16(*x);
            w.i16(*y);
            w.i16(*z);
            w.u8(gesture.as_u8());
            op::ACCELEROMETER
        }
        Response::Temperature { value } => {
            w.i16(*value);
            op::TEMPERATURE
        }
        Response::Micros { value } => {
            w.u64(*value);
            op::MICROS
        }
        Response::Packet {
            payload,
            rssi,
            timestamp_micros,
        } => {
            w.bytes(payload)?;
            w.i16(*rssi);
            w.u64(*timestamp_micros);
            op::PACKET
        }
        Response::Empty => op::EMPTY,
        Response::LightLevel { level } => {
            w.u8(*level);
            op::LIGHT_LEVEL
        }
        Response::Pixel { value } => {
            w.u8(*value);
            op::PIXEL
        }
        Response::Gestures { list } => {
            let count = u16::try_from(list.len())
                .map_err(|_| EncodeError::PayloadTooLarge(list.len()))?;
            w.u16(count);
            list.iter().for_each(|g| w.u8(g.as_u8()));
            op::GESTURES
        }
        Response::Error { code, message } => {
            w.u8(code.as_u8());
            w.bytes(message.as_bytes())?;
            op::ERROR
        }
    };
    Ok(opcode)
}

fn decode_response(kind: u8, opcode: u8, r: &mut Reader<'_>) -> Result<Response, DecodeError> {
    let resp = match opcode {
        op::ACK => Response::Ack,
        op::BUTTON_STATE => Response::ButtonState {
            pressed: r.bool()?,
            was_pressed: r.bool()?,
            presses: r.u16()?,
        },
        op::ACCELEROMETER => Response::Accelerometer {
            x: r.i16()?,
            y: r.i16()?,
            z: r.i16()?,
            gesture: r.gesture()?,
        },
        op::TEMPERATURE => Response::Temperature { value: r.i16()? },
        op::MICROS => Response::Micros { value: r.u64()? },
        op::PACKET => Response::Packet {
            payload: r.bytes()?,
            rssi: r.i16()?,
            timestamp_micros: r.u64()?,
        },
        op::EMPTY => Response::Empty,
        op::LIGHT_LEVEL => Response::LightLevel { level: r.u8()? },
        op::PIXEL => Response::Pixel { value: r.u8()? },
        op::GESTURES => {
            let count = r.u16()?;
            let list = (0..count)
                .map(|_| r.gesture())
                .collect::<Result<Vec<_>, _>>()?;
            Response::Gestures { list }
        }
        op::ERROR => {
            let raw = r.u8()?;
            let code = ErrorCode::from_u8(raw)
                .ok_or_else(|| DecodeError::malformed(format!("invalid error code {}", raw)))?;
            Response::Error {
                code,
                message: r.text()?,
            }
        }
        _ => return Err(DecodeError::UnknownKind { kind, opcode }),
    };
    Ok(resp)
}

fn encode_event(event: &Event, w: &mut Writer) -> Result<u8, EncodeError> {
    let opcode = match event {
        Event::Hello { device_id, version } => {
            w.u32(device_id.0);
            w.u8(*version);
            op::HELLO
        }
        Event::RadioPacketArrived { from, length } => {
            w.u32(from.0);
            w.u16(*length);
            op::RADIO_PACKET_ARRIVED
        }
        Event::ButtonPressed { button } => {
            w.u8(button.as_u8());
            op::BUTTON_PRESSED
        }
        Event::StateChanged(snapshot) => {
            w.u8(snapshot.lifecycle.as_u8());
            w.u8(snapshot.panic_code);
            w.grid(&snapshot.display);
            w.bool(snapshot.display_on);
            w.i16(snapshot.temperature);
            w.u64(snapshot.running_time_micros);
            w.bool(snapshot.radio_on);
            w.radio_settings(&snapshot.radio);
            w.u8(snapshot.accelerometer_range);
            snapshot.acceleration.iter().for_each(|v| w.i16(*v));
            w.u8(snapshot.gesture.as_u8());
            op::STATE_CHANGED
        }
    };
    Ok(opcode)
}

fn decode_event(kind: u8, opcode: u8, r: &mut Reader<'_>) -> Result<Event, DecodeError> {
    let event = match opcode {
        op::HELLO => Event::Hello {
            device_id: DeviceId(r.u32()?),
            version: r.u8()?,
        },
        op::RADIO_PACKET_ARRIVED => Event::RadioPacketArrived {
            from: DeviceId(r.u32()?),
            length: r.u16()?,
        },
        op::BUTTON_PRESSED => {
            let raw = r.u8()?;
            Event::ButtonPressed {
                button: Button::from_u8(raw)
                    .ok_or_else(|| DecodeError::malformed(format!("invalid button {}", raw)))?,
            }
        }
        op::STATE_CHANGED => {
            let raw = r.u8()?;
            let lifecycle = LifecycleKind::from_u8(raw)
                .ok_or_else(|| DecodeError::malformed(format!("invalid lifecycle {}", raw)))?;
            Event::StateChanged(DeviceSnapshot {
                lifecycle,
                panic_code: r.u8()?,
                display: r.grid()?,
                display_on: r.bool()?,
                temperature: r.i16()?,
                running_time_micros: r.u64()?,
                radio_on: r.bool()?,
                radio: r.radio_settings()?,
                accelerometer_range: r.u8()?,
                acceleration: [r.i16()?, r.i16()?, r.i16()?],
                gesture: r.gesture()?,
            })
        }
        _ => return Err(DecodeError::UnknownKind { kind, opcode }),
    };
    Ok(event)
}

/// Payload builder
#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let len = u16::try_from(data.len()).map_err(|_| EncodeError::PayloadTooLarge(data.len()))?;
        self.u16(len);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn grid(&mut self, grid: &Grid) {
        self.u8(grid.rows());
        self.u8(grid.cols());
        self.buf.extend_from_slice(grid.cells());
    }

    fn radio_settings(&mut self, s: &RadioSettings) {
        self.u8(s.channel);
        self.u8(s.group);
        self.u8(s.power);
        self.u32(s.address);
        self.u8(s.queue);
        self.u8(s.length);
        self.u16(s.data_rate);
    }
}

/// Bounds-checked payload cursor
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        let Some(end) = end else {
            return Err(DecodeError::malformed(format!(
                "truncated payload: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len() - self.pos
            )));
        };
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::malformed(format!("invalid boolean {}", other))),
        }
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn text(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.bytes()?)
            .map_err(|e| DecodeError::malformed(format!("invalid UTF-8 text: {}", e)))
    }

    fn grid(&mut self) -> Result<Grid, DecodeError> {
        let rows = self.u8()?;
        let cols = self.u8()?;
        let cells = self.take(rows as usize * cols as usize)?.to_vec();
        Grid::from_cells(rows, cols, cells)
            .ok_or_else(|| DecodeError::malformed("grid cell count mismatch"))
    }

    fn radio_settings(&mut self) -> Result<RadioSettings, DecodeError> {
        Ok(RadioSettings {
            channel: self.u8()?,
            group: self.u8()?,
            power: self.u8()?,
            address: self.u32()?,
            queue: self.u8()?,
            length: self.u8()?,
            data_rate: self.u16()?,
        })
    }

    fn gesture(&mut self) -> Result<Gesture, DecodeError> {
        let raw = self.u8()?;
        Gesture::from_u8(raw)
            .ok_or_else(|| DecodeError::malformed(format!("invalid gesture {}", raw)))
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.pos != self.buf.len() {
            return Err(DecodeError::malformed(format!(
                "{} trailing payload bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
