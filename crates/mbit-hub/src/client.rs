//! Async client for a hub session
//!
//! [`DeviceClient`] is the library a user program links against: each call
//! sends one request and waits for its response. Unsolicited events that
//! arrive in between are buffered for [`DeviceClient::take_events`].

use std::collections::VecDeque;

use mbit_protocol::{
    encode, Button, DeviceId, Envelope, Event, FrameCodec, Gesture, Grid, MessageBody,
    RadioSettings, Request, Response,
};
use mbit_sim::{AccelerometerReading, ButtonReading};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::ClientError;

const READ_CHUNK: usize = 1024;

/// Packet returned by [`DeviceClient::radio_receive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub payload: Vec<u8>,
    pub rssi: i16,
    pub timestamp_micros: u64,
}

/// Client side of one session
pub struct DeviceClient<S> {
    stream: S,
    codec: FrameCodec,
    device_id: DeviceId,
    protocol_version: u8,
    next_seq: u64,
    events: VecDeque<Event>,
}

impl<S> DeviceClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wait for the server's `Hello` and learn the device id
    pub async fn connect(stream: S) -> Result<Self, ClientError> {
        let mut client = Self {
            stream,
            codec: FrameCodec::new(),
            device_id: DeviceId(0),
            protocol_version: 0,
            next_seq: 1,
            events: VecDeque::new(),
        };
        let hello = client.next_envelope().await?;
        match hello.body {
            MessageBody::Event(Event::Hello { device_id, version }) => {
                client.device_id = device_id;
                client.protocol_version = version;
                debug!("Connected as {} (protocol v{})", device_id, version);
                Ok(client)
            }
            other => Err(ClientError::Handshake(format!(
                "expected hello, got {:?}",
                other
            ))),
        }
    }

    /// Device assigned by the server
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Protocol version announced by the server
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// Send a request and map error responses to [`ClientError::Remote`]
    pub async fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        let seq = self.next_seq;
        match self.call_with_seq(seq, request).await? {
            Response::Error { code, message } => Err(ClientError::Remote { code, message }),
            response => Ok(response),
        }
    }

    /// Send a request with an explicit sequence number and return the raw
    /// response, error responses included
    pub async fn call_with_seq(
        &mut self,
        seq: u64,
        request: Request,
    ) -> Result<Response, ClientError> {
        self.next_seq = self.next_seq.max(seq.saturating_add(1));
        let name = request.name();
        let envelope = Envelope::request(self.device_id, seq, request);
        self.stream.write_all(&encode(&envelope)?).await?;
        self.stream.flush().await?;

        loop {
            let envelope = self.next_envelope().await?;
            match envelope.body {
                MessageBody::Event(event) => self.events.push_back(event),
                MessageBody::Response(response) if envelope.seq == seq => return Ok(response),
                MessageBody::Response(response) => {
                    return match response {
                        Response::Error { code, message } => {
                            Err(ClientError::Remote { code, message })
                        }
                        _ => Err(ClientError::SequenceMismatch {
                            expected: seq,
                            actual: envelope.seq,
                        }),
                    };
                }
                MessageBody::Request(other) => {
                    return Err(ClientError::UnexpectedResponse {
                        request: name,
                        response: format!("request frame {:?}", other),
                    })
                }
            }
        }
    }

    /// Write raw bytes to the transport
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next frame, whatever its kind
    pub async fn next_envelope(&mut self) -> Result<Envelope, ClientError> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.codec.next_frame() {
                return Ok(frame?);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            self.codec.push_bytes(&buf[..n]);
        }
    }

    /// Wait for the next unsolicited event
    pub async fn next_event(&mut self) -> Result<Event, ClientError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        loop {
            let envelope = self.next_envelope().await?;
            if let MessageBody::Event(event) = envelope.body {
                return Ok(event);
            }
        }
    }

    /// Drain events buffered so far
    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    async fn expect_ack(&mut self, request: Request) -> Result<(), ClientError> {
        let name = request.name();
        match self.call(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(name, other)),
        }
    }

    // ---- radio ----

    pub async fn radio_config(&mut self, settings: RadioSettings) -> Result<(), ClientError> {
        self.expect_ack(Request::Configure(settings)).await
    }

    pub async fn radio_on(&mut self) -> Result<(), ClientError> {
        self.expect_ack(Request::RadioOn).await
    }

    pub async fn radio_off(&mut self) -> Result<(), ClientError> {
        self.expect_ack(Request::RadioOff).await
    }

    pub async fn radio_reset(&mut self) -> Result<(), ClientError> {
        self.expect_ack(Request::RadioReset).await
    }

    pub async fn radio_send(&mut self, payload: impl Into<Vec<u8>>) -> Result<(), ClientError> {
        self.expect_ack(Request::RadioSend {
            payload: payload.into(),
        })
        .await
    }

    pub async fn radio_receive(&mut self) -> Result<Option<ReceivedPacket>, ClientError> {
        match self.call(Request::RadioReceive).await? {
            Response::Packet {
                payload,
                rssi,
                timestamp_micros,
            } => Ok(Some(ReceivedPacket {
                payload,
                rssi,
                timestamp_micros,
            })),
            Response::Empty => Ok(None),
            other => Err(unexpected("radio receive", other)),
        }
    }

    // ---- display ----

    pub async fn display_write(&mut self, grid: Grid) -> Result<(), ClientError> {
        self.expect_ack(Request::DisplayWrite { grid }).await
    }

    pub async fn set_pixel(&mut self, x: u8, y: u8, value: u8) -> Result<(), ClientError> {
        self.expect_ack(Request::DisplaySetPixel { x, y, value })
            .await
    }

    pub async fn get_pixel(&mut self, x: u8, y: u8) -> Result<u8, ClientError> {
        match self.call(Request::DisplayGetPixel { x, y }).await? {
            Response::Pixel { value } => Ok(value),
            other => Err(unexpected("get pixel", other)),
        }
    }

    pub async fn display_clear(&mut self) -> Result<(), ClientError> {
        self.expect_ack(Request::DisplayClear).await
    }

    pub async fn display_on(&mut self) -> Result<(), ClientError> {
        self.expect_ack(Request::DisplayOn).await
    }

    pub async fn display_off(&mut self) -> Result<(), ClientError> {
        self.expect_ack(Request::DisplayOff).await
    }

    pub async fn read_light_level(&mut self) -> Result<u8, ClientError> {
        match self.call(Request::DisplayReadLightLevel).await? {
            Response::LightLevel { level } => Ok(level),
            other => Err(unexpected("read light level", other)),
        }
    }

    // ---- sensors ----

    pub async fn button_read(&mut self, button: Button) -> Result<ButtonReading, ClientError> {
        match self
            .call(Request::ButtonRead {
                button: button.as_u8(),
            })
            .await?
        {
            Response::ButtonState {
                pressed,
                was_pressed,
                presses,
            } => Ok(ButtonReading {
                pressed,
                was_pressed,
                presses,
            }),
            other => Err(unexpected("button read", other)),
        }
    }

    pub async fn accelerometer(&mut self) -> Result<AccelerometerReading, ClientError> {
        match self.call(Request::AccelerometerRead).await? {
            Response::Accelerometer { x, y, z, gesture } => {
                Ok(AccelerometerReading { x, y, z, gesture })
            }
            other => Err(unexpected("accelerometer read", other)),
        }
    }

    pub async fn accelerometer_range(&mut self, g: u8) -> Result<(), ClientError> {
        self.expect_ack(Request::AccelerometerSetRange { g }).await
    }

    /// Gesture the board is currently in
    pub async fn current_gesture(&mut self) -> Result<Gesture, ClientError> {
        Ok(self.accelerometer().await?.gesture)
    }

    pub async fn is_gesture(&mut self, gesture: Gesture) -> Result<bool, ClientError> {
        Ok(self.current_gesture().await? == gesture)
    }

    /// Whether `gesture` happened since the history was last drained
    ///
    /// Leaves the history alone.
    pub async fn was_gesture(&mut self, gesture: Gesture) -> Result<bool, ClientError> {
        Ok(self.gesture_history(false).await?.contains(&gesture))
    }

    /// Drain the gesture history, oldest first
    pub async fn gestures(&mut self) -> Result<Vec<Gesture>, ClientError> {
        self.gesture_history(true).await
    }

    async fn gesture_history(&mut self, drain: bool) -> Result<Vec<Gesture>, ClientError> {
        match self.call(Request::AccelerometerGestures { drain }).await? {
            Response::Gestures { list } => Ok(list),
            other => Err(unexpected("accelerometer gestures", other)),
        }
    }

    pub async fn temperature(&mut self) -> Result<i16, ClientError> {
        match self.call(Request::TemperatureRead).await? {
            Response::Temperature { value } => Ok(value),
            other => Err(unexpected("temperature read", other)),
        }
    }

    pub async fn set_temperature(&mut self, value: i16) -> Result<(), ClientError> {
        self.expect_ack(Request::TemperatureSet { value }).await
    }

    // ---- time and lifecycle ----

    /// Sleep for `millis` of simulated time
    pub async fn sleep(&mut self, millis: u32) -> Result<(), ClientError> {
        self.expect_ack(Request::Sleep { millis }).await
    }

    pub async fn advance_time(&mut self, micros: u64) -> Result<(), ClientError> {
        self.expect_ack(Request::AdvanceTime { micros }).await
    }

    /// Microseconds since the last reset
    pub async fn running_time(&mut self) -> Result<u64, ClientError> {
        match self.call(Request::RunningTime).await? {
            Response::Micros { value } => Ok(value),
            other => Err(unexpected("running time", other)),
        }
    }

    pub async fn panic(&mut self, code: u8) -> Result<(), ClientError> {
        self.expect_ack(Request::Panic { code }).await
    }

    pub async fn reset(&mut self) -> Result<(), ClientError> {
        self.expect_ack(Request::Reset).await
    }
}

fn unexpected(request: &'static str, response: Response) -> ClientError {
    ClientError::UnexpectedResponse {
        request,
        response: format!("{:?}", response),
    }
}
