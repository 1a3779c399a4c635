//! Session actor
//!
//! Each connected client gets one task that owns its [`Device`]. The task is
//! the only code that touches the device, so requests against it are handled
//! strictly one at a time and answered in arrival order. The task uses a
//! select! loop to:
//! - Read request frames from the client stream
//! - Apply input injected from outside (buttons, sensors, reset)
//! - Forward radio arrival notices as events
//! - Follow the shared wall-clock ticker in real-time mode
//!
//! A sleeping device parks its sleep request. Later requests are held back
//! until the wake fires, while input, radio notices and ticks keep flowing.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use mbit_protocol::{
    encode, Button, DecodeError, DeviceId, DeviceSnapshot, Envelope, ErrorCode, Event, FrameCodec,
    MessageBody, Request, Response, PROTOCOL_VERSION,
};
use mbit_sim::{Device, DeviceConfig, DeviceError, Lifecycle, RadioDomain, RadioNotice};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, WriteHalf};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{SessionConfig, TimeMode};
use crate::events::{CloseReason, InputEvent, SessionId, SessionStats, SimEvent};

const READ_CHUNK: usize = 1024;

/// Commands that can be sent to a session task
#[derive(Debug, Clone)]
pub(crate) enum SessionCommand {
    /// Apply a physical input to the device
    Input(InputEvent),
    /// End this session
    Terminate,
    /// The hub is going away
    Shutdown,
}

/// Everything a session task takes from the hub
pub(crate) struct SessionContext {
    pub session: SessionId,
    pub device: DeviceId,
    pub config: SessionConfig,
    pub device_config: DeviceConfig,
    pub time_mode: TimeMode,
    pub domain: Arc<RadioDomain>,
    pub events: broadcast::Sender<SimEvent>,
    /// Elapsed wall-clock micros published by the ticker (real-time mode)
    pub ticks: Option<watch::Receiver<u64>>,
}

struct Session<S> {
    ctx: SessionContext,
    device: Device,
    writer: BufWriter<WriteHalf<S>>,
    codec: FrameCodec,
    /// Highest request sequence accepted so far
    last_seq: u64,
    /// Sequence of the last event pushed to the client
    event_seq: u64,
    /// Requests that arrived while the device was asleep
    pending: VecDeque<(u64, Request)>,
    stats: SessionStats,
}

/// Run a session until the client leaves, the transport fails or the hub
/// asks it to stop
///
/// The device is torn down before this returns: wakes are cancelled and the
/// radio membership is dropped.
pub(crate) async fn run_session<S>(
    stream: S,
    mut ctx: SessionContext,
    cmd_rx: mpsc::Receiver<SessionCommand>,
) -> (CloseReason, SessionStats)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    let (notice_tx, notice_rx) = mpsc::channel(ctx.domain.config().notify_buffer);
    let ticks = ctx.ticks.take();

    let mut device = Device::new(
        ctx.device,
        ctx.device_config.clone(),
        Arc::clone(&ctx.domain),
        Some(notice_tx),
    );
    device.finish_reset();

    let mut session = Session {
        writer: BufWriter::with_capacity(ctx.config.outbound_buffer, writer),
        ctx,
        device,
        codec: FrameCodec::new(),
        last_seq: 0,
        event_seq: 0,
        pending: VecDeque::new(),
        stats: SessionStats::default(),
    };

    info!(
        "Starting {} for {}",
        session.ctx.session, session.ctx.device
    );

    let reason = match session.start().await {
        Ok(()) => session.run(reader, cmd_rx, notice_rx, ticks).await,
        Err(e) => CloseReason::TransportFailure(e.to_string()),
    };

    info!(
        "{} ended ({:?}): {} requests, {} decode failures, {} protocol errors",
        session.ctx.session,
        reason,
        session.stats.requests,
        session.stats.decode_failures,
        session.stats.protocol_errors
    );
    (reason, session.stats)
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    async fn start(&mut self) -> io::Result<()> {
        let device_id = self.ctx.device;
        self.push_event(Event::Hello {
            device_id,
            version: PROTOCOL_VERSION,
        })
        .await?;
        self.emit(SimEvent::StateChanged {
            session: self.ctx.session,
            device: device_id,
            snapshot: self.device.snapshot(),
        });
        self.writer.flush().await
    }

    async fn run(
        &mut self,
        mut reader: tokio::io::ReadHalf<S>,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut notice_rx: mpsc::Receiver<RadioNotice>,
        mut ticks: Option<watch::Receiver<u64>>,
    ) -> CloseReason {
        let mut buf = [0u8; READ_CHUNK];
        let mut tick_base = ticks.as_ref().map(|rx| *rx.borrow()).unwrap_or(0);

        loop {
            let step = tokio::select! {
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            debug!("{} stream closed", self.ctx.session);
                            break CloseReason::CleanDisconnect;
                        }
                        Ok(n) => self.on_bytes(&buf[..n]).await,
                        Err(e) => {
                            warn!("{} stream error: {}", self.ctx.session, e);
                            break CloseReason::TransportFailure(e.to_string());
                        }
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Input(input)) => self.on_input(input).await,
                        Some(SessionCommand::Terminate) => {
                            info!("Terminate requested for {}", self.ctx.session);
                            break CloseReason::Terminated;
                        }
                        Some(SessionCommand::Shutdown) | None => break CloseReason::Shutdown,
                    }
                }

                Some(notice) = notice_rx.recv() => self.on_radio_notice(notice).await,

                elapsed = next_tick(&mut ticks) => {
                    match elapsed {
                        Some(now) => {
                            let delta = now.saturating_sub(tick_base);
                            tick_base = now;
                            self.on_tick(delta).await
                        }
                        None => {
                            debug!("{} ticker stopped", self.ctx.session);
                            ticks = None;
                            Ok(())
                        }
                    }
                }
            };

            let flushed = match step {
                Ok(()) => self.writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = flushed {
                warn!("{} write failed: {}", self.ctx.session, e);
                break CloseReason::TransportFailure(e.to_string());
            }
        }
    }

    // ---- inbound frames ----

    async fn on_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.codec.push_bytes(data);
        while let Some(frame) = self.codec.next_frame() {
            match frame {
                Ok(envelope) => self.on_envelope(envelope).await?,
                Err(e) => self.on_decode_error(e).await?,
            }
        }
        Ok(())
    }

    async fn on_decode_error(&mut self, error: DecodeError) -> io::Result<()> {
        self.stats.decode_failures += 1;
        warn!("{} dropped undecodable frame: {}", self.ctx.session, error);
        self.emit(SimEvent::DecodeFailure {
            session: self.ctx.session,
            message: error.to_string(),
        });
        // No sequence number can be trusted from a bad frame
        self.respond(0, Response::error(ErrorCode::Decode, error.to_string()))
            .await
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> io::Result<()> {
        let kind = envelope.kind();
        let Envelope {
            device_id,
            seq,
            body,
        } = envelope;

        if device_id != self.ctx.device {
            return self
                .protocol_error(seq, format!("{} is not attached to this session", device_id))
                .await;
        }
        let MessageBody::Request(request) = body else {
            return self
                .protocol_error(seq, format!("clients may only send requests, got {:?}", kind))
                .await;
        };
        if seq <= self.last_seq {
            return self
                .protocol_error(
                    seq,
                    format!("sequence {} not greater than {}", seq, self.last_seq),
                )
                .await;
        }
        self.last_seq = seq;

        if matches!(self.device.lifecycle(), Lifecycle::Sleeping { .. }) {
            if self.pending.len() >= self.ctx.config.max_pending_requests {
                return self
                    .protocol_error(seq, "too many requests while sleeping".to_string())
                    .await;
            }
            debug!(
                "{} holding #{} {} until wake",
                self.ctx.device,
                seq,
                request.name()
            );
            self.pending.push_back((seq, request));
            return Ok(());
        }

        self.dispatch(seq, request).await
    }

    async fn protocol_error(&mut self, seq: u64, message: String) -> io::Result<()> {
        self.stats.protocol_errors += 1;
        warn!("{} protocol error: {}", self.ctx.session, message);
        self.respond(seq, Response::error(ErrorCode::Protocol, message))
            .await
    }

    // ---- requests ----

    async fn dispatch(&mut self, seq: u64, request: Request) -> io::Result<()> {
        self.stats.requests += 1;
        debug!("{} <- #{} {}", self.ctx.device, seq, request.name());

        let before = self.device.snapshot();
        let mutating = request.is_mutating();
        let (reply, applied) = match self.apply(seq, request) {
            Ok(reply) => (reply, true),
            Err(e) => {
                debug!("{} #{} failed: {}", self.ctx.device, seq, e);
                (Some(Response::error(e.code(), e.to_string())), false)
            }
        };
        if let Some(response) = reply {
            self.respond(seq, response).await?;
        }
        if mutating && applied {
            self.publish_state(before).await
        } else {
            self.publish_changes(before).await
        }
    }

    /// Run one request against the device
    ///
    /// `Ok(None)` means the request is parked until the device wakes.
    fn apply(&mut self, seq: u64, request: Request) -> Result<Option<Response>, DeviceError> {
        let device = &mut self.device;
        let response = match request {
            Request::Configure(settings) => {
                device.configure_radio(settings)?;
                Response::Ack
            }
            Request::RadioOn => {
                device.radio_on()?;
                Response::Ack
            }
            Request::RadioOff => {
                device.radio_off()?;
                Response::Ack
            }
            Request::RadioReset => {
                device.radio_reset()?;
                Response::Ack
            }
            Request::DisplayWrite { grid } => {
                device.display_write(grid)?;
                Response::Ack
            }
            Request::DisplaySetPixel { x, y, value } => {
                device.set_pixel(x, y, value)?;
                Response::Ack
            }
            Request::DisplayGetPixel { x, y } => Response::Pixel {
                value: device.get_pixel(x, y)?,
            },
            Request::DisplayClear => {
                device.display_clear()?;
                Response::Ack
            }
            Request::DisplayOn => {
                device.set_display_on(true)?;
                Response::Ack
            }
            Request::DisplayOff => {
                device.set_display_on(false)?;
                Response::Ack
            }
            Request::DisplayReadLightLevel => Response::LightLevel {
                level: device.read_light_level()?,
            },
            Request::ButtonRead { button } => {
                let button = Button::from_u8(button)
                    .ok_or_else(|| DeviceError::Validation(format!("unknown button {}", button)))?;
                let reading = device.button_read(button)?;
                Response::ButtonState {
                    pressed: reading.pressed,
                    was_pressed: reading.was_pressed,
                    presses: reading.presses,
                }
            }
            Request::AccelerometerRead => {
                let reading = device.accelerometer()?;
                Response::Accelerometer {
                    x: reading.x,
                    y: reading.y,
                    z: reading.z,
                    gesture: reading.gesture,
                }
            }
            Request::AccelerometerSetRange { g } => {
                device.set_accelerometer_range(g)?;
                Response::Ack
            }
            Request::AccelerometerGestures { drain } => Response::Gestures {
                list: device.gestures(drain)?,
            },
            Request::TemperatureRead => Response::Temperature {
                value: device.temperature()?,
            },
            Request::TemperatureSet { value } => {
                device.set_temperature(value)?;
                Response::Ack
            }
            Request::Sleep { millis } => {
                device.sleep(millis, seq)?;
                let woke = match self.ctx.time_mode {
                    TimeMode::Virtual => device.run_until_wake(),
                    TimeMode::RealTime { .. } => device.tick(0),
                };
                if woke.is_none() {
                    return Ok(None);
                }
                Response::Ack
            }
            Request::AdvanceTime { micros } => {
                device.advance_time(micros)?;
                Response::Ack
            }
            Request::RunningTime => Response::Micros {
                value: device.running_time()?,
            },
            Request::RadioSend { payload } => {
                if let Some(report) = device.radio_send(&payload)? {
                    let _ = self.ctx.events.send(SimEvent::RadioTraffic {
                        from: self.ctx.device,
                        key: report.key,
                        length: payload.len(),
                        delivered: report.delivered,
                        dropped: report.dropped,
                    });
                }
                Response::Ack
            }
            Request::RadioReceive => match device.radio_receive()? {
                Some(packet) => Response::Packet {
                    payload: packet.payload,
                    rssi: packet.rssi,
                    timestamp_micros: packet.timestamp_micros,
                },
                None => Response::Empty,
            },
            Request::Panic { code } => {
                // Requests never reach a sleeping device, so no sleep is cut short
                device.panic(code)?;
                Response::Ack
            }
            Request::Reset => {
                device.reset();
                Response::Ack
            }
        };
        Ok(Some(response))
    }

    /// Answer requests held back during a sleep, stopping if the device
    /// goes back to sleep
    async fn drain_pending(&mut self) -> io::Result<()> {
        while !matches!(self.device.lifecycle(), Lifecycle::Sleeping { .. }) {
            let Some((seq, request)) = self.pending.pop_front() else {
                break;
            };
            self.dispatch(seq, request).await?;
        }
        Ok(())
    }

    // ---- other inputs ----

    async fn on_input(&mut self, input: InputEvent) -> io::Result<()> {
        debug!("{} input {:?}", self.ctx.device, input);
        let before = self.device.snapshot();
        match input {
            InputEvent::ButtonPress(button) => {
                if self.device.press(button) && self.device.lifecycle().is_operable() {
                    self.push_event(Event::ButtonPressed { button }).await?;
                }
            }
            InputEvent::ButtonRelease(button) => self.device.release(button),
            InputEvent::Accelerometer { x, y, z } => self.device.tilt(x, y, z),
            InputEvent::Gesture(gesture) => self.device.gesture(gesture),
            InputEvent::LightLevel(level) => self.device.set_light_level(level),
            InputEvent::Temperature(value) => {
                if let Err(e) = self.device.set_ambient_temperature(value) {
                    warn!("{} rejected input: {}", self.ctx.device, e);
                    self.emit(SimEvent::Error {
                        source: format!("{} input", self.ctx.device),
                        message: e.to_string(),
                    });
                }
            }
            InputEvent::Reset => {
                if let Some(seq) = self.device.reset() {
                    self.respond(
                        seq,
                        Response::error(ErrorCode::InvalidState, "sleep interrupted by reset"),
                    )
                    .await?;
                }
            }
        }
        self.publish_changes(before).await?;
        self.drain_pending().await
    }

    async fn on_radio_notice(&mut self, notice: RadioNotice) -> io::Result<()> {
        // A panicked board no longer reacts to traffic; the packet stays queued
        if !self.device.lifecycle().is_operable() {
            return Ok(());
        }
        self.push_event(Event::RadioPacketArrived {
            from: notice.from,
            length: notice.length,
        })
        .await
    }

    async fn on_tick(&mut self, delta_micros: u64) -> io::Result<()> {
        let before = matches!(self.device.lifecycle(), Lifecycle::Sleeping { .. })
            .then(|| self.device.snapshot());

        let Some(seq) = self.device.tick(delta_micros) else {
            return Ok(());
        };
        debug!("{} woke for #{}", self.ctx.device, seq);
        self.respond(seq, Response::Ack).await?;
        if let Some(before) = before {
            self.publish_changes(before).await?;
        }
        self.drain_pending().await
    }

    // ---- outbound ----

    /// Report device changes to observers, and lifecycle moves to the client
    async fn publish_changes(&mut self, before: DeviceSnapshot) -> io::Result<()> {
        if self.device.snapshot() == before {
            return Ok(());
        }
        self.publish_state(before).await
    }

    /// Tell observers the current state, even if nothing visible moved
    ///
    /// The client only hears about lifecycle transitions.
    async fn publish_state(&mut self, before: DeviceSnapshot) -> io::Result<()> {
        let after = self.device.snapshot();
        let lifecycle_changed = after.lifecycle != before.lifecycle;
        self.emit(SimEvent::StateChanged {
            session: self.ctx.session,
            device: self.ctx.device,
            snapshot: after.clone(),
        });
        if lifecycle_changed && self.ctx.config.client_state_events {
            self.push_event(Event::StateChanged(after)).await?;
        }
        Ok(())
    }

    async fn respond(&mut self, seq: u64, response: Response) -> io::Result<()> {
        self.send(Envelope::response(self.ctx.device, seq, response))
            .await
    }

    async fn push_event(&mut self, event: Event) -> io::Result<()> {
        self.event_seq += 1;
        self.send(Envelope::event(self.ctx.device, self.event_seq, event))
            .await
    }

    async fn send(&mut self, envelope: Envelope) -> io::Result<()> {
        match encode(&envelope) {
            Ok(bytes) => self.writer.write_all(&bytes).await,
            Err(e) => {
                warn!("{} could not encode outbound frame: {}", self.ctx.session, e);
                Ok(())
            }
        }
    }

    fn emit(&self, event: SimEvent) {
        // No subscribers is fine
        let _ = self.ctx.events.send(event);
    }
}

/// Wait for the next ticker value; never resolves without a ticker
async fn next_tick(ticks: &mut Option<watch::Receiver<u64>>) -> Option<u64> {
    match ticks {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
