//! The serial bus connection.
//!
//! The bus is half-duplex and shared by every inverter, so exactly one
//! transaction may be outstanding at a time. [`Transport::transact`] takes
//! `&mut self` to make that mutual exclusion structural: a second request
//! cannot be issued before the previous response (or its timeout) resolves.

use crate::protocol::{FrameCodec, Request, Response};
use futures::{SinkExt, StreamExt as _};
use std::path::PathBuf;
use tokio::time::Instant;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt as _, SerialStream, StopBits};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open serial device {1:?} for reading and writing")]
    OpenDevice(#[source] tokio_serial::Error, PathBuf),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the serial stream closed unexpectedly")]
    Closed,
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Path to the serial device the inverter bus hangs off (e.g. /dev/ttyUSB0).
    #[arg(long)]
    pub serial: PathBuf,

    /// Baudrate of the inverter bus. Eversolar devices talk 9600 8N1.
    #[arg(long, default_value = "9600")]
    pub baudrate: u32,

    /// If a response frame isn't received in this amount of time, the
    /// transaction is considered failed.
    ///
    /// There is no retry; the enclosing operation is skipped for this cycle.
    #[arg(long, default_value = "1s")]
    pub read_timeout: humantime::Duration,
}

/// One request-response exchange on the bus.
///
/// `Ok(None)` is the timeout outcome, and the immediate result of broadcast
/// functions that solicit no response. `Err` is reserved for channel-level
/// failures with no defined recovery.
pub trait Transport {
    async fn transact(&mut self, request: &Request) -> Result<Option<Response>, Error>;
}

pub struct Connection {
    io: Framed<SerialStream, FrameCodec>,
    read_timeout: std::time::Duration,
}

impl Connection {
    pub fn open(args: &Args) -> Result<Connection, Error> {
        let path = args.serial.to_string_lossy();
        info!(message = "opening serial device", path = %path, baudrate = args.baudrate);
        let stream = tokio_serial::new(path, args.baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(|e| Error::OpenDevice(e, args.serial.clone()))?;
        Ok(Self { io: Framed::new(stream, FrameCodec {}), read_timeout: *args.read_timeout })
    }
}

impl Transport for Connection {
    async fn transact(&mut self, request: &Request) -> Result<Option<Response>, Error> {
        SinkExt::send(&mut self.io, request).await.map_err(Error::Send)?;
        let Some(expected) = request.function.response_code() else {
            trace!(message = "not expecting a response", function = request.function.name());
            return Ok(None);
        };
        let deadline = Instant::now() + self.read_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.io.next()).await {
                // The response window elapsed without a matching frame.
                Err(_elapsed) => return Ok(None),
                Ok(None) => return Err(Error::Closed),
                Ok(Some(Err(e))) => return Err(Error::Receive(e)),
                Ok(Some(Ok(response))) => {
                    if [response.control, response.function] != expected {
                        debug!(
                            message = "a response we were not expecting",
                            control = response.control,
                            function = response.function,
                        );
                        continue;
                    }
                    trace!(
                        message = "received response",
                        function = request.function.name(),
                        payload = ?response.payload,
                    );
                    return Ok(Some(response));
                }
            }
        }
    }
}
