//! Modbus RTU/TCP client behind the [`SensorPort`] trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::{self, error::Elapsed};
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::*;

use pump_core::config::{BusConfig, Parity, Transport};
use pump_core::{PortError, SensorPort};

type Response<T> = Result<Result<T, ExceptionCode>, tokio_modbus::Error>;

/// One connection to the field bus, opened lazily on first use.
///
/// A transport error or timeout drops the connection: with RTU a late reply
/// would otherwise be taken as the answer to the next request.
pub struct ModbusBus {
    config: BusConfig,
    ctx: Option<Context>,
    connects: u32,
}

impl ModbusBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            ctx: None,
            connects: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    /// Connections opened so far, reconnects included.
    pub fn connects(&self) -> u32 {
        self.connects
    }

    pub fn disconnect(&mut self) {
        if self.ctx.take().is_some() {
            info!("field bus connection closed");
        }
    }

    async fn context(&mut self, unit: u8) -> Result<&mut Context, PortError> {
        if self.ctx.is_none() {
            let ctx = open_context(&self.config).await?;
            self.connects += 1;
            self.ctx = Some(ctx);
        }
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| PortError::Transport("not connected".into()))?;
        ctx.set_slave(Slave(unit));
        Ok(ctx)
    }

    fn settle<T>(&mut self, response: Result<Response<T>, Elapsed>) -> Result<T, PortError> {
        match response {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(exception))) => Err(PortError::Protocol(format!("exception {exception:?}"))),
            Ok(Err(tokio_modbus::Error::Protocol(err))) => {
                warn!("protocol error, dropping connection: {err}");
                self.ctx = None;
                Err(PortError::Protocol(err.to_string()))
            }
            Ok(Err(tokio_modbus::Error::Transport(err))) => {
                self.ctx = None;
                Err(PortError::Transport(err.to_string()))
            }
            Err(_) => {
                debug!("request timed out, dropping connection");
                self.ctx = None;
                Err(timeout_error(self.config.response_timeout()))
            }
        }
    }

    pub async fn read_discrete(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<bool>, PortError> {
        let timeout = self.config.response_timeout();
        let ctx = self.context(unit).await?;
        let response = time::timeout(timeout, ctx.read_discrete_inputs(address, count)).await;
        self.settle(response)
    }

    pub async fn read_holding(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>, PortError> {
        let timeout = self.config.response_timeout();
        let ctx = self.context(unit).await?;
        let response = time::timeout(timeout, ctx.read_holding_registers(address, count)).await;
        self.settle(response)
    }

    pub async fn read_input(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>, PortError> {
        let timeout = self.config.response_timeout();
        let ctx = self.context(unit).await?;
        let response = time::timeout(timeout, ctx.read_input_registers(address, count)).await;
        self.settle(response)
    }

    pub async fn write_coil(&mut self, unit: u8, address: u16, value: bool) -> Result<(), PortError> {
        let timeout = self.config.response_timeout();
        let ctx = self.context(unit).await?;
        let response = time::timeout(timeout, ctx.write_single_coil(address, value)).await;
        self.settle(response)
    }
}

/// Opens a client context. Borrows only the config: the bus holds a
/// `Context`, which is not `Sync`, and bus futures must stay `Send`.
async fn open_context(config: &BusConfig) -> Result<Context, PortError> {
    match config.transport {
        Transport::Rtu => {
            let device = config
                .device
                .as_deref()
                .ok_or_else(|| PortError::Transport("no serial device configured".into()))?;
            let parity = match config.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            };
            let stop_bits = if config.stop_bits == 2 {
                tokio_serial::StopBits::Two
            } else {
                tokio_serial::StopBits::One
            };
            let builder = tokio_serial::new(device, config.baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(parity)
                .stop_bits(stop_bits)
                .timeout(config.response_timeout());
            let port = tokio_serial::SerialStream::open(&builder)
                .map_err(|e| PortError::Transport(format!("{device}: {e}")))?;
            info!(
                "connected to {device} @ {} baud ({:?}, {} stop)",
                config.baud_rate, config.parity, config.stop_bits
            );
            Ok(rtu::attach(port))
        }
        Transport::Tcp => {
            let address = config
                .tcp_address
                .as_deref()
                .ok_or_else(|| PortError::Transport("no TCP address configured".into()))?;
            let socket = tokio::net::lookup_host(address)
                .await
                .map_err(|e| PortError::Transport(format!("{address}: {e}")))?
                .next()
                .ok_or_else(|| PortError::Transport(format!("{address}: no address")))?;
            let timeout = config.response_timeout();
            let ctx = time::timeout(timeout, tcp::connect(socket))
                .await
                .map_err(|_| timeout_error(timeout))?
                .map_err(|e| PortError::Transport(format!("{socket}: {e}")))?;
            info!("connected to {socket}");
            Ok(ctx)
        }
    }
}

fn timeout_error(timeout: Duration) -> PortError {
    PortError::Timeout {
        timeout_ms: timeout.as_millis() as u64,
    }
}

/// Handle to a bus shared by the sensor and a coil actuator on the same line.
///
/// Requests are serialized by the mutex, so the two never interleave frames.
#[derive(Clone)]
pub struct SharedBus {
    inner: Arc<Mutex<ModbusBus>>,
}

impl SharedBus {
    pub fn new(bus: ModbusBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }

    pub async fn connects(&self) -> u32 {
        self.inner.lock().await.connects()
    }
}

#[async_trait]
impl SensorPort for SharedBus {
    async fn read_discrete(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<bool>, PortError> {
        self.inner.lock().await.read_discrete(unit, address, count).await
    }

    async fn read_holding(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>, PortError> {
        self.inner.lock().await.read_holding(unit, address, count).await
    }

    async fn read_input(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>, PortError> {
        self.inner.lock().await.read_input(unit, address, count).await
    }

    async fn write_coil(&mut self, unit: u8, address: u16, value: bool) -> Result<(), PortError> {
        self.inner.lock().await.write_coil(unit, address, value).await
    }

    async fn reset(&mut self) {
        self.inner.lock().await.disconnect();
    }
}
