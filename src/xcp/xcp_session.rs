//--------------------------------------------------------------------------------------------------------------------------------------------------
// Module xcp_session
// Single connection XCP client session
// Only one command/response exchange may be in flight, the transport lock is held from write until the response is complete

use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::a2l::{A2lDataType, A2lError};

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Session configuration and state

/// Maximum wait for the DISCONNECT acknowledge when no read timeout is configured
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum time for one command/response exchange, None waits until cancelled
    pub read_timeout: Option<Duration>,
    /// Mode byte of the CONNECT command
    pub connect_mode: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            read_timeout: None,
            connect_mode: XCP_CONNECT_MODE_NORMAL,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Server parameters reported in the CONNECT response
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct XcpSessionInfo {
    pub resource: u8,
    pub comm_mode_basic: u8,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_layer_version: u8,
    pub transport_layer_version: u8,
}

impl XcpSessionInfo {
    // Positive CONNECT response payload, without the packet identifier
    fn from_connect_response(data: &[u8]) -> Option<XcpSessionInfo> {
        if data.len() < 7 {
            return None;
        }
        Some(XcpSessionInfo {
            resource: data[0],
            comm_mode_basic: data[1],
            max_cto: data[2],
            max_dto: LittleEndian::read_u16(&data[3..5]),
            protocol_layer_version: data[5],
            transport_layer_version: data[6],
        })
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XcpSession

type TransportSlot = Option<Box<dyn Transport>>;

/// XCP client session to one ECU
pub struct XcpSession {
    host: String,
    port: u16,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    transport: tokio::sync::Mutex<TransportSlot>,
    state: parking_lot::Mutex<SessionState>,
    info: parking_lot::Mutex<Option<XcpSessionInfo>>,
}

impl XcpSession {
    pub fn new(host: &str, port: u16, connector: Arc<dyn Connector>, config: SessionConfig) -> XcpSession {
        XcpSession {
            host: host.to_string(),
            port,
            config,
            connector,
            transport: tokio::sync::Mutex::new(None),
            state: parking_lot::Mutex::new(SessionState::Disconnected),
            info: parking_lot::Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Server parameters, if the CONNECT response contained them
    pub fn info(&self) -> Option<XcpSessionInfo> {
        *self.info.lock()
    }

    fn set_state(&self, state: SessionState) {
        let mut s = self.state.lock();
        if *s != state {
            trace!("XCP session {}:{} {:?} -> {:?}", self.host, self.port, *s, state);
            *s = state;
        }
    }

    //------------------------------------------------------------------------
    // Connect/disconnect

    /// Open the transport and send CONNECT
    /// Every failure is reported as ConnectFailed, there is no retry
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), XcpError> {
        let mut slot = tokio::select! {
            _ = cancel.cancelled() => return Err(XcpError::ConnectFailed("cancelled".to_string())),
            slot = self.transport.lock() => slot,
        };
        if slot.is_some() && self.is_connected() {
            debug!("XCP session {}:{} already connected", self.host, self.port);
            return Ok(());
        }

        self.set_state(SessionState::Connecting);
        match self.connect_locked(&mut slot, cancel).await {
            Ok(info) => {
                match info {
                    Some(info) => info!(
                        "XCP client connected to {}:{}, max_cto_size = {}, max_dto_size = {}",
                        self.host, self.port, info.max_cto, info.max_dto
                    ),
                    None => info!("XCP client connected to {}:{}", self.host, self.port),
                }
                *self.info.lock() = info;
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("XCP connect to {}:{} failed: {}", self.host, self.port, e);
                Self::release(&mut slot).await;
                self.set_state(SessionState::Disconnected);
                Err(XcpError::ConnectFailed(format!("{}:{}: {}", self.host, self.port, e)))
            }
        }
    }

    async fn connect_locked(&self, slot: &mut TransportSlot, cancel: &CancellationToken) -> Result<Option<XcpSessionInfo>, XcpError> {
        Self::release(slot).await;
        let transport = tokio::select! {
            _ = cancel.cancelled() => return Err(XcpError::Cancelled),
            res = self.connector.connect(&self.host, self.port) => res?,
        };
        *slot = Some(transport);

        let packet = self
            .exchange_locked(slot, XcpCommandBuilder::new(CC_CONNECT).add_u8(self.config.connect_mode).build(), cancel)
            .await?;
        match XcpResponse::from_packet(&packet)? {
            XcpResponse::Positive(data) => Ok(XcpSessionInfo::from_connect_response(&data)),
            other => Err(XcpError::NegativeResponse(other)),
        }
    }

    /// Send DISCONNECT if connected and release the transport
    /// A missing acknowledge does not prevent closing the transport, the acknowledge is awaited at most
    /// for the read timeout or DISCONNECT_TIMEOUT
    pub async fn disconnect(&self, cancel: &CancellationToken) {
        let mut slot = self.transport.lock().await;
        if slot.is_some() && self.is_connected() {
            self.set_state(SessionState::Disconnecting);
            let mut builder = XcpCommandBuilder::new(CC_DISCONNECT);
            let command = builder.build();
            let exchange = self.exchange_locked(&mut slot, command, cancel);
            let timeout = self.config.read_timeout.unwrap_or(DISCONNECT_TIMEOUT);
            let res = tokio::time::timeout(timeout, exchange).await.unwrap_or(Err(XcpError::Timeout(timeout)));
            match res.and_then(|packet| XcpResponse::from_packet(&packet)) {
                Ok(XcpResponse::Positive(_)) => debug!("XCP client disconnected from {}:{}", self.host, self.port),
                Ok(other) => warn!("XCP DISCONNECT not acknowledged: {}", XcpError::NegativeResponse(other)),
                Err(e) => warn!("XCP DISCONNECT failed: {}", e),
            }
        }
        Self::release(&mut slot).await;
        *self.info.lock() = None;
        self.set_state(SessionState::Disconnected);
    }

    async fn release(slot: &mut TransportSlot) {
        if let Some(mut transport) = slot.take() {
            if let Err(e) = transport.close().await {
                debug!("transport close: {}", e);
            }
        }
    }

    //------------------------------------------------------------------------
    // Memory access

    /// Read size bytes from ECU memory with SHORT_UPLOAD, address extension 0
    pub async fn read_memory(&self, address: u32, size: u8, cancel: &CancellationToken) -> Result<Vec<u8>, XcpError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(XcpError::InvalidUploadSize(size));
        }
        let mut data = self
            .exchange(
                XcpCommandBuilder::new(CC_SHORT_UPLOAD).add_u8(0).add_u8(size).add_u8(0).add_u32(address).build(),
                size as usize,
                cancel,
            )
            .await?;
        data.truncate(size as usize);
        trace!("SHORT_UPLOAD 0x{:08X} -> {:?}", address, data);
        Ok(data)
    }

    /// Read and decode a value, the data type is given by its A2L name
    /// An unknown data type fails before anything is sent
    pub async fn read_value(&self, address: u32, data_type: &str, cancel: &CancellationToken) -> Result<f64, XcpError> {
        let data_type = data_type.parse::<A2lDataType>().map_err(|e| match e {
            A2lError::UnsupportedDataType(t) => XcpError::UnsupportedDataType(t),
            other => XcpError::UnsupportedDataType(other.to_string()),
        })?;
        self.read_typed(address, data_type, cancel).await
    }

    pub async fn read_typed(&self, address: u32, data_type: A2lDataType, cancel: &CancellationToken) -> Result<f64, XcpError> {
        let data = self.read_memory(address, data_type.get_size() as u8, cancel).await?;
        data_type
            .decode(&data)
            .ok_or_else(|| XcpError::Protocol(format!("can not decode {} from {:?}", data_type, data)))
    }

    //------------------------------------------------------------------------
    // Command/response exchange

    // Serialized exchange, returns the payload of a positive response with at least min_len bytes
    // A fatal error, including a malformed response, tears down the connection
    async fn exchange(&self, frame: &[u8], min_len: usize, cancel: &CancellationToken) -> Result<Vec<u8>, XcpError> {
        let mut slot = tokio::select! {
            _ = cancel.cancelled() => return Err(XcpError::Cancelled),
            slot = self.transport.lock() => slot,
        };
        if slot.is_none() || !self.is_connected() {
            return Err(XcpError::NotConnected);
        }
        let res = self
            .exchange_locked(&mut slot, frame, cancel)
            .await
            .and_then(|packet| XcpResponse::from_packet(&packet))
            .and_then(XcpResponse::into_positive)
            .and_then(|data| {
                if data.len() < min_len {
                    Err(XcpError::Protocol(format!("response too short, expected {} bytes, got {}", min_len, data.len())))
                } else {
                    Ok(data)
                }
            });
        if let Err(e) = &res {
            if e.is_fatal() {
                error!("XCP session {}:{} closed: {}", self.host, self.port, e);
                Self::release(&mut slot).await;
                *self.info.lock() = None;
                self.set_state(SessionState::Disconnected);
            }
        }
        res
    }

    async fn exchange_locked(&self, slot: &mut TransportSlot, frame: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, XcpError> {
        let transport = slot.as_mut().ok_or(XcpError::NotConnected)?;
        trace!("XCP command = {:?}", frame);
        let transfer = Self::transfer(&mut **transport, frame);
        let res = tokio::select! {
            _ = cancel.cancelled() => Err(XcpError::Cancelled),
            res = async {
                match self.config.read_timeout {
                    Some(t) => tokio::time::timeout(t, transfer).await.unwrap_or(Err(XcpError::Timeout(t))),
                    None => transfer.await,
                }
            } => res,
        };
        trace!("XCP response = {:?}", res);
        res
    }

    async fn transfer(transport: &mut dyn Transport, frame: &[u8]) -> Result<Vec<u8>, XcpError> {
        transport
            .write_all(frame)
            .await
            .map_err(|e| XcpError::Protocol(format!("write failed: {}", e)))?;

        let mut header = [0u8; 2];
        transport
            .read_exact(&mut header)
            .await
            .map_err(|e| XcpError::Protocol(format!("short read of response length: {}", e)))?;
        let len = LittleEndian::read_u16(&header) as usize;

        let mut packet = vec![0u8; len];
        transport
            .read_exact(&mut packet)
            .await
            .map_err(|e| XcpError::Protocol(format!("short read of response, expected {} bytes: {}", len, e)))?;
        Ok(packet)
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
