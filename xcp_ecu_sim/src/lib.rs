//-----------------------------------------------------------------------------
// Crate xcp_ecu_sim
// Simulated ECU with a minimal XCP on TCP server
// Supports CONNECT, DISCONNECT and SHORT_UPLOAD on a sparse byte addressed memory
// Used by the xcp_monitor integration tests and as a demo server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

//-----------------------------------------------------------------------------
// XCP definitions

const CC_CONNECT: u8 = 0xFF;
const CC_DISCONNECT: u8 = 0xFE;
const CC_SHORT_UPLOAD: u8 = 0xF4;

const PID_RES: u8 = 0xFF;
const PID_ERR: u8 = 0xFE;

pub const CRC_CMD_UNKNOWN: u8 = 0x20;
pub const CRC_CMD_SYNTAX: u8 = 0x21;
pub const CRC_OUT_OF_RANGE: u8 = 0x22;

const MAX_CTO: u8 = 0xFF;
const MAX_DTO: u16 = 1400;

//-----------------------------------------------------------------------------
// Demo ECU

/// A2L description of the demo memory layout created by EcuSim::load_demo
pub const DEMO_A2L: &str = r#"
ASAP2_VERSION 1 71
/begin PROJECT xcp_ecu_sim ""
  /begin MODULE demo_ecu ""

    /begin MEASUREMENT counter
      LONGIDENTIFIER "Cycle counter"
      DATATYPE UWORD
      ECU_ADDRESS 0x1000
    /end MEASUREMENT

    /begin MEASUREMENT engine_speed
      LONGIDENTIFIER "Engine speed"
      DATATYPE UWORD
      ECU_ADDRESS 0x1002
      UNIT "rpm"
      COMPU_METHOD cm_speed
      LOWER_LIMIT 0
      UPPER_LIMIT 8000
    /end MEASUREMENT

    /begin MEASUREMENT coolant_temp
      LONGIDENTIFIER "Coolant temperature"
      DATATYPE SBYTE
      ECU_ADDRESS 0x1004
      UNIT "degC"
      COMPU_METHOD cm_temp
    /end MEASUREMENT

    /begin MEASUREMENT battery_voltage
      DATATYPE FLOAT32_IEEE
      ECU_ADDRESS 0x1008
      UNIT "V"
    /end MEASUREMENT

    /begin MEASUREMENT unmapped
      LONGIDENTIFIER "Not backed by ECU memory"
      DATATYPE ULONG
      ECU_ADDRESS 0x3000
    /end MEASUREMENT

    /begin CHARACTERISTIC idle_target
      LONGIDENTIFIER "Idle speed target"
      TYPE UWORD
      ECU_ADDRESS 0x2000
      UNIT "rpm"
    /end CHARACTERISTIC

    /begin CHARACTERISTIC gain
      TYPE FLOAT64_IEEE
      ECU_ADDRESS 0x2008
    /end CHARACTERISTIC

  /end MODULE

  /begin COMPU_METHOD cm_speed "" RAT_FUNC "%6.2" "rpm"
    COEFFS 4 1 0 0 0 1
  /end COMPU_METHOD
  /begin COMPU_METHOD cm_temp "" RAT_FUNC "%6.2" "degC"
    COEFFS 0 -40 0 0 0 1
  /end COMPU_METHOD
/end PROJECT
"#;

pub const DEMO_COUNTER_ADDR: u32 = 0x1000;
pub const DEMO_ENGINE_SPEED_ADDR: u32 = 0x1002;
pub const DEMO_COOLANT_TEMP_ADDR: u32 = 0x1004;
pub const DEMO_BATTERY_VOLTAGE_ADDR: u32 = 0x1008;
pub const DEMO_IDLE_TARGET_ADDR: u32 = 0x2000;
pub const DEMO_GAIN_ADDR: u32 = 0x2008;

//-----------------------------------------------------------------------------
// EcuMemory

/// Sparse byte addressed memory, unwritten bytes are not readable
#[derive(Debug, Default)]
pub struct EcuMemory {
    bytes: Mutex<HashMap<u32, u8>>,
}

impl EcuMemory {
    pub fn write(&self, addr: u32, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        for (i, b) in data.iter().enumerate() {
            bytes.insert(addr.wrapping_add(i as u32), *b);
        }
    }

    pub fn read(&self, addr: u32, size: usize) -> Option<Vec<u8>> {
        let bytes = self.bytes.lock();
        (0..size).map(|i| bytes.get(&addr.wrapping_add(i as u32)).copied()).collect()
    }

    pub fn write_u8(&self, addr: u32, value: u8) {
        self.write(addr, &[value]);
    }

    pub fn write_i8(&self, addr: u32, value: i8) {
        self.write(addr, &[value as u8]);
    }

    pub fn write_u16(&self, addr: u32, value: u16) {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write(addr, &buf);
    }

    pub fn write_u32(&self, addr: u32, value: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(addr, &buf);
    }

    pub fn write_f32(&self, addr: u32, value: f32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_f32(&mut buf, value);
        self.write(addr, &buf);
    }

    pub fn write_f64(&self, addr: u32, value: f64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_f64(&mut buf, value);
        self.write(addr, &buf);
    }

    pub fn read_u16(&self, addr: u32) -> Option<u16> {
        self.read(addr, 2).map(|b| LittleEndian::read_u16(&b))
    }

    /// Initial values of the DEMO_A2L parameters
    pub fn load_demo(&self) {
        self.write_u16(DEMO_COUNTER_ADDR, 0);
        self.write_u16(DEMO_ENGINE_SPEED_ADDR, 3200); // 800 rpm
        self.write_i8(DEMO_COOLANT_TEMP_ADDR, 90); // 50 degC
        self.write_f32(DEMO_BATTERY_VOLTAGE_ADDR, 13.5);
        self.write_u16(DEMO_IDLE_TARGET_ADDR, 800);
        self.write_f64(DEMO_GAIN_ADDR, 1.5);
    }
}

//-----------------------------------------------------------------------------
// EcuSim

#[derive(Debug, Default)]
struct SimState {
    connections: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    commands: AtomicUsize,
    response_delay: Mutex<Option<Duration>>,
}

/// XCP on TCP server task serving an EcuMemory
pub struct EcuSim {
    memory: Arc<EcuMemory>,
    state: Arc<SimState>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EcuSim {
    /// Bind to addr (port 0 selects a free port) and start serving
    pub async fn start(addr: &str) -> std::io::Result<EcuSim> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("xcp_ecu_sim: listening on {}", local_addr);

        let memory = Arc::new(EcuMemory::default());
        let state = Arc::new(SimState::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server_task(listener, memory.clone(), state.clone(), cancel.clone()));
        Ok(EcuSim {
            memory,
            state,
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    /// Start with the DEMO_A2L memory layout
    pub async fn start_demo(addr: &str) -> std::io::Result<EcuSim> {
        let sim = EcuSim::start(addr).await?;
        sim.memory.load_demo();
        Ok(sim)
    }

    pub fn memory(&self) -> &Arc<EcuMemory> {
        &self.memory
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of open client connections
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Number of CONNECT commands received
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of DISCONNECT commands received
    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Number of commands received
    pub fn command_count(&self) -> usize {
        self.state.commands.load(Ordering::SeqCst)
    }

    /// Delay every response, to simulate a stalled ECU
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        *self.state.response_delay.lock() = delay;
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("xcp_ecu_sim: server task failed: {}", e);
            }
        }
        info!("xcp_ecu_sim: shutdown");
    }
}

impl Drop for EcuSim {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

//-----------------------------------------------------------------------------
// Server

async fn server_task(listener: TcpListener, memory: Arc<EcuMemory>, state: Arc<SimState>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    info!("xcp_ecu_sim: client {} accepted", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("xcp_ecu_sim: set_nodelay failed: {}", e);
                    }
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    let memory = memory.clone();
                    let state = state.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            res = client_task(stream, &memory, &state) => {
                                if let Err(e) = res {
                                    debug!("xcp_ecu_sim: client {}: {}", addr, e);
                                }
                            }
                        }
                        state.connections.fetch_sub(1, Ordering::SeqCst);
                        info!("xcp_ecu_sim: client {} closed", addr);
                    });
                }
                Err(e) => {
                    error!("xcp_ecu_sim: accept failed: {}", e);
                    break;
                }
            },
        }
    }
}

// Serve one client until it closes the connection
async fn client_task(mut stream: TcpStream, memory: &EcuMemory, state: &SimState) -> std::io::Result<()> {
    let mut connected = false;
    loop {
        let len = match stream.read_u16_le().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut packet = vec![0u8; len];
        stream.read_exact(&mut packet).await?;
        state.commands.fetch_add(1, Ordering::SeqCst);
        trace!("xcp_ecu_sim: command {:?}", packet);

        let response = command(&packet, &mut connected, memory, state);

        let delay = *state.response_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut frame = BytesMut::with_capacity(response.len() + 2);
        frame.put_u16_le(response.len() as u16);
        frame.put_slice(&response);
        stream.write_all(&frame).await?;
    }
}

fn error_packet(code: u8) -> Vec<u8> {
    vec![PID_ERR, code]
}

// Execute a command packet and return the response packet
fn command(packet: &[u8], connected: &mut bool, memory: &EcuMemory, state: &SimState) -> Vec<u8> {
    let Some(&cmd) = packet.first() else {
        return error_packet(CRC_CMD_SYNTAX);
    };
    match cmd {
        CC_CONNECT => {
            *connected = true;
            state.connects.fetch_add(1, Ordering::SeqCst);
            let mut res = vec![PID_RES, 0x00, 0x00, MAX_CTO, 0, 0, 0x01, 0x01];
            LittleEndian::write_u16(&mut res[4..6], MAX_DTO);
            res
        }
        CC_DISCONNECT => {
            *connected = false;
            state.disconnects.fetch_add(1, Ordering::SeqCst);
            vec![PID_RES]
        }
        CC_SHORT_UPLOAD if *connected => {
            if packet.len() < 8 {
                return error_packet(CRC_CMD_SYNTAX);
            }
            let size = packet[2] as usize;
            let addr = LittleEndian::read_u32(&packet[4..8]);
            if size == 0 || size > MAX_CTO as usize - 1 {
                return error_packet(CRC_OUT_OF_RANGE);
            }
            match memory.read(addr, size) {
                Some(data) => {
                    let mut res = Vec::with_capacity(size + 1);
                    res.push(PID_RES);
                    res.extend_from_slice(&data);
                    res
                }
                None => {
                    debug!("xcp_ecu_sim: SHORT_UPLOAD 0x{:08X} size {} out of range", addr, size);
                    error_packet(CRC_OUT_OF_RANGE)
                }
            }
        }
        _ => error_packet(CRC_CMD_UNKNOWN),
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod ecu_sim_tests {

    use super::*;

    async fn transfer(stream: &mut TcpStream, cmd: &[u8]) -> Vec<u8> {
        stream.write_u16_le(cmd.len() as u16).await.unwrap();
        stream.write_all(cmd).await.unwrap();
        let len = stream.read_u16_le().await.unwrap();
        let mut res = vec![0u8; len as usize];
        stream.read_exact(&mut res).await.unwrap();
        res
    }

    #[test]
    fn test_memory() {
        let memory = EcuMemory::default();
        memory.write_u16(0x10, 0x1234);
        assert_eq!(memory.read(0x10, 2), Some(vec![0x34, 0x12]));
        assert_eq!(memory.read_u16(0x10), Some(0x1234));
        assert_eq!(memory.read(0x10, 3), None);
    }

    #[tokio::test]
    async fn test_server() {
        let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
        let mut stream = TcpStream::connect(sim.local_addr()).await.unwrap();

        // Upload before connect
        assert_eq!(transfer(&mut stream, &[0xF4, 0, 2, 0, 0x00, 0x10, 0, 0]).await, vec![PID_ERR, CRC_CMD_UNKNOWN]);

        let res = transfer(&mut stream, &[0xFF, 0x00]).await;
        assert_eq!(res.len(), 8);
        assert_eq!(res[0], PID_RES);
        assert_eq!(LittleEndian::read_u16(&res[4..6]), MAX_DTO);

        // engine_speed
        assert_eq!(transfer(&mut stream, &[0xF4, 0, 2, 0, 0x02, 0x10, 0, 0]).await, vec![PID_RES, 0x80, 0x0C]);
        // unmapped
        assert_eq!(transfer(&mut stream, &[0xF4, 0, 4, 0, 0x00, 0x30, 0, 0]).await, vec![PID_ERR, CRC_OUT_OF_RANGE]);
        // unknown command
        assert_eq!(transfer(&mut stream, &[0xF5, 0, 0, 0]).await, vec![PID_ERR, CRC_CMD_UNKNOWN]);

        assert_eq!(transfer(&mut stream, &[0xFE]).await, vec![PID_RES]);
        assert_eq!(sim.connect_count(), 1);
        assert_eq!(sim.disconnect_count(), 1);
        assert_eq!(sim.command_count(), 6);

        drop(stream);
        sim.shutdown().await;
    }
}
