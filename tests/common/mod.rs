#![allow(dead_code)]

use sermatec_bridge::prelude::*;
use sermatec_bridge::sermatec::frame::FrameFactory;
use sermatec_bridge::sermatec::frame_decoder::FrameDecoder;

pub use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const PROTOCOL: &str = r#"{
  "osim": {
    "versions": [
      {
        "version": 0,
        "queryCommands": ["98", "0a", "0b", "0c", "95", "0d"],
        "commands": [
          {
            "type": "98",
            "comment": "System information",
            "fields": [
              { "name": "Protocol version number", "byteLen": 2, "type": "uInt" },
              { "name": "Product SN", "byteLen": "9", "type": "string" }
            ]
          },
          {
            "type": "0a",
            "comment": "Battery information",
            "fields": [
              { "name": "Battery voltage", "byteLen": 2, "type": "uInt", "unitValue": 0.1, "unitType": "V" },
              { "name": "Battery current", "byteLen": 2, "type": "int", "unitValue": "0.1", "unitType": "A" },
              { "name": "Charge and discharge status", "byteLen": 2, "type": "uInt" },
              { "name": "Reserved", "byteLen": 2, "type": "preserve" },
              { "name": "SOC", "byteLen": 1, "type": "uInt", "unitType": "%", "deviceClass": "BATTERY" }
            ]
          },
          {
            "type": "0b",
            "comment": "Grid and PV",
            "fields": [
              { "name": "PV1 power", "byteLen": 2, "type": "uInt", "unitType": "W" },
              { "name": "Grid frequency", "byteLen": 2, "type": "uInt", "unitValue": 0.01, "unitType": "Hz" }
            ]
          },
          {
            "type": "0c",
            "comment": "Running status",
            "fields": [
              { "name": "Standby", "byteLen": 1, "type": "bit", "bitPosition": 0 },
              { "name": "Grid relay", "byteLen": 1, "type": "bit", "bitPosition": 1, "same": true },
              { "name": "Error bits", "byteLen": 1, "type": "bitRange", "fromBit": 0, "endBit": 4, "same": true },
              { "name": "Cell temperatures", "byteLen": 2, "type": "int", "repeat": 4 },
              { "name": "Inverter temperature", "byteLen": 2, "type": "int", "unitValue": 0.1, "unitType": "°C" }
            ]
          },
          {
            "type": "0d",
            "comment": "BMS status",
            "fields": [
              { "name": "BMS state", "byteLen": 2, "type": "hex", "listIgnore": true }
            ]
          },
          {
            "type": "95",
            "comment": "Working parameters",
            "fields": [
              { "name": "Electricity price 1", "byteLen": 2, "type": "uInt", "tag": "price1" },
              { "name": "Electricity price 2", "byteLen": 2, "type": "uInt", "tag": "price2" },
              { "name": "Electricity price 3", "byteLen": 2, "type": "uInt", "tag": "price3" },
              { "name": "Electricity price 4", "byteLen": 2, "type": "uInt", "tag": "price4" },
              { "name": "Grid code", "byteLen": 2, "type": "uInt", "tag": "con" },
              { "name": "Charge power", "byteLen": 2, "type": "uInt", "unitType": "W", "tag": "chargePower" },
              { "name": "Operating mode", "byteLen": 2, "type": "uInt", "tag": "operatingMode" },
              { "name": "Grid switch", "byteLen": 2, "type": "uInt", "tag": "gridSwitch" },
              { "name": "Adjust method", "byteLen": 2, "type": "uInt", "tag": "adjustMethod" },
              { "name": "Reflux", "byteLen": 2, "type": "uInt", "tag": "refluxs" },
              { "name": "Battery charge", "byteLen": 2, "type": "uInt", "tag": "batteryCharge" },
              { "name": "Lower SOC limit", "byteLen": 2, "type": "uInt", "unitType": "%", "tag": "soc" }
            ]
          },
          {
            "type": "9d",
            "comment": "Working parameters, extended",
            "fields": [
              { "name": "Battery upper voltage", "byteLen": 2, "type": "uInt", "unitValue": 0.1, "unitType": "V" }
            ]
          }
        ]
      },
      {
        "version": 200,
        "commands": [
          {
            "type": "0a",
            "comment": "Battery information",
            "fields": [
              { "name": "Battery voltage", "byteLen": 2, "type": "uInt", "unitValue": 0.1, "unitType": "V" },
              { "name": "Battery SOH", "byteLen": 1, "type": "uInt", "unitType": "%" }
            ]
          }
        ]
      },
      {
        "version": 300,
        "queryCommands": ["42"],
        "commands": [
          {
            "type": "42",
            "comment": "Meter",
            "fields": [
              { "name": "Meter power", "byteLen": 4, "type": "long", "unitType": "W" }
            ]
          }
        ]
      }
    ]
  }
}"#;

pub struct Factory;
impl Factory {
    pub fn registry() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::from_json_str(PROTOCOL).unwrap())
    }

    pub fn sysinfo_reply(version: u16) -> Vec<u8> {
        let mut payload = version.to_be_bytes().to_vec();
        payload.extend_from_slice(b"SN12345\0\0");
        FrameFactory::build_reply(0x98, &payload).unwrap()
    }

    pub fn battery_payload() -> Vec<u8> {
        vec![
            0x04, 0xd2, // 123.4 V
            0xff, 0xe7, // -2.5 A
            0x00, 0x22, // discharging
            0xaa, 0xbb, // reserved
            0x55, // 85 %
        ]
    }

    pub fn battery_reply() -> Vec<u8> {
        FrameFactory::build_reply(0x0a, &Self::battery_payload()).unwrap()
    }

    pub fn running_status_reply() -> Vec<u8> {
        let mut payload = vec![0x45];
        payload.extend_from_slice(&[0; 8]);
        payload.extend_from_slice(&[0x01, 0x2c]);
        FrameFactory::build_reply(0x0c, &payload).unwrap()
    }

    /// price1..soc, operating mode General Mode
    pub fn working_parameters_payload() -> Vec<u8> {
        vec![
            0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, // prices
            0x00, 0x05, // con
            0x0b, 0xb8, // chargePower
            0x00, 0x01, // operatingMode
            0x00, 0x06, 0x00, 0x07, 0x00, 0x08, 0x00, 0x09, // gridSwitch..batteryCharge
            0x00, 0x50, // soc
        ]
    }

    pub fn working_parameters_replies() -> Vec<Vec<u8>> {
        vec![
            FrameFactory::build_reply(0x95, &Self::working_parameters_payload()).unwrap(),
            FrameFactory::build_reply(0x9d, &[0x0f, 0xa0]).unwrap(),
        ]
    }

    /// Same frame with the checksum byte flipped.
    pub fn corrupt(frame: &[u8]) -> Vec<u8> {
        let mut r = frame.to_vec();
        let idx = r.len() - 2;
        r[idx] ^= 0xff;
        r
    }
}

// MockConnector {{{
pub struct MockConnector {
    stream: Mutex<Option<DuplexStream>>,
}

impl MockConnector {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> std::io::Result<DuplexStream> {
        let stream = self.stream.lock().unwrap().take();
        stream.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "peer already used"))
    }
}

/// Never completes a connection.
pub struct HangingConnector;

#[async_trait]
impl Connector for HangingConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> std::io::Result<DuplexStream> {
        std::future::pending().await
    }
} // }}}

// Peer {{{
#[derive(Clone, Debug)]
pub enum Reply {
    /// Read the request, answer nothing.
    Silent,
    Frames(Vec<Vec<u8>>),
    /// Hang up after reading the request.
    Close,
}

impl Reply {
    pub fn frame(frame: Vec<u8>) -> Self {
        Reply::Frames(vec![frame])
    }
}

/// Simulated inverter answering each request with the next scripted reply.
pub struct Peer {
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    handle: JoinHandle<()>,
}

impl Peer {
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    /// Command byte of every request seen so far.
    pub fn commands(&self) -> Vec<u8> {
        self.requests().iter().map(|r| r[4]).collect()
    }

    /// Waits until the client side hung up, then returns every request.
    pub async fn finish(self) -> Vec<Vec<u8>> {
        let Peer { requests, handle } = self;
        handle.await.unwrap();
        let r = requests.lock().unwrap().clone();
        r
    }
}

async fn serve(server: DuplexStream, script: Vec<Reply>, requests: Arc<Mutex<Vec<Vec<u8>>>>) {
    let (read, mut write) = tokio::io::split(server);
    let mut frames = FramedRead::new(read, FrameDecoder::new());
    let mut script = script.into_iter();

    while let Some(Ok(request)) = frames.next().await {
        requests.lock().unwrap().push(request.to_vec());

        match script.next().unwrap_or(Reply::Silent) {
            Reply::Silent => {}
            Reply::Frames(replies) => {
                for frame in replies {
                    if write.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            }
            Reply::Close => return,
        }
    }
}

pub fn mock_inverter(script: Vec<Reply>) -> (Inverter<MockConnector>, Peer) {
    let (client, server) = tokio::io::duplex(4096);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let handle = tokio::spawn(serve(server, script, requests.clone()));

    let inverter = Inverter::new(
        MockConnector::new(client),
        Factory::registry(),
        Arc::new(Translations::new()),
    );

    (inverter, Peer { requests, handle })
}

/// Connected client whose peer answers version discovery, then stops
/// reading. The link is narrower than one request, so every later write
/// stalls.
pub async fn stalled_inverter(version: u16) -> (Inverter<MockConnector>, Peer) {
    let (client, server) = tokio::io::duplex(8);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();

    let handle = tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server);
        let mut frames = FramedRead::new(read, FrameDecoder::new());
        if let Some(Ok(request)) = frames.next().await {
            seen.lock().unwrap().push(request.to_vec());
            let _ = write.write_all(&Factory::sysinfo_reply(version)).await;
        }
        // keep both halves open without reading
        std::future::pending::<()>().await;
        drop((frames, write));
    });

    let mut inverter = Inverter::new(
        MockConnector::new(client),
        Factory::registry(),
        Arc::new(Translations::new()),
    );
    inverter.connect().await.unwrap();

    (inverter, Peer { requests, handle })
}

/// Connected client whose version discovery reported `version`.
pub async fn connected_inverter(version: u16, mut script: Vec<Reply>) -> (Inverter<MockConnector>, Peer) {
    script.insert(0, Reply::frame(Factory::sysinfo_reply(version)));
    let (mut inverter, peer) = mock_inverter(script);
    inverter.connect().await.unwrap();
    (inverter, peer)
} // }}}
