// Simulated reader on the device end of an in-memory link

#![allow(dead_code)]

use magstripe::{DesKey, DuplexConnector, Operation, Reader, ReaderConfig, Reply};
use magstripe_core::{
    constants::control,
    crypto::{random_bytes, Iv, BLOCK_SIZE, KEY_SIZE},
    frame::{CRC_SIZE, HEADER_SIZE},
    CommandFrame,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

pub const TRACK1: &[u8] = b"4111111111111111^DOE/JOHN^25121010000000000000";
pub const TRACK2: &[u8] = b"4111111111111111=25121010000000000";

/// What the reader finds on a track
#[derive(Debug, Clone)]
pub enum SimTrack {
    /// Plaintext as stored, encrypted on read
    Data(Vec<u8>),
    /// Negative status reported instead of data
    Status(u8),
}

/// Track plaintext with terminator and trailing junk
pub fn terminated(data: &[u8]) -> Vec<u8> {
    let mut plain = data.to_vec();
    plain.push(0x80);
    plain.extend_from_slice(b"\x13\x37JUNK");
    plain
}

pub struct SimReader {
    pub master: Option<DesKey>,
    pub factory: DesKey,
    pub serial: String,
    pub model: String,
    pub firmware: Vec<(Operation, Option<String>)>,
    pub tracks: [SimTrack; 3],

    pub tamper: bool,
    pub reject_import: bool,
    pub hold_intake: bool,

    pub log: Vec<Operation>,

    ke: Option<DesKey>,
    kwa: Option<DesKey>,
    rnd_a: [u8; 16],
    mag_ke: Option<DesKey>,
    kwm: Option<(DesKey, Iv)>,
}

impl SimReader {
    pub fn new(master: Option<DesKey>, factory: DesKey) -> Self {
        Self {
            master,
            factory,
            serial: "SN00012345".into(),
            model: "MCR-3000".into(),
            firmware: vec![
                (Operation::FirmwareSuper, Some("S1.02".into())),
                (Operation::FirmwareUser, Some("U2.10".into())),
                (Operation::FirmwareEmv2000, None),
                (Operation::FirmwareSecSuper, None),
                (Operation::FirmwareSecUser, None),
            ],
            tracks: [
                SimTrack::Data(terminated(TRACK1)),
                SimTrack::Data(terminated(TRACK2)),
                SimTrack::Status(25),
            ],
            tamper: false,
            reject_import: false,
            hold_intake: false,
            log: Vec::new(),
            ke: None,
            kwa: None,
            rnd_a: [0u8; 16],
            mag_ke: None,
            kwm: None,
        }
    }

    /// Serve commands until the host closes the link
    pub async fn run(mut self, mut io: DuplexStream) -> Self {
        while let Some(command) = read_command(&mut io).await {
            if io.write_all(&[control::ACK]).await.is_err() {
                break;
            }

            let operation = command.operation().unwrap();
            self.log.push(operation);

            if operation == Operation::Intake && self.hold_intake {
                let mut cancel = [0u8; 2];
                if io.read_exact(&mut cancel).await.is_err() {
                    break;
                }
                assert_eq!(cancel, [control::DLE, control::EOT]);
                io.write_all(&[control::DLE, control::EOT]).await.unwrap();
                continue;
            }

            let reply = self.handle(operation, &command.payload);
            if io.write_all(&reply.encode()).await.is_err() {
                break;
            }
            match io.read_u8().await {
                Ok(control::ACK) => {}
                _ => break,
            }
        }
        self
    }

    fn handle(&mut self, operation: Operation, payload: &[u8]) -> Reply {
        let (command, parameter) = operation.code();
        let ok = |data: Vec<u8>| Reply::positive(command, parameter, 0, data);
        let fail = |code: u8| Reply::negative(command, parameter, code, Vec::new());

        match operation {
            Operation::SendKeKey | Operation::SendMagDataKe => {
                let Some(master) = &self.master else {
                    return fail(10);
                };
                let ke = master.unwrap_key(payload).unwrap();
                if operation == Operation::SendKeKey {
                    self.ke = Some(ke);
                } else {
                    self.mag_ke = Some(ke);
                }
                ok(Vec::new())
            }
            Operation::SendKwaKey => {
                let Some(ke) = &self.ke else {
                    return fail(12);
                };
                self.kwa = Some(ke.unwrap_key(payload).unwrap());
                ok(Vec::new())
            }
            Operation::GetChallenge => {
                let Some(kwa) = &self.kwa else {
                    return fail(12);
                };
                self.rnd_a = random_bytes();
                let mut challenge = self.rnd_a;
                kwa.encrypt_ecb(&mut challenge).unwrap();
                ok(challenge.to_vec())
            }
            Operation::DeviceAuth => {
                let Some(kwa) = &self.kwa else {
                    return fail(12);
                };
                let mut plain = payload.to_vec();
                kwa.decrypt_ecb(&mut plain).unwrap();

                let mut rnd_b = [0u8; 16];
                for i in 0..16 {
                    if plain[2 * i + 1] != self.rnd_a[i] {
                        return fail(11);
                    }
                    rnd_b[i] = plain[2 * i];
                }
                if self.tamper {
                    rnd_b[15] ^= 0x80;
                }

                let mut echo = rnd_b.to_vec();
                echo.extend_from_slice(&self.rnd_a);
                kwa.encrypt_ecb(&mut echo).unwrap();
                ok(echo)
            }
            Operation::SendMagDataKey => {
                let Some(ke) = &self.mag_ke else {
                    return fail(12);
                };
                let mut plain = payload.to_vec();
                ke.decrypt_ecb(&mut plain).unwrap();

                let kwm = DesKey::from_slice(&plain[..KEY_SIZE]).unwrap();
                let iv: Iv = plain[KEY_SIZE..].try_into().unwrap();
                self.kwm = Some((kwm, iv));
                ok(Vec::new())
            }
            Operation::ReadTrack1 | Operation::ReadTrack2 | Operation::ReadTrack3 => {
                // Keys are single use
                let Some((kwm, iv)) = self.kwm.take() else {
                    return fail(12);
                };
                let index = (parameter - b'1') as usize;

                match &self.tracks[index] {
                    SimTrack::Data(plain) => {
                        let mut data = plain.clone();
                        data.resize(plain.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
                        kwm.encrypt_cbc(&iv, &mut data).unwrap();
                        ok(data)
                    }
                    SimTrack::Status(code) => fail(*code),
                }
            }
            Operation::ImportMasterKey => {
                if self.reject_import {
                    return fail(4);
                }
                self.master = Some(self.factory.unwrap_key(payload).unwrap());
                ok(Vec::new())
            }
            Operation::InfoSerialNumber => ok(self.serial.clone().into_bytes()),
            Operation::InfoModel => {
                let mut model = self.model.clone().into_bytes();
                model.resize(16, 0);
                ok(model)
            }
            op if op.is_firmware_query() => {
                match self.firmware.iter().find(|(query, _)| *query == op) {
                    Some((_, Some(version))) => ok(version.clone().into_bytes()),
                    _ => fail(1),
                }
            }
            _ => ok(Vec::new()),
        }
    }
}

/// Read one command frame, `None` once the host hangs up
async fn read_command(io: &mut DuplexStream) -> Option<CommandFrame> {
    let mut header = [0u8; HEADER_SIZE];
    loop {
        io.read_exact(&mut header[..1]).await.ok()?;
        if header[0] == control::STX {
            break;
        }
    }
    io.read_exact(&mut header[1..]).await.ok()?;
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;

    let mut raw = header.to_vec();
    raw.resize(HEADER_SIZE + len + CRC_SIZE, 0);
    io.read_exact(&mut raw[HEADER_SIZE..]).await.ok()?;

    Some(CommandFrame::decode(&raw).unwrap())
}

/// Reader wired to a running simulator
pub fn start(sim: SimReader, config: ReaderConfig) -> (Reader, JoinHandle<SimReader>) {
    let (connector, device) = DuplexConnector::pair();
    let task = tokio::spawn(sim.run(device));
    (Reader::with_connector(config, connector), task)
}

pub fn keys() -> (DesKey, DesKey) {
    (DesKey::generate().unwrap(), DesKey::generate().unwrap())
}
