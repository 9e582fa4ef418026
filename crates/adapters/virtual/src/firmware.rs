//! Simulated firmware: how the tracker answers each write.
//!
//! [`Firmware::handle`] never performs IO; it returns the [`Effect`]s the
//! transport has to carry out once its lock is released.

use uuid::Uuid;

use bandlink_app::protocol::codec::{self, CHALLENGE_LEN};
use bandlink_app::protocol::{Channel, ProtocolTable};
use bandlink_app::services::cipher;
use bandlink_domain::error::{BandError, GattOp, ProtocolError, TransportError};
use bandlink_domain::key::AuthKey;

use crate::device::{Faults, VirtualBand};

const RESPONSE: u8 = 0x10;
const SUCCESS: u8 = 0x01;
const FAILURE: u8 = 0x04;
const SAMPLES_PER_PACKET: usize = 4;

/// Something the transport must do after a write was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    Notify(Uuid, Vec<u8>),
    StartLive,
    StopLive,
    /// Push `packets` on the activity channel, then `done` on fetch control.
    Transfer { packets: Vec<Vec<u8>>, done: Vec<u8> },
}

/// Device-side protocol state.
pub(crate) struct Firmware {
    pub band: VirtualBand,
    pub faults: Faults,
    table: &'static ProtocolTable,
    challenge: Option<[u8; CHALLENGE_LEN]>,
    pending_history: Option<Vec<Vec<u8>>>,
}

impl Firmware {
    pub(crate) fn new(band: VirtualBand, table: &'static ProtocolTable) -> Self {
        Self {
            band,
            faults: Faults::default(),
            table,
            challenge: None,
            pending_history: None,
        }
    }

    fn uuid(&self, channel: Channel) -> Result<Uuid, BandError> {
        Ok(self.table.uuid(channel)?)
    }

    fn channel(&self, uuid: Uuid) -> Result<Channel, BandError> {
        CHANNELS
            .iter()
            .copied()
            .find(|channel| self.table.uuid(*channel).is_ok_and(|u| u == uuid))
            .ok_or_else(|| TransportError::CharacteristicNotFound { uuid }.into())
    }

    /// React to a write on `uuid`.
    pub(crate) fn handle(&mut self, uuid: Uuid, bytes: &[u8]) -> Result<Vec<Effect>, BandError> {
        if let Some(prefix) = &self.faults.fail_prefix {
            if bytes.starts_with(prefix) {
                return Err(TransportError::Gatt {
                    op: GattOp::Write,
                    characteristic: uuid,
                    source: "simulated write failure".into(),
                }
                .into());
            }
        }
        match self.channel(uuid)? {
            Channel::Auth => self.auth(bytes),
            Channel::CurrentTime => {
                self.band.clock = codec::decode_device_time(bytes)?;
                Ok(Vec::new())
            }
            Channel::HeartRateControl => Ok(match bytes {
                [0x15, 0x01, 0x01] => vec![Effect::StartLive],
                [0x15, 0x01, 0x00] | [0x15, 0x02, 0x00] => vec![Effect::StopLive],
                _ => Vec::new(),
            }),
            Channel::FetchControl => self.fetch(bytes),
            Channel::Configuration | Channel::UserSettings => Ok(Vec::new()),
            _ => Err(TransportError::Gatt {
                op: GattOp::Write,
                characteristic: uuid,
                source: "characteristic is not writable".into(),
            }
            .into()),
        }
    }

    fn auth(&mut self, bytes: &[u8]) -> Result<Vec<Effect>, BandError> {
        let auth = self.uuid(Channel::Auth)?;
        let reply = match bytes {
            [0x01, 0x00, key @ ..] => {
                let key: [u8; 16] = key.try_into().map_err(|_| ProtocolError::WrongLength {
                    format: "auth key",
                    expected: 16,
                    actual: key.len(),
                })?;
                if self.faults.reject_pairing {
                    vec![RESPONSE, 0x01, FAILURE]
                } else {
                    self.band.key = Some(AuthKey::new(key));
                    vec![RESPONSE, 0x01, SUCCESS]
                }
            }
            [0x02, 0x00] => {
                let challenge: [u8; CHALLENGE_LEN] = rand::random();
                self.challenge = Some(challenge);
                let mut reply = vec![RESPONSE, 0x02, SUCCESS];
                reply.extend_from_slice(&challenge);
                reply
            }
            [0x03, 0x00, response @ ..] => {
                let expected = self
                    .challenge
                    .take()
                    .zip(self.band.key.as_ref())
                    .map(|(challenge, key)| cipher::respond(key, &challenge));
                if expected.is_some_and(|expected| expected.as_slice() == response) {
                    vec![RESPONSE, 0x03, SUCCESS]
                } else {
                    vec![RESPONSE, 0x03, FAILURE]
                }
            }
            _ => {
                return Err(ProtocolError::UnexpectedResponse {
                    format: "auth command",
                    bytes: bytes.iter().take(4).copied().collect(),
                }
                .into());
            }
        };
        Ok(vec![Effect::Notify(auth, reply)])
    }

    fn fetch(&mut self, bytes: &[u8]) -> Result<Vec<Effect>, BandError> {
        let control = self.uuid(Channel::FetchControl)?;
        match bytes {
            [0x01, 0x01, range @ ..] => {
                let since = codec::decode_range_start(range)?;
                let history = &self.band.history;
                let first = (0..history.minutes.len())
                    .find(|i| history.minute(*i) >= since)
                    .unwrap_or(history.minutes.len());
                let selected = &history.minutes[first..];
                let start = history.minute(first);

                let packets: Vec<Vec<u8>> = selected
                    .chunks(SAMPLES_PER_PACKET)
                    .enumerate()
                    .map(|(counter, chunk)| {
                        #[allow(clippy::cast_possible_truncation)]
                        let mut packet = vec![counter as u8];
                        for sample in chunk {
                            packet.extend_from_slice(&[
                                sample.kind,
                                sample.intensity,
                                sample.steps,
                                sample.heart_rate,
                            ]);
                        }
                        packet
                    })
                    .collect();
                let expected = u32::try_from(selected.len() * 4).unwrap_or(u32::MAX);
                self.pending_history = Some(packets);

                let mut reply = vec![RESPONSE, 0x01, SUCCESS];
                reply.extend_from_slice(&expected.to_le_bytes());
                let encoded = codec::encode_device_time(&start.fixed_offset())?;
                // metadata carries the time without weekday and fractions
                reply.extend_from_slice(&encoded[..7]);
                reply.push(encoded[10]);
                Ok(vec![Effect::Notify(control, reply)])
            }
            [0x02] => {
                let packets = self.pending_history.take().unwrap_or_default();
                if self.faults.stall_history {
                    return Ok(Vec::new());
                }
                Ok(vec![Effect::Transfer {
                    packets,
                    done: vec![RESPONSE, 0x02, SUCCESS],
                }])
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Value of a readable characteristic.
    pub(crate) fn read(&self, uuid: Uuid) -> Result<Vec<u8>, BandError> {
        Ok(match self.channel(uuid)? {
            Channel::CurrentTime => codec::encode_device_time(&self.band.clock.fixed_offset())?.to_vec(),
            Channel::Battery => vec![
                0x0f,
                self.band.battery.level,
                u8::from(self.band.battery.charging),
            ],
            Channel::HardwareRevision => self.band.hardware_revision.as_bytes().to_vec(),
            Channel::FirmwareRevision => self.band.firmware_revision.as_bytes().to_vec(),
            _ => {
                return Err(TransportError::Gatt {
                    op: GattOp::Read,
                    characteristic: uuid,
                    source: "characteristic is not readable".into(),
                }
                .into());
            }
        })
    }

    /// Check a characteristic exists before subscribing to it.
    pub(crate) fn check(&self, uuid: Uuid) -> Result<(), BandError> {
        self.channel(uuid).map(|_| ())
    }
}

const CHANNELS: [Channel; 11] = [
    Channel::Auth,
    Channel::Configuration,
    Channel::FetchControl,
    Channel::ActivityData,
    Channel::Battery,
    Channel::UserSettings,
    Channel::CurrentTime,
    Channel::HeartRateMeasurement,
    Channel::HeartRateControl,
    Channel::HardwareRevision,
    Channel::FirmwareRevision,
];
