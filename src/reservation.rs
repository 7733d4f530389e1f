//! Persistent reservations for shared (clustered) disks.
//!
//! Serves the SHARED request. Each peer channel registers a 64-bit key; one
//! registered channel may then hold the reservation. The table follows the
//! SCSI-3 persistent reservation model in a reduced form: a single
//! reservation, no scope beyond the whole logical unit, and the reservation
//! type carried opaquely.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::protocol::{SharedRequest, SharedResponse};

/// Operation codes carried in [`SharedRequest::operation`].
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedOperation {
    GetUniqueId = 0,
    ReadKeys = 1,
    Register = 2,
    RegisterIgnoreExisting = 3,
    Unregister = 4,
    Reserve = 5,
    Release = 6,
    Preempt = 7,
    Clear = 8,
}

impl SharedOperation {
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => SharedOperation::GetUniqueId,
            1 => SharedOperation::ReadKeys,
            2 => SharedOperation::Register,
            3 => SharedOperation::RegisterIgnoreExisting,
            4 => SharedOperation::Unregister,
            5 => SharedOperation::Reserve,
            6 => SharedOperation::Release,
            7 => SharedOperation::Preempt,
            8 => SharedOperation::Clear,
            _ => return None,
        })
    }
}

/// Response codes carried in [`SharedResponse::error_code`].
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedResponseCode {
    NoError = 0,
    ReservationCollision = 1,
    InvalidParameter = 2,
    IoError = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    channel: u64,
    key: u64,
    scope: u64,
    kind: u64,
}

#[derive(Debug, Default)]
struct TableState {
    /// channel key -> registration key
    registrations: BTreeMap<u64, u64>,
    reservation: Option<Reservation>,
    generation: u64,
}

/// In-memory persistent reservation table.
#[derive(Debug)]
pub struct ReservationTable {
    unique_id: [u64; 2],
    state: Mutex<TableState>,
}

impl Default for ReservationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationTable {
    /// Create an empty table with a random unique identifier.
    pub fn new() -> Self {
        let mut raw = [0u8; 16];
        if getrandom::getrandom(&mut raw).is_err() {
            tracing::warn!("no system randomness, reservation table id derived from time");
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            raw = nanos.to_le_bytes();
        }
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&raw[..8]);
        hi.copy_from_slice(&raw[8..]);
        Self::with_unique_id([u64::from_le_bytes(lo), u64::from_le_bytes(hi)])
    }

    /// Create an empty table with a fixed identifier.
    pub fn with_unique_id(unique_id: [u64; 2]) -> Self {
        Self {
            unique_id,
            state: Mutex::new(TableState::default()),
        }
    }

    pub fn unique_id(&self) -> [u64; 2] {
        self.unique_id
    }

    /// Registered keys, in channel order.
    pub fn keys(&self) -> Vec<u64> {
        self.state.lock().registrations.values().copied().collect()
    }

    /// Apply a SHARED request and build the response and key list.
    ///
    /// `current_channel_key` names the calling channel,
    /// `existing_reservation_key` is the caller's current registration key and
    /// `operation_channel_key` is the operation's argument key (the new key for
    /// Register, the victim key for Preempt).
    pub fn handle(&self, request: &SharedRequest) -> (SharedResponse, Vec<u64>) {
        let mut state = self.state.lock();
        let channel = request.current_channel_key;
        let caller_key = request.existing_reservation_key;
        let arg_key = request.operation_channel_key;

        let mut keys = Vec::new();
        let code = match SharedOperation::from_code(request.operation) {
            None => SharedResponseCode::InvalidParameter,
            Some(SharedOperation::GetUniqueId) => SharedResponseCode::NoError,
            Some(SharedOperation::ReadKeys) => {
                keys = state.registrations.values().copied().collect();
                SharedResponseCode::NoError
            }
            Some(SharedOperation::Register) => match state.registrations.get(&channel).copied() {
                Some(current) if current != caller_key => SharedResponseCode::ReservationCollision,
                None if caller_key != 0 => SharedResponseCode::ReservationCollision,
                _ => {
                    state.set_registration(channel, arg_key);
                    SharedResponseCode::NoError
                }
            },
            Some(SharedOperation::RegisterIgnoreExisting) => {
                state.set_registration(channel, arg_key);
                SharedResponseCode::NoError
            }
            Some(SharedOperation::Unregister) => {
                if state.is_registered(channel, caller_key) {
                    state.set_registration(channel, 0);
                    SharedResponseCode::NoError
                } else {
                    SharedResponseCode::ReservationCollision
                }
            }
            Some(SharedOperation::Reserve) => {
                if !state.is_registered(channel, caller_key) {
                    SharedResponseCode::ReservationCollision
                } else {
                    match state.reservation {
                        None => {
                            state.reservation = Some(Reservation {
                                channel,
                                key: caller_key,
                                scope: request.reserve_scope,
                                kind: request.reserve_type,
                            });
                            SharedResponseCode::NoError
                        }
                        Some(r) if r.channel == channel && r.kind == request.reserve_type => {
                            SharedResponseCode::NoError
                        }
                        Some(_) => SharedResponseCode::ReservationCollision,
                    }
                }
            }
            Some(SharedOperation::Release) => {
                if !state.is_registered(channel, caller_key) {
                    SharedResponseCode::ReservationCollision
                } else {
                    match state.reservation {
                        Some(r) if r.channel == channel && r.kind != request.reserve_type => {
                            SharedResponseCode::InvalidParameter
                        }
                        Some(r) if r.channel == channel => {
                            state.reservation = None;
                            state.generation += 1;
                            SharedResponseCode::NoError
                        }
                        // Releasing a reservation held by someone else is a no-op.
                        _ => SharedResponseCode::NoError,
                    }
                }
            }
            Some(SharedOperation::Preempt) => {
                if !state.is_registered(channel, caller_key) || arg_key == 0 {
                    SharedResponseCode::ReservationCollision
                } else {
                    state.preempt(channel, caller_key, arg_key, request);
                    SharedResponseCode::NoError
                }
            }
            Some(SharedOperation::Clear) => {
                if !state.is_registered(channel, caller_key) {
                    SharedResponseCode::ReservationCollision
                } else {
                    state.registrations.clear();
                    state.reservation = None;
                    state.generation += 1;
                    SharedResponseCode::NoError
                }
            }
        };

        let reservation = state.reservation;
        let response = SharedResponse {
            error_code: code as u64,
            unique_id: self.unique_id,
            channel_key: channel,
            generation: state.generation,
            reservation_key: reservation.map(|r| r.key).unwrap_or(0),
            reservation_scope: reservation.map(|r| r.scope).unwrap_or(0),
            reservation_type: reservation.map(|r| r.kind).unwrap_or(0),
            length: (keys.len() * 8) as u64,
        };

        tracing::trace!(
            operation = request.operation,
            channel,
            code = ?code,
            generation = state.generation,
            "shared request"
        );

        (response, keys)
    }
}

impl TableState {
    fn is_registered(&self, channel: u64, key: u64) -> bool {
        key != 0 && self.registrations.get(&channel) == Some(&key)
    }

    /// Register `key` for `channel`; a zero key removes the registration and
    /// any reservation the channel holds.
    fn set_registration(&mut self, channel: u64, key: u64) {
        if key == 0 {
            if self.registrations.remove(&channel).is_some() {
                if matches!(self.reservation, Some(r) if r.channel == channel) {
                    self.reservation = None;
                }
                self.generation += 1;
            }
        } else {
            self.registrations.insert(channel, key);
            if let Some(r) = self.reservation.as_mut() {
                if r.channel == channel {
                    r.key = key;
                }
            }
            self.generation += 1;
        }
    }

    fn preempt(&mut self, channel: u64, caller_key: u64, victim_key: u64, request: &SharedRequest) {
        let holder_preempted = matches!(self.reservation, Some(r) if r.key == victim_key);
        self.registrations
            .retain(|&ch, &mut key| ch == channel || key != victim_key);
        if holder_preempted {
            self.reservation = Some(Reservation {
                channel,
                key: caller_key,
                scope: request.reserve_scope,
                kind: request.reserve_type,
            });
        }
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(op: SharedOperation, channel: u64, key: u64, arg: u64) -> SharedRequest {
        SharedRequest {
            operation: op as u64,
            reserve_type: 1,
            current_channel_key: channel,
            existing_reservation_key: key,
            operation_channel_key: arg,
            ..Default::default()
        }
    }

    fn code(table: &ReservationTable, req: SharedRequest) -> u64 {
        table.handle(&req).0.error_code
    }

    #[test]
    fn test_register_and_read_keys() {
        let table = ReservationTable::with_unique_id([7, 8]);
        assert_eq!(code(&table, request(SharedOperation::Register, 1, 0, 0xA)), 0);
        assert_eq!(code(&table, request(SharedOperation::Register, 2, 0, 0xB)), 0);

        let (resp, keys) = table.handle(&request(SharedOperation::ReadKeys, 1, 0, 0));
        assert_eq!(keys, vec![0xA, 0xB]);
        assert_eq!(resp.length, 16);
        assert_eq!(resp.unique_id, [7, 8]);
        assert_eq!(resp.generation, 2);
    }

    #[test]
    fn test_register_with_wrong_existing_key_collides() {
        let table = ReservationTable::new();
        code(&table, request(SharedOperation::Register, 1, 0, 0xA));
        assert_eq!(
            code(&table, request(SharedOperation::Register, 1, 0xBAD, 0xC)),
            SharedResponseCode::ReservationCollision as u64
        );
        assert_eq!(
            code(&table, request(SharedOperation::RegisterIgnoreExisting, 1, 0, 0xC)),
            0
        );
        assert_eq!(table.keys(), vec![0xC]);
    }

    #[test]
    fn test_reserve_conflict_and_release() {
        let table = ReservationTable::new();
        code(&table, request(SharedOperation::Register, 1, 0, 0xA));
        code(&table, request(SharedOperation::Register, 2, 0, 0xB));

        assert_eq!(code(&table, request(SharedOperation::Reserve, 1, 0xA, 0)), 0);
        assert_eq!(
            code(&table, request(SharedOperation::Reserve, 2, 0xB, 0)),
            SharedResponseCode::ReservationCollision as u64
        );

        let (resp, _) = table.handle(&request(SharedOperation::Release, 1, 0xA, 0));
        assert_eq!(resp.error_code, 0);
        assert_eq!(resp.reservation_key, 0);
        assert_eq!(code(&table, request(SharedOperation::Reserve, 2, 0xB, 0)), 0);
    }

    #[test]
    fn test_unregistered_channel_cannot_reserve() {
        let table = ReservationTable::new();
        assert_eq!(
            code(&table, request(SharedOperation::Reserve, 9, 0x1, 0)),
            SharedResponseCode::ReservationCollision as u64
        );
    }

    #[test]
    fn test_preempt_takes_over_reservation() {
        let table = ReservationTable::new();
        code(&table, request(SharedOperation::Register, 1, 0, 0xA));
        code(&table, request(SharedOperation::Register, 2, 0, 0xB));
        code(&table, request(SharedOperation::Reserve, 1, 0xA, 0));

        let (resp, _) = table.handle(&request(SharedOperation::Preempt, 2, 0xB, 0xA));
        assert_eq!(resp.error_code, 0);
        assert_eq!(resp.reservation_key, 0xB);
        assert_eq!(table.keys(), vec![0xB]);
    }

    #[test]
    fn test_unregister_drops_held_reservation() {
        let table = ReservationTable::new();
        code(&table, request(SharedOperation::Register, 1, 0, 0xA));
        code(&table, request(SharedOperation::Reserve, 1, 0xA, 0));
        let (resp, _) = table.handle(&request(SharedOperation::Unregister, 1, 0xA, 0));
        assert_eq!(resp.reservation_key, 0);
        assert!(table.keys().is_empty());
    }

    #[test]
    fn test_unregister_needs_caller_key() {
        let table = ReservationTable::new();
        code(&table, request(SharedOperation::Register, 1, 0, 0xA));
        assert_eq!(
            code(&table, request(SharedOperation::Unregister, 1, 0xB, 0)),
            SharedResponseCode::ReservationCollision as u64
        );
        assert_eq!(
            code(&table, request(SharedOperation::Unregister, 2, 0xA, 0)),
            SharedResponseCode::ReservationCollision as u64
        );
        assert_eq!(table.keys(), vec![0xA]);
    }

    #[test]
    fn test_clear_and_invalid_operation() {
        let table = ReservationTable::new();
        code(&table, request(SharedOperation::Register, 1, 0, 0xA));
        code(&table, request(SharedOperation::Register, 2, 0, 0xB));
        assert_eq!(code(&table, request(SharedOperation::Clear, 2, 0xB, 0)), 0);
        assert!(table.keys().is_empty());

        let bogus = SharedRequest {
            operation: 99,
            ..Default::default()
        };
        assert_eq!(
            code(&table, bogus),
            SharedResponseCode::InvalidParameter as u64
        );
    }
}
