//! BLE adapter error types.

use bandlink_domain::address::DeviceAddress;
use bandlink_domain::error::{BandError, ConnectionError, DiscoveryError, GattOp, TransportError};

/// Errors specific to the BLE adapter.
#[derive(Debug, thiserror::Error)]
pub enum BleError {
    /// No BLE adapter at the configured index.
    #[error("no BLE adapter available at index {index}")]
    NotAvailable {
        /// Requested adapter index.
        index: usize,
    },

    /// A radio-level operation failed.
    #[error("BLE radio error")]
    Radio(#[from] btleplug::Error),
}

impl From<BleError> for BandError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::NotAvailable { .. } => DiscoveryError::RadioUnavailable.into(),
            BleError::Radio(btleplug::Error::PermissionDenied) => {
                DiscoveryError::PermissionDenied.into()
            }
            BleError::Radio(err) => DiscoveryError::Scan(Box::new(err)).into(),
        }
    }
}

/// Map a failed GATT operation on `characteristic`.
///
/// Link loss becomes [`TransportError::NotConnected`] so the session can
/// tell it apart from a rejected operation.
pub(crate) fn gatt(op: GattOp, characteristic: uuid::Uuid, err: btleplug::Error) -> BandError {
    match err {
        btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => {
            TransportError::NotConnected.into()
        }
        btleplug::Error::NoSuchCharacteristic => {
            TransportError::CharacteristicNotFound {
                uuid: characteristic,
            }
            .into()
        }
        err => TransportError::Gatt {
            op,
            characteristic,
            source: Box::new(err),
        }
        .into(),
    }
}

/// Map a failed link setup with `address`.
pub(crate) fn refused(address: DeviceAddress, err: btleplug::Error) -> BandError {
    ConnectionError::Refused {
        address,
        source: Some(Box::new(err)),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_display_not_available_error() {
        let err = BleError::NotAvailable { index: 1 };
        assert_eq!(err.to_string(), "no BLE adapter available at index 1");
    }

    #[test]
    fn should_convert_not_available_to_radio_unavailable() {
        let err: BandError = BleError::NotAvailable { index: 0 }.into();
        assert!(matches!(
            err,
            BandError::Discovery(DiscoveryError::RadioUnavailable)
        ));
    }

    #[test]
    fn should_convert_permission_denied() {
        let err: BandError = BleError::Radio(btleplug::Error::PermissionDenied).into();
        assert!(matches!(
            err,
            BandError::Discovery(DiscoveryError::PermissionDenied)
        ));
    }

    #[test]
    fn should_map_lost_link_to_not_connected() {
        let err = gatt(GattOp::Write, uuid::Uuid::nil(), btleplug::Error::NotConnected);
        assert!(err.is_link_lost());
    }

    #[test]
    fn should_keep_characteristic_on_gatt_failure() {
        let uuid = uuid::Uuid::from_u128(0x0000_0009_0000_3512_2118_0009_af10_0700);
        let err = gatt(
            GattOp::Read,
            uuid,
            btleplug::Error::RuntimeError("busy".to_owned()),
        );
        let BandError::Transport(TransportError::Gatt {
            op, characteristic, ..
        }) = err
        else {
            panic!("expected a GATT failure, got {err:?}");
        };
        assert_eq!(op, GattOp::Read);
        assert_eq!(characteristic, uuid);
        assert!(!BandError::from(TransportError::CharacteristicNotFound { uuid }).is_link_lost());
    }

    #[test]
    fn should_map_refused_link() {
        let address = DeviceAddress::new([1, 2, 3, 4, 5, 6]);
        let err = refused(address, btleplug::Error::TimedOut(std::time::Duration::from_secs(1)));
        assert!(matches!(
            err,
            BandError::Connection(ConnectionError::Refused { address: a, .. }) if a == address
        ));
    }
}
