//! GATT helpers over a connected peripheral.

use btleplug::api::{Characteristic, Peripheral as _};
use btleplug::platform::Peripheral;
use tokio_stream::StreamExt as _;

use bandlink_app::ports::NotificationStream;
use bandlink_domain::error::{BandError, GattOp, TransportError};

use crate::error;

/// Find a GATT characteristic by UUID on a peripheral that has already
/// discovered its services.
///
/// # Errors
///
/// Returns [`TransportError::CharacteristicNotFound`] if no characteristic
/// with the given UUID is present.
pub(crate) fn find_characteristic(
    peripheral: &Peripheral,
    uuid: uuid::Uuid,
) -> Result<Characteristic, BandError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| TransportError::CharacteristicNotFound { uuid }.into())
}

/// Values notified on `uuid`, in arrival order.
///
/// btleplug multiplexes every characteristic of a peripheral onto one
/// stream per call, so each subscription filters its own.
pub(crate) async fn notifications(
    peripheral: &Peripheral,
    uuid: uuid::Uuid,
) -> Result<NotificationStream, BandError> {
    let stream = peripheral
        .notifications()
        .await
        .map_err(|err| error::gatt(GattOp::Subscribe, uuid, err))?;
    Ok(Box::pin(
        stream
            .filter(move |notification| notification.uuid == uuid)
            .map(|notification| notification.value),
    ))
}
