//! Scanner: turns central events into advertisements.

use btleplug::api::{Central, CentralEvent, Peripheral as _, PeripheralProperties};
use btleplug::platform::Adapter;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt as _};

use bandlink_app::ports::Advertisement;
use bandlink_domain::address::DeviceAddress;

pub(crate) fn advertisement(properties: &PeripheralProperties) -> Advertisement {
    Advertisement {
        address: DeviceAddress::new(properties.address.into_inner()),
        name: properties.local_name.clone(),
        rssi: properties.rssi,
    }
}

/// Forward every discovered or updated peripheral until the receiver goes
/// away or the event stream ends.
pub(crate) async fn forward<S>(central: Adapter, mut events: S, sender: mpsc::Sender<Advertisement>)
where
    S: Stream<Item = CentralEvent> + Send + Unpin,
{
    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => continue,
        };
        let Ok(peripheral) = central.peripheral(&id).await else {
            continue;
        };
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => continue,
            Err(err) => {
                tracing::debug!(%err, "skipping peripheral without properties");
                continue;
            }
        };
        let advert = advertisement(&properties);
        tracing::trace!(address = %advert.address, name = ?advert.name, rssi = ?advert.rssi, "advertisement");
        if sender.send(advert).await.is_err() {
            break;
        }
    }
    tracing::debug!("advertisement forwarding stopped");
}

#[cfg(test)]
mod tests {
    use btleplug::api::BDAddr;

    use super::*;

    #[test]
    fn should_map_properties_to_advertisement() {
        let properties = PeripheralProperties {
            address: BDAddr::from([0xa4, 0xc1, 0x38, 0x5b, 0x0e, 0xdf]),
            local_name: Some("Mi Band 3".to_owned()),
            rssi: Some(-61),
            ..PeripheralProperties::default()
        };

        let advert = advertisement(&properties);

        assert_eq!(
            advert.address,
            DeviceAddress::new([0xa4, 0xc1, 0x38, 0x5b, 0x0e, 0xdf])
        );
        assert_eq!(advert.name.as_deref(), Some("Mi Band 3"));
        assert_eq!(advert.rssi, Some(-61));
    }

    #[test]
    fn should_keep_nameless_advertisement() {
        let advert = advertisement(&PeripheralProperties::default());
        assert!(advert.name.is_none());
        assert!(advert.rssi.is_none());
    }
}
