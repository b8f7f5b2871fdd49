//! Device Notification Stream
//!
//! After a successful `Listen` the multiplexer socket only carries
//! notifications: one `Attached` per device already present, then
//! `Attached`/`Detached`/`Paired` as devices come and go.

use super::client::read_frame;
use super::message::MuxerResponse;
use crate::device::Device;
use crate::transport::{guarded, BoxChannel};
use crate::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attach/detach notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device attached
    Attached(Device),
    /// A device detached
    Detached {
        /// Multiplexer device id
        device_id: u32,
    },
    /// A device completed pairing with this host
    Paired {
        /// Multiplexer device id
        device_id: u32,
    },
}

/// Notification stream produced by [`super::MuxerClient::listen`]
pub struct DeviceEvents {
    channel: Option<BoxChannel>,
    max_frame_size: usize,
    cancel: Option<CancellationToken>,
}

impl DeviceEvents {
    pub(crate) fn new(
        channel: BoxChannel,
        max_frame_size: usize,
        cancel: Option<CancellationToken>,
    ) -> Self {
        Self {
            channel: Some(channel),
            max_frame_size,
            cancel,
        }
    }

    /// Wait for the next notification
    ///
    /// Returns `None` once the daemon closes the stream. Messages that are
    /// not notifications are logged and skipped. After an error the stream
    /// is closed and further calls return `None`.
    pub async fn next_event(&mut self) -> Result<Option<DeviceEvent>> {
        loop {
            let Some(channel) = self.channel.as_mut() else {
                return Ok(None);
            };

            let max = self.max_frame_size;
            let frame = match guarded(self.cancel.as_ref(), None, read_frame(channel, max)).await {
                Ok(Some((_, body))) => body,
                Ok(None) => {
                    debug!("Multiplexer closed the notification stream");
                    self.channel = None;
                    return Ok(None);
                }
                Err(e) => {
                    self.channel = None;
                    return Err(e);
                }
            };

            match MuxerResponse::from_plist(frame) {
                Ok(MuxerResponse::Attached(device)) => return Ok(Some(DeviceEvent::Attached(device))),
                Ok(MuxerResponse::Detached { device_id }) => {
                    return Ok(Some(DeviceEvent::Detached { device_id }))
                }
                Ok(MuxerResponse::Paired { device_id }) => {
                    return Ok(Some(DeviceEvent::Paired { device_id }))
                }
                Ok(other) => warn!("Ignoring non-notification message: {:?}", other),
                Err(e) => warn!("Ignoring unreadable notification: {}", e),
            }
        }
    }

    /// Forward notifications to a channel from a background task
    ///
    /// The receiver yields events until the stream ends or fails.
    pub fn subscribe(mut self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match self.next_event().await {
                    Ok(Some(event)) => {
                        if tx.send(event).is_err() {
                            debug!("Notification subscriber dropped");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Notification stream failed: {}", e);
                        break;
                    }
                }
            }
            info!("Stopped forwarding device notifications");
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::super::client::{write_frame, MuxerClient};
    use super::super::message::MuxerRequest;
    use super::*;
    use crate::device::ConnectionType;
    use crate::error::MuxerResultCode;

    #[tokio::test]
    async fn test_listen_yields_notifications() {
        let (a, mut daemon) = tokio::io::duplex(64 * 1024);
        let client = MuxerClient::new(Box::new(a));

        tokio::spawn(async move {
            let (tag, body) = read_frame(&mut daemon, 1 << 20).await.unwrap().unwrap();
            assert_eq!(MuxerRequest::from_plist(&body).unwrap(), MuxerRequest::Listen);
            for (tag, response) in [
                (tag, MuxerResponse::Result(MuxerResultCode::Ok)),
                (0, MuxerResponse::Attached(Device::new(5, "five", ConnectionType::Usb))),
                (0, MuxerResponse::Result(MuxerResultCode::Ok)),
                (0, MuxerResponse::Detached { device_id: 5 }),
            ] {
                write_frame(&mut daemon, tag, &response.to_plist()).await.unwrap();
            }
        });

        let mut events = client.listen().await.unwrap();
        assert_eq!(
            events.next_event().await.unwrap(),
            Some(DeviceEvent::Attached(Device::new(5, "five", ConnectionType::Usb)))
        );
        assert_eq!(
            events.next_event().await.unwrap(),
            Some(DeviceEvent::Detached { device_id: 5 })
        );
        assert_eq!(events.next_event().await.unwrap(), None);
        assert_eq!(events.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribe_forwards_until_close() {
        let (a, mut daemon) = tokio::io::duplex(64 * 1024);
        let events = DeviceEvents::new(Box::new(a), 1 << 20, None);

        tokio::spawn(async move {
            let response = MuxerResponse::Paired { device_id: 9 };
            write_frame(&mut daemon, 0, &response.to_plist()).await.unwrap();
        });

        let mut rx = events.subscribe();
        assert_eq!(rx.recv().await, Some(DeviceEvent::Paired { device_id: 9 }));
        assert_eq!(rx.recv().await, None);
    }
}
