//! Hand-off of collected batches to the outside world.
//!
//! Transport to a cloud endpoint is the application's business; the
//! device manager only needs to know whether a hand-off was accepted.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::data::DeviceBatch;

/// Receives the batches collected since the last upload.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Deliver `batches`; `false` means they were not accepted and will be
    /// offered again with the next upload.
    async fn upload(&self, batches: Vec<DeviceBatch>) -> bool;
}

/// [`Uploader`] that forwards batches over a bounded channel.
///
/// A full or closed channel counts as a rejected upload.
#[derive(Debug, Clone)]
pub struct ChannelUploader {
    sender: mpsc::Sender<Vec<DeviceBatch>>,
}

impl ChannelUploader {
    /// Create the uploader and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<DeviceBatch>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Uploader for ChannelUploader {
    async fn upload(&self, batches: Vec<DeviceBatch>) -> bool {
        match self.sender.try_send(batches) {
            Ok(()) => true,
            Err(e) => {
                debug!("Upload channel refused batches: {}", e);
                false
            }
        }
    }
}
