use tokio::sync::{mpsc, oneshot};
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.greeter.Station1";
pub const OBJECT_PATH: &str = "/org/greeter/Station1";

/// Requests forwarded from D-Bus handlers to the scheduler loop.
#[derive(Debug)]
pub enum StationCommand {
    Verify {
        reply: oneshot::Sender<Result<(), String>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<String>,
    },
    Reload {
        reply: oneshot::Sender<Result<usize, String>>,
    },
}

/// D-Bus interface for the greeter station.
///
/// Bus name: org.greeter.Station1
/// Object path: /org/greeter/Station1
pub struct StationService {
    tx: mpsc::Sender<StationCommand>,
}

impl StationService {
    pub fn new(tx: mpsc::Sender<StationCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> StationCommand,
    ) -> fdo::Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| fdo::Error::Failed("station loop stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| fdo::Error::Failed("station loop dropped the request".into()))
    }
}

#[interface(name = "org.greeter.Station1")]
impl StationService {
    /// Start a verification session.
    async fn verify(&self) -> fdo::Result<String> {
        tracing::info!("verify requested");
        self.request(|reply| StationCommand::Verify { reply })
            .await?
            .map_err(fdo::Error::Failed)?;
        Ok("running".into())
    }

    /// Cancel the running session. `false` if none was running.
    async fn cancel(&self) -> fdo::Result<bool> {
        tracing::info!("cancel requested");
        self.request(|reply| StationCommand::Cancel { reply }).await
    }

    /// Station status as JSON.
    async fn status(&self) -> fdo::Result<String> {
        self.request(|reply| StationCommand::Status { reply }).await
    }

    /// Reload the identity registry; returns the identity count.
    async fn reload(&self) -> fdo::Result<u32> {
        tracing::info!("reload requested");
        let count = self
            .request(|reply| StationCommand::Reload { reply })
            .await?
            .map_err(fdo::Error::Failed)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
