//! Device session manager.
//!
//! Probes enumerate devices, try to establish a session and record the
//! resulting [`ConnectionState`]. Nothing from a probe is kept except that
//! state. While a job holds a session, probes and other acquisitions share
//! its link instead of connecting again.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use penumbra_schema::{ConnectionState, DeviceInfo, KeySource};
use reqwest::Client;
use tracing::debug;

use super::commands::DeviceSession;
use super::signer::RemoteSigner;
use super::{DeviceLink, SessionCredential, Transport};
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};

const NO_DEVICE: &str = "No device connected. Connect the device over USB and enable debugging.";

pub struct DeviceSessionManager {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    client: Client,
    state: Mutex<ConnectionState>,
    // Shared by every session so device operations never interleave.
    device_lock: Arc<tokio::sync::Mutex<()>>,
    // Link of the most recently acquired session, alive while a job holds it.
    live: Mutex<Option<Weak<dyn DeviceLink>>>,
}

/// A session could not be established.
#[derive(Debug)]
struct Refused {
    /// Devices enumerated before the failure.
    device_count: usize,
    error: Error,
}

impl Refused {
    fn new(device_count: usize, error: Error) -> Self {
        Self {
            device_count,
            error,
        }
    }
}

impl fmt::Debug for DeviceSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSessionManager")
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DeviceSessionManager {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<CredentialStore>, client: Client) -> Self {
        Self {
            transport,
            credentials,
            client,
            state: Mutex::new(ConnectionState::Unknown),
            device_lock: Arc::new(tokio::sync::Mutex::new(())),
            live: Mutex::new(None),
        }
    }

    /// State recorded by the most recent probe or acquisition.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Test reachability. Failures are reported in the returned info, never
    /// as an error.
    pub async fn probe(&self) -> DeviceInfo {
        self.set_state(ConnectionState::Probing);
        let info = match self.establish().await {
            Ok(session) => DeviceInfo {
                connected: true,
                device_count: 1,
                serial: Some(session.serial().to_string()),
                error_message: None,
                state: ConnectionState::Connected,
            },
            Err(Refused {
                error: Error::DeviceAmbiguous(n),
                ..
            }) => DeviceInfo {
                connected: false,
                device_count: n,
                serial: None,
                error_message: Some(format!(
                    "Multiple devices connected ({n}). Disconnect all but one."
                )),
                state: ConnectionState::Ambiguous,
            },
            Err(Refused {
                device_count,
                error,
            }) => DeviceInfo::disconnected(device_count, error.to_string()),
        };
        debug!(state = ?info.state, count = info.device_count, "device probe");
        self.set_state(info.state);
        info
    }

    /// Establish a session for a job.
    pub async fn acquire(&self) -> Result<DeviceSession> {
        self.set_state(ConnectionState::Probing);
        let result = self.establish().await.map_err(|refused| refused.error);
        self.set_state(match &result {
            Ok(_) => ConnectionState::Connected,
            Err(Error::DeviceAmbiguous(_)) => ConnectionState::Ambiguous,
            Err(_) => ConnectionState::Disconnected,
        });
        result
    }

    /// Establish a session, sharing the link of a session a job still holds.
    ///
    /// Connecting again while a job runs could restart the bridge server
    /// under it when the signing key changed in the meantime.
    async fn establish(&self) -> std::result::Result<DeviceSession, Refused> {
        if let Some(link) = self.live_link() {
            debug!(serial = link.serial(), "reusing live device session");
            return Ok(DeviceSession::new(link, Arc::clone(&self.device_lock)));
        }

        let devices = self
            .transport
            .devices()
            .await
            .map_err(|e| Refused::new(0, e))?;
        let device = match devices.as_slice() {
            [] => {
                return Err(Refused::new(
                    0,
                    Error::DeviceUnreachable(NO_DEVICE.to_string()),
                ));
            }
            [one] => one,
            many => return Err(Refused::new(many.len(), Error::DeviceAmbiguous(many.len()))),
        };

        let credential = self.credential().map_err(|e| Refused::new(1, e))?;
        let link = self
            .transport
            .connect(device, &credential)
            .await
            .map_err(|e| Refused::new(1, e))?;
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(&link));
        Ok(DeviceSession::new(link, Arc::clone(&self.device_lock)))
    }

    fn live_link(&self) -> Option<Arc<dyn DeviceLink>> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn credential(&self) -> Result<SessionCredential> {
        Ok(match self.credentials.load().key_source {
            KeySource::Unset => SessionCredential::HostDefault,
            KeySource::LocalCopy { stored_path, .. } => SessionCredential::KeyFile(stored_path),
            KeySource::RemoteServer { url } => {
                SessionCredential::Remote(RemoteSigner::new(self.client.clone(), &url)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;
    use crate::paths::Layout;
    use crate::testing::FakeTransport;

    fn manager(transport: FakeTransport, dir: &std::path::Path) -> DeviceSessionManager {
        let store = Arc::new(CredentialStore::open(&Layout::new(dir)));
        DeviceSessionManager::new(Arc::new(transport), store, Client::new())
    }

    #[tokio::test]
    async fn test_probe_single_device() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(FakeTransport::new(), dir.path());
        assert_eq!(mgr.state(), ConnectionState::Unknown);

        let info = mgr.probe().await;
        assert!(info.connected);
        assert_eq!(info.device_count, 1);
        assert_eq!(info.serial.as_deref(), Some("FAKE0001"));
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_probe_no_device_and_many_devices() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new();
        transport.set_device_count(0);
        let mgr = manager(transport.clone(), dir.path());

        let info = mgr.probe().await;
        assert!(!info.connected);
        assert_eq!(info.device_count, 0);
        assert_eq!(info.state, ConnectionState::Disconnected);

        transport.set_device_count(3);
        let info = mgr.probe().await;
        assert_eq!(info.device_count, 3);
        assert_eq!(info.state, ConnectionState::Ambiguous);
        assert!(info.error_message.unwrap().contains("Multiple devices"));

        let err = mgr.acquire().await.unwrap_err();
        assert!(matches!(err, Error::DeviceAmbiguous(3)));
    }

    #[tokio::test]
    async fn test_failed_enumeration_reports_no_devices() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new();
        transport.fail_device_listing("'adb' not found");
        let mgr = manager(transport, dir.path());

        let info = mgr.probe().await;
        assert!(!info.connected);
        assert_eq!(info.device_count, 0);
        assert_eq!(info.state, ConnectionState::Disconnected);
        assert!(info.error_message.unwrap().contains("'adb' not found"));
        assert!(matches!(
            mgr.acquire().await.unwrap_err(),
            Error::DeviceUnreachable(_)
        ));
    }

    #[tokio::test]
    async fn test_probe_shares_session_held_by_job() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new();
        let mgr = manager(transport.clone(), dir.path());

        let session = mgr.acquire().await.unwrap();
        transport.set_device_count(0);
        let info = mgr.probe().await;
        assert!(info.connected);
        assert_eq!(info.serial.as_deref(), Some(session.serial()));
        assert_eq!(transport.connects(), 1);

        drop(session);
        let info = mgr.probe().await;
        assert!(!info.connected);
        assert_eq!(info.device_count, 0);
    }

    #[tokio::test]
    async fn test_unauthorized_device_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new();
        transport.set_device_state(DeviceState::Unauthorized);
        let mgr = manager(transport, dir.path());

        let info = mgr.probe().await;
        assert!(!info.connected);
        assert_eq!(info.device_count, 1);
        assert!(info.error_message.unwrap().contains("Authorization failed"));
        assert!(matches!(
            mgr.acquire().await.unwrap_err(),
            Error::AuthorizationFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_signing_server_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let store = Arc::new(CredentialStore::open(&layout));
        store.set_key_remote("http://127.0.0.1:9/sign").unwrap();
        let transport = FakeTransport::new();
        let mgr = DeviceSessionManager::new(Arc::new(transport.clone()), store, Client::new());

        let info = mgr.probe().await;
        assert!(!info.connected);
        assert_eq!(info.state, ConnectionState::Disconnected);
        assert!(transport.commands().is_empty());
    }
}
