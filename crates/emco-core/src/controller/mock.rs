// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process stand-ins for the synchronizer, the ready-notify stream and
//! CLM controllers.
//!
//! They record every call so tests can assert on what the control plane
//! asked of its collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use emco_protocol::readynotify::Notification;

use super::traits::{AlertStream, ClusterEvent, ClusterEventPublisher, ReadyNotifier, Synchronizer};
use crate::appcontext::{AppContext, StatusValue};
use crate::contextdb::ContextTree;
use crate::error::{EmcoError, Result, TRANSPORT_CLOSING};

/// Synchronizer that records install/uninstall requests.
#[derive(Clone, Default)]
pub struct MockSynchronizer {
    installed: Arc<Mutex<Vec<String>>>,
    uninstalled: Arc<Mutex<Vec<String>>>,
    /// Fail every call when set.
    pub fail: bool,
    // status written into the context on install/uninstall
    report: Option<(ContextTree, StatusValue, StatusValue)>,
}

impl MockSynchronizer {
    /// Accept every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every request.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Write `on_install` / `on_uninstall` into the context status, the way
    /// the real synchronizer reports progress.
    pub fn reporting(tree: ContextTree, on_install: StatusValue, on_uninstall: StatusValue) -> Self {
        Self {
            report: Some((tree, on_install, on_uninstall)),
            ..Self::default()
        }
    }

    /// Contexts passed to `install_app`, in call order.
    pub async fn installed(&self) -> Vec<String> {
        self.installed.lock().await.clone()
    }

    /// Contexts passed to `uninstall_app`, in call order.
    pub async fn uninstalled(&self) -> Vec<String> {
        self.uninstalled.lock().await.clone()
    }

    async fn report(&self, app_context: &str, install: bool) -> Result<()> {
        if let Some((tree, on_install, on_uninstall)) = &self.report {
            let ac = AppContext::load(tree, app_context).await?;
            let status = if install { *on_install } else { *on_uninstall };
            ac.update_app_context_status(status).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Synchronizer for MockSynchronizer {
    async fn install_app(&self, app_context: &str) -> Result<()> {
        self.installed.lock().await.push(app_context.to_string());
        if self.fail {
            return Err(EmcoError::Upstream("InstallApp failed: mock".to_string()));
        }
        self.report(app_context, true).await
    }

    async fn uninstall_app(&self, app_context: &str) -> Result<()> {
        self.uninstalled.lock().await.push(app_context.to_string());
        if self.fail {
            return Err(EmcoError::Upstream("UninstallApp failed: mock".to_string()));
        }
        self.report(app_context, false).await
    }
}

type AlertSender = mpsc::UnboundedSender<std::result::Result<Notification, tonic::Status>>;

/// Ready-notify endpoint driven by the test.
#[derive(Clone, Default)]
pub struct MockReadyNotifier {
    senders: Arc<Mutex<HashMap<String, Vec<AlertSender>>>>,
    subscriptions: Arc<Mutex<Vec<(String, String)>>>,
    unsubscribed: Arc<Mutex<Vec<(String, String)>>>,
    /// Refuse subscriptions when set.
    pub fail: bool,
}

impl MockReadyNotifier {
    /// Accept every subscription.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every subscription.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Deliver a readiness notification to every open stream of `app_context`.
    pub async fn notify(&self, app_context: &str) -> usize {
        self.push(
            app_context,
            Ok(Notification {
                app_context: app_context.to_string(),
                message: "ready".to_string(),
            }),
        )
        .await
    }

    /// Deliver a transport-closing error to every open stream of `app_context`.
    pub async fn close_transport(&self, app_context: &str) -> usize {
        self.push(app_context, Err(tonic::Status::unavailable(TRANSPORT_CLOSING)))
            .await
    }

    async fn push(
        &self,
        app_context: &str,
        item: std::result::Result<Notification, tonic::Status>,
    ) -> usize {
        let mut senders = self.senders.lock().await;
        let Some(list) = senders.get_mut(app_context) else {
            return 0;
        };
        list.retain(|tx| tx.send(item.clone()).is_ok());
        list.len()
    }

    /// `(client, app_context)` of every `alert` call.
    pub async fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions.lock().await.clone()
    }

    /// `(client, app_context)` of every `unsubscribe` call.
    pub async fn unsubscribed(&self) -> Vec<(String, String)> {
        self.unsubscribed.lock().await.clone()
    }

    /// Number of streams still open for `app_context`.
    pub async fn open_streams(&self, app_context: &str) -> usize {
        let mut senders = self.senders.lock().await;
        match senders.get_mut(app_context) {
            Some(list) => {
                list.retain(|tx| !tx.is_closed());
                list.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl ReadyNotifier for MockReadyNotifier {
    async fn alert(&self, client_name: &str, app_context: &str) -> Result<AlertStream> {
        if self.fail {
            return Err(EmcoError::Upstream("Alert failed: mock".to_string()));
        }
        self.subscriptions
            .lock()
            .await
            .push((client_name.to_string(), app_context.to_string()));
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .await
            .entry(app_context.to_string())
            .or_default()
            .push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn unsubscribe(&self, client_name: &str, app_context: &str) -> Result<()> {
        self.unsubscribed
            .lock()
            .await
            .push((client_name.to_string(), app_context.to_string()));
        self.senders.lock().await.remove(app_context);
        Ok(())
    }
}

/// CLM publisher that records events.
#[derive(Clone, Default)]
pub struct MockClusterEventPublisher {
    events: Arc<Mutex<Vec<(String, String, ClusterEvent)>>>,
    /// Fail every publish when set.
    pub fail: bool,
}

impl MockClusterEventPublisher {
    /// Accept every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every event.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// `(provider, cluster, event)` in publish order.
    pub async fn events(&self) -> Vec<(String, String, ClusterEvent)> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl ClusterEventPublisher for MockClusterEventPublisher {
    async fn publish(&self, provider: &str, cluster: &str, event: ClusterEvent) -> Result<()> {
        self.events
            .lock()
            .await
            .push((provider.to_string(), cluster.to_string(), event));
        if self.fail {
            return Err(EmcoError::Upstream("Publish failed: mock".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_notifier_delivers_and_unsubscribes() {
        let notifier = MockReadyNotifier::new();
        let mut stream = notifier.alert("dtc", "42").await.unwrap();

        assert_eq!(notifier.close_transport("42").await, 1);
        assert_eq!(notifier.notify("42").await, 1);

        let first = stream.next().await.unwrap();
        assert!(first.unwrap_err().message().contains(TRANSPORT_CLOSING));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.app_context, "42");

        notifier.unsubscribe("dtc", "42").await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(notifier.unsubscribed().await, vec![("dtc".to_string(), "42".to_string())]);
    }

    #[tokio::test]
    async fn test_synchronizer_records_calls() {
        let sync = MockSynchronizer::new();
        sync.install_app("1").await.unwrap();
        sync.uninstall_app("1").await.unwrap();
        assert_eq!(sync.installed().await, vec!["1"]);
        assert_eq!(sync.uninstalled().await, vec!["1"]);

        let failing = MockSynchronizer::failing();
        assert!(failing.install_app("2").await.is_err());
        assert_eq!(failing.installed().await, vec!["2"]);
    }
}
