//! Configuration manager: CRUD, history, rollback and change watches.

use crate::config::ExchangeMode;
use crate::dispatch::DispatchPool;
use crate::error::{ClientError, Result};
use crate::event::{ConfigChangeEvent, ConfigListener};
use crate::reconnect::Restorable;
use crate::session::{Session, SessionState};
use crate::stream::unexpected_payload;
use crate::types::{
    ConfigHistoryInfo, ConfigInfo, ConfigListing, ConfigSnapshot, HistoryListing,
    OperationStatus, SaveOutcome,
};
use async_trait::async_trait;
use compass_proto as pb;
use dashmap::DashMap;
use pb::{client_message, server_message};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// History page size when the caller passes a non-positive limit.
const DEFAULT_HISTORY_LIMIT: i32 = 100;

/// Backoff ceiling for per-watch retry loops in unary mode.
const WATCH_RETRY_CAP: Duration = Duration::from_secs(30);

struct WatchRecord {
    id: String,
    namespace: String,
    group_name: String,
    data_ids: BTreeSet<String>,
    listener: ConfigListener,
    /// Ordered hand-off to the listener consumer; events for one watch are
    /// delivered in arrival order.
    events: mpsc::UnboundedSender<ConfigChangeEvent>,
    /// Unary mode: the server-stream reader task.
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// One consumer task per watch keeps per-watch ordering and isolates a
/// slow listener from the dispatcher and other watches.
fn spawn_listener_consumer(listener: ConfigListener) -> mpsc::UnboundedSender<ConfigChangeEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConfigChangeEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            crate::dispatch::run_listener(|| listener.invoke(&event));
        }
    });
    tx
}

impl WatchRecord {
    fn matches(&self, event: &ConfigChangeEvent) -> bool {
        self.namespace == event.namespace
            && self.group_name == event.group_name
            && self.data_ids.contains(&event.data_id)
    }

    fn abort_task(&self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

struct ConfigManagerInner {
    session: Session,
    pool: Arc<DispatchPool>,
    watches: DashMap<String, Arc<WatchRecord>>,
    closed: AtomicBool,
}

/// Distributed configuration access. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConfigManager {
    inner: Arc<ConfigManagerInner>,
}

impl ConfigManager {
    pub(crate) fn new(session: Session, pool: Arc<DispatchPool>) -> Self {
        Self {
            inner: Arc::new(ConfigManagerInner {
                session,
                pool,
                watches: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register this manager's push sink with the session and start the
    /// event consumer. Called once at client construction.
    pub(crate) fn attach(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.session.set_config_event_sink(tx);
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                manager.route_event(event);
            }
            debug!("Config event consumer exiting");
        });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidState(
                "config manager is closed".to_string(),
            ));
        }
        self.inner.session.ensure_operational()
    }

    /// Upsert a configuration. Returns the new version and the
    /// server-computed MD5.
    pub async fn save_config(&self, config: ConfigInfo) -> Result<SaveOutcome> {
        self.ensure_open()?;
        let defaults = self.inner.session.config();

        let mut config = config;
        config.namespace = defaults.namespace_or_default(&config.namespace);
        config.group_name = defaults.group_or_default(&config.group_name);
        config.validate()?;

        let request = pb::SaveConfigRequest {
            config: Some(config.to_proto()),
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.config_client().await?;
                self.inner
                    .session
                    .unary(client.save_config(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::SaveConfig(request))
                .await?
            {
                server_message::Payload::SaveConfig(resp) => resp,
                _ => return Err(unexpected_payload("SaveConfig")),
            },
        };
        Ok(SaveOutcome {
            status: OperationStatus::from_proto(response.status),
            version: response.version,
            content_md5: response.content_md5,
        })
    }

    /// Fetch the most recent version of a configuration.
    pub async fn get_config(
        &self,
        namespace: &str,
        group_name: &str,
        data_id: &str,
    ) -> Result<ConfigSnapshot> {
        self.ensure_open()?;
        let request = self.keyed_request(namespace, group_name, data_id)?;
        let request = pb::GetConfigRequest {
            namespace: request.0,
            group_name: request.1,
            data_id: request.2,
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.config_client().await?;
                self.inner
                    .session
                    .unary(client.get_config(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::GetConfig(request))
                .await?
            {
                server_message::Payload::GetConfig(resp) => resp,
                _ => return Err(unexpected_payload("GetConfig")),
            },
        };
        Ok(ConfigSnapshot {
            status: OperationStatus::from_proto(response.status),
            config: response.config.map(ConfigInfo::from_proto),
        })
    }

    /// Delete the current head of a configuration; history remains.
    pub async fn delete_config(
        &self,
        namespace: &str,
        group_name: &str,
        data_id: &str,
    ) -> Result<OperationStatus> {
        self.ensure_open()?;
        let key = self.keyed_request(namespace, group_name, data_id)?;
        let request = pb::DeleteConfigRequest {
            namespace: key.0,
            group_name: key.1,
            data_id: key.2,
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.config_client().await?;
                self.inner
                    .session
                    .unary(client.delete_config(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::DeleteConfig(request))
                .await?
            {
                server_message::Payload::DeleteConfig(resp) => resp,
                _ => return Err(unexpected_payload("DeleteConfig")),
            },
        };
        Ok(OperationStatus::from_proto(response.status))
    }

    /// List configurations in a namespace/group.
    ///
    /// Search and pagination parameters are accepted for interface
    /// compatibility but the core sends the unpaged request; callers page
    /// client-side.
    pub async fn list_configs(
        &self,
        namespace: &str,
        group_name: &str,
        search_key: Option<&str>,
        page: Option<(u32, u32)>,
    ) -> Result<ConfigListing> {
        self.ensure_open()?;
        let defaults = self.inner.session.config();
        if search_key.is_some() || page.is_some() {
            warn!("list_configs: search/pagination requested but unsupported; returning the full listing");
        }
        let request = pb::ListConfigsRequest {
            namespace: defaults.namespace_or_default(namespace),
            group_name: defaults.group_or_default(group_name),
            search_key: String::new(),
            page_num: 0,
            page_size: 0,
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.config_client().await?;
                self.inner
                    .session
                    .unary(client.list_configs(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::ListConfigs(request))
                .await?
            {
                server_message::Payload::ListConfigs(resp) => resp,
                _ => return Err(unexpected_payload("ListConfigs")),
            },
        };
        Ok(ConfigListing {
            status: OperationStatus::from_proto(response.status),
            configs: response
                .configs
                .into_iter()
                .map(ConfigInfo::from_proto)
                .collect(),
            total: response.total,
        })
    }

    /// Reverse-chronological change history. A non-positive limit defaults
    /// to 100.
    pub async fn get_config_history(
        &self,
        namespace: &str,
        group_name: &str,
        data_id: &str,
        limit: i32,
    ) -> Result<HistoryListing> {
        self.ensure_open()?;
        let key = self.keyed_request(namespace, group_name, data_id)?;
        let request = pb::GetConfigHistoryRequest {
            namespace: key.0,
            group_name: key.1,
            data_id: key.2,
            limit: if limit <= 0 { DEFAULT_HISTORY_LIMIT } else { limit },
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.config_client().await?;
                self.inner
                    .session
                    .unary(client.get_config_history(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::GetConfigHistory(request))
                .await?
            {
                server_message::Payload::GetConfigHistory(resp) => resp,
                _ => return Err(unexpected_payload("GetConfigHistory")),
            },
        };
        Ok(HistoryListing {
            status: OperationStatus::from_proto(response.status),
            histories: response
                .histories
                .into_iter()
                .map(ConfigHistoryInfo::from_proto)
                .collect(),
        })
    }

    /// Create a new version whose content equals `target_version`'s
    /// content. The target is accepted as a string for interface
    /// compatibility and parsed as the integer version number.
    pub async fn rollback_config(
        &self,
        namespace: &str,
        group_name: &str,
        data_id: &str,
        target_version: &str,
        changed_by: Option<&str>,
        change_reason: Option<&str>,
    ) -> Result<SaveOutcome> {
        self.ensure_open()?;
        let key = self.keyed_request(namespace, group_name, data_id)?;
        let version: i64 = target_version.trim().parse().map_err(|_| {
            ClientError::InvalidArgument(format!(
                "target version '{}' is not an integer",
                target_version
            ))
        })?;
        let request = pb::RollbackConfigRequest {
            namespace: key.0,
            group_name: key.1,
            data_id: key.2,
            target_version: version,
            changed_by: changed_by.unwrap_or_default().to_string(),
            change_reason: change_reason.unwrap_or_default().to_string(),
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.config_client().await?;
                self.inner
                    .session
                    .unary(client.rollback_config(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::RollbackConfig(request))
                .await?
            {
                server_message::Payload::RollbackConfig(resp) => resp,
                _ => return Err(unexpected_payload("RollbackConfig")),
            },
        };
        Ok(SaveOutcome {
            status: OperationStatus::from_proto(response.status),
            version: response.version,
            content_md5: response.content_md5,
        })
    }

    /// Watch a set of data ids for changes. All ids share one stream.
    /// Returns the watch id.
    pub async fn watch_config(
        &self,
        namespace: &str,
        group_name: &str,
        data_ids: Vec<String>,
        listener: ConfigListener,
    ) -> Result<String> {
        self.ensure_open()?;
        let defaults = self.inner.session.config();
        let data_ids: BTreeSet<String> = data_ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if data_ids.is_empty() {
            return Err(ClientError::InvalidArgument(
                "watch requires at least one data id".to_string(),
            ));
        }
        let id = Uuid::new_v4().to_string();
        let events = spawn_listener_consumer(listener.clone());
        let record = Arc::new(WatchRecord {
            id: id.clone(),
            namespace: defaults.namespace_or_default(namespace),
            group_name: defaults.group_or_default(group_name),
            data_ids,
            listener,
            events,
            task: std::sync::Mutex::new(None),
        });
        self.inner.watches.insert(id.clone(), record.clone());

        match self.inner.session.mode() {
            ExchangeMode::Stream => {
                if let Err(e) = self.send_watch(&record).await {
                    self.inner.watches.remove(&id);
                    return Err(e);
                }
            }
            ExchangeMode::Unary => {
                let handle = self.spawn_watch_stream(record.clone());
                if let Ok(mut guard) = record.task.lock() {
                    *guard = Some(handle);
                }
            }
        }
        info!(
            "Watch {} created for {}/{} ({} data ids)",
            id,
            record.namespace,
            record.group_name,
            record.data_ids.len()
        );
        Ok(id)
    }

    /// Remove a watch. Unknown ids succeed.
    pub async fn unwatch(&self, watch_id: &str) -> Result<()> {
        self.ensure_open()?;
        match self.inner.watches.remove(watch_id) {
            Some((_, record)) => {
                record.abort_task();
                if self.inner.session.mode() == ExchangeMode::Stream {
                    let _ = self
                        .inner
                        .session
                        .send_async(client_message::Payload::Unwatch(pb::UnwatchRequest {
                            watch_id: watch_id.to_string(),
                        }))
                        .await;
                }
                info!("Watch {} removed", watch_id);
            }
            None => debug!("unwatch on unknown id {} (no-op)", watch_id),
        }
        Ok(())
    }

    /// Drop every watch. Never fails.
    pub(crate) async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let watches: Vec<Arc<WatchRecord>> = self
            .inner
            .watches
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for record in watches {
            record.abort_task();
        }
        self.inner.watches.clear();
        debug!("Config manager shut down");
    }

    fn keyed_request(
        &self,
        namespace: &str,
        group_name: &str,
        data_id: &str,
    ) -> Result<(String, String, String)> {
        if data_id.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "config data id must not be empty".to_string(),
            ));
        }
        let defaults = self.inner.session.config();
        Ok((
            defaults.namespace_or_default(namespace),
            defaults.group_or_default(group_name),
            data_id.to_string(),
        ))
    }

    async fn send_watch(&self, record: &WatchRecord) -> Result<()> {
        self.inner
            .session
            .send_async(client_message::Payload::WatchConfig(pb::WatchConfigRequest {
                watch_id: record.id.clone(),
                namespace: record.namespace.clone(),
                group_name: record.group_name.clone(),
                data_ids: record.data_ids.iter().cloned().collect(),
            }))
            .await
    }

    /// Unary mode: dedicated server stream per watch with its own retry
    /// loop.
    fn spawn_watch_stream(&self, record: Arc<WatchRecord>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let initial_backoff = manager.inner.session.config().reconnect_interval;
            let mut backoff = initial_backoff;
            loop {
                if manager.inner.closed.load(Ordering::SeqCst)
                    || !manager.inner.watches.contains_key(&record.id)
                {
                    break;
                }
                match manager.inner.session.state() {
                    SessionState::Closed | SessionState::Failed => break,
                    _ => {}
                }
                match manager.run_watch_stream(&record).await {
                    Ok(()) => {
                        debug!("Watch {} stream ended; re-establishing", record.id);
                        backoff = initial_backoff;
                    }
                    Err(e) => {
                        warn!(
                            "Watch {} stream failed: {}; retry in {:?}",
                            record.id, e, backoff
                        );
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(WATCH_RETRY_CAP);
            }
            debug!("Watch {} task exiting", record.id);
        })
    }

    async fn run_watch_stream(&self, record: &WatchRecord) -> Result<()> {
        let mut client = self.inner.session.config_client().await?;
        // The watch stream is long-lived; no per-call deadline.
        let mut stream = client
            .watch_config(tonic::Request::new(pb::WatchConfigRequest {
                watch_id: record.id.clone(),
                namespace: record.namespace.clone(),
                group_name: record.group_name.clone(),
                data_ids: record.data_ids.iter().cloned().collect(),
            }))
            .await
            .map_err(|s| self.inner.session.note_status(s))?
            .into_inner();
        self.inner.session.note_success();

        loop {
            match stream.message().await {
                Ok(Some(event)) => self.deliver(record, event),
                Ok(None) => return Ok(()),
                Err(status) => return Err(self.inner.session.note_status(status)),
            }
        }
    }

    fn deliver(&self, record: &WatchRecord, proto: pb::ConfigChangeEvent) {
        let event = ConfigChangeEvent::from_proto(proto);
        if record.matches(&event) {
            let _ = record.events.send(event);
        }
    }

    /// Stream mode: fan a pushed event out to every matching watch.
    fn route_event(&self, proto: pb::ConfigChangeEvent) {
        let event = ConfigChangeEvent::from_proto(proto);
        let sinks: Vec<mpsc::UnboundedSender<ConfigChangeEvent>> = self
            .inner
            .watches
            .iter()
            .filter(|entry| entry.value().matches(&event))
            .map(|entry| entry.value().events.clone())
            .collect();
        for sink in sinks {
            let _ = sink.send(event.clone());
        }
    }
}

#[async_trait]
impl Restorable for ConfigManager {
    fn name(&self) -> &'static str {
        "config"
    }

    async fn restore(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.session.mode() != ExchangeMode::Stream {
            // Unary mode: each watch loop re-dials on its own.
            return Ok(());
        }
        let watches: Vec<Arc<WatchRecord>> = self
            .inner
            .watches
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for record in watches {
            if let Err(e) = self.send_watch(&record).await {
                warn!("Failed to restore watch {}: {}", record.id, e);
            }
        }
        Ok(())
    }

    fn notify_reconnected(&self) {
        let listeners: Vec<ConfigListener> = self
            .inner
            .watches
            .iter()
            .map(|entry| entry.value().listener.clone())
            .collect();
        for listener in listeners {
            self.inner
                .pool
                .execute(Box::new(move || listener.invoke_reconnected()));
        }
    }
}
